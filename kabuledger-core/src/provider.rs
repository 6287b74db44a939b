//! Price provider trait, the batched response shape, and structured error types.
//!
//! The BatchProvider trait abstracts over market-data sources so the sync
//! engine can be driven by Yahoo Finance in production and by an in-memory
//! table in tests.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Daily bar exactly as the provider delivered it. Missing fields stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub adj_close: Option<f64>,
    pub volume: Option<u64>,
}

/// What the provider returned for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesPayload {
    /// Per-date rows, in provider order.
    Bars(Vec<RawBar>),
    /// The response for this symbol decoded but did not have the expected shape.
    Malformed(String),
}

/// Multi-symbol fetch result, keyed by provider symbol.
///
/// Symbols the provider had nothing for are simply absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResponse {
    pub series: BTreeMap<String, SeriesPayload>,
}

impl BatchResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_bars(&mut self, symbol: impl Into<String>, bars: Vec<RawBar>) {
        self.series.insert(symbol.into(), SeriesPayload::Bars(bars));
    }

    pub fn insert_malformed(&mut self, symbol: impl Into<String>, reason: impl Into<String>) {
        self.series
            .insert(symbol.into(), SeriesPayload::Malformed(reason.into()));
    }

    /// True when no symbol carries a single bar or a malformed marker.
    pub fn is_empty(&self) -> bool {
        self.series.values().all(|payload| match payload {
            SeriesPayload::Bars(bars) => bars.is_empty(),
            SeriesPayload::Malformed(_) => false,
        })
    }

    pub fn bar_count(&self) -> usize {
        self.series
            .values()
            .map(|payload| match payload {
                SeriesPayload::Bars(bars) => bars.len(),
                SeriesPayload::Malformed(_) => 0,
            })
            .sum()
    }
}

/// Structured error types for provider and constituent-list operations.
///
/// These are designed to be displayable in the CLI report.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("hard stop: data provider has blocked requests (circuit breaker open for another {retry_in_secs}s)")]
    CircuitBreakerTripped { retry_in_secs: u64 },

    #[error("constituent page could not be read: {0}")]
    Scrape(String),

    #[error("data error: {0}")]
    Other(String),
}

/// Trait for batched daily-bar providers.
///
/// `end` is inclusive: sessions dated `start..=end` are requested.
pub trait BatchProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Fetch daily bars for every symbol over the window.
    ///
    /// A symbol without data is left out of the response. An `Err` means the
    /// whole batch is unusable (transport, timeout, ban).
    fn fetch_batch(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BatchResponse, DataError>;

    /// Check if the provider is currently available (not rate-limited, not blocked).
    fn is_available(&self) -> bool;
}

/// Mapping between provider symbols (`7203.T`) and storage tickers (`7203`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolConvention {
    suffix: Option<String>,
}

impl SymbolConvention {
    pub fn with_suffix(suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        Self {
            suffix: (!suffix.is_empty()).then_some(suffix),
        }
    }

    /// Strip the market suffix to get the identifier written to disk.
    pub fn to_storage(&self, symbol: &str) -> String {
        let trimmed = symbol.trim();
        match &self.suffix {
            Some(sfx) => trimmed.strip_suffix(sfx.as_str()).unwrap_or(trimmed).to_string(),
            None => trimmed.to_string(),
        }
    }

    /// Append the market suffix unless the code already carries it.
    pub fn to_provider(&self, code: &str) -> String {
        let trimmed = code.trim();
        match &self.suffix {
            Some(sfx) if !trimmed.ends_with(sfx.as_str()) => format!("{trimmed}{sfx}"),
            _ => trimmed.to_string(),
        }
    }
}
