//! Observation rows, datasets and universes: the stored unit of market data.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// One trading day's bar for one ticker, as persisted.
///
/// Every price field is optional: a provider may publish a close without an
/// open, and "no data" must survive a round trip instead of becoming `0.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub ticker: String,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub adj_close: Option<f64>,
    pub volume: Option<u64>,
}

/// Unique key of an observation within a dataset. Orders by date, then ticker.
pub type ObservationKey = (NaiveDate, String);

impl Observation {
    /// True if at least one price field carries a value.
    ///
    /// Volume alone does not count: a row with a volume and no prices is a
    /// provider artifact, not a session.
    pub fn has_prices(&self) -> bool {
        self.open.is_some()
            || self.high.is_some()
            || self.low.is_some()
            || self.close.is_some()
            || self.adj_close.is_some()
    }

    pub fn key(&self) -> ObservationKey {
        (self.date, self.ticker.clone())
    }

    fn key_ref(&self) -> (NaiveDate, &str) {
        (self.date, self.ticker.as_str())
    }
}

/// How a dataset came to be in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetOrigin {
    /// No file existed at the path.
    Missing,
    /// Read and parsed from disk.
    Loaded,
    /// The file existed but could not be parsed; treated as empty.
    Recovered { reason: String },
    /// Produced by a merge in this process.
    Merged,
}

/// One persisted table for one universe.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub rows: Vec<Observation>,
    pub origin: DatasetOrigin,
}

impl Dataset {
    pub fn empty(origin: DatasetOrigin) -> Self {
        Self {
            rows: Vec::new(),
            origin,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Latest session date across all tickers.
    pub fn last_date(&self) -> Option<NaiveDate> {
        self.rows.iter().map(|r| r.date).max()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.rows.iter().map(|r| r.date).min()
    }

    /// Distinct tickers, sorted.
    pub fn tickers(&self) -> BTreeSet<&str> {
        self.rows.iter().map(|r| r.ticker.as_str()).collect()
    }

    /// True if rows are strictly ascending by `(date, ticker)`, which also
    /// rules out duplicate keys.
    pub fn is_canonical(&self) -> bool {
        self.rows
            .windows(2)
            .all(|w| w[0].key_ref() < w[1].key_ref())
    }

    /// The fallback reason when the file on disk was unreadable.
    pub fn recovery_reason(&self) -> Option<&str> {
        match &self.origin {
            DatasetOrigin::Recovered { reason } => Some(reason),
            _ => None,
        }
    }
}

/// A named set of provider symbols and the file its observations land in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Universe {
    pub name: String,
    /// Provider-addressed symbols, e.g. `7203.T`.
    pub identifiers: Vec<String>,
    pub path: PathBuf,
    /// An empty identifier list for a required universe aborts the run.
    pub required: bool,
}
