//! Batch response normalization.
//!
//! Decomposes a multi-symbol [`BatchResponse`] into flat observation rows,
//! one requested symbol at a time. Each symbol ends up in exactly one of
//! three buckets: present (rows kept), absent (nothing usable, not an
//! error), or malformed (surfaced as a warning).
//!
//! Bars dated outside the planned window are never kept. A bar past `end`
//! would otherwise be taken as coverage and hide the sessions before it.

use crate::domain::Observation;
use crate::planner::Window;
use crate::provider::{BatchResponse, RawBar, SeriesPayload, SymbolConvention};
use chrono::NaiveDate;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

/// Extraction result for one requested symbol.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Present(Vec<Observation>),
    Absent,
    Malformed(String),
}

/// Output of [`normalize`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    /// Flat, unsorted rows ready for merge.
    pub rows: Vec<Observation>,
    /// Storage tickers that contributed rows.
    pub present: Vec<String>,
    /// Provider symbols with no usable data.
    pub absent: Vec<String>,
    /// Provider symbols whose payload was rejected, with the reason.
    pub malformed: Vec<(String, String)>,
    /// Symbols in the response that nobody asked for.
    pub unexpected: Vec<String>,
    /// Provider symbols that delivered bars outside the window, with those dates.
    pub out_of_window: Vec<(String, Vec<NaiveDate>)>,
    /// The window rows were checked against.
    pub window: Option<(NaiveDate, NaiveDate)>,
}

impl Normalized {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Human-readable warnings for malformed and unexpected symbols.
    pub fn warnings(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .malformed
            .iter()
            .map(|(symbol, reason)| format!("{symbol}: malformed provider data ({reason})"))
            .collect();
        if let Some((start, end)) = self.window {
            for (symbol, dates) in &self.out_of_window {
                let dates: Vec<String> = dates.iter().map(NaiveDate::to_string).collect();
                out.push(format!(
                    "{symbol}: ignored bars outside {start}..={end} ({})",
                    dates.join(", ")
                ));
            }
        }
        if !self.unexpected.is_empty() {
            out.push(format!(
                "provider returned unrequested symbols: {}",
                self.unexpected.join(", ")
            ));
        }
        out
    }

    pub fn summary(&self) -> String {
        format!(
            "{} rows from {} symbols ({} without data, {} malformed)",
            self.rows.len(),
            self.present.len(),
            self.absent.len(),
            self.malformed.len()
        )
    }
}

fn to_observation(bar: &RawBar, ticker: &str) -> Observation {
    Observation {
        date: bar.date,
        ticker: ticker.to_string(),
        open: bar.open,
        high: bar.high,
        low: bar.low,
        close: bar.close,
        adj_close: bar.adj_close,
        volume: bar.volume,
    }
}

/// Extract one symbol's rows from its payload.
///
/// Price-less rows are dropped. Repeated dates carrying identical values
/// collapse to one row; repeated dates with different values reject the
/// whole series, since there is no way to tell which one is right.
pub fn extract(payload: Option<&SeriesPayload>, ticker: &str) -> Extraction {
    let bars = match payload {
        None => return Extraction::Absent,
        Some(SeriesPayload::Malformed(reason)) => return Extraction::Malformed(reason.clone()),
        Some(SeriesPayload::Bars(bars)) => bars,
    };

    let mut by_date: BTreeMap<NaiveDate, Observation> = BTreeMap::new();
    for bar in bars {
        let row = to_observation(bar, ticker);
        if !row.has_prices() {
            continue;
        }
        match by_date.entry(row.date) {
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
            Entry::Occupied(existing) if *existing.get() == row => {}
            Entry::Occupied(existing) => {
                return Extraction::Malformed(format!(
                    "conflicting bars for {}",
                    existing.key()
                ));
            }
        }
    }

    if by_date.is_empty() {
        Extraction::Absent
    } else {
        Extraction::Present(by_date.into_values().collect())
    }
}

/// Decompose a batch response into flat rows for the requested symbols,
/// keeping only sessions inside `window`.
pub fn normalize(
    response: &BatchResponse,
    requested: &[String],
    convention: &SymbolConvention,
    window: &Window,
) -> Normalized {
    let mut out = Normalized {
        window: Some((window.start, window.end)),
        ..Normalized::default()
    };
    let mut seen = BTreeSet::new();

    for symbol in requested {
        if !seen.insert(symbol.as_str()) {
            continue;
        }
        let ticker = convention.to_storage(symbol);
        match extract(response.series.get(symbol), &ticker) {
            Extraction::Present(rows) => {
                let (inside, outside): (Vec<_>, Vec<_>) =
                    rows.into_iter().partition(|r| window.contains(r.date));
                if !outside.is_empty() {
                    tracing::warn!(
                        symbol = %symbol,
                        count = outside.len(),
                        start = %window.start,
                        end = %window.end,
                        "provider returned bars outside the requested window"
                    );
                    out.out_of_window
                        .push((symbol.clone(), outside.iter().map(|r| r.date).collect()));
                }
                if inside.is_empty() {
                    out.absent.push(symbol.clone());
                } else {
                    out.rows.extend(inside);
                    out.present.push(ticker);
                }
            }
            Extraction::Absent => out.absent.push(symbol.clone()),
            Extraction::Malformed(reason) => out.malformed.push((symbol.clone(), reason)),
        }
    }

    out.unexpected = response
        .series
        .keys()
        .filter(|k| !seen.contains(k.as_str()))
        .cloned()
        .collect();

    if !out.absent.is_empty() {
        tracing::info!(
            count = out.absent.len(),
            symbols = %out.absent.join(","),
            "symbols without data in window"
        );
    }

    out
}
