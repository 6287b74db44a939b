//! CSV dataset store: one file per universe.
//!
//! Layout: `Date,Ticker,Open,High,Low,Close,Adj Close,Volume`, UTF-8 with a
//! BOM, rows ordered by `(Date, Ticker)` ascending, absent values as empty
//! fields.
//!
//! Features:
//! - Atomic writes (temp file in the target directory, renamed into place)
//! - Corrupt files load as empty with a recoverable reason, never an abort
//! - Quarantine copy of a corrupt file before it is replaced
//! - Deterministic merge: incoming wins, deduplicated, canonical order

use crate::domain::{Dataset, DatasetOrigin, Observation, ObservationKey};
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

pub const HEADER: [&str; 8] = [
    "Date", "Ticker", "Open", "High", "Low", "Close", "Adj Close", "Volume",
];

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CSV write error for {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },

    #[error("atomic replace of {path} failed: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One CSV line. Field names are the on-disk column headers.
#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    #[serde(rename = "Date")]
    date: NaiveDate,
    #[serde(rename = "Ticker")]
    ticker: String,
    #[serde(rename = "Open")]
    open: Option<f64>,
    #[serde(rename = "High")]
    high: Option<f64>,
    #[serde(rename = "Low")]
    low: Option<f64>,
    #[serde(rename = "Close")]
    close: Option<f64>,
    #[serde(rename = "Adj Close")]
    adj_close: Option<f64>,
    #[serde(rename = "Volume", deserialize_with = "de_volume")]
    volume: Option<u64>,
}

impl From<&Observation> for CsvRow {
    fn from(o: &Observation) -> Self {
        Self {
            date: o.date,
            ticker: o.ticker.clone(),
            open: o.open,
            high: o.high,
            low: o.low,
            close: o.close,
            adj_close: o.adj_close,
            volume: o.volume,
        }
    }
}

impl From<CsvRow> for Observation {
    fn from(r: CsvRow) -> Self {
        Self {
            date: r.date,
            ticker: r.ticker,
            open: r.open,
            high: r.high,
            low: r.low,
            close: r.close,
            adj_close: r.adj_close,
            volume: r.volume,
        }
    }
}

/// Volume as an integer, also accepting integral floats (`1234.0`) that
/// float-typed writers produce when a column contains gaps.
fn de_volume<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if let Ok(v) = raw.parse::<u64>() {
        return Ok(Some(v));
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u64::MAX as f64 => {
            Ok(Some(v as u64))
        }
        _ => Err(serde::de::Error::custom(format!("invalid volume '{raw}'"))),
    }
}

/// Parse file bytes into rows, or explain why they are unusable.
fn parse_rows(bytes: &[u8]) -> Result<Vec<Observation>, String> {
    let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(body);

    let headers = reader
        .headers()
        .map_err(|e| format!("unreadable header: {e}"))?
        .clone();
    for column in HEADER {
        if !headers.iter().any(|h| h == column) {
            return Err(format!("missing column '{column}'"));
        }
    }

    let mut rows = Vec::new();
    for (i, record) in reader.deserialize::<CsvRow>().enumerate() {
        // +2: header line plus 1-based numbering
        let row = record.map_err(|e| format!("line {}: {e}", i + 2))?;
        rows.push(Observation::from(row));
    }
    Ok(rows)
}

/// Read the dataset at `path`.
///
/// A missing file is an empty dataset. A file that exists but cannot be
/// parsed is also empty, with [`DatasetOrigin::Recovered`] carrying the
/// reason. Only genuine I/O failures (permissions, a directory at the path)
/// return an error.
pub fn load(path: &Path) -> Result<Dataset, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Dataset::empty(DatasetOrigin::Missing));
        }
        Err(e) => return Err(StoreError::io(path, e)),
    };

    match parse_rows(&bytes) {
        Ok(rows) => {
            tracing::debug!(path = %path.display(), rows = rows.len(), "dataset loaded");
            Ok(Dataset {
                rows,
                origin: DatasetOrigin::Loaded,
            })
        }
        Err(reason) => {
            tracing::warn!(
                path = %path.display(),
                %reason,
                "existing dataset is unreadable, starting from empty"
            );
            Ok(Dataset::empty(DatasetOrigin::Recovered { reason }))
        }
    }
}

/// Union `existing` and `incoming`; on a shared `(date, ticker)` the incoming
/// row wins. Rows without any price are dropped. The result is sorted by
/// `(date, ticker)` and has no duplicate keys.
pub fn merge(existing: Dataset, incoming: impl IntoIterator<Item = Observation>) -> Dataset {
    let mut table: BTreeMap<ObservationKey, Observation> = BTreeMap::new();
    for row in existing.rows.into_iter().chain(incoming) {
        if row.has_prices() {
            table.insert(row.key(), row);
        }
    }
    Dataset {
        rows: table.into_values().collect(),
        origin: DatasetOrigin::Merged,
    }
}

fn canonical_rows(dataset: &Dataset) -> Cow<'_, [Observation]> {
    if dataset.is_canonical() {
        Cow::Borrowed(&dataset.rows)
    } else {
        Cow::Owned(merge(Dataset::empty(DatasetOrigin::Merged), dataset.rows.iter().cloned()).rows)
    }
}

/// Write the whole dataset to `path`, replacing any previous file atomically.
///
/// The temp file lives next to `path` so the final rename never crosses a
/// filesystem. If anything fails before the rename the temp file is removed
/// and `path` keeps its previous content.
pub fn persist(dataset: &Dataset, path: &Path) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(UTF8_BOM)
        .map_err(|e| StoreError::io(tmp.path(), e))?;

    let rows = canonical_rows(dataset);
    {
        let csv_err = |source| StoreError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(&mut tmp);
        writer.write_record(HEADER).map_err(csv_err)?;
        for row in rows.iter() {
            writer.serialize(CsvRow::from(row)).map_err(csv_err)?;
        }
        writer.flush().map_err(|e| StoreError::io(path, e))?;
    }

    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| StoreError::Persist {
        path: path.to_path_buf(),
        source: e.error,
    })?;

    tracing::debug!(path = %path.display(), rows = rows.len(), "dataset persisted");
    Ok(())
}

/// `<path>.quarantined`
pub fn quarantine_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".quarantined");
    PathBuf::from(name)
}

/// Keep a copy of an unreadable file before a recovered pass replaces it.
pub fn quarantine(path: &Path) -> Result<PathBuf, StoreError> {
    let target = quarantine_path(path);
    fs::copy(path, &target).map_err(|e| StoreError::io(path, e))?;
    tracing::warn!(
        path = %path.display(),
        copy = %target.display(),
        "quarantined unreadable dataset"
    );
    Ok(target)
}

/// What is on disk for one dataset file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetSummary {
    pub path: PathBuf,
    pub exists: bool,
    pub rows: usize,
    pub tickers: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    /// BLAKE3 of the file bytes.
    pub content_hash: Option<String>,
    /// Set when the file could not be parsed.
    pub unreadable: Option<String>,
}

pub fn describe(path: &Path) -> Result<DatasetSummary, StoreError> {
    let dataset = load(path)?;
    let content_hash = match fs::read(path) {
        Ok(bytes) => Some(blake3::hash(&bytes).to_hex().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(StoreError::io(path, e)),
    };

    Ok(DatasetSummary {
        path: path.to_path_buf(),
        exists: dataset.origin != DatasetOrigin::Missing,
        rows: dataset.len(),
        tickers: dataset.tickers().len(),
        first_date: dataset.first_date(),
        last_date: dataset.last_date(),
        content_hash,
        unreadable: dataset.recovery_reason().map(str::to_string),
    })
}
