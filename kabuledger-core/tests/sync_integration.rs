//! End-to-end sync passes against an in-memory provider and a temp directory.

use chrono::NaiveDate;
use kabuledger_core::provider::{BatchProvider, BatchResponse, DataError, RawBar};
use kabuledger_core::store;
use kabuledger_core::{RunStatus, SyncConfig, SyncState, Syncer, Universe};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn bar(d: &str, close: f64) -> RawBar {
    RawBar {
        date: date(d),
        open: Some(close - 10.0),
        high: Some(close + 5.0),
        low: Some(close - 15.0),
        close: Some(close),
        adj_close: None,
        volume: Some(1_000_000),
    }
}

/// Serves bars from a fixed table, filtered to the requested window.
#[derive(Default)]
struct TableProvider {
    table: BTreeMap<String, Vec<RawBar>>,
    malformed: BTreeMap<String, String>,
    fail_symbol: Option<String>,
    /// Serve every stored bar regardless of the requested window.
    ignore_window: bool,
    unavailable: bool,
    calls: Mutex<Vec<(Vec<String>, NaiveDate, NaiveDate)>>,
}

impl TableProvider {
    fn with(mut self, symbol: &str, bars: Vec<RawBar>) -> Self {
        self.table.insert(symbol.into(), bars);
        self
    }

    fn failing_on(mut self, symbol: &str) -> Self {
        self.fail_symbol = Some(symbol.into());
        self
    }

    fn calls(&self) -> Vec<(Vec<String>, NaiveDate, NaiveDate)> {
        self.calls.lock().unwrap().clone()
    }
}

impl BatchProvider for TableProvider {
    fn name(&self) -> &str {
        "table"
    }

    fn fetch_batch(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BatchResponse, DataError> {
        self.calls
            .lock()
            .unwrap()
            .push((symbols.to_vec(), start, end));

        if let Some(bad) = &self.fail_symbol {
            if symbols.contains(bad) {
                return Err(DataError::Timeout(format!("{bad}: operation timed out")));
            }
        }

        let mut batch = BatchResponse::new();
        for symbol in symbols {
            if let Some(reason) = self.malformed.get(symbol) {
                batch.insert_malformed(symbol.clone(), reason.clone());
                continue;
            }
            if let Some(bars) = self.table.get(symbol) {
                let window: Vec<RawBar> = bars
                    .iter()
                    .filter(|b| self.ignore_window || (b.date >= start && b.date <= end))
                    .cloned()
                    .collect();
                if !window.is_empty() {
                    batch.insert_bars(symbol.clone(), window);
                }
            }
        }
        Ok(batch)
    }

    fn is_available(&self) -> bool {
        !self.unavailable
    }
}

fn config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.epoch = date("2025-01-01");
    config.universes.clear();
    config
}

fn universe(dir: &Path, name: &str, identifiers: &[&str]) -> Universe {
    Universe {
        name: name.into(),
        identifiers: identifiers.iter().map(|s| s.to_string()).collect(),
        path: dir.join(format!("{name}.csv")),
        required: false,
    }
}

fn file_lines(path: &PathBuf) -> Vec<String> {
    let text = std::fs::read_to_string(path).unwrap();
    text.trim_start_matches('\u{feff}')
        .lines()
        .map(String::from)
        .collect()
}

#[test]
fn first_pass_fetches_from_epoch_and_skips_empty_symbols() {
    let dir = tempfile::tempdir().unwrap();
    let provider = TableProvider::default().with(
        "7203.T",
        vec![bar("2025-01-01", 2850.0), bar("2025-01-02", 2860.0)],
    );
    let config = config();
    let syncer = Syncer::new(&config, &provider).with_today(date("2025-01-03"));
    let u = universe(dir.path(), "nikkei", &["7203.T", "9999.T"]);

    let outcome = syncer.sync_one(&u);

    assert_eq!(outcome.state, SyncState::Done);
    assert!(outcome.updated);
    assert_eq!(outcome.rows_written, 2);
    assert!(outcome.warnings.is_empty());

    let calls = provider.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, date("2025-01-01"));
    assert_eq!(calls[0].2, date("2025-01-03"));

    let lines = file_lines(&u.path);
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "Date,Ticker,Open,High,Low,Close,Adj Close,Volume");
    assert!(lines[1].starts_with("2025-01-01,7203,"));
    assert!(lines[2].starts_with("2025-01-02,7203,"));
}

#[test]
fn second_pass_without_new_data_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let provider = TableProvider::default().with(
        "7203.T",
        vec![bar("2025-01-01", 2850.0), bar("2025-01-02", 2860.0)],
    );
    let config = config();
    let syncer = Syncer::new(&config, &provider).with_today(date("2025-01-03"));
    let u = universe(dir.path(), "nikkei", &["7203.T"]);

    assert_eq!(syncer.sync_one(&u).state, SyncState::Done);
    let first = std::fs::read(&u.path).unwrap();

    let again = syncer.sync_one(&u);
    assert!(!again.updated);
    assert_eq!(again.state, SyncState::NoData);
    assert_eq!(std::fs::read(&u.path).unwrap(), first);
}

#[test]
fn planner_boundary_controls_provider_calls() {
    let dir = tempfile::tempdir().unwrap();
    let provider = TableProvider::default().with(
        "7203.T",
        vec![
            bar("2025-01-01", 2850.0),
            bar("2025-01-02", 2860.0),
            bar("2025-01-03", 2870.0),
        ],
    );
    let config = config();
    let u = universe(dir.path(), "nikkei", &["7203.T"]);

    Syncer::new(&config, &provider)
        .with_today(date("2025-01-02"))
        .sync_one(&u);
    assert_eq!(provider.calls().len(), 1);

    // Stored through 01-02 and today is 01-02: start would be 01-03 > today.
    let up_to_date = Syncer::new(&config, &provider)
        .with_today(date("2025-01-02"))
        .sync_one(&u);
    assert_eq!(
        up_to_date.state,
        SyncState::UpToDate {
            last_date: date("2025-01-02")
        }
    );
    assert_eq!(provider.calls().len(), 1);

    // start == today still fetches.
    let next = Syncer::new(&config, &provider)
        .with_today(date("2025-01-03"))
        .sync_one(&u);
    assert_eq!(next.state, SyncState::Done);
    assert_eq!(next.rows_written, 3);
    let calls = provider.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].1, date("2025-01-03"));
    assert_eq!(calls[1].2, date("2025-01-03"));
}

#[test]
fn coverage_never_shrinks_across_days() {
    let dir = tempfile::tempdir().unwrap();
    let provider = TableProvider::default()
        .with(
            "7203.T",
            vec![
                bar("2025-01-06", 1.0),
                bar("2025-01-07", 2.0),
                bar("2025-01-08", 3.0),
            ],
        )
        .with("6758.T", vec![bar("2025-01-07", 4.0)]);
    let config = config();
    let u = universe(dir.path(), "mixed", &["7203.T", "6758.T"]);

    let mut last = None;
    let mut rows = 0;
    for day in ["2025-01-06", "2025-01-07", "2025-01-08", "2025-01-09"] {
        Syncer::new(&config, &provider)
            .with_today(date(day))
            .sync_one(&u);
        let ds = store::load(&u.path).unwrap();
        assert!(ds.is_canonical());
        assert!(ds.last_date() >= last);
        assert!(ds.len() >= rows);
        last = ds.last_date();
        rows = ds.len();
    }
    assert_eq!(rows, 4);
    assert_eq!(last, Some(date("2025-01-08")));
}

#[test]
fn corrupt_file_triggers_full_refetch_and_is_quarantined() {
    let dir = tempfile::tempdir().unwrap();
    let provider = TableProvider::default().with("7203.T", vec![bar("2025-01-02", 2860.0)]);
    let config = config();
    let u = universe(dir.path(), "nikkei", &["7203.T"]);
    std::fs::write(&u.path, "\u{0}\u{1}garbage without header").unwrap();

    let outcome = Syncer::new(&config, &provider)
        .with_today(date("2025-01-10"))
        .sync_one(&u);

    assert_eq!(outcome.state, SyncState::Done);
    assert_eq!(outcome.rows_written, 1);
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].contains("unreadable"));
    assert_eq!(provider.calls()[0].1, date("2025-01-01"));

    let quarantined = store::quarantine_path(&u.path);
    assert_eq!(
        std::fs::read(&quarantined).unwrap(),
        b"\x00\x01garbage without header"
    );
    assert_eq!(store::load(&u.path).unwrap().len(), 1);
}

#[test]
fn provider_failure_is_isolated_and_leaves_file_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let provider = TableProvider::default()
        .with("7203.T", vec![bar("2025-01-02", 2860.0)])
        .with("4385.T", vec![bar("2025-01-02", 2100.0)]);
    let config = config();
    let good = universe(dir.path(), "good", &["7203.T"]);
    let bad = universe(dir.path(), "bad", &["4385.T"]);

    Syncer::new(&config, &provider)
        .with_today(date("2025-01-02"))
        .sync_all(&[good.clone(), bad.clone()]);
    let bad_before = std::fs::read(&bad.path).unwrap();

    let flaky = TableProvider::default()
        .with("7203.T", vec![bar("2025-01-03", 2870.0)])
        .failing_on("4385.T");
    let report = Syncer::new(&config, &flaky)
        .with_today(date("2025-01-03"))
        .sync_all(&[bad.clone(), good.clone()]);

    assert!(report.outcomes[0].state.is_failed());
    assert!(!report.outcomes[0].updated);
    assert_eq!(report.outcomes[1].state, SyncState::Done);
    assert_eq!(report.outcomes[1].rows_written, 2);
    assert_eq!(report.status(), RunStatus::Degraded);
    assert_eq!(std::fs::read(&bad.path).unwrap(), bad_before);
}

#[test]
fn all_universes_failing_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let provider = TableProvider::default().failing_on("7203.T");
    let config = config();
    let report = Syncer::new(&config, &provider)
        .with_today(date("2025-01-03"))
        .sync_all(&[universe(dir.path(), "only", &["7203.T"])]);
    assert_eq!(report.status(), RunStatus::Fatal);
}

#[test]
fn empty_universe_is_skipped_unless_required() {
    let dir = tempfile::tempdir().unwrap();
    let provider = TableProvider::default();
    let config = config();
    let syncer = Syncer::new(&config, &provider).with_today(date("2025-01-03"));

    let optional = universe(dir.path(), "optional", &[]);
    let report = syncer.sync_all(&[optional.clone()]);
    assert_eq!(report.outcomes[0].state, SyncState::Skipped);
    assert_eq!(report.status(), RunStatus::Success);
    assert!(!optional.path.exists());

    let mut required = universe(dir.path(), "required", &[]);
    required.required = true;
    let report = syncer.sync_all(&[required]);
    assert_eq!(report.missing_required, vec!["required"]);
    assert_eq!(report.status(), RunStatus::Fatal);
    assert!(provider.calls().is_empty());
}

#[test]
fn price_less_bars_end_as_empty_after_filter() {
    let dir = tempfile::tempdir().unwrap();
    let mut holiday = bar("2025-01-02", 0.0);
    holiday.open = None;
    holiday.high = None;
    holiday.low = None;
    holiday.close = None;
    let provider = TableProvider::default().with("7203.T", vec![holiday]);
    let config = config();
    let u = universe(dir.path(), "nikkei", &["7203.T"]);

    let outcome = Syncer::new(&config, &provider)
        .with_today(date("2025-01-03"))
        .sync_one(&u);
    assert_eq!(outcome.state, SyncState::EmptyAfterFilter);
    assert!(!outcome.updated);
    assert!(!u.path.exists());
}

#[test]
fn malformed_symbol_is_warned_while_others_persist() {
    let dir = tempfile::tempdir().unwrap();
    let mut provider = TableProvider::default().with("7203.T", vec![bar("2025-01-02", 1.0)]);
    provider
        .malformed
        .insert("6758.T".into(), "no quote data".into());
    let config = config();
    let u = universe(dir.path(), "nikkei", &["7203.T", "6758.T"]);

    let outcome = Syncer::new(&config, &provider)
        .with_today(date("2025-01-03"))
        .sync_one(&u);
    assert_eq!(outcome.state, SyncState::Done);
    assert_eq!(outcome.rows_written, 1);
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].contains("6758.T"));
}

#[test]
fn unreadable_path_fails_without_fetching() {
    let dir = tempfile::tempdir().unwrap();
    let provider = TableProvider::default().with("7203.T", vec![bar("2025-01-02", 1.0)]);
    let config = config();
    let mut u = universe(dir.path(), "dir", &["7203.T"]);
    // A directory at the dataset path is an I/O error, not corruption.
    u.path = dir.path().join("as_dir");
    std::fs::create_dir(&u.path).unwrap();

    let outcome = Syncer::new(&config, &provider)
        .with_today(date("2025-01-03"))
        .sync_one(&u);
    assert!(outcome.state.is_failed());
    assert!(provider.calls().is_empty());
}

#[test]
fn bars_past_today_are_not_taken_as_coverage() {
    let dir = tempfile::tempdir().unwrap();
    let mut provider = TableProvider::default().with(
        "7203.T",
        vec![
            bar("2025-01-02", 2860.0),
            bar("2025-01-06", 2880.0),
            bar("2025-01-09", 2900.0),
        ],
    );
    provider.ignore_window = true;
    let config = config();
    let u = universe(dir.path(), "nikkei", &["7203.T"]);

    let first = Syncer::new(&config, &provider)
        .with_today(date("2025-01-03"))
        .sync_one(&u);
    assert_eq!(first.state, SyncState::Done);
    assert_eq!(first.rows_written, 1);
    assert_eq!(first.warnings.len(), 1);
    assert!(first.warnings[0].contains("2025-01-09"));
    assert_eq!(store::load(&u.path).unwrap().last_date(), Some(date("2025-01-02")));

    // The next day still asks for the sessions after 01-02.
    let next = Syncer::new(&config, &provider)
        .with_today(date("2025-01-06"))
        .sync_one(&u);
    assert_eq!(next.state, SyncState::Done);
    let calls = provider.calls();
    assert_eq!(calls[1].1, date("2025-01-03"));
    assert_eq!(calls[1].2, date("2025-01-06"));
    assert_eq!(store::load(&u.path).unwrap().last_date(), Some(date("2025-01-06")));
}

#[test]
fn only_out_of_window_bars_end_as_empty_after_filter() {
    let dir = tempfile::tempdir().unwrap();
    let mut provider = TableProvider::default().with("7203.T", vec![bar("2025-01-09", 1.0)]);
    provider.ignore_window = true;
    let config = config();
    let u = universe(dir.path(), "nikkei", &["7203.T"]);

    let outcome = Syncer::new(&config, &provider)
        .with_today(date("2025-01-03"))
        .sync_one(&u);
    assert_eq!(outcome.state, SyncState::EmptyAfterFilter);
    assert!(!u.path.exists());
}

#[test]
fn required_universe_without_identifiers_aborts_before_any_pass() {
    let dir = tempfile::tempdir().unwrap();
    let provider = TableProvider::default().with("7203.T", vec![bar("2025-01-02", 1.0)]);
    let config = config();
    let mut required = universe(dir.path(), "required", &[]);
    required.required = true;
    let other = universe(dir.path(), "other", &["7203.T"]);

    let report = Syncer::new(&config, &provider)
        .with_today(date("2025-01-03"))
        .sync_all(&[other.clone(), required]);

    assert_eq!(report.status(), RunStatus::Fatal);
    assert_eq!(report.missing_required, vec!["required"]);
    assert!(report.outcomes.is_empty());
    assert!(provider.calls().is_empty());
    assert!(!other.path.exists());
}

#[test]
fn unavailable_provider_fails_without_fetching() {
    let dir = tempfile::tempdir().unwrap();
    let mut provider = TableProvider::default().with("7203.T", vec![bar("2025-01-02", 1.0)]);
    provider.unavailable = true;
    let config = config();
    let u = universe(dir.path(), "nikkei", &["7203.T"]);

    let outcome = Syncer::new(&config, &provider)
        .with_today(date("2025-01-03"))
        .sync_one(&u);
    assert!(matches!(
        &outcome.state,
        SyncState::Failed { reason } if reason.contains("unavailable")
    ));
    assert!(provider.calls().is_empty());
    assert!(!u.path.exists());
}

#[test]
fn excluding_today_leaves_the_session_for_the_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let provider = TableProvider::default().with(
        "7203.T",
        vec![bar("2025-01-02", 2860.0), bar("2025-01-03", 2870.0)],
    );
    let mut config = config();
    config.include_today = false;
    let u = universe(dir.path(), "nikkei", &["7203.T"]);

    let first = Syncer::new(&config, &provider)
        .with_today(date("2025-01-03"))
        .sync_one(&u);
    assert_eq!(first.rows_written, 1);
    assert_eq!(provider.calls()[0].2, date("2025-01-02"));

    let same_day = Syncer::new(&config, &provider)
        .with_today(date("2025-01-03"))
        .sync_one(&u);
    assert_eq!(
        same_day.state,
        SyncState::UpToDate {
            last_date: date("2025-01-02")
        }
    );

    let next = Syncer::new(&config, &provider)
        .with_today(date("2025-01-04"))
        .sync_one(&u);
    assert_eq!(next.rows_written, 2);
}
