//! Sync orchestrator: one pass per universe, PLAN → FETCH → NORMALIZE → MERGE.
//!
//! Every failure inside a pass is converted into a [`SyncOutcome`]; nothing
//! escapes `sync_one`, so one universe failing never stops the others.

use crate::config::SyncConfig;
use crate::domain::Universe;
use crate::normalize::normalize;
use crate::planner::{CoveragePlan, CoveragePlanner, WindowBasis};
use crate::provider::{BatchProvider, SymbolConvention};
use crate::store;
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Terminal state of one universe's pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    /// No identifiers to track.
    Skipped,
    /// Dataset already covers today; the provider was not called.
    UpToDate { last_date: NaiveDate },
    /// Provider returned nothing for the window.
    NoData,
    /// Provider returned data but no row survived normalization.
    EmptyAfterFilter,
    /// Merged and persisted.
    Done,
    Failed { reason: String },
}

impl SyncState {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped => write!(f, "skipped (empty universe)"),
            Self::UpToDate { last_date } => write!(f, "up to date (through {last_date})"),
            Self::NoData => write!(f, "no new data"),
            Self::EmptyAfterFilter => write!(f, "no usable rows"),
            Self::Done => write!(f, "updated"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub universe: String,
    pub state: SyncState,
    pub updated: bool,
    /// Total rows in the persisted file after a `Done` pass, else 0.
    pub rows_written: usize,
    /// Rows the provider contributed in this pass.
    pub rows_fetched: usize,
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl SyncOutcome {
    fn new(universe: &str) -> Self {
        Self {
            universe: universe.to_string(),
            state: SyncState::Skipped,
            updated: false,
            rows_written: 0,
            rows_fetched: 0,
            warnings: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }
}

/// Aggregate verdict for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Some universes failed, others did not.
    Degraded,
    /// A required universe had no identifiers, or every universe failed.
    Fatal,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Fatal => 1,
            Self::Degraded => 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub outcomes: Vec<SyncOutcome>,
    /// Required universes that came back without identifiers.
    pub missing_required: Vec<String>,
}

impl RunReport {
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.state.is_failed()).count()
    }

    pub fn updated(&self) -> usize {
        self.outcomes.iter().filter(|o| o.updated).count()
    }

    pub fn status(&self) -> RunStatus {
        let failed = self.failed();
        if !self.missing_required.is_empty()
            || (!self.outcomes.is_empty() && failed == self.outcomes.len())
        {
            RunStatus::Fatal
        } else if failed > 0 {
            RunStatus::Degraded
        } else {
            RunStatus::Success
        }
    }

    pub fn log_summary(&self) {
        tracing::info!(
            universes = self.outcomes.len(),
            updated = self.updated(),
            failed = self.failed(),
            status = ?self.status(),
            "sync run finished"
        );
    }
}

/// Drives sync passes against one provider.
pub struct Syncer<'a> {
    provider: &'a dyn BatchProvider,
    planner: CoveragePlanner,
    convention: SymbolConvention,
    include_today: bool,
    today: Option<NaiveDate>,
}

impl<'a> Syncer<'a> {
    pub fn new(config: &SyncConfig, provider: &'a dyn BatchProvider) -> Self {
        Self {
            provider,
            planner: CoveragePlanner::new(config.epoch),
            convention: SymbolConvention::with_suffix(config.provider.symbol_suffix.clone()),
            include_today: config.include_today,
            today: None,
        }
    }

    /// Pin "today" instead of reading the local wall clock.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| chrono::Local::now().date_naive())
    }

    /// Last session a pass may fetch: today, or yesterday when today's bar
    /// may still be in progress.
    pub fn fetch_through(&self) -> NaiveDate {
        let today = self.today();
        if self.include_today {
            today
        } else {
            today.pred_opt().unwrap_or(today)
        }
    }

    /// Run one pass for one universe. Never panics on I/O or provider errors.
    pub fn sync_one(&self, universe: &Universe) -> SyncOutcome {
        let started = Instant::now();
        let mut outcome = SyncOutcome::new(&universe.name);
        outcome.state = self.run_pass(universe, &mut outcome);
        outcome.elapsed = started.elapsed();

        match &outcome.state {
            SyncState::Failed { reason } => {
                tracing::error!(universe = %universe.name, %reason, "sync failed");
            }
            state => {
                tracing::info!(
                    universe = %universe.name,
                    state = %state,
                    rows = outcome.rows_written,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "sync finished"
                );
            }
        }
        outcome
    }

    fn run_pass(&self, universe: &Universe, outcome: &mut SyncOutcome) -> SyncState {
        if universe.identifiers.is_empty() {
            tracing::warn!(universe = %universe.name, "identifier list is empty, skipping");
            return SyncState::Skipped;
        }

        // PLAN
        let existing = match store::load(&universe.path) {
            Ok(ds) => ds,
            Err(e) => {
                return SyncState::Failed {
                    reason: e.to_string(),
                }
            }
        };
        let window = match self.planner.plan(&existing, self.fetch_through()) {
            CoveragePlan::Complete { last_date } => return SyncState::UpToDate { last_date },
            CoveragePlan::Fetch(window) => window,
        };
        if let WindowBasis::Recovered { reason } = &window.basis {
            outcome.warnings.push(format!(
                "{} was unreadable ({reason}); refetching from {}",
                universe.path.display(),
                window.start
            ));
        }

        // FETCH
        if !self.provider.is_available() {
            return SyncState::Failed {
                reason: format!("provider {} is unavailable", self.provider.name()),
            };
        }
        tracing::info!(
            universe = %universe.name,
            symbols = universe.identifiers.len(),
            start = %window.start,
            end = %window.end,
            days = window.days(),
            full_refetch = window.is_full_refetch(),
            provider = self.provider.name(),
            "fetching"
        );
        let response = match self
            .provider
            .fetch_batch(&universe.identifiers, window.start, window.end)
        {
            Ok(resp) => resp,
            Err(e) => {
                return SyncState::Failed {
                    reason: e.to_string(),
                }
            }
        };
        if response.is_empty() {
            return SyncState::NoData;
        }
        tracing::debug!(
            universe = %universe.name,
            series = response.series.len(),
            bars = response.bar_count(),
            "batch received"
        );

        // NORMALIZE
        let normalized = normalize(&response, &universe.identifiers, &self.convention, &window);
        outcome.warnings.extend(normalized.warnings());
        tracing::debug!(universe = %universe.name, summary = %normalized.summary(), "normalized");
        if normalized.is_empty() {
            return SyncState::EmptyAfterFilter;
        }
        outcome.rows_fetched = normalized.rows.len();

        // MERGE
        let recovered = existing.recovery_reason().is_some();
        let merged = store::merge(existing, normalized.rows);
        if recovered {
            if let Err(e) = store::quarantine(&universe.path) {
                return SyncState::Failed {
                    reason: format!("could not preserve unreadable file: {e}"),
                };
            }
        }
        if let Err(e) = store::persist(&merged, &universe.path) {
            return SyncState::Failed {
                reason: e.to_string(),
            };
        }

        outcome.updated = true;
        outcome.rows_written = merged.len();
        SyncState::Done
    }

    /// Sync universes one after another.
    ///
    /// A required universe without identifiers aborts the run before any
    /// pass starts: the report carries no outcomes and nothing is written.
    pub fn sync_all(&self, universes: &[Universe]) -> RunReport {
        let mut report = RunReport::default();
        for universe in universes {
            if universe.required && universe.identifiers.is_empty() {
                tracing::error!(universe = %universe.name, "required universe has no identifiers");
                report.missing_required.push(universe.name.clone());
            }
        }
        if !report.missing_required.is_empty() {
            tracing::error!(
                missing = %report.missing_required.join(","),
                "aborting run before any universe is synced"
            );
            return report;
        }

        for universe in universes {
            report.outcomes.push(self.sync_one(universe));
        }
        report.log_summary();
        report
    }
}
