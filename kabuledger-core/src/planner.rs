//! Coverage planning: the date window a dataset still needs.

use crate::domain::{Dataset, DatasetOrigin};
use chrono::{Days, NaiveDate};

/// Why a window starts where it does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowBasis {
    /// No history on disk: start at the epoch.
    Epoch,
    /// The file on disk was unreadable: start over at the epoch.
    Recovered { reason: String },
    /// Continue the day after the latest stored session.
    Resume { last_date: NaiveDate },
}

/// Inclusive fetch window `[start, end]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub basis: WindowBasis,
}

impl Window {
    /// Number of calendar days covered, both ends included.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn is_full_refetch(&self) -> bool {
        !matches!(self.basis, WindowBasis::Resume { .. })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoveragePlan {
    /// Nothing to fetch: the dataset already reaches `today`.
    Complete { last_date: NaiveDate },
    Fetch(Window),
}

#[derive(Debug, Clone, Copy)]
pub struct CoveragePlanner {
    epoch: NaiveDate,
}

impl CoveragePlanner {
    pub fn new(epoch: NaiveDate) -> Self {
        Self { epoch }
    }

    /// Plan the next window for `dataset` given the wall-clock date `today`.
    pub fn plan(&self, dataset: &Dataset, today: NaiveDate) -> CoveragePlan {
        let (start, basis) = match dataset.last_date() {
            Some(last_date) => match last_date.checked_add_days(Days::new(1)) {
                Some(next) => (next, WindowBasis::Resume { last_date }),
                None => return CoveragePlan::Complete { last_date },
            },
            None => {
                let basis = match &dataset.origin {
                    DatasetOrigin::Recovered { reason } => WindowBasis::Recovered {
                        reason: reason.clone(),
                    },
                    _ => WindowBasis::Epoch,
                };
                (self.epoch, basis)
            }
        };

        if start > today {
            // An empty dataset whose epoch is in the future has nothing to
            // fetch either; report the day before the epoch as its coverage.
            let last_date = match basis {
                WindowBasis::Resume { last_date } => last_date,
                _ => start.pred_opt().unwrap_or(start),
            };
            return CoveragePlan::Complete { last_date };
        }

        CoveragePlan::Fetch(Window {
            start,
            end: today,
            basis,
        })
    }
}
