//! kabuledger core: incremental sync of daily price bars into per-universe CSV files.
//!
//! - Coverage planner: the next date window each dataset needs
//! - Normalizer: ragged multi-symbol provider responses to flat rows
//! - Store: load / merge / atomic persist of the canonical CSV table
//! - Orchestrator: one isolated pass per universe, aggregated into a run report
//! - Collaborators: Yahoo Finance provider, constituent page scrapers

pub mod circuit_breaker;
pub mod config;
pub mod constituents;
pub mod domain;
pub mod normalize;
pub mod planner;
pub mod provider;
pub mod store;
pub mod sync;
pub mod yahoo;

pub use circuit_breaker::CircuitBreaker;
pub use config::{ConfigError, ProviderConfig, SyncConfig, UniverseConfig, UniverseSource};
pub use constituents::UniverseResolver;
pub use domain::{Dataset, DatasetOrigin, Observation, Universe};
pub use normalize::{normalize, Extraction, Normalized};
pub use planner::{CoveragePlan, CoveragePlanner, Window, WindowBasis};
pub use provider::{BatchProvider, BatchResponse, DataError, RawBar, SeriesPayload, SymbolConvention};
pub use store::{DatasetSummary, StoreError};
pub use sync::{RunReport, RunStatus, SyncOutcome, SyncState, Syncer};
pub use yahoo::YahooProvider;
