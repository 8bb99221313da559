// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod alerts;
pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::alerts::{AlertEvaluator, AlertIntent, SeverityTable};
pub use crate::api::create_router;
pub use crate::ingest::fetcher::{Fetcher, FixtureFetcher, HttpFetcher};
pub use crate::ingest::normalizer::Normalizer;
pub use crate::ingest::scheduler::{Scheduler, SchedulerState, SchedulerStatus};
pub use crate::ingest::types::{CycleOutcome, CyclePhase};
pub use crate::ingest::{AlertSettings, Pipeline};
pub use crate::model::{EventRecord, IdentityKey};
pub use crate::notify::{Notifier, NotifierMux};
pub use crate::store::Store;
