//! Vitals Reconciliation Engine
//!
//! Turns polled, possibly duplicated, reordered or gapped rows into one
//! strictly ordered, gap-annotated log.
//!
//! - `decoder`: decrypt + strip filler + strict payload parse
//! - `reconcile`: dedup, placeholder synthesis, ordering (pure)
//! - `store`: atomically published log state
//! - `poller`: single-flight tick loop with window-local recovery fetches

pub mod decoder;
pub mod log;
pub mod poller;
pub mod reconcile;
pub mod store;
pub mod window;

pub use decoder::{DecodeError, DecodedBatch, RecordDecoder};
pub use log::CanonicalLog;
pub use poller::{
    InitialLoad, PollStats, PollStatsSnapshot, PollerConfig, PollerHandle, TickOutcome, TickPhase,
    TickReport, VitalPoller,
};
pub use reconcile::{reconcile, MergeStats, PlaceholderPolicy, Reconciler};
pub use store::{LogState, VitalStore};
pub use window::PollWindow;
