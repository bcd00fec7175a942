//! Vitalwatch Backend Library
//!
//! Polls a remote log of encrypted, sequence-numbered vital-sign records and
//! reconciles it into one ordered, gap-annotated log.
//!
//! - `vitals`: decoder, reconciler, store and poll driver
//! - `remote`: fetch/decrypt collaborators (REST and in-memory)
//! - `crypto`: the origin's AES-GCM envelope
//! - `api`: status HTTP surface

pub mod api;
pub mod config;
pub mod crypto;
pub mod models;
pub mod remote;
pub mod vitals;

pub use config::AppConfig;
pub use models::{CaptureTime, RawRow, VitalRecord};
pub use vitals::{CanonicalLog, PollerConfig, Reconciler, VitalPoller, VitalStore};
