//! Remote Log Collaborators
//!
//! The poll driver only sees these two traits. Concrete implementations:
//! - `rest`: HTTP client for the vitals API (range / latest / decrypt endpoints)
//! - `memory`: in-process log with fault injection, for tests and simulation

pub mod memory;
pub mod rest;

use anyhow::Result;

use crate::models::RawRow;

pub use memory::{BlobCodec, FaultProfile, FetchRequest, InMemoryRemoteLog, MemoryDecryptor, VitalReading};
pub use rest::{RestDecryptor, VitalsRestClient};

/// Source of encrypted, sequence-numbered rows.
#[async_trait::async_trait]
pub trait RangeFetcher: Send + Sync {
    /// Rows with `start <= seq_no <= end` for one patient. May return fewer
    /// rows than requested.
    async fn fetch_by_seq_range(&self, patient_id: &str, start: u64, end: u64)
        -> Result<Vec<RawRow>>;

    /// Up to `limit` most recent rows by capture time.
    async fn fetch_latest(&self, limit: u64) -> Result<Vec<RawRow>>;
}

/// Turns an opaque ciphertext blob into padded plaintext.
#[async_trait::async_trait]
pub trait Decryptor: Send + Sync {
    async fn decrypt(&self, blob: &str) -> Result<String>;
}
