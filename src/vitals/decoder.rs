//! Record Decoder
//!
//! Raw row → decrypt → strip filler → strict JSON parse → envelope merge.
//! A failure only ever drops the offending row; the rest of the batch
//! continues.

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::models::{coerce_reading, id_from_value, CaptureTime, RawRow, ReadingFault, VitalRecord};
use crate::remote::Decryptor;

/// Filler the origin appends to reach its fixed block size.
pub const DEFAULT_PADDING: char = 'X';

pub const DEFAULT_DECRYPT_CONCURRENCY: usize = 8;

/// Per-row decode failure.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Decrypt collaborator returned no usable plaintext
    Decrypt(String),
    /// Plaintext is not a JSON object
    Malformed(String),
    /// Reading present but not numeric
    InvalidReading { field: &'static str, raw: String },
    /// Reading coerced to NaN or infinity
    NonFiniteReading { field: &'static str },
    MissingSeqNo,
    MissingPatientId,
    InvalidTimestamp(Option<String>),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decrypt(e) => write!(f, "decrypt failed: {}", e),
            Self::Malformed(e) => write!(f, "malformed payload: {}", e),
            Self::InvalidReading { field, raw } => write!(f, "{} is not numeric: {}", field, raw),
            Self::NonFiniteReading { field } => write!(f, "{} is not finite", field),
            Self::MissingSeqNo => write!(f, "row has no seq_no"),
            Self::MissingPatientId => write!(f, "row has no patient_id"),
            Self::InvalidTimestamp(Some(t)) => write!(f, "invalid capture time: {}", t),
            Self::InvalidTimestamp(None) => write!(f, "row has no capture time"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decrypted payload after schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct VitalPayload {
    pub heart_rate: Option<f64>,
    pub oxygen_level: Option<f64>,
    pub temp: Option<f64>,
    pub patient_id: Option<String>,
}

/// Remove the trailing filler run (and any trailing whitespace).
#[inline]
pub fn strip_padding(plaintext: &str, filler: char) -> &str {
    plaintext.trim_end_matches(filler).trim_end()
}

pub fn parse_payload(text: &str) -> Result<VitalPayload, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(DecodeError::Malformed("payload is not a JSON object".to_string()));
    };

    Ok(VitalPayload {
        heart_rate: reading(&map, "heart_rate")?,
        oxygen_level: reading(&map, "oxygen_level")?,
        temp: reading(&map, "temp")?,
        patient_id: map.get("patient_id").and_then(id_from_value),
    })
}

fn reading(map: &Map<String, Value>, field: &'static str) -> Result<Option<f64>, DecodeError> {
    coerce_reading(map.get(field)).map_err(|fault| match fault {
        ReadingFault::NotNumeric(raw) => DecodeError::InvalidReading { field, raw },
        ReadingFault::NonFinite => DecodeError::NonFiniteReading { field },
    })
}

/// Decode already-decrypted plaintext against its envelope.
///
/// Envelope metadata (`seq_no`, `time`, `late`, `patient_id`) wins over the
/// payload; the payload's `patient_id` is only a fallback.
pub fn decode_plaintext(raw: &RawRow, plaintext: &str, filler: char) -> Result<VitalRecord, DecodeError> {
    let payload = parse_payload(strip_padding(plaintext, filler))?;

    let seq_no = raw.seq_no.ok_or(DecodeError::MissingSeqNo)?;
    let patient_id = raw
        .patient_id
        .clone()
        .or(payload.patient_id)
        .ok_or(DecodeError::MissingPatientId)?;
    let time = match raw.time.as_deref().map(CaptureTime::parse) {
        Some(Some(t @ CaptureTime::At(_))) => t,
        _ => return Err(DecodeError::InvalidTimestamp(raw.time.clone())),
    };

    Ok(VitalRecord {
        seq_no,
        patient_id,
        heart_rate: payload.heart_rate,
        oxygen_level: payload.oxygen_level,
        temp: payload.temp,
        time,
        late: raw.late.unwrap_or(false),
        missed_live: false,
    })
}

#[derive(Debug, Clone)]
pub struct RowFailure {
    pub seq_no: Option<u64>,
    pub error: DecodeError,
}

/// Outcome of decoding one fetched batch. `records` is in completion order.
#[derive(Debug, Clone, Default)]
pub struct DecodedBatch {
    pub records: Vec<VitalRecord>,
    pub failures: Vec<RowFailure>,
}

impl DecodedBatch {
    pub fn seq_nos(&self) -> impl Iterator<Item = u64> + '_ {
        self.records.iter().map(|r| r.seq_no)
    }
}

#[derive(Clone)]
pub struct RecordDecoder {
    decryptor: Arc<dyn Decryptor>,
    padding: char,
    concurrency: usize,
}

impl RecordDecoder {
    pub fn new(decryptor: Arc<dyn Decryptor>) -> Self {
        Self {
            decryptor,
            padding: DEFAULT_PADDING,
            concurrency: DEFAULT_DECRYPT_CONCURRENCY,
        }
    }

    pub fn with_padding(mut self, padding: char) -> Self {
        self.padding = padding;
        self
    }

    /// Max decrypt calls in flight per batch (at least 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn decode(&self, raw: &RawRow) -> Result<VitalRecord, DecodeError> {
        let plaintext = self
            .decryptor
            .decrypt(&raw.encrypted_data)
            .await
            .map_err(|e| DecodeError::Decrypt(format!("{e:#}")))?;
        decode_plaintext(raw, &plaintext, self.padding)
    }

    /// Best-effort decode of a whole batch.
    pub async fn decode_batch(&self, rows: Vec<RawRow>) -> DecodedBatch {
        let total = rows.len();
        let outcomes: Vec<(Option<u64>, Result<VitalRecord, DecodeError>)> = stream::iter(rows)
            .map(|row| async move {
                let outcome = self.decode(&row).await;
                (row.seq_no, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut batch = DecodedBatch::default();
        for (seq_no, outcome) in outcomes {
            match outcome {
                Ok(record) => batch.records.push(record),
                Err(error) => {
                    warn!(seq_no = ?seq_no, error = %error, "Dropping undecodable row");
                    batch.failures.push(RowFailure { seq_no, error });
                }
            }
        }

        if !batch.failures.is_empty() {
            metrics::counter!("vitals_decode_failures_total", batch.failures.len() as u64);
        }
        debug!(
            rows = total,
            decoded = batch.records.len(),
            failed = batch.failures.len(),
            "Decoded batch"
        );
        batch
    }
}
