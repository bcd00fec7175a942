//! In-process remote log
//!
//! Stores sealed rows per patient exactly as the vitals API would serve them
//! and injects transport faults on demand: rows hidden from live fetches,
//! failed fetches, failed decrypts, duplicate deliveries, shuffled responses.
//! Deterministic hooks drive the tests; a seeded `FaultProfile` drives the
//! simulator.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Decryptor, RangeFetcher};
use crate::crypto::{pad_plaintext, AesGcmDecryptor, PLAINTEXT_BLOCK};
use crate::models::RawRow;
use crate::vitals::decoder::DEFAULT_PADDING;

/// Random fault rates, each a probability in `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultProfile {
    /// Row left out of a range response
    #[serde(default)]
    pub hide_prob: f64,
    /// Whole fetch fails
    #[serde(default)]
    pub fetch_fail_prob: f64,
    /// Decrypt call fails
    #[serde(default)]
    pub decrypt_fail_prob: f64,
    /// Row delivered twice in one response
    #[serde(default)]
    pub duplicate_prob: f64,
    /// Response order randomized
    #[serde(default)]
    pub shuffle: bool,
}

impl FaultProfile {
    /// No faults at all.
    pub fn reliable() -> Self {
        Self::default()
    }

    /// A link that drops, repeats and reorders regularly.
    pub fn lossy() -> Self {
        Self {
            hide_prob: 0.1,
            fetch_fail_prob: 0.05,
            decrypt_fail_prob: 0.03,
            duplicate_prob: 0.05,
            shuffle: true,
        }
    }

    fn clamped(mut self) -> Self {
        for p in [
            &mut self.hide_prob,
            &mut self.fetch_fail_prob,
            &mut self.decrypt_fail_prob,
            &mut self.duplicate_prob,
        ] {
            *p = if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 };
        }
        self
    }
}

/// How plaintext is turned into the `encrypted_data` blob.
#[derive(Clone)]
pub enum BlobCodec {
    /// base64 of the padded plaintext
    Base64,
    /// The origin's AES-256-GCM envelope
    Sealed(AesGcmDecryptor),
}

impl BlobCodec {
    fn encode(&self, plaintext: &str) -> Result<String> {
        match self {
            Self::Base64 => Ok(STANDARD.encode(plaintext)),
            Self::Sealed(cipher) => Ok(cipher.seal_random(&mut rand::thread_rng(), plaintext.as_bytes())?),
        }
    }

    fn decode(&self, blob: &str) -> Result<String> {
        match self {
            Self::Base64 => {
                let bytes = STANDARD.decode(blob.trim())?;
                Ok(String::from_utf8(bytes)?)
            }
            Self::Sealed(cipher) => Ok(cipher.open_envelope(blob)?),
        }
    }
}

/// One generated reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VitalReading {
    pub heart_rate: f64,
    pub oxygen_level: f64,
    pub temp: f64,
}

impl VitalReading {
    /// Resting adult ranges.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        Self {
            heart_rate: rng.gen_range(60..=100) as f64,
            oxygen_level: rng.gen_range(95..=100) as f64,
            temp: (rng.gen_range(36.0..=37.5_f64) * 10.0).round() / 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchRequest {
    Range { patient_id: String, start: u64, end: u64 },
    Latest { limit: u64 },
}

struct StoredRow {
    row: RawRow,
    arrival: u64,
}

#[derive(Default)]
struct Rows {
    by_patient: HashMap<String, BTreeMap<u64, StoredRow>>,
    arrivals: u64,
}

struct FaultState {
    rng: ChaCha8Rng,
    profile: FaultProfile,
    /// (patient, seq) → range fetches still to skip it
    hidden: HashMap<(String, u64), u32>,
    fail_fetches: u32,
    /// blob → decrypt calls still to fail
    decrypt_failures: HashMap<String, u32>,
    duplicates: HashSet<(String, u64)>,
    requests: Vec<FetchRequest>,
}

impl FaultState {
    fn roll(&mut self, p: f64) -> bool {
        p > 0.0 && self.rng.gen_bool(p)
    }

    fn check_fetch(&mut self) -> Result<()> {
        if self.fail_fetches > 0 {
            self.fail_fetches -= 1;
            bail!("injected fetch failure");
        }
        let p = self.profile.fetch_fail_prob;
        if self.roll(p) {
            bail!("random fetch failure");
        }
        Ok(())
    }

    fn take_hidden(&mut self, key: &(String, u64)) -> bool {
        match self.hidden.get_mut(key) {
            Some(n) if *n > 0 => {
                *n -= 1;
                if *n == 0 {
                    self.hidden.remove(key);
                }
                true
            }
            _ => false,
        }
    }

    fn check_decrypt(&mut self, blob: &str) -> Result<()> {
        if let Some(n) = self.decrypt_failures.get_mut(blob) {
            *n -= 1;
            if *n == 0 {
                self.decrypt_failures.remove(blob);
            }
            bail!("injected decrypt failure");
        }
        let p = self.profile.decrypt_fail_prob;
        if self.roll(p) {
            bail!("random decrypt failure");
        }
        Ok(())
    }
}

/// Remote vitals log held in memory.
pub struct InMemoryRemoteLog {
    rows: RwLock<Rows>,
    faults: Arc<Mutex<FaultState>>,
    codec: BlobCodec,
    padding: char,
}

impl InMemoryRemoteLog {
    /// Reliable log with base64 blobs.
    pub fn new() -> Self {
        Self::with_faults(BlobCodec::Base64, FaultProfile::reliable(), 0)
    }

    pub fn with_faults(codec: BlobCodec, profile: FaultProfile, seed: u64) -> Self {
        Self {
            rows: RwLock::new(Rows::default()),
            faults: Arc::new(Mutex::new(FaultState {
                rng: ChaCha8Rng::seed_from_u64(seed),
                profile: profile.clamped(),
                hidden: HashMap::new(),
                fail_fetches: 0,
                decrypt_failures: HashMap::new(),
                duplicates: HashSet::new(),
                requests: Vec::new(),
            })),
            codec,
            padding: DEFAULT_PADDING,
        }
    }

    /// Decryptor sharing this log's codec and decrypt faults.
    pub fn decryptor(&self) -> MemoryDecryptor {
        MemoryDecryptor {
            codec: self.codec.clone(),
            faults: self.faults.clone(),
        }
    }

    /// Append a reading with the patient's next `seq_no`.
    pub fn push_reading(&self, patient_id: &str, reading: VitalReading) -> Result<u64> {
        let seq_no = self.last_seq(patient_id).unwrap_or(0) + 1;
        self.insert_reading(patient_id, seq_no, reading, false)?;
        Ok(seq_no)
    }

    /// Store a reading under an explicit `seq_no`; rows delivered through the
    /// origin's fallback path carry `late = true`. Re-inserting a `seq_no` is
    /// ignored, like the API's duplicate-key handling.
    pub fn insert_reading(&self, patient_id: &str, seq_no: u64, reading: VitalReading, late: bool) -> Result<bool> {
        let json = serde_json::json!({
            "patient_id": patient_id,
            "heart_rate": reading.heart_rate,
            "oxygen_level": reading.oxygen_level,
            "temp": reading.temp,
        })
        .to_string();
        let padded = pad_plaintext(&json, PLAINTEXT_BLOCK, self.padding)?;
        self.insert_plaintext(patient_id, seq_no, &padded, late)
    }

    /// Store arbitrary plaintext (already padded) as a sealed row.
    pub fn insert_plaintext(&self, patient_id: &str, seq_no: u64, plaintext: &str, late: bool) -> Result<bool> {
        let encrypted_data = self.codec.encode(plaintext)?;
        let mut rows = self.rows.write();
        rows.arrivals += 1;
        let arrival = rows.arrivals;

        let patient = rows.by_patient.entry(patient_id.to_string()).or_default();
        if patient.contains_key(&seq_no) {
            return Ok(false);
        }
        patient.insert(
            seq_no,
            StoredRow {
                row: RawRow {
                    uuid: Some(Uuid::new_v4().to_string()),
                    seq_no: Some(seq_no),
                    patient_id: Some(patient_id.to_string()),
                    time: Some(Utc::now().to_rfc3339()),
                    encrypted_data,
                    late: Some(late),
                },
                arrival,
            },
        );
        Ok(true)
    }

    pub fn last_seq(&self, patient_id: &str) -> Option<u64> {
        self.rows
            .read()
            .by_patient
            .get(patient_id)
            .and_then(|p| p.keys().next_back().copied())
    }

    pub fn len(&self) -> usize {
        self.rows.read().by_patient.values().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row(&self, patient_id: &str, seq_no: u64) -> Option<RawRow> {
        self.rows
            .read()
            .by_patient
            .get(patient_id)
            .and_then(|p| p.get(&seq_no))
            .map(|s| s.row.clone())
    }

    /// Leave `seq_no` out of the next `fetches` range responses covering it.
    pub fn hide_from_live(&self, patient_id: &str, seq_no: u64, fetches: u32) {
        self.faults
            .lock()
            .hidden
            .insert((patient_id.to_string(), seq_no), fetches);
    }

    pub fn fail_next_fetches(&self, n: u32) {
        self.faults.lock().fail_fetches = n;
    }

    /// Fail the next `times` decrypt calls for this row's blob.
    pub fn fail_decrypt(&self, patient_id: &str, seq_no: u64, times: u32) -> Result<()> {
        let row = self
            .row(patient_id, seq_no)
            .ok_or_else(|| anyhow!("no row {seq_no} for {patient_id}"))?;
        if times > 0 {
            self.faults.lock().decrypt_failures.insert(row.encrypted_data, times);
        }
        Ok(())
    }

    /// Deliver `seq_no` twice in the next range response covering it.
    pub fn duplicate_next(&self, patient_id: &str, seq_no: u64) {
        self.faults
            .lock()
            .duplicates
            .insert((patient_id.to_string(), seq_no));
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.faults.lock().requests.clone()
    }

    fn serve_range(&self, patient_id: &str, start: u64, end: u64) -> Result<Vec<RawRow>> {
        let mut faults = self.faults.lock();
        faults.requests.push(FetchRequest::Range {
            patient_id: patient_id.to_string(),
            start,
            end,
        });
        faults.check_fetch()?;

        let rows = self.rows.read();
        let mut out = Vec::new();
        if start > end {
            return Ok(out);
        }
        if let Some(patient) = rows.by_patient.get(patient_id) {
            for (&seq_no, stored) in patient.range(start..=end) {
                let key = (patient_id.to_string(), seq_no);
                let hide_prob = faults.profile.hide_prob;
                if faults.take_hidden(&key) || faults.roll(hide_prob) {
                    continue;
                }
                out.push(stored.row.clone());

                let dup_prob = faults.profile.duplicate_prob;
                if faults.duplicates.remove(&key) || faults.roll(dup_prob) {
                    out.push(stored.row.clone());
                }
            }
        }

        if faults.profile.shuffle {
            out.shuffle(&mut faults.rng);
        }
        Ok(out)
    }

    fn serve_latest(&self, limit: u64) -> Result<Vec<RawRow>> {
        let mut faults = self.faults.lock();
        faults.requests.push(FetchRequest::Latest { limit });
        faults.check_fetch()?;
        drop(faults);

        let rows = self.rows.read();
        let mut all: Vec<&StoredRow> = rows.by_patient.values().flat_map(|p| p.values()).collect();
        all.sort_by(|a, b| b.arrival.cmp(&a.arrival));

        // The latest endpoint does not carry `late`
        Ok(all
            .into_iter()
            .take(limit as usize)
            .map(|s| RawRow {
                late: None,
                ..s.row.clone()
            })
            .collect())
    }
}

impl Default for InMemoryRemoteLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RangeFetcher for InMemoryRemoteLog {
    async fn fetch_by_seq_range(&self, patient_id: &str, start: u64, end: u64) -> Result<Vec<RawRow>> {
        self.serve_range(patient_id, start, end)
    }

    async fn fetch_latest(&self, limit: u64) -> Result<Vec<RawRow>> {
        self.serve_latest(limit)
    }
}

/// Decrypt collaborator paired with an `InMemoryRemoteLog`.
#[derive(Clone)]
pub struct MemoryDecryptor {
    codec: BlobCodec,
    faults: Arc<Mutex<FaultState>>,
}

impl MemoryDecryptor {
    fn open(&self, blob: &str) -> Result<String> {
        self.faults.lock().check_decrypt(blob)?;
        self.codec.decode(blob)
    }
}

#[async_trait::async_trait]
impl Decryptor for MemoryDecryptor {
    async fn decrypt(&self, blob: &str) -> Result<String> {
        self.open(blob)
    }
}
