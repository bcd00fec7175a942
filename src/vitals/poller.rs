//! Poll Driver
//!
//! One tick = fetch window → decode → window-local gap check → optional
//! recovery fetch → reconcile → publish. Ticks never overlap: a tick that
//! finds another in flight is skipped, not queued. After `stop()` nothing
//! reaches the store, even from a fetch that was already in flight.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::decoder::{RecordDecoder, DEFAULT_DECRYPT_CONCURRENCY, DEFAULT_PADDING};
use super::reconcile::{MergeStats, PlaceholderPolicy, Reconciler, DEFAULT_MAX_GAP_FILL};
use super::store::{LogState, VitalStore};
use super::window::PollWindow;
use crate::models::VitalRecord;
use crate::remote::{Decryptor, RangeFetcher};

/// How the first batch is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialLoad {
    /// Sequence window `1..=window_size`
    Range,
    /// Most recent `window_size` rows; the log starts at the oldest of them
    Latest,
}

impl Default for InitialLoad {
    fn default() -> Self {
        Self::Range
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_patient_id")]
    pub patient_id: String,
    /// Sequence numbers requested per tick
    #[serde(default = "default_window_size")]
    pub window_size: u64,
    /// Tick cadence
    #[serde(default = "default_interval", with = "crate::config::duration_ms")]
    pub interval: Duration,
    #[serde(default)]
    pub initial_load: InitialLoad,
    /// Decrypt calls in flight per batch
    #[serde(default = "default_decrypt_concurrency")]
    pub decrypt_concurrency: usize,
    #[serde(default)]
    pub placeholder_policy: PlaceholderPolicy,
    #[serde(default = "default_max_gap_fill")]
    pub max_gap_fill: u64,
    /// Filler stripped from decrypted plaintext
    #[serde(default = "default_padding")]
    pub padding: char,
    /// Placeholders within this many sequence numbers of the head are
    /// re-requested every tick, so a late delivery can still upgrade them
    #[serde(default = "default_placeholder_retry_span")]
    pub placeholder_retry_span: u64,
}

fn default_patient_id() -> String {
    "patient1".to_string()
}

fn default_window_size() -> u64 {
    10
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_decrypt_concurrency() -> usize {
    DEFAULT_DECRYPT_CONCURRENCY
}

fn default_max_gap_fill() -> u64 {
    DEFAULT_MAX_GAP_FILL
}

fn default_padding() -> char {
    DEFAULT_PADDING
}

fn default_placeholder_retry_span() -> u64 {
    100
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            patient_id: default_patient_id(),
            window_size: default_window_size(),
            interval: default_interval(),
            initial_load: InitialLoad::default(),
            decrypt_concurrency: default_decrypt_concurrency(),
            placeholder_policy: PlaceholderPolicy::default(),
            max_gap_fill: default_max_gap_fill(),
            padding: default_padding(),
            placeholder_retry_span: default_placeholder_retry_span(),
        }
    }
}

/// Poll driver counters
#[derive(Debug, Default)]
pub struct PollStats {
    pub ticks: AtomicU64,
    pub ticks_skipped: AtomicU64,
    pub ticks_failed: AtomicU64,
    pub ticks_cancelled: AtomicU64,
    pub rows_fetched: AtomicU64,
    pub decode_failures: AtomicU64,
    pub gaps_detected: AtomicU64,
    pub recovery_fetches: AtomicU64,
    pub records_recovered: AtomicU64,
    pub records_accepted: AtomicU64,
    pub placeholders: AtomicU64,
    pub duplicates: AtomicU64,
    pub upgraded: AtomicU64,
    pub implausible: AtomicU64,
}

impl PollStats {
    pub fn snapshot(&self) -> PollStatsSnapshot {
        PollStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            ticks_failed: self.ticks_failed.load(Ordering::Relaxed),
            ticks_cancelled: self.ticks_cancelled.load(Ordering::Relaxed),
            rows_fetched: self.rows_fetched.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            recovery_fetches: self.recovery_fetches.load(Ordering::Relaxed),
            records_recovered: self.records_recovered.load(Ordering::Relaxed),
            records_accepted: self.records_accepted.load(Ordering::Relaxed),
            placeholders: self.placeholders.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            upgraded: self.upgraded.load(Ordering::Relaxed),
            implausible: self.implausible.load(Ordering::Relaxed),
        }
    }

    fn record_merge(&self, merge: &MergeStats) {
        self.records_accepted.fetch_add(merge.accepted, Ordering::Relaxed);
        self.placeholders.fetch_add(merge.placeholders, Ordering::Relaxed);
        self.duplicates.fetch_add(merge.duplicates, Ordering::Relaxed);
        self.upgraded.fetch_add(merge.upgraded, Ordering::Relaxed);
        self.implausible.fetch_add(merge.implausible, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollStatsSnapshot {
    pub ticks: u64,
    pub ticks_skipped: u64,
    pub ticks_failed: u64,
    pub ticks_cancelled: u64,
    pub rows_fetched: u64,
    pub decode_failures: u64,
    pub gaps_detected: u64,
    pub recovery_fetches: u64,
    pub records_recovered: u64,
    pub records_accepted: u64,
    pub placeholders: u64,
    pub duplicates: u64,
    pub upgraded: u64,
    pub implausible: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickPhase {
    InitialLoad,
    Steady,
}

/// What a committed tick did.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub phase: TickPhase,
    /// Primary window; `None` for a latest-N initial load
    pub window: Option<PollWindow>,
    pub rows_fetched: usize,
    pub decode_failures: usize,
    /// Window-local holes that triggered a recovery fetch
    pub missing: Vec<u64>,
    /// Older placeholders re-requested alongside the holes
    pub retried: Vec<u64>,
    /// Rows obtained by the recovery fetch, holes and retries together
    pub recovered: usize,
    pub merge: MergeStats,
    pub last_seq_no: u64,
    pub version: u64,
}

#[derive(Debug, Clone)]
pub enum TickOutcome {
    Applied(TickReport),
    /// Another tick was in flight
    Skipped,
    /// The driver was stopped before the tick could commit
    Cancelled,
    /// Latest feed had nothing for this patient yet; the initial load is retried
    AwaitingData,
}

/// Decoded batch waiting to be committed.
struct PendingTick {
    phase: TickPhase,
    window: Option<PollWindow>,
    records: Vec<VitalRecord>,
    rows_fetched: usize,
    decode_failures: usize,
    missing: Vec<u64>,
    retried: Vec<u64>,
    recovered: usize,
}

impl PendingTick {
    /// A latest-N load that found no rows for the patient.
    fn is_empty_latest_load(&self) -> bool {
        self.window.is_none() && self.records.is_empty()
    }
}

/// Holds the single-flight flag for the duration of a tick.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct VitalPoller {
    config: PollerConfig,
    fetcher: Arc<dyn RangeFetcher>,
    decoder: RecordDecoder,
    store: Arc<VitalStore>,
    stats: Arc<PollStats>,
    in_flight: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl VitalPoller {
    pub fn new(
        config: PollerConfig,
        fetcher: Arc<dyn RangeFetcher>,
        decryptor: Arc<dyn Decryptor>,
        store: Arc<VitalStore>,
    ) -> Arc<Self> {
        let decoder = RecordDecoder::new(decryptor)
            .with_padding(config.padding)
            .with_concurrency(config.decrypt_concurrency);
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            config,
            fetcher,
            decoder,
            store,
            stats: Arc::new(PollStats::default()),
            in_flight: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<VitalStore> {
        &self.store
    }

    pub fn stats(&self) -> Arc<PollStats> {
        self.stats.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Cancel the schedule. In-flight ticks finish as `Cancelled` without
    /// writing to the store. Once this returns no further write can land.
    pub fn stop(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!(patient_id = %self.config.patient_id, "Stopping vitals poller");
        }
        self.store.quiesce();
    }

    /// Run exactly one tick.
    ///
    /// Transport failures come back as `Err` and leave the store untouched;
    /// the next tick retries the same window.
    pub async fn poll_once(&self) -> Result<TickOutcome> {
        if self.is_cancelled() {
            return Ok(TickOutcome::Cancelled);
        }
        let Some(_flight) = FlightGuard::acquire(&self.in_flight) else {
            self.stats.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            debug!("Previous tick still in flight, skipping");
            return Ok(TickOutcome::Skipped);
        };

        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("vitals_poll_ticks_total", 1);

        let state = self.store.snapshot();
        let pending = if state.loaded {
            self.steady_tick(&state).await
        } else {
            self.initial_load().await
        };

        match pending {
            Ok(pending) if pending.is_empty_latest_load() => {
                debug!(
                    patient_id = %self.config.patient_id,
                    rows = pending.rows_fetched,
                    "Latest feed has no rows for patient yet"
                );
                Ok(TickOutcome::AwaitingData)
            }
            Ok(pending) => Ok(self.commit(pending)),
            Err(e) => {
                self.stats.ticks_failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("vitals_poll_failures_total", 1);
                Err(e)
            }
        }
    }

    async fn initial_load(&self) -> Result<PendingTick> {
        let patient_id = self.config.patient_id.as_str();

        if self.config.initial_load == InitialLoad::Range {
            let window = PollWindow::initial(self.config.window_size);
            info!(patient_id, %window, "Initial range load");
            return self.poll_window(TickPhase::InitialLoad, window, Vec::new()).await;
        }

        let rows = self
            .fetcher
            .fetch_latest(self.config.window_size)
            .await
            .context("initial latest fetch failed")?;
        let rows_fetched = self.note_rows(rows.len());
        let decoded = self.decoder.decode_batch(rows).await;
        let decode_failures = self.note_failures(decoded.failures.len());

        // The latest feed is not scoped to a patient
        let records: Vec<VitalRecord> = decoded
            .records
            .into_iter()
            .filter(|r| r.patient_id == patient_id)
            .collect();

        info!(
            patient_id,
            rows = rows_fetched,
            records = records.len(),
            "Initial latest load"
        );

        Ok(PendingTick {
            phase: TickPhase::InitialLoad,
            window: None,
            records,
            rows_fetched,
            decode_failures,
            missing: Vec::new(),
            retried: Vec::new(),
            recovered: 0,
        })
    }

    async fn steady_tick(&self, state: &LogState) -> Result<PendingTick> {
        let window = PollWindow::after(state.last_seq_no, self.config.window_size);
        let outstanding = match self.config.placeholder_policy {
            PlaceholderPolicy::Upgrade => state.outstanding_placeholders(self.config.placeholder_retry_span),
            PlaceholderPolicy::Keep => Vec::new(),
        };
        self.poll_window(TickPhase::Steady, window, outstanding).await
    }

    /// Fetch one window, then re-request whatever it skipped together with
    /// any `outstanding` placeholders from earlier windows.
    async fn poll_window(
        &self,
        phase: TickPhase,
        window: PollWindow,
        outstanding: Vec<u64>,
    ) -> Result<PendingTick> {
        let patient_id = self.config.patient_id.as_str();

        let rows = self
            .fetcher
            .fetch_by_seq_range(patient_id, window.start, window.end)
            .await
            .with_context(|| format!("range fetch {window} failed"))?;
        let mut rows_fetched = self.note_rows(rows.len());

        let decoded = self.decoder.decode_batch(rows).await;
        let mut decode_failures = self.note_failures(decoded.failures.len());
        let missing = window.missing(decoded.seq_nos());
        let mut records = decoded.records;
        let mut recovered = 0;

        let wanted: BTreeSet<u64> = missing.iter().chain(&outstanding).copied().collect();
        let targets: Vec<u64> = wanted.iter().copied().collect();

        if let Some(span) = PollWindow::span(&targets) {
            if !missing.is_empty() {
                self.stats.gaps_detected.fetch_add(missing.len() as u64, Ordering::Relaxed);
                metrics::counter!("vitals_gaps_detected_total", missing.len() as u64);
            }
            self.stats.recovery_fetches.fetch_add(1, Ordering::Relaxed);
            debug!(
                %window,
                recovery = %span,
                missing = ?missing,
                retried = ?outstanding,
                "Re-requesting missing rows"
            );

            let rows = self
                .fetcher
                .fetch_by_seq_range(patient_id, span.start, span.end)
                .await
                .with_context(|| format!("recovery fetch {span} failed"))?;
            rows_fetched += self.note_rows(rows.len());

            let retry = self.decoder.decode_batch(rows).await;
            decode_failures += self.note_failures(retry.failures.len());

            for mut record in retry.records {
                if wanted.contains(&record.seq_no) {
                    record.missed_live = true;
                    records.push(record);
                    recovered += 1;
                }
            }

            self.stats.records_recovered.fetch_add(recovered as u64, Ordering::Relaxed);
            if recovered < targets.len() {
                debug!(
                    %window,
                    still_missing = targets.len() - recovered,
                    "Recovery incomplete, reconciler will fill placeholders"
                );
            }
        }

        Ok(PendingTick {
            phase,
            window: Some(window),
            records,
            rows_fetched,
            decode_failures,
            missing,
            retried: outstanding,
            recovered,
        })
    }

    fn commit(&self, pending: PendingTick) -> TickOutcome {
        let reconciler = self.reconciler_for(&pending.records);
        // Checked under the store's writer lock so a concurrent stop() cannot
        // slip in between the check and the write
        let Some((state, merge)) = self
            .store
            .apply_if(pending.records, &reconciler, || !self.is_cancelled())
        else {
            self.stats.ticks_cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(phase = ?pending.phase, "Driver stopped mid-tick, discarding batch");
            return TickOutcome::Cancelled;
        };
        self.stats.record_merge(&merge);

        if merge.placeholders > 0 {
            metrics::counter!("vitals_placeholders_total", merge.placeholders);
            warn!(
                patient_id = %self.config.patient_id,
                placeholders = merge.placeholders,
                last_seq_no = state.last_seq_no,
                "Synthesized placeholders for unrecovered sequence numbers"
            );
        }
        if merge.implausible > 0 {
            warn!(dropped = merge.implausible, "Dropped records with implausible sequence jumps");
        }
        metrics::gauge!("vitals_log_records", state.log.len() as f64);
        metrics::gauge!("vitals_last_seq_no", state.last_seq_no as f64);

        debug!(
            phase = ?pending.phase,
            accepted = merge.accepted,
            duplicates = merge.duplicates,
            last_seq_no = state.last_seq_no,
            version = state.version,
            "Tick committed"
        );

        TickOutcome::Applied(TickReport {
            phase: pending.phase,
            window: pending.window,
            rows_fetched: pending.rows_fetched,
            decode_failures: pending.decode_failures,
            missing: pending.missing,
            retried: pending.retried,
            recovered: pending.recovered,
            merge,
            last_seq_no: state.last_seq_no,
            version: state.version,
        })
    }

    /// In latest mode an empty log starts at the oldest record observed,
    /// not at sequence 1.
    fn reconciler_for(&self, batch: &[VitalRecord]) -> Reconciler {
        let mut reconciler = Reconciler::new()
            .with_placeholder_policy(self.config.placeholder_policy)
            .with_max_gap_fill(self.config.max_gap_fill);

        if self.config.initial_load == InitialLoad::Latest && self.store.snapshot().log.is_empty() {
            if let Some(first) = batch.iter().map(|r| r.seq_no).min() {
                reconciler = reconciler.with_origin(first);
            }
        }
        reconciler
    }

    fn note_rows(&self, n: usize) -> usize {
        self.stats.rows_fetched.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    fn note_failures(&self, n: usize) -> usize {
        self.stats.decode_failures.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    /// Tick loop. The next tick is only considered once the previous one has
    /// finished; a late tick is skipped rather than bunched up.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            patient_id = %self.config.patient_id,
            window_size = self.config.window_size,
            interval_ms = self.config.interval.as_millis() as u64,
            "Vitals poller started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown_signal(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = shutdown_signal(&mut shutdown) => {
                    self.stats.ticks_cancelled.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                result = self.poll_once() => match result {
                    Ok(TickOutcome::Cancelled) => break,
                    Ok(_) => {}
                    Err(e) => warn!("Poll tick failed, retrying next tick: {:#}", e),
                },
            }
        }

        info!(stats = ?self.stats.snapshot(), "Vitals poller stopped");
    }

    pub fn spawn(self: &Arc<Self>) -> PollerHandle {
        let task = tokio::spawn(self.clone().run());
        PollerHandle {
            poller: self.clone(),
            task,
        }
    }
}

async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Owner of a spawned poll loop.
pub struct PollerHandle {
    poller: Arc<VitalPoller>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn poller(&self) -> &Arc<VitalPoller> {
        &self.poller
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(self) {
        self.poller.stop();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Poll loop task ended abnormally");
        }
    }
}
