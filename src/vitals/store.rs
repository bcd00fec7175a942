//! Canonical log store
//!
//! Holds the current `LogState` behind an `ArcSwap`: readers take lock-free
//! snapshots while the single writer replaces the whole state per tick.
//! `LogState::apply` is pure, the store only publishes its result.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use super::log::CanonicalLog;
use super::reconcile::{MergeStats, Reconciler, Reconciliation};
use crate::models::VitalRecord;

/// Immutable snapshot of everything the poll driver tracks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogState {
    pub log: CanonicalLog,
    /// Highest `seq_no` merged so far; the next window starts after it
    pub last_seq_no: u64,
    /// Initial load has completed
    pub loaded: bool,
    /// Bumped on every published state
    pub version: u64,
}

impl LogState {
    /// Fold one batch into a new state. `self` is untouched.
    pub fn apply(&self, batch: Vec<VitalRecord>, reconciler: &Reconciler) -> (LogState, MergeStats) {
        let Reconciliation { log, stats } = reconciler.reconcile(&self.log, batch);
        let last_seq_no = self.last_seq_no.max(log.last_seq().unwrap_or(0));

        let next = LogState {
            log,
            last_seq_no,
            loaded: true,
            version: self.version + 1,
        };
        (next, stats)
    }

    /// Placeholders among the newest `span` sequence numbers, oldest first.
    /// These are the rows a late delivery may still fill in.
    pub fn outstanding_placeholders(&self, span: u64) -> Vec<u64> {
        let floor = self.last_seq_no.saturating_sub(span) + 1;
        (floor..=self.last_seq_no)
            .filter(|seq| self.log.get(*seq).is_some_and(|r| r.is_placeholder()))
            .collect()
    }
}

pub struct VitalStore {
    current: ArcSwap<LogState>,
    writer: Mutex<()>,
    version_tx: watch::Sender<u64>,
}

impl Default for VitalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VitalStore {
    pub fn new() -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            current: ArcSwap::from_pointee(LogState::default()),
            writer: Mutex::new(()),
            version_tx,
        }
    }

    pub fn snapshot(&self) -> Arc<LogState> {
        self.current.load_full()
    }

    /// Reconcile `batch` against the current state and publish the result.
    pub fn apply(&self, batch: Vec<VitalRecord>, reconciler: &Reconciler) -> (Arc<LogState>, MergeStats) {
        let _writer = self.writer.lock();
        self.publish(batch, reconciler)
    }

    /// Same as `apply`, but `admit` is evaluated under the writer lock and
    /// nothing is published when it returns false.
    pub fn apply_if<F>(
        &self,
        batch: Vec<VitalRecord>,
        reconciler: &Reconciler,
        admit: F,
    ) -> Option<(Arc<LogState>, MergeStats)>
    where
        F: FnOnce() -> bool,
    {
        let _writer = self.writer.lock();
        if !admit() {
            return None;
        }
        Some(self.publish(batch, reconciler))
    }

    /// Block until any write in progress has been published.
    pub fn quiesce(&self) {
        drop(self.writer.lock());
    }

    fn publish(&self, batch: Vec<VitalRecord>, reconciler: &Reconciler) -> (Arc<LogState>, MergeStats) {
        let (next, stats) = self.current.load().apply(batch, reconciler);
        let next = Arc::new(next);
        self.current.store(next.clone());
        self.version_tx.send_replace(next.version);
        (next, stats)
    }

    /// Receiver that wakes on every published version.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CaptureTime;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_apply_replaces_state() {
        let store = VitalStore::new();
        let before = store.snapshot();
        assert!(!before.loaded);

        let (after, stats) = store.apply(
            vec![VitalRecord::placeholder(1, "p"), VitalRecord::placeholder(3, "p")],
            &Reconciler::default(),
        );

        // The earlier snapshot is never mutated
        assert!(before.log.is_empty());
        assert_eq!(before.version, 0);

        assert!(after.loaded);
        assert_eq!(after.version, 1);
        assert_eq!(after.last_seq_no, 3);
        assert_eq!(after.log.len(), 3);
        assert_eq!(stats.placeholders, 1);
        assert_eq!(store.snapshot().version, 1);
    }

    #[test]
    fn test_empty_batch_marks_loaded() {
        let store = VitalStore::new();
        let mut rx = store.subscribe();
        let (state, _) = store.apply(Vec::new(), &Reconciler::default());

        assert!(state.loaded);
        assert_eq!(state.last_seq_no, 0);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
    }

    #[test]
    fn test_apply_if_rejected_publishes_nothing() {
        let store = VitalStore::new();
        let mut rx = store.subscribe();

        let result = store.apply_if(vec![VitalRecord::placeholder(1, "p")], &Reconciler::default(), || false);
        assert!(result.is_none());
        assert_eq!(store.snapshot().version, 0);
        assert!(!store.snapshot().loaded);
        assert!(!rx.has_changed().unwrap());

        let (state, _) = store
            .apply_if(vec![VitalRecord::placeholder(1, "p")], &Reconciler::default(), || true)
            .unwrap();
        assert_eq!(state.version, 1);
    }

    #[test]
    fn test_quiesce_waits_for_admitted_write() {
        let store = Arc::new(VitalStore::new());
        let admitted = Arc::new(AtomicBool::new(false));

        let writer = std::thread::spawn({
            let store = store.clone();
            let admitted = admitted.clone();
            move || {
                store.apply_if(vec![VitalRecord::placeholder(1, "p")], &Reconciler::default(), || {
                    admitted.store(true, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(50));
                    true
                })
            }
        });

        while !admitted.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        store.quiesce();
        assert_eq!(store.snapshot().version, 1);
        assert!(writer.join().unwrap().is_some());
    }

    #[test]
    fn test_outstanding_placeholders_are_bounded() {
        let store = VitalStore::new();
        let batch = [1, 4, 30, 33]
            .into_iter()
            .map(|seq| {
                let mut record = VitalRecord::placeholder(seq, "p");
                record.time = CaptureTime::At(Utc::now());
                record.missed_live = false;
                record
            })
            .collect();
        let (state, _) = store.apply(batch, &Reconciler::default());

        let mut expected: Vec<u64> = vec![2, 3];
        expected.extend(5..=29);
        expected.extend([31, 32]);
        assert_eq!(state.outstanding_placeholders(100), expected);
        assert_eq!(state.outstanding_placeholders(4), vec![31, 32]);
        assert_eq!(state.outstanding_placeholders(5), vec![29, 31, 32]);
        assert!(state.outstanding_placeholders(0).is_empty());
        assert!(LogState::default().outstanding_placeholders(10).is_empty());
    }
}
