//! Poll driver against the in-memory remote log.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use vitalwatch_backend::models::RawRow;
use vitalwatch_backend::remote::{
    BlobCodec, FaultProfile, FetchRequest, InMemoryRemoteLog, RangeFetcher, VitalReading,
};
use vitalwatch_backend::vitals::{
    InitialLoad, PlaceholderPolicy, PollerConfig, TickOutcome, TickPhase, TickReport, VitalPoller,
    VitalStore,
};

const PATIENT: &str = "patient1";

fn reading(n: u64) -> VitalReading {
    VitalReading {
        heart_rate: 60.0 + n as f64,
        oxygen_level: 97.0,
        temp: 36.8,
    }
}

fn fill(remote: &InMemoryRemoteLog, patient_id: &str, range: std::ops::RangeInclusive<u64>) {
    for seq in range {
        remote.insert_reading(patient_id, seq, reading(seq), false).unwrap();
    }
}

fn poller_with(remote: Arc<dyn RangeFetcher>, decryptor: &InMemoryRemoteLog, config: PollerConfig) -> Arc<VitalPoller> {
    VitalPoller::new(
        config,
        remote,
        Arc::new(decryptor.decryptor()),
        Arc::new(VitalStore::new()),
    )
}

fn poller(remote: &Arc<InMemoryRemoteLog>) -> Arc<VitalPoller> {
    poller_with(remote.clone(), remote, PollerConfig::default())
}

fn applied(outcome: TickOutcome) -> TickReport {
    match outcome {
        TickOutcome::Applied(report) => report,
        other => panic!("expected applied tick, got {other:?}"),
    }
}

fn seqs(poller: &VitalPoller) -> Vec<u64> {
    poller.store().snapshot().log.seq_nos().collect()
}

#[tokio::test]
async fn test_decrypt_failure_is_recovered_within_window() {
    let remote = Arc::new(InMemoryRemoteLog::new());
    fill(&remote, PATIENT, 1..=10);
    remote.fail_decrypt(PATIENT, 4, 1).unwrap();
    let poller = poller(&remote);

    let report = applied(poller.poll_once().await.unwrap());
    assert_eq!(report.phase, TickPhase::InitialLoad);
    assert_eq!(report.decode_failures, 1);
    assert_eq!(report.missing, vec![4]);
    assert_eq!(report.recovered, 1);
    assert_eq!(report.merge.placeholders, 0);

    let state = poller.store().snapshot();
    assert_eq!(seqs(&poller), (1..=10).collect::<Vec<_>>());
    assert_eq!(state.log.placeholder_count(), 0);
    for record in state.log.iter() {
        assert_eq!(record.missed_live, record.seq_no == 4, "seq {}", record.seq_no);
    }

    assert_eq!(
        remote.requests(),
        vec![
            FetchRequest::Range { patient_id: PATIENT.into(), start: 1, end: 10 },
            FetchRequest::Range { patient_id: PATIENT.into(), start: 4, end: 4 },
        ]
    );
}

#[tokio::test]
async fn test_unrecoverable_row_becomes_placeholder() {
    let remote = Arc::new(InMemoryRemoteLog::new());
    fill(&remote, PATIENT, 1..=10);
    // Hidden from the live fetch and the recovery fetch
    remote.hide_from_live(PATIENT, 5, 2);
    let poller = poller(&remote);

    let report = applied(poller.poll_once().await.unwrap());
    assert_eq!(report.missing, vec![5]);
    assert_eq!(report.recovered, 0);
    assert_eq!(report.merge.placeholders, 1);

    let state = poller.store().snapshot();
    assert_eq!(state.log.len(), 10);
    assert!(state.log.get(5).unwrap().is_placeholder());
    assert!(state.log.get(6).unwrap().missed_live);
    assert!(!state.log.get(4).unwrap().missed_live);
}

#[tokio::test]
async fn test_late_delivery_upgrades_placeholder() {
    let remote = Arc::new(InMemoryRemoteLog::new());
    fill(&remote, PATIENT, 1..=4);
    fill(&remote, PATIENT, 6..=10);
    let poller = poller(&remote);

    let report = applied(poller.poll_once().await.unwrap());
    assert_eq!(report.missing, vec![5]);
    assert!(poller.store().snapshot().log.get(5).unwrap().is_placeholder());

    // The fallback path delivers row 5 after its window was polled
    remote.insert_reading(PATIENT, 5, reading(5), true).unwrap();
    fill(&remote, PATIENT, 11..=12);

    let report = applied(poller.poll_once().await.unwrap());
    assert_eq!(report.phase, TickPhase::Steady);
    assert!(report.missing.is_empty());
    assert_eq!(report.retried, vec![5]);
    assert_eq!(report.recovered, 1);
    assert_eq!(report.merge.upgraded, 1);

    let state = poller.store().snapshot();
    let record = state.log.get(5).unwrap();
    assert!(!record.is_placeholder());
    assert!(record.late);
    assert!(record.missed_live);
    assert_eq!(record.heart_rate, Some(65.0));
    assert_eq!(state.log.placeholder_count(), 0);
    assert_eq!(state.last_seq_no, 12);

    // Nothing outstanding any more: no recovery fetch on the next tick
    let before = remote.requests().len();
    let report = applied(poller.poll_once().await.unwrap());
    assert!(report.retried.is_empty());
    assert_eq!(remote.requests().len(), before + 1);
}

#[tokio::test]
async fn test_keep_policy_does_not_retry_placeholders() {
    let remote = Arc::new(InMemoryRemoteLog::new());
    fill(&remote, PATIENT, 1..=4);
    fill(&remote, PATIENT, 6..=10);
    let config = PollerConfig {
        placeholder_policy: PlaceholderPolicy::Keep,
        ..PollerConfig::default()
    };
    let poller = poller_with(remote.clone(), &remote, config);

    applied(poller.poll_once().await.unwrap());
    remote.insert_reading(PATIENT, 5, reading(5), true).unwrap();

    let report = applied(poller.poll_once().await.unwrap());
    assert!(report.retried.is_empty());
    assert_eq!(report.recovered, 0);
    assert!(poller.store().snapshot().log.get(5).unwrap().is_placeholder());
}

#[tokio::test]
async fn test_placeholders_past_retry_span_are_left_alone() {
    let remote = Arc::new(InMemoryRemoteLog::new());
    fill(&remote, PATIENT, 1..=4);
    fill(&remote, PATIENT, 6..=30);
    let config = PollerConfig {
        placeholder_retry_span: 10,
        ..PollerConfig::default()
    };
    let poller = poller_with(remote.clone(), &remote, config);

    for _ in 0..3 {
        applied(poller.poll_once().await.unwrap());
    }
    assert_eq!(poller.store().snapshot().last_seq_no, 30);

    remote.insert_reading(PATIENT, 5, reading(5), true).unwrap();
    let report = applied(poller.poll_once().await.unwrap());
    assert!(report.retried.is_empty());
    assert!(poller.store().snapshot().log.get(5).unwrap().is_placeholder());
}

#[tokio::test]
async fn test_transport_failure_leaves_state_untouched() {
    let remote = Arc::new(InMemoryRemoteLog::new());
    fill(&remote, PATIENT, 1..=3);
    remote.fail_next_fetches(1);
    let poller = poller(&remote);

    assert!(poller.poll_once().await.is_err());
    let state = poller.store().snapshot();
    assert!(!state.loaded);
    assert_eq!(state.version, 0);
    assert_eq!(poller.stats().snapshot().ticks_failed, 1);

    // Same window is retried on the next tick
    let report = applied(poller.poll_once().await.unwrap());
    assert_eq!(report.window.map(|w| (w.start, w.end)), Some((1, 10)));
    assert_eq!(seqs(&poller), vec![1, 2, 3]);
}

/// Fails every call whose index is in `fail_calls`.
struct FailingCalls {
    inner: Arc<InMemoryRemoteLog>,
    calls: AtomicUsize,
    fail_calls: Vec<usize>,
}

#[async_trait::async_trait]
impl RangeFetcher for FailingCalls {
    async fn fetch_by_seq_range(&self, patient_id: &str, start: u64, end: u64) -> Result<Vec<RawRow>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_calls.contains(&call) {
            bail!("connection reset");
        }
        self.inner.fetch_by_seq_range(patient_id, start, end).await
    }

    async fn fetch_latest(&self, limit: u64) -> Result<Vec<RawRow>> {
        self.inner.fetch_latest(limit).await
    }
}

#[tokio::test]
async fn test_failed_recovery_fetch_abandons_tick() {
    let remote = Arc::new(InMemoryRemoteLog::new());
    fill(&remote, PATIENT, 1..=10);
    remote.hide_from_live(PATIENT, 7, 1);

    // Call 0 is the live window, call 1 its recovery fetch
    let fetcher = Arc::new(FailingCalls {
        inner: remote.clone(),
        calls: AtomicUsize::new(0),
        fail_calls: vec![1],
    });
    let poller = poller_with(fetcher, &remote, PollerConfig::default());

    assert!(poller.poll_once().await.is_err());
    assert!(!poller.store().snapshot().loaded);

    // Row 7 is visible again; the retry sees a complete window
    let report = applied(poller.poll_once().await.unwrap());
    assert!(report.missing.is_empty());
    assert_eq!(seqs(&poller), (1..=10).collect::<Vec<_>>());
    assert_eq!(poller.store().snapshot().log.placeholder_count(), 0);
}

#[tokio::test]
async fn test_steady_ticks_follow_last_seq_no() {
    let remote = Arc::new(InMemoryRemoteLog::new());
    fill(&remote, PATIENT, 1..=4);
    let poller = poller(&remote);

    applied(poller.poll_once().await.unwrap());
    assert_eq!(poller.store().snapshot().last_seq_no, 4);

    // Nothing new yet: no holes, no recovery
    let report = applied(poller.poll_once().await.unwrap());
    assert_eq!(report.phase, TickPhase::Steady);
    assert_eq!(report.rows_fetched, 0);
    assert!(report.missing.is_empty());

    fill(&remote, PATIENT, 5..=12);
    remote.insert_reading(PATIENT, 13, reading(13), true).unwrap();
    let report = applied(poller.poll_once().await.unwrap());
    assert_eq!(report.window.map(|w| (w.start, w.end)), Some((5, 14)));
    assert_eq!(report.last_seq_no, 13);

    let state = poller.store().snapshot();
    assert!(state.log.get(13).unwrap().late);
    assert!(!state.log.get(13).unwrap().missed_live);
    assert_eq!(state.log.len(), 13);
}

#[tokio::test]
async fn test_duplicate_and_shuffled_delivery() {
    let profile = FaultProfile {
        shuffle: true,
        ..FaultProfile::reliable()
    };
    let remote = Arc::new(InMemoryRemoteLog::with_faults(BlobCodec::Base64, profile, 11));
    fill(&remote, PATIENT, 1..=10);
    remote.duplicate_next(PATIENT, 3);
    remote.duplicate_next(PATIENT, 9);
    let poller = poller(&remote);

    let report = applied(poller.poll_once().await.unwrap());
    assert_eq!(report.rows_fetched, 12);
    assert_eq!(report.merge.duplicates, 2);
    assert_eq!(seqs(&poller), (1..=10).collect::<Vec<_>>());
    assert_eq!(poller.store().snapshot().log.placeholder_count(), 0);
}

#[tokio::test]
async fn test_latest_mode_starts_mid_stream() {
    let remote = Arc::new(InMemoryRemoteLog::new());
    fill(&remote, PATIENT, 1..=50);
    fill(&remote, "patient2", 1..=3);
    let config = PollerConfig {
        initial_load: InitialLoad::Latest,
        ..PollerConfig::default()
    };
    let poller = poller_with(remote.clone(), &remote, config);

    let report = applied(poller.poll_once().await.unwrap());
    assert_eq!(report.window, None);
    assert_eq!(report.merge.placeholders, 0);
    // Newest 10 rows: three from patient2, seven from patient1
    assert_eq!(seqs(&poller), (44..=50).collect::<Vec<_>>());

    fill(&remote, PATIENT, 51..=52);
    applied(poller.poll_once().await.unwrap());
    assert_eq!(seqs(&poller), (44..=52).collect::<Vec<_>>());
    assert_eq!(remote.requests()[0], FetchRequest::Latest { limit: 10 });
}

#[tokio::test]
async fn test_latest_mode_waits_for_patient_rows() {
    let remote = Arc::new(InMemoryRemoteLog::new());
    fill(&remote, "patient2", 1..=3);
    let config = PollerConfig {
        initial_load: InitialLoad::Latest,
        ..PollerConfig::default()
    };
    let poller = poller_with(remote.clone(), &remote, config);

    assert!(matches!(poller.poll_once().await.unwrap(), TickOutcome::AwaitingData));
    let state = poller.store().snapshot();
    assert!(!state.loaded);
    assert_eq!(state.version, 0);

    fill(&remote, PATIENT, 40..=45);
    let report = applied(poller.poll_once().await.unwrap());
    assert_eq!(report.phase, TickPhase::InitialLoad);
    assert_eq!(seqs(&poller), (40..=45).collect::<Vec<_>>());
    assert_eq!(
        remote.requests(),
        vec![FetchRequest::Latest { limit: 10 }, FetchRequest::Latest { limit: 10 }]
    );
}

#[tokio::test]
async fn test_spawned_loop_catches_up_and_stops() {
    let remote = Arc::new(InMemoryRemoteLog::new());
    fill(&remote, PATIENT, 1..=25);
    let config = PollerConfig {
        interval: Duration::from_millis(10),
        ..PollerConfig::default()
    };
    let poller = poller_with(remote.clone(), &remote, config);
    let store = poller.store().clone();
    let mut versions = store.subscribe();

    let handle = poller.spawn();
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.snapshot().last_seq_no < 25 {
            versions.changed().await.unwrap();
        }
    })
    .await
    .expect("poller did not catch up");

    handle.stop().await;
    assert!(poller.is_cancelled());
    let stopped_at = store.snapshot().version;

    fill(&remote, PATIENT, 26..=30);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.snapshot().version, stopped_at);
    assert_eq!(store.snapshot().last_seq_no, 25);
    assert!(matches!(poller.poll_once().await.unwrap(), TickOutcome::Cancelled));
}

#[tokio::test]
async fn test_lossy_feed_keeps_log_invariants() {
    let remote = Arc::new(InMemoryRemoteLog::with_faults(
        BlobCodec::Base64,
        FaultProfile::lossy(),
        42,
    ));
    fill(&remote, PATIENT, 1..=120);
    let poller = poller(&remote);

    for _ in 0..60 {
        let _ = poller.poll_once().await;
    }

    let state = poller.store().snapshot();
    let seqs: Vec<u64> = state.log.seq_nos().collect();
    assert_eq!(seqs.first(), Some(&1));
    assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
    assert_eq!(state.last_seq_no, 120);

    let stats = poller.stats().snapshot();
    assert!(stats.ticks_failed > 0 || stats.recovery_fetches > 0);
}
