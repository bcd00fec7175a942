//! Vitals Simulator
//!
//! Runs the poll driver against an in-memory remote log fed by a generator
//! task, under a seeded fault profile, then checks the reconciled log.
//!
//! Usage:
//!   vitals_simulator --readings 200 --profile lossy --seed 42 --sealed

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use vitalwatch_backend::crypto::AesGcmDecryptor;
use vitalwatch_backend::remote::{BlobCodec, FaultProfile, InMemoryRemoteLog, VitalReading};
use vitalwatch_backend::vitals::{CanonicalLog, PlaceholderPolicy, PollerConfig, VitalPoller, VitalStore};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Profile {
    Reliable,
    Lossy,
}

#[derive(Parser, Debug)]
#[command(name = "vitals_simulator")]
#[command(about = "Exercise the vitals poller against a faulty in-memory feed")]
struct Args {
    /// Readings to generate
    #[arg(long, default_value = "100")]
    readings: u64,

    #[arg(long, default_value = "patient1")]
    patient_id: String,

    /// Generator period in milliseconds
    #[arg(long, default_value = "20")]
    period_ms: u64,

    /// Poll interval in milliseconds
    #[arg(long, default_value = "50")]
    poll_ms: u64,

    #[arg(long, default_value = "10")]
    window_size: u64,

    #[arg(long, value_enum, default_value = "lossy")]
    profile: Profile,

    /// Probability that a reading is delivered late through the fallback path
    #[arg(long, default_value = "0.02")]
    late_prob: f64,

    /// Seal rows with AES-256-GCM instead of plain base64
    #[arg(long)]
    sealed: bool,

    /// Never replace placeholders with late records
    #[arg(long)]
    keep_placeholders: bool,

    #[arg(long, default_value = "7")]
    seed: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(Level::INFO.into())
                .add_directive("vitals_simulator=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);

    let codec = if args.sealed {
        let mut key = [0u8; 32];
        rng.fill_bytes(&mut key);
        BlobCodec::Sealed(AesGcmDecryptor::new(&key)?)
    } else {
        BlobCodec::Base64
    };
    let profile = match args.profile {
        Profile::Reliable => FaultProfile::reliable(),
        Profile::Lossy => FaultProfile::lossy(),
    };

    info!("Starting vitals simulator");
    info!("  Readings: {} every {}ms", args.readings, args.period_ms);
    info!("  Poll: window {} every {}ms", args.window_size, args.poll_ms);
    info!("  Faults: {:?}", profile);

    let remote = Arc::new(InMemoryRemoteLog::with_faults(codec, profile, args.seed));
    let store = Arc::new(VitalStore::new());
    let config = PollerConfig {
        patient_id: args.patient_id.clone(),
        window_size: args.window_size,
        interval: Duration::from_millis(args.poll_ms),
        placeholder_policy: if args.keep_placeholders {
            PlaceholderPolicy::Keep
        } else {
            PlaceholderPolicy::Upgrade
        },
        ..PollerConfig::default()
    };
    let poller = VitalPoller::new(config, remote.clone(), Arc::new(remote.decryptor()), store.clone());
    let handle = poller.spawn();

    let generator = tokio::spawn(generate(
        remote.clone(),
        args.patient_id.clone(),
        args.readings,
        Duration::from_millis(args.period_ms),
        args.late_prob.clamp(0.0, 1.0),
        ChaCha8Rng::seed_from_u64(rng.next_u64()),
    ));
    generator.await??;

    // Let the poller catch up with the tail of the feed
    let deadline = tokio::time::Instant::now() + Duration::from_millis(args.poll_ms * 40);
    while store.snapshot().last_seq_no < args.readings && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(args.poll_ms)).await;
    }
    handle.stop().await;

    let state = store.snapshot();
    let stats = poller.stats().snapshot();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    let missed_live = state.log.iter().filter(|r| r.missed_live).count();
    info!(
        records = state.log.len(),
        placeholders = state.log.placeholder_count(),
        missed_live,
        upgraded = stats.upgraded,
        last_seq_no = state.last_seq_no,
        "Simulation finished"
    );

    verify(&state.log, args.readings)
}

/// Push readings at a fixed period; a few are held back and delivered later
/// with `late = true`, the way the origin's fallback queue does.
async fn generate(
    remote: Arc<InMemoryRemoteLog>,
    patient_id: String,
    readings: u64,
    period: Duration,
    late_prob: f64,
    mut rng: ChaCha8Rng,
) -> Result<()> {
    let mut held: Vec<(u64, u64, VitalReading)> = Vec::new();
    let mut ticker = tokio::time::interval(period);

    for seq_no in 1..=readings {
        ticker.tick().await;
        let reading = VitalReading::random(&mut rng);

        if late_prob > 0.0 && rng.gen_bool(late_prob) {
            let due = seq_no + rng.gen_range(2..=30);
            held.push((due, seq_no, reading));
        } else {
            remote.insert_reading(&patient_id, seq_no, reading, false)?;
        }

        let (due_now, later): (Vec<_>, Vec<_>) = held.into_iter().partition(|(due, _, _)| *due <= seq_no);
        held = later;
        for (_, late_seq, late_reading) in due_now {
            remote.insert_reading(&patient_id, late_seq, late_reading, true)?;
        }
    }

    for (_, late_seq, late_reading) in held {
        remote.insert_reading(&patient_id, late_seq, late_reading, true)?;
    }
    Ok(())
}

fn verify(log: &CanonicalLog, readings: u64) -> Result<()> {
    let seqs: Vec<u64> = log.seq_nos().collect();
    if seqs.windows(2).any(|w| w[1] != w[0] + 1) {
        bail!("log is not strictly contiguous");
    }
    if log.first_seq().is_some_and(|first| first != 1) {
        bail!("log does not start at seq 1");
    }
    match log.last_seq() {
        Some(last) if last >= readings => {}
        last => warn!(?last, readings, "Poller did not reach the end of the feed"),
    }
    info!("Log invariants hold");
    Ok(())
}
