//! Vitalwatch
//!
//! Polls the vitals API for one patient, reconciles the encrypted feed into a
//! gap-annotated log and serves it on a small status API.
//!
//! Usage:
//!   vitalwatch --api-base http://localhost:8000 --patient-id patient1
//!
//! Environment:
//!   VITALWATCH_CONFIG_PATH - TOML config (default: vitalwatch.toml)
//!   VITALS_API_BASE, VITALS_PATIENT_ID, VITALS_WINDOW_SIZE, VITALS_POLL_MS,
//!   VITALS_INITIAL_LOAD (range|latest), VITALS_DECRYPT_MODE (remote|local)
//!   AES_KEY - 32-byte key for local decrypt mode

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use vitalwatch_backend::api::{self, ApiState};
use vitalwatch_backend::config::{AppConfig, DecryptMode};
use vitalwatch_backend::crypto::AesGcmDecryptor;
use vitalwatch_backend::remote::{Decryptor, RangeFetcher, VitalsRestClient};
use vitalwatch_backend::vitals::{InitialLoad, VitalPoller, VitalStore};

#[derive(Parser, Debug)]
#[command(name = "vitalwatch")]
#[command(about = "Poll and reconcile encrypted patient vitals")]
struct Args {
    /// TOML config file (overrides VITALWATCH_CONFIG_PATH)
    #[arg(long)]
    config: Option<String>,

    /// Vitals API base URL
    #[arg(long)]
    api_base: Option<String>,

    /// Patient to follow
    #[arg(long)]
    patient_id: Option<String>,

    /// Sequence numbers per poll window
    #[arg(long)]
    window_size: Option<u64>,

    /// Poll interval in milliseconds
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Start from the latest rows instead of seq 1
    #[arg(long)]
    latest: bool,

    /// Decrypt locally with AES_KEY instead of calling the API
    #[arg(long)]
    local_decrypt: bool,

    /// Status API port
    #[arg(long)]
    port: Option<u16>,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(v) = &self.api_base {
            config.remote.base_url = v.clone();
        }
        if let Some(v) = &self.patient_id {
            config.poller.patient_id = v.clone();
        }
        if let Some(v) = self.window_size.filter(|&v| v > 0) {
            config.poller.window_size = v;
        }
        if let Some(v) = self.poll_ms.filter(|&v| v > 0) {
            config.poller.interval = Duration::from_millis(v);
        }
        if self.latest {
            config.poller.initial_load = InitialLoad::Latest;
        }
        if self.local_decrypt {
            config.decrypt.mode = DecryptMode::Local;
        }
        if let Some(v) = self.port {
            config.server.port = v;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(Level::INFO.into())
                .add_directive("vitalwatch_backend=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            let mut config = AppConfig::load(path).with_context(|| format!("Failed to load {}", path))?;
            config.apply_overrides(|key| std::env::var(key).ok());
            config
        }
        None => AppConfig::from_env(),
    };
    args.apply(&mut config);

    info!("Starting vitalwatch");
    info!("  API: {}", config.remote.base_url);
    info!("  Patient: {}", config.poller.patient_id);
    info!(
        "  Window: {} every {}ms ({:?} initial load)",
        config.poller.window_size,
        config.poller.interval.as_millis(),
        config.poller.initial_load
    );
    info!("  Decrypt: {:?}", config.decrypt.mode);

    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Prometheus recorder unavailable: {}", e);
            None
        }
    };

    let client = VitalsRestClient::new(config.remote.clone())?;
    let decryptor: Arc<dyn Decryptor> = match config.decrypt.mode {
        DecryptMode::Remote => Arc::new(client.decryptor()),
        DecryptMode::Local => Arc::new(AesGcmDecryptor::from_env(&config.decrypt.key_env)?),
    };
    let fetcher: Arc<dyn RangeFetcher> = Arc::new(client);

    let store = Arc::new(VitalStore::new());
    let poller = VitalPoller::new(config.poller.clone(), fetcher, decryptor, store.clone());
    let handle = poller.spawn();

    let state = ApiState {
        store,
        stats: poller.stats(),
        prometheus,
        display_limit: config.server.display_limit,
    };
    let addr = format!("{}:{}", config.server.bind, config.server.port);

    tokio::select! {
        result = api::serve(&addr, state) => {
            if let Err(e) = result {
                warn!("Status API stopped: {:#}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    handle.stop().await;
    info!("Vitalwatch stopped");
    Ok(())
}
