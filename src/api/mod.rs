//! Status HTTP surface
//!
//! Read-only views over the published log state and poller counters.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::models::VitalRecord;
use crate::vitals::{PollStats, PollStatsSnapshot, VitalStore};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<VitalStore>,
    pub stats: Arc<PollStats>,
    pub prometheus: Option<PrometheusHandle>,
    /// Upper bound on records per `/vitals` response
    pub display_limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct VitalsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VitalsView {
    /// Nothing merged yet; clients show a waiting state
    pub waiting: bool,
    pub loaded: bool,
    pub last_seq_no: u64,
    pub version: u64,
    pub total: usize,
    pub placeholders: usize,
    pub records: Vec<VitalRecord>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/vitals", get(get_vitals))
        .route("/stats", get(get_stats))
        .route("/metrics", get(get_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(addr: &str, state: ApiState) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status API on {}", addr))?;
    info!("Status API listening on {}", addr);

    axum::serve(listener, router(state))
        .await
        .context("Status API server error")
}

async fn health() -> &'static str {
    "OK"
}

async fn get_vitals(State(state): State<ApiState>, Query(params): Query<VitalsQuery>) -> Json<VitalsView> {
    let snapshot = state.store.snapshot();
    let limit = params
        .limit
        .unwrap_or(state.display_limit)
        .min(state.display_limit);

    Json(VitalsView {
        waiting: snapshot.log.is_empty(),
        loaded: snapshot.loaded,
        last_seq_no: snapshot.last_seq_no,
        version: snapshot.version,
        total: snapshot.log.len(),
        placeholders: snapshot.log.placeholder_count(),
        records: snapshot.log.tail(limit).to_vec(),
    })
}

async fn get_stats(State(state): State<ApiState>) -> Json<PollStatsSnapshot> {
    Json(state.stats.snapshot())
}

async fn get_metrics(State(state): State<ApiState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vitals::Reconciler;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn state(store: Arc<VitalStore>) -> ApiState {
        ApiState {
            store,
            stats: Arc::new(PollStats::default()),
            prometheus: None,
            display_limit: 3,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(app: Router, uri: &str) -> (StatusCode, T) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_vitals_waiting_when_empty() {
        let app = router(state(Arc::new(VitalStore::new())));
        let (status, view): (_, VitalsView) = get_json(app, "/vitals").await;

        assert_eq!(status, StatusCode::OK);
        assert!(view.waiting);
        assert!(!view.loaded);
        assert!(view.records.is_empty());
    }

    #[tokio::test]
    async fn test_vitals_tail_is_capped() {
        let store = Arc::new(VitalStore::new());
        store.apply(vec![VitalRecord::placeholder(6, "p1")], &Reconciler::default());
        let app = router(state(store));

        let (_, view): (_, VitalsView) = get_json(app.clone(), "/vitals?limit=50").await;
        assert!(!view.waiting);
        assert_eq!(view.total, 6);
        assert_eq!(view.placeholders, 6);
        let seqs: Vec<u64> = view.records.iter().map(|r| r.seq_no).collect();
        assert_eq!(seqs, vec![4, 5, 6]);

        let (_, view): (_, VitalsView) = get_json(app, "/vitals?limit=1").await;
        assert_eq!(view.records.len(), 1);
        assert_eq!(view.records[0].seq_no, 6);
    }

    #[tokio::test]
    async fn test_stats_and_metrics() {
        let app = router(state(Arc::new(VitalStore::new())));
        let (status, stats): (_, PollStatsSnapshot) = get_json(app.clone(), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats, PollStatsSnapshot::default());

        let resp = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
