//! Liveness and readiness probes.
//!
//! - `GET /health` returns 200 while the process runs.
//! - `GET /ready` returns 200 only while the media engine is connected and the
//!   service is not draining. The JSON body names the failing condition.
//!
//! `/metrics` is merged onto the same listener by the binary.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Probe state shared by the engine watcher and the shutdown path.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    engine_connected: AtomicBool,
    draining: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Live, engine not yet connected, not draining.
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            engine_connected: AtomicBool::new(false),
            draining: AtomicBool::new(false),
        }
    }

    pub fn engine_connected(&self) {
        self.engine_connected.store(true, Ordering::SeqCst);
    }

    pub fn engine_lost(&self) {
        self.engine_connected.store(false, Ordering::SeqCst);
    }

    /// Stop advertising readiness; set once shutdown begins and never cleared.
    pub fn start_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.engine_connected.load(Ordering::SeqCst) && !self.draining.load(Ordering::SeqCst)
    }

    fn readiness(&self) -> Readiness {
        let engine = if self.engine_connected.load(Ordering::SeqCst) {
            "connected"
        } else {
            "disconnected"
        };
        Readiness {
            status: if self.is_ready() { "ready" } else { "not_ready" },
            engine,
            draining: self.draining.load(Ordering::SeqCst),
        }
    }
}

/// Body of `GET /ready`.
#[derive(Debug, Serialize)]
struct Readiness {
    status: &'static str,
    engine: &'static str,
    draining: bool,
}

/// Router serving `/health` and `/ready`.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<Readiness>) {
    let code = if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(state.readiness()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    async fn get_path(state: &Arc<HealthState>, uri: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");
        let response = health_router(Arc::clone(state))
            .oneshot(request)
            .await
            .expect("Failed to execute request");
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    async fn ready_body(state: &Arc<HealthState>) -> (StatusCode, Value) {
        let (status, body) = get_path(state, "/ready").await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[test]
    fn test_ready_requires_engine_and_no_drain() {
        let state = HealthState::new();
        assert!(state.is_live());
        assert!(!state.is_ready());

        state.engine_connected();
        assert!(state.is_ready());

        state.engine_lost();
        assert!(!state.is_ready());

        state.engine_connected();
        state.start_draining();
        assert!(!state.is_ready());
    }

    #[tokio::test]
    async fn test_liveness_is_ok_before_engine_connects() {
        let state = Arc::new(HealthState::new());
        let (status, _) = get_path(&state, "/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_reports_engine_state() {
        let state = Arc::new(HealthState::new());

        let (status, body) = ready_body(&state).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body,
            json!({"status": "not_ready", "engine": "disconnected", "draining": false})
        );

        state.engine_connected();
        let (status, body) = ready_body(&state).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"status": "ready", "engine": "connected", "draining": false})
        );
    }

    #[tokio::test]
    async fn test_readiness_drops_while_draining() {
        let state = Arc::new(HealthState::new());
        state.engine_connected();
        state.start_draining();

        let (status, body) = ready_body(&state).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.get("draining"), Some(&json!(true)));
        assert_eq!(body.get("engine"), Some(&json!("connected")));
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let state = Arc::new(HealthState::new());
        let (status, _) = get_path(&state, "/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
