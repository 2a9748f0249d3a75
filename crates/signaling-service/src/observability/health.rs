//! Health endpoints for the signaling service.
//!
//! - `GET /health` - liveness (the process is up)
//! - `GET /ready` - readiness (the signaling listener is bound and the room
//!   registry still accepts joins)
//!
//! `/metrics` is merged into the same router by `main`.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness and readiness flags shared with the probe handlers.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    listening: AtomicBool,
    draining: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Live, not yet listening, not draining.
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            listening: AtomicBool::new(false),
            draining: AtomicBool::new(false),
        }
    }

    /// The signaling listener is bound and serving.
    pub fn set_ready(&self) {
        self.listening.store(true, Ordering::SeqCst);
    }

    /// Shutdown has begun; new clients should go elsewhere.
    pub fn set_not_ready(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.listening.load(Ordering::SeqCst) && !self.is_draining()
    }
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

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    if state.is_ready() {
        (StatusCode::OK, "ready")
    } else if state.is_draining() {
        (StatusCode::SERVICE_UNAVAILABLE, "draining")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn probe(state: Arc<HealthState>, uri: &str) -> StatusCode {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");
        health_router(state)
            .oneshot(request)
            .await
            .expect("Failed to execute request")
            .status()
    }

    #[test]
    fn test_health_state_lifecycle() {
        let state = HealthState::new();
        assert!(state.is_live());
        assert!(!state.is_ready(), "Should not be ready before listening");

        state.set_ready();
        assert!(state.is_ready());

        state.set_not_ready();
        assert!(state.is_draining());
        assert!(!state.is_ready(), "Draining overrides listening");

        // Draining is one-way
        state.set_ready();
        assert!(!state.is_ready());
    }

    #[tokio::test]
    async fn test_liveness_endpoint() {
        let state = Arc::new(HealthState::new());
        assert_eq!(probe(state, "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_endpoint_follows_state() {
        let state = Arc::new(HealthState::new());
        assert_eq!(
            probe(Arc::clone(&state), "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.set_ready();
        assert_eq!(probe(Arc::clone(&state), "/ready").await, StatusCode::OK);

        state.set_not_ready();
        assert_eq!(
            probe(state, "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_readiness_body_names_reason() {
        let state = Arc::new(HealthState::new());
        state.set_not_ready();
        let (status, body) = readiness_handler(State(state)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "draining");
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let state = Arc::new(HealthState::new());
        assert_eq!(probe(state, "/unknown").await, StatusCode::NOT_FOUND);
    }
}
