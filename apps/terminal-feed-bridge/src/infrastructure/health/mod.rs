//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, session status reporting, and Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (transport connected and logged in)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{RequestSessionManager, SessionController, TransactionNormalizer};
use crate::domain::SessionState;
use crate::infrastructure::bridge::BridgeSession;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Node name reported by this bridge.
    pub node: String,
    /// Bridge version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Session status.
    pub session: SessionStatus,
    /// Request id usage.
    pub requests: RequestStatus,
    /// Push normalization counters.
    pub transactions: TransactionStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Subscribed with a healthy connection.
    Healthy,
    /// Logged in but not subscribed, or the connection check failed.
    Degraded,
    /// Not logged in.
    Unhealthy,
}

/// Session lifecycle status.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    /// Lifecycle state.
    pub state: String,
    /// Transport connected and session authenticated.
    pub healthy: bool,
    /// Subscribed push channel.
    pub channel: String,
}

/// Request id usage.
#[derive(Debug, Clone, Serialize)]
pub struct RequestStatus {
    /// Request ids currently allocated.
    pub live_request_ids: usize,
}

/// Push normalization counters.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionStatus {
    /// Local sequence numbers consumed so far.
    pub emitted: u64,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
#[derive(Debug)]
pub struct HealthServerState {
    node: String,
    version: String,
    started_at: Instant,
    controller: Arc<SessionController>,
    requests: Arc<RequestSessionManager>,
    normalizer: Arc<TransactionNormalizer>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(node: String, version: String, session: &BridgeSession) -> Self {
        Self {
            node,
            version,
            started_at: Instant::now(),
            controller: Arc::clone(session.controller()),
            requests: Arc::clone(session.requests()),
            normalizer: Arc::clone(session.normalizer()),
        }
    }

    /// Health checks only touch the terminal once logged in.
    fn session_healthy(&self, state: SessionState) -> bool {
        state.is_logged_in() && self.controller.is_healthy()
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Routes served by [`HealthServer`].
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.session_healthy(state.controller.state()) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let session_state = state.controller.state();
    let healthy = state.session_healthy(session_state);

    HealthResponse {
        status: determine_health_status(session_state, healthy),
        node: state.node.clone(),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        session: SessionStatus {
            state: session_state.as_str().to_string(),
            healthy,
            channel: state.controller.channel().to_string(),
        },
        requests: RequestStatus {
            live_request_ids: state.requests.live_count(),
        },
        transactions: TransactionStatus {
            emitted: state.normalizer.emitted(),
        },
    }
}

fn determine_health_status(state: SessionState, healthy: bool) -> HealthStatus {
    match (state, healthy) {
        (SessionState::Subscribed, true) => HealthStatus::Healthy,
        (state, _) if state.is_logged_in() => HealthStatus::Degraded,
        _ => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
