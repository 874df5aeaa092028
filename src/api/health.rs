//! Health check endpoint.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::infrastructure::resilience::CircuitState;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub store: BackendHealthResponse,
    pub blobs: BackendHealthResponse,
    pub guard: GuardHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct BackendHealthResponse {
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitState>,
}

#[derive(Debug, Serialize)]
pub struct GuardHealthResponse {
    pub scope: String,
    pub tracked_locks: usize,
}

/// Reports "degraded" while the store's circuit breaker is open.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let guard = state.queue.guard();
    let circuit = state.queue.store_circuit_state();
    let status = if circuit == Some(CircuitState::Open) {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        store: BackendHealthResponse {
            backend: state.queue.store_backend().to_string(),
            circuit,
        },
        blobs: BackendHealthResponse {
            backend: state.queue.blob_backend().to_string(),
            circuit: None,
        },
        guard: GuardHealthResponse {
            scope: format!("{:?}", guard.scope()),
            tracked_locks: guard.tracked_locks(),
        },
    })
}
