//! Orchestrator status endpoint.

use axum::extract::State;
use axum::Json;

use eoslink_flow::runtime::RuntimeSnapshot;

use crate::server::AppState;

/// GET `/api/eos/runtime`
///
/// Probes optimizer health live, so the response reflects connectivity
/// at request time rather than the last background poll.
pub async fn snapshot(State(state): State<AppState>) -> Json<RuntimeSnapshot> {
    Json(state.orchestrator.snapshot().await)
}
