//! Output inspection and force-dispatch endpoints.

use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use eoslink_core::RunId;
use eoslink_flow::dispatch::DispatchEvent;
use eoslink_flow::plan::{active_instructions, PlanInstruction};

use crate::error::ApiResult;
use crate::server::AppState;

/// The active instruction set derived from the latest dispatchable run.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentOutputs {
    /// The run the instructions were derived from, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    /// The currently active instruction per resource.
    pub active: Vec<PlanInstruction>,
}

/// GET `/api/eos/outputs/current`
///
/// Empty when no dispatchable run exists yet.
pub async fn current(State(state): State<AppState>) -> ApiResult<Json<CurrentOutputs>> {
    let store = state.orchestrator.store();
    let Some(run) = store.latest_dispatchable_run().await? else {
        return Ok(Json(CurrentOutputs {
            run_id: None,
            active: Vec::new(),
        }));
    };
    let instructions = store.instructions_for_run(run.id).await?;

    Ok(Json(CurrentOutputs {
        run_id: Some(run.id),
        active: active_instructions(&instructions, Utc::now()),
    }))
}

/// The full instruction timeline of the latest dispatchable run.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputTimeline {
    /// The run the instructions were derived from, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    /// All derived instructions, in plan order.
    pub instructions: Vec<PlanInstruction>,
}

/// GET `/api/eos/outputs/timeline`
pub async fn timeline(State(state): State<AppState>) -> ApiResult<Json<OutputTimeline>> {
    let store = state.orchestrator.store();
    let Some(run) = store.latest_dispatchable_run().await? else {
        return Ok(Json(OutputTimeline {
            run_id: None,
            instructions: Vec::new(),
        }));
    };
    let instructions = store.instructions_for_run(run.id).await?;

    Ok(Json(OutputTimeline {
        run_id: Some(run.id),
        instructions,
    }))
}

/// Query parameters for the dispatch event listing.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Maximum number of events to return.
    pub limit: Option<usize>,
}

/// GET `/api/eos/outputs/events`
pub async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<DispatchEvent>>> {
    let limit = query.limit.unwrap_or(100).min(1000);
    let events = state
        .orchestrator
        .store()
        .list_dispatch_events(limit)
        .await?;
    Ok(Json(events))
}

/// Request body for the force-dispatch trigger.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceDispatchRequest {
    /// Restricts dispatch to these resources. Omit for all.
    #[serde(default)]
    pub resource_ids: Option<Vec<String>>,
}

/// Response for the force-dispatch trigger.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceDispatchResponse {
    /// Number of instructions pushed through the delivery pipeline.
    pub dispatched: usize,
}

/// POST `/api/eos/outputs/dispatch/force`
pub async fn force_dispatch(
    State(state): State<AppState>,
    body: Option<Json<ForceDispatchRequest>>,
) -> ApiResult<Json<ForceDispatchResponse>> {
    let scope = body.and_then(|Json(b)| b.resource_ids);
    let dispatched = state
        .orchestrator
        .dispatch()
        .force(scope.as_deref(), Utc::now())
        .await?;
    Ok(Json(ForceDispatchResponse { dispatched }))
}
