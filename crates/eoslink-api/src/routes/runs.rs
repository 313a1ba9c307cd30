//! Run lifecycle endpoints.
//!
//! Trigger endpoints report the terminal state of the run they produced
//! in the response body rather than surfacing expected failures as 5xx:
//! a force run that falls back and fails is still an answered request.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use eoslink_core::RunId;
use eoslink_flow::artifact::{Artifact, ArtifactKind};
use eoslink_flow::plan::PlanInstruction;
use eoslink_flow::plausibility::{check_run, Finding};
use eoslink_flow::prediction::RefreshScope;
use eoslink_flow::run::{Run, RunStatus};

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Response for the force-run and prediction-refresh triggers.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    /// The run the trigger produced.
    pub run_id: RunId,
    /// Terminal status of the run.
    pub status: RunStatus,
    /// Error text for `partial`/`failed` runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<Run> for TriggerResponse {
    fn from(run: Run) -> Self {
        Self {
            run_id: run.id,
            status: run.status,
            message: run.error_text,
        }
    }
}

/// POST `/api/eos/runs/force`
///
/// Returns 409 when a force run or prediction refresh is already in
/// progress; all other outcomes are 200 with the run's terminal state.
pub async fn force_run(State(state): State<AppState>) -> ApiResult<Json<TriggerResponse>> {
    let run = state.orchestrator.force_run().await?;
    Ok(Json(run.into()))
}

/// Request body for the prediction refresh trigger.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    /// Which forecast providers to refresh. Defaults to all.
    #[serde(default)]
    pub scope: RefreshScope,
}

/// POST `/api/eos/runs/predictions/refresh`
pub async fn refresh_predictions(
    State(state): State<AppState>,
    body: Option<Json<RefreshRequest>>,
) -> ApiResult<Json<TriggerResponse>> {
    let scope = body.map(|Json(b)| b.scope).unwrap_or_default();
    let run = state.orchestrator.refresh_predictions(scope).await?;
    Ok(Json(run.into()))
}

/// Query parameters for run listing.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Maximum number of runs to return.
    pub limit: Option<usize>,
}

/// GET `/api/eos/runs`
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Run>>> {
    let limit = query.limit.unwrap_or(50).min(500);
    let runs = state.orchestrator.store().list_runs(limit).await?;
    Ok(Json(runs))
}

/// Run detail with artifact and instruction counts.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetail {
    /// The run record.
    #[serde(flatten)]
    pub run: Run,
    /// Number of artifacts attached to the run.
    pub artifact_count: usize,
    /// Number of instructions derived from the run's plan.
    pub instruction_count: usize,
}

/// GET `/api/eos/runs/{id}`
pub async fn run_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RunDetail>> {
    let run_id = parse_run_id(&id)?;
    let store = state.orchestrator.store();
    let run = store
        .get_run(run_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("run not found: {id}")))?;
    let artifact_count = store.count_artifacts(run_id).await?;
    let instruction_count = store.instructions_for_run(run_id).await?.len();

    Ok(Json(RunDetail {
        run,
        artifact_count,
        instruction_count,
    }))
}

/// Plan artifact with its derived instructions.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPlan {
    /// The run the plan belongs to.
    pub run_id: RunId,
    /// The raw plan document fetched from the optimizer.
    pub plan: serde_json::Value,
    /// The typed instructions derived from the plan.
    pub instructions: Vec<PlanInstruction>,
}

/// GET `/api/eos/runs/{id}/plan`
pub async fn run_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RunPlan>> {
    let run_id = parse_run_id(&id)?;
    let store = state.orchestrator.store();
    require_run(&state, run_id, &id).await?;

    let artifact = store
        .get_artifact(run_id, ArtifactKind::Plan)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("run {id} has no plan artifact")))?;
    let instructions = store.instructions_for_run(run_id).await?;

    Ok(Json(RunPlan {
        run_id,
        plan: artifact.payload,
        instructions,
    }))
}

/// GET `/api/eos/runs/{id}/solution`
pub async fn run_solution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Artifact>> {
    let run_id = parse_run_id(&id)?;
    require_run(&state, run_id, &id).await?;

    let artifact = state
        .orchestrator
        .store()
        .get_artifact(run_id, ArtifactKind::Solution)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("run {id} has no solution artifact")))?;
    Ok(Json(artifact))
}

/// Full context of a run: the record plus every attached artifact.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    /// The run record.
    pub run: Run,
    /// Every artifact attached to the run, in append order.
    pub artifacts: Vec<Artifact>,
}

/// GET `/api/eos/runs/{id}/context`
pub async fn run_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RunContext>> {
    let run_id = parse_run_id(&id)?;
    let store = state.orchestrator.store();
    let run = store
        .get_run(run_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("run not found: {id}")))?;
    let artifacts = store.artifacts_for_run(run_id).await?;

    Ok(Json(RunContext { run, artifacts }))
}

/// GET `/api/eos/runs/{id}/plausibility`
pub async fn run_plausibility(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Finding>>> {
    let run_id = parse_run_id(&id)?;
    let findings = check_run(state.orchestrator.store(), run_id).await?;
    Ok(Json(findings))
}

fn parse_run_id(id: &str) -> ApiResult<RunId> {
    id.parse()
        .map_err(|e: eoslink_core::Error| ApiError::bad_request(e.to_string()))
}

async fn require_run(state: &AppState, run_id: RunId, id: &str) -> ApiResult<()> {
    state
        .orchestrator
        .store()
        .get_run(run_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("run not found: {id}")))?;
    Ok(())
}
