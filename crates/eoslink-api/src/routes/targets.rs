//! Output target configuration endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use eoslink_flow::dispatch::OutputTarget;

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// GET `/api/eos/output-targets`
pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<OutputTarget>>> {
    let targets = state.orchestrator.store().list_output_targets().await?;
    Ok(Json(targets))
}

/// POST `/api/eos/output-targets`
///
/// Creates or replaces the target for the resource named in the body.
pub async fn upsert(
    State(state): State<AppState>,
    Json(target): Json<OutputTarget>,
) -> ApiResult<(StatusCode, Json<OutputTarget>)> {
    validate(&target)?;
    state
        .orchestrator
        .store()
        .upsert_output_target(target.clone())
        .await?;
    Ok((StatusCode::CREATED, Json(target)))
}

/// PUT `/api/eos/output-targets/{resource_id}`
///
/// Replaces an existing target. The path resource is authoritative;
/// a mismatching `resourceId` in the body is rejected.
pub async fn update(
    State(state): State<AppState>,
    Path(resource_id): Path<String>,
    Json(target): Json<OutputTarget>,
) -> ApiResult<Json<OutputTarget>> {
    if target.resource_id != resource_id {
        return Err(ApiError::bad_request(format!(
            "body resourceId '{}' does not match path '{resource_id}'",
            target.resource_id
        )));
    }
    validate(&target)?;

    let store = state.orchestrator.store();
    if store.get_output_target(&resource_id).await?.is_none() {
        return Err(ApiError::not_found(format!(
            "no output target for resource: {resource_id}"
        )));
    }
    store.upsert_output_target(target.clone()).await?;
    Ok(Json(target))
}

fn validate(target: &OutputTarget) -> ApiResult<()> {
    if target.resource_id.trim().is_empty() {
        return Err(ApiError::bad_request("resourceId must not be empty"));
    }
    if !target.webhook_url.starts_with("http://") && !target.webhook_url.starts_with("https://") {
        return Err(ApiError::bad_request(format!(
            "webhookUrl is not an http(s) URL: {}",
            target.webhook_url
        )));
    }
    if !matches!(target.method.as_str(), "POST" | "PUT") {
        return Err(ApiError::bad_request(format!(
            "method must be POST or PUT, got {}",
            target.method
        )));
    }
    Ok(())
}
