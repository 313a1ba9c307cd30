//! Request handlers for the `/api/eos` endpoint tree.

pub mod outputs;
pub mod runs;
pub mod runtime;
pub mod targets;

use axum::routing::{get, post, put};
use axum::Router;

use crate::server::AppState;

/// Builds the `/api/eos` route tree.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/runs/force", post(runs::force_run))
        .route("/runs/predictions/refresh", post(runs::refresh_predictions))
        .route("/runs", get(runs::list_runs))
        .route("/runs/{id}", get(runs::run_detail))
        .route("/runs/{id}/plan", get(runs::run_plan))
        .route("/runs/{id}/solution", get(runs::run_solution))
        .route("/runs/{id}/context", get(runs::run_context))
        .route("/runs/{id}/plausibility", get(runs::run_plausibility))
        .route("/outputs/current", get(outputs::current))
        .route("/outputs/timeline", get(outputs::timeline))
        .route("/outputs/events", get(outputs::events))
        .route("/outputs/dispatch/force", post(outputs::force_dispatch))
        .route("/output-targets", get(targets::list).post(targets::upsert))
        .route("/output-targets/{resource_id}", put(targets::update))
        .route("/runtime", get(runtime::snapshot))
}
