//! API integration tests.
//!
//! Tests the complete request flow: HTTP, routes, orchestrator, store,
//! against a scripted optimizer client.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use anyhow::Result;
use axum::http::StatusCode;
use serde_json::{json, Value};

use eoslink_api::config::Config;
use eoslink_api::server::Server;
use eoslink_flow::dispatch::memory::MemoryWebhookSender;
use eoslink_flow::eos::mock::MockEosClient;
use eoslink_flow::guard::StaticSignalSource;
use eoslink_flow::runtime::{FlowConfig, Orchestrator};
use eoslink_flow::store::memory::MemoryRunStore;

struct World {
    eos: Arc<MockEosClient>,
    orchestrator: Arc<Orchestrator>,
}

fn world() -> World {
    let eos = Arc::new(MockEosClient::new());
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(MemoryRunStore::new()),
        Arc::clone(&eos) as Arc<dyn eoslink_flow::eos::EosClient>,
        Arc::new(MemoryWebhookSender::new()),
        Arc::new(StaticSignalSource::new()),
        FlowConfig::default(),
    ));
    World { eos, orchestrator }
}

fn test_config() -> Config {
    Config {
        port: 0,
        debug: true,
        eos_base_url: "http://eos.test:8503".to_string(),
        eos_http_timeout_seconds: 5,
        flow: FlowConfig::default(),
    }
}

fn router(world: &World) -> axum::Router {
    Server::with_orchestrator(test_config(), Arc::clone(&world.orchestrator)).router()
}

/// Scripts the mock so a force run materializes immediately and
/// completes with a plan and solution.
fn script_successful_cycle(eos: &MockEosClient) {
    eos.set_marker_on_pulse(Some("2026-08-30T14:15:00Z".parse().unwrap()));
    eos.set_plan(Some(json!({
        "instructions": [{
            "resource_id": "battery-1",
            "instruction_type": "charge",
            "operation_mode_id": "grid_support",
            "operation_mode_factor": 0.8,
            "execution_time": "2020-01-01T00:00:00Z"
        }]
    })));
    eos.set_solution(Some(json!({ "objective": 42.0 })));
}

#[tokio::test]
async fn health_returns_ok() -> Result<()> {
    let w = world();
    let (status, body): (_, Value) = helpers::get_json(router(&w), "/health").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn force_run_returns_terminal_success() -> Result<()> {
    let w = world();
    script_successful_cycle(&w.eos);

    let (status, body): (_, Value) =
        helpers::post_json(router(&w), "/api/eos/runs/force", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert!(body["runId"].is_string());
    assert!(body.get("message").is_none());

    let (status, runs): (_, Vec<Value>) = helpers::get_json(router(&w), "/api/eos/runs").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["triggerSource"], "force_run");
    Ok(())
}

#[tokio::test]
async fn force_run_failure_is_reported_in_body_not_5xx() -> Result<()> {
    let w = world();
    // Marker advances but neither plan nor solution is produced.
    w.eos
        .set_marker_on_pulse(Some("2026-08-30T14:15:00Z".parse().unwrap()));

    let (status, body): (_, Value) =
        helpers::post_json(router(&w), "/api/eos/runs/force", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "partial");
    assert!(body["message"].as_str().unwrap().contains("plan unavailable"));
    Ok(())
}

#[tokio::test]
async fn run_detail_plan_context_and_plausibility() -> Result<()> {
    let w = world();
    script_successful_cycle(&w.eos);
    let (_, trigger): (_, Value) =
        helpers::post_json(router(&w), "/api/eos/runs/force", None).await?;
    let run_id = trigger["runId"].as_str().unwrap().to_string();

    let (status, detail): (_, Value) =
        helpers::get_json(router(&w), &format!("/api/eos/runs/{run_id}")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["status"], "success");
    assert!(detail["artifactCount"].as_u64().unwrap() >= 2);
    assert_eq!(detail["instructionCount"], 1);

    let (status, plan): (_, Value) =
        helpers::get_json(router(&w), &format!("/api/eos/runs/{run_id}/plan")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(plan["instructions"][0]["resourceId"], "battery-1");

    let (status, solution): (_, Value) =
        helpers::get_json(router(&w), &format!("/api/eos/runs/{run_id}/solution")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(solution["payload"]["objective"], 42.0);

    let (status, context): (_, Value) =
        helpers::get_json(router(&w), &format!("/api/eos/runs/{run_id}/context")).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(context["artifacts"].as_array().unwrap().len() >= 2);

    let (status, findings): (_, Vec<Value>) =
        helpers::get_json(router(&w), &format!("/api/eos/runs/{run_id}/plausibility")).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(findings.iter().any(|f| f["code"] == "plausible"));
    Ok(())
}

#[tokio::test]
async fn malformed_and_unknown_run_ids() -> Result<()> {
    let w = world();

    let (status, body): (_, Value) =
        helpers::get_json(router(&w), "/api/eos/runs/not-a-ulid").await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let unknown = eoslink_core::RunId::generate();
    let (status, body): (_, Value) =
        helpers::get_json(router(&w), &format!("/api/eos/runs/{unknown}")).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn prediction_refresh_with_scope() -> Result<()> {
    let w = world();

    let (status, body): (_, Value) = helpers::post_json(
        router(&w),
        "/api/eos/runs/predictions/refresh",
        Some(json!({ "scope": "pv" })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    let run_id = body["runId"].as_str().unwrap().to_string();
    let (_, context): (StatusCode, Value) =
        helpers::get_json(router(&w), &format!("/api/eos/runs/{run_id}/context")).await?;
    let kinds: Vec<&str> = context["artifacts"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|a| a["kind"].as_str())
        .collect();
    assert!(kinds.contains(&"prediction_refresh"));
    assert!(kinds.contains(&"prediction_keys"));
    Ok(())
}

#[tokio::test]
async fn output_target_crud() -> Result<()> {
    let w = world();

    let target = json!({
        "resourceId": "battery-1",
        "webhookUrl": "http://actuator.local/hook",
        "method": "POST"
    });
    let (status, created): (_, Value) =
        helpers::post_json(router(&w), "/api/eos/output-targets", Some(target)).await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["resourceId"], "battery-1");
    assert_eq!(created["enabled"], true);

    let (status, listed): (_, Vec<Value>) =
        helpers::get_json(router(&w), "/api/eos/output-targets").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.len(), 1);

    // Path is authoritative; a mismatching body is rejected.
    let (status, _): (_, Value) = helpers::put_json(
        router(&w),
        "/api/eos/output-targets/battery-1",
        json!({
            "resourceId": "battery-2",
            "webhookUrl": "http://actuator.local/hook"
        }),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _): (_, Value) = helpers::put_json(
        router(&w),
        "/api/eos/output-targets/battery-9",
        json!({
            "resourceId": "battery-9",
            "webhookUrl": "http://actuator.local/hook"
        }),
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, updated): (_, Value) = helpers::put_json(
        router(&w),
        "/api/eos/output-targets/battery-1",
        json!({
            "resourceId": "battery-1",
            "webhookUrl": "https://actuator.local/hook2",
            "enabled": false
        }),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["enabled"], false);
    Ok(())
}

#[tokio::test]
async fn target_validation_rejects_bad_input() -> Result<()> {
    let w = world();

    let (status, _): (StatusCode, Value) = helpers::post_json(
        router(&w),
        "/api/eos/output-targets",
        Some(json!({
            "resourceId": "battery-1",
            "webhookUrl": "actuator.local/hook"
        })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _): (StatusCode, Value) = helpers::post_json(
        router(&w),
        "/api/eos/output-targets",
        Some(json!({
            "resourceId": "battery-1",
            "webhookUrl": "http://actuator.local/hook",
            "method": "DELETE"
        })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn outputs_current_and_force_dispatch() -> Result<()> {
    let w = world();

    let (status, empty): (_, Value) =
        helpers::get_json(router(&w), "/api/eos/outputs/current").await?;
    assert_eq!(status, StatusCode::OK);
    assert!(empty.get("runId").is_none());
    assert_eq!(empty["active"].as_array().unwrap().len(), 0);

    script_successful_cycle(&w.eos);
    let (_, _body): (StatusCode, Value) =
        helpers::post_json(router(&w), "/api/eos/runs/force", None).await?;

    let (status, current): (_, Value) =
        helpers::get_json(router(&w), "/api/eos/outputs/current").await?;
    assert_eq!(status, StatusCode::OK);
    let active = current["active"].as_array().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["resourceId"], "battery-1");

    let (status, timeline): (_, Value) =
        helpers::get_json(router(&w), "/api/eos/outputs/timeline").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(timeline["instructions"].as_array().unwrap().len(), 1);

    let (status, dispatched): (_, Value) =
        helpers::post_json(router(&w), "/api/eos/outputs/dispatch/force", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dispatched["dispatched"], 1);

    let (status, events): (_, Vec<Value>) =
        helpers::get_json(router(&w), "/api/eos/outputs/events").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["dispatchKind"], "force");
    // No target is configured, so the attempt is audited as skipped.
    assert_eq!(events[0]["status"], "skipped_no_target");
    Ok(())
}

#[tokio::test]
async fn runtime_snapshot_endpoint() -> Result<()> {
    let w = world();
    w.eos
        .set_last_run_datetime(Some("2026-08-30T14:00:00Z".parse().unwrap()));

    let (status, snapshot): (_, Value) =
        helpers::get_json(router(&w), "/api/eos/runtime").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["eosHealthy"], true);
    assert!(snapshot["aligned"]["nextDueTs"].is_string());
    assert_eq!(snapshot["forceRun"]["inProgress"], false);
    Ok(())
}

mod helpers {
    use anyhow::{Context, Result};
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    fn make_request(
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Request<Body>> {
        let builder = Request::builder().method(method).uri(uri);

        // Only tag a content type when a body is present, so optional
        // body extractors see "no body" rather than malformed JSON.
        match body {
            Some(v) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::to_vec(&v).context("serialize request body")?,
                ))
                .context("build request"),
            None => builder.body(Body::empty()).context("build request"),
        }
    }

    async fn send_json<T: DeserializeOwned>(
        router: axum::Router,
        request: Request<Body>,
    ) -> Result<(StatusCode, T)> {
        let response = router
            .oneshot(request)
            .await
            .expect("router call is infallible");
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .context("read response body")?;
        let json = serde_json::from_slice(&body).with_context(|| {
            format!(
                "parse JSON response (status={status}): {}",
                String::from_utf8_lossy(&body)
            )
        })?;
        Ok((status, json))
    }

    pub async fn get_json<T: DeserializeOwned>(
        router: axum::Router,
        uri: &str,
    ) -> Result<(StatusCode, T)> {
        send_json(router, make_request(Method::GET, uri, None)?).await
    }

    pub async fn post_json<T: DeserializeOwned>(
        router: axum::Router,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(StatusCode, T)> {
        send_json(router, make_request(Method::POST, uri, body)?).await
    }

    pub async fn put_json<T: DeserializeOwned>(
        router: axum::Router,
        uri: &str,
        body: serde_json::Value,
    ) -> Result<(StatusCode, T)> {
        send_json(router, make_request(Method::PUT, uri, Some(body))?).await
    }
}
