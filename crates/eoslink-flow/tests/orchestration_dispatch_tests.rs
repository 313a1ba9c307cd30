//! End-to-end dispatch engine tests over the in-memory store.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use eoslink_flow::artifact::ArtifactKind;
use eoslink_flow::dispatch::memory::ScriptedResponse;
use eoslink_flow::dispatch::{
    idempotency_key, DispatchConfig, DispatchEngine, DispatchKind, DispatchStatus,
    MemoryWebhookSender, OutputTarget,
};
use eoslink_flow::error::Result;
use eoslink_flow::guard::{GuardPolicy, SignalSample, StaticSignalSource};
use eoslink_flow::plan::PlanInstruction;
use eoslink_flow::run::{RunStatus, TriggerSource};
use eoslink_flow::store::memory::MemoryRunStore;
use eoslink_flow::store::RunStore;

struct Harness {
    store: Arc<dyn RunStore>,
    sender: Arc<MemoryWebhookSender>,
    signal: Arc<StaticSignalSource>,
    engine: DispatchEngine,
}

fn harness(guard: GuardPolicy) -> Harness {
    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
    let sender = Arc::new(MemoryWebhookSender::new());
    let signal = Arc::new(StaticSignalSource::new());
    let engine = DispatchEngine::new(
        Arc::clone(&store),
        sender.clone() as Arc<dyn eoslink_flow::dispatch::WebhookSender>,
        signal.clone() as Arc<dyn eoslink_flow::guard::GridSignalSource>,
        DispatchConfig {
            scheduled_tick_seconds: 15,
            heartbeat_seconds: 60,
            guard,
        },
    );
    Harness {
        store,
        sender,
        signal,
        engine,
    }
}

fn at(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn target(resource_id: &str) -> OutputTarget {
    OutputTarget {
        resource_id: resource_id.to_string(),
        webhook_url: format!("http://actuators.local/{resource_id}"),
        method: "POST".to_string(),
        headers: std::collections::HashMap::new(),
        enabled: true,
        timeout_seconds: 5,
        retry_max: 2,
        payload_template: None,
    }
}

/// Seeds a finalized run with one charge instruction per given
/// `(resource, execution_time)` pair and returns its instructions.
async fn seed_run(
    store: &Arc<dyn RunStore>,
    entries: &[(&str, &str)],
) -> Result<Vec<PlanInstruction>> {
    let run = store
        .create_run(TriggerSource::Automatic, "eos_detected")
        .await?;
    store
        .append_artifact(run.id, ArtifactKind::Plan, "", json!([]))
        .await?;

    let instructions: Vec<PlanInstruction> = entries
        .iter()
        .enumerate()
        .map(|(index, (resource, time))| PlanInstruction {
            run_id: run.id,
            index,
            resource_id: (*resource).to_string(),
            instruction_type: "charge".to_string(),
            operation_mode_id: Some("mode-a".to_string()),
            operation_mode_factor: Some(0.8),
            execution_time: Some(at(time)),
            ends_at: None,
        })
        .collect();
    store.insert_instructions(run.id, instructions.clone()).await?;
    store.finalize_run(run.id, RunStatus::Success, None).await?;
    Ok(instructions)
}

#[tokio::test]
async fn scheduled_crossing_delivers_exactly_once() -> Result<()> {
    let h = harness(GuardPolicy::default());
    seed_run(&h.store, &[("battery-1", "2026-08-30T14:15:00Z")]).await?;
    h.store.upsert_output_target(target("battery-1")).await?;

    let window_start = at("2026-08-30T14:14:50Z");
    let now = at("2026-08-30T14:15:05Z");
    let sent = h.engine.tick_scheduled(window_start, now).await?;
    assert_eq!(sent, 1);
    assert_eq!(h.sender.request_count()?, 1);

    // The next tick's window no longer contains the crossing.
    let later = at("2026-08-30T14:15:20Z");
    assert_eq!(h.engine.tick_scheduled(now, later).await?, 0);
    assert_eq!(h.sender.request_count()?, 1);

    let events = h.store.list_dispatch_events(10).await?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, DispatchStatus::Sent);
    assert_eq!(events[0].http_status, Some(200));
    Ok(())
}

#[tokio::test]
async fn duplicate_delivery_is_suppressed_by_idempotency_key() -> Result<()> {
    let h = harness(GuardPolicy::default());
    let instructions = seed_run(&h.store, &[("battery-1", "2026-08-30T14:15:00Z")]).await?;
    h.store.upsert_output_target(target("battery-1")).await?;

    let now = at("2026-08-30T14:15:05Z");
    h.engine
        .deliver(&instructions[0], DispatchKind::Scheduled, now)
        .await?;
    assert_eq!(h.sender.request_count()?, 1);

    // Same logical dispatch again: an audit event is re-emitted but no
    // second HTTP call happens.
    h.engine
        .deliver(&instructions[0], DispatchKind::Scheduled, now)
        .await?;
    assert_eq!(h.sender.request_count()?, 1);

    let events = h.store.list_dispatch_events(10).await?;
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.status == DispatchStatus::Sent));
    assert_eq!(events[0].idempotency_key, events[1].idempotency_key);
    assert_ne!(events[0].id, events[1].id);
    Ok(())
}

#[tokio::test]
async fn heartbeat_key_does_not_collide_with_scheduled_key() -> Result<()> {
    let h = harness(GuardPolicy::default());
    let instructions = seed_run(&h.store, &[("battery-1", "2026-08-30T14:15:00Z")]).await?;
    h.store.upsert_output_target(target("battery-1")).await?;

    let now = at("2026-08-30T14:15:05Z");
    h.engine
        .deliver(&instructions[0], DispatchKind::Scheduled, now)
        .await?;
    let sent = h.engine.tick_heartbeat(at("2026-08-30T14:16:00Z")).await?;

    assert_eq!(sent, 1);
    assert_eq!(h.sender.request_count()?, 2);
    assert_ne!(
        idempotency_key(&instructions[0].resource_id, instructions[0].execution_time, DispatchKind::Scheduled),
        idempotency_key(&instructions[0].resource_id, instructions[0].execution_time, DispatchKind::Heartbeat),
    );
    Ok(())
}

#[tokio::test]
async fn guard_blocks_charge_instruction_without_http() -> Result<()> {
    let guard = GuardPolicy {
        enabled: true,
        threshold_watts: 50.0,
        signal_max_age_seconds: 300,
    };
    let h = harness(guard);
    let instructions = seed_run(&h.store, &[("battery-1", "2026-08-30T14:15:00Z")]).await?;
    h.store.upsert_output_target(target("battery-1")).await?;

    let now = at("2026-08-30T14:15:05Z");
    h.signal.set(Some(SignalSample {
        watts: 1200.0,
        observed_at: now - Duration::seconds(10),
    }));

    h.engine
        .deliver(&instructions[0], DispatchKind::Scheduled, now)
        .await?;

    assert_eq!(h.sender.request_count()?, 0);
    let events = h.store.list_dispatch_events(10).await?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, DispatchStatus::Blocked);
    assert!(events[0].http_status.is_none());
    Ok(())
}

#[tokio::test]
async fn stale_signal_fails_open() -> Result<()> {
    let guard = GuardPolicy {
        enabled: true,
        threshold_watts: 50.0,
        signal_max_age_seconds: 60,
    };
    let h = harness(guard);
    let instructions = seed_run(&h.store, &[("battery-1", "2026-08-30T14:15:00Z")]).await?;
    h.store.upsert_output_target(target("battery-1")).await?;

    let now = at("2026-08-30T14:15:05Z");
    h.signal.set(Some(SignalSample {
        watts: 1200.0,
        observed_at: now - Duration::seconds(600),
    }));

    h.engine
        .deliver(&instructions[0], DispatchKind::Scheduled, now)
        .await?;

    assert_eq!(h.sender.request_count()?, 1);
    let events = h.store.list_dispatch_events(10).await?;
    assert_eq!(events[0].status, DispatchStatus::Sent);
    Ok(())
}

#[tokio::test]
async fn missing_target_is_skipped_not_failed() -> Result<()> {
    let h = harness(GuardPolicy::default());
    let instructions = seed_run(&h.store, &[("battery-1", "2026-08-30T14:15:00Z")]).await?;

    h.engine
        .deliver(&instructions[0], DispatchKind::Scheduled, at("2026-08-30T14:15:05Z"))
        .await?;

    assert_eq!(h.sender.request_count()?, 0);
    let events = h.store.list_dispatch_events(10).await?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, DispatchStatus::SkippedNoTarget);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_record_retrying_then_failed() -> Result<()> {
    let h = harness(GuardPolicy::default());
    let instructions = seed_run(&h.store, &[("battery-1", "2026-08-30T14:15:00Z")]).await?;
    h.store.upsert_output_target(target("battery-1")).await?;

    // retry_max = 2 means three attempts in total.
    h.sender.push_response(ScriptedResponse::Status(503));
    h.sender.push_response(ScriptedResponse::TransportError("connection reset".into()));
    h.sender.push_response(ScriptedResponse::Status(500));

    h.engine
        .deliver(&instructions[0], DispatchKind::Scheduled, at("2026-08-30T14:15:05Z"))
        .await?;

    assert_eq!(h.sender.request_count()?, 3);
    let mut events = h.store.list_dispatch_events(10).await?;
    events.reverse(); // oldest first
    let statuses: Vec<DispatchStatus> = events.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![
            DispatchStatus::Retrying,
            DispatchStatus::Retrying,
            DispatchStatus::Failed
        ]
    );
    assert!(events[2].error_text.is_some());
    // The terminal event carries the last upstream status seen.
    assert_eq!(events[2].http_status, Some(500));
    assert_eq!(events[1].http_status, None); // transport error attempt

    // A failed key is not authoritative: the next attempt may retry.
    assert!(h
        .store
        .last_sent_event_for_key(&events[2].idempotency_key)
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn transient_failure_then_success_on_retry() -> Result<()> {
    let h = harness(GuardPolicy::default());
    let instructions = seed_run(&h.store, &[("battery-1", "2026-08-30T14:15:00Z")]).await?;
    h.store.upsert_output_target(target("battery-1")).await?;

    h.sender.push_response(ScriptedResponse::Status(503));

    h.engine
        .deliver(&instructions[0], DispatchKind::Scheduled, at("2026-08-30T14:15:05Z"))
        .await?;

    assert_eq!(h.sender.request_count()?, 2);
    let events = h.store.list_dispatch_events(10).await?;
    assert_eq!(events[0].status, DispatchStatus::Sent);
    assert_eq!(events[0].http_status, Some(200));
    Ok(())
}

#[tokio::test]
async fn force_dispatch_honors_resource_scope() -> Result<()> {
    let h = harness(GuardPolicy::default());
    seed_run(
        &h.store,
        &[
            ("battery-1", "2026-08-30T14:00:00Z"),
            ("battery-2", "2026-08-30T14:00:00Z"),
        ],
    )
    .await?;
    h.store.upsert_output_target(target("battery-1")).await?;
    h.store.upsert_output_target(target("battery-2")).await?;

    let scope = vec!["battery-2".to_string()];
    let sent = h
        .engine
        .force(Some(&scope), at("2026-08-30T14:05:00Z"))
        .await?;

    assert_eq!(sent, 1);
    let requests = h.sender.requests()?;
    assert_eq!(requests.len(), 1);
    assert!(requests[0].url.ends_with("battery-2"));
    Ok(())
}

#[tokio::test]
async fn heartbeat_resends_only_active_instruction() -> Result<()> {
    let h = harness(GuardPolicy::default());
    // Two consecutive instructions for the same resource; only the
    // later one is active at `now`.
    seed_run(
        &h.store,
        &[
            ("battery-1", "2026-08-30T14:00:00Z"),
            ("battery-1", "2026-08-30T14:15:00Z"),
        ],
    )
    .await?;
    h.store.upsert_output_target(target("battery-1")).await?;

    let sent = h.engine.tick_heartbeat(at("2026-08-30T14:20:00Z")).await?;
    assert_eq!(sent, 1);

    let events = h.store.list_dispatch_events(10).await?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].execution_time, Some(at("2026-08-30T14:15:00Z")));
    assert_eq!(events[0].dispatch_kind, DispatchKind::Heartbeat);
    Ok(())
}

#[tokio::test]
async fn disabled_target_is_not_heartbeaten() -> Result<()> {
    let h = harness(GuardPolicy::default());
    seed_run(&h.store, &[("battery-1", "2026-08-30T14:00:00Z")]).await?;
    let mut disabled = target("battery-1");
    disabled.enabled = false;
    h.store.upsert_output_target(disabled).await?;

    let sent = h.engine.tick_heartbeat(at("2026-08-30T14:20:00Z")).await?;
    assert_eq!(sent, 0);
    assert_eq!(h.sender.request_count()?, 0);
    Ok(())
}

#[tokio::test]
async fn payload_template_substitutes_placeholders() -> Result<()> {
    let h = harness(GuardPolicy::default());
    let instructions = seed_run(&h.store, &[("battery-1", "2026-08-30T14:15:00Z")]).await?;
    let mut templated = target("battery-1");
    templated.payload_template = Some(
        r#"{"device":"{resource_id}","mode":"{operation_mode_id}","level":{factor}}"#.to_string(),
    );
    h.store.upsert_output_target(templated).await?;

    h.engine
        .deliver(&instructions[0], DispatchKind::Scheduled, at("2026-08-30T14:15:05Z"))
        .await?;

    let requests = h.sender.requests()?;
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body["device"], "battery-1");
    assert_eq!(body["mode"], "mode-a");
    assert!((body["level"].as_f64().unwrap() - 0.8).abs() < f64::EPSILON);
    Ok(())
}
