//! Output dispatch engine.
//!
//! Consumes the latest dispatchable run's plan instructions and a
//! configured set of webhook targets, decides what to send and when,
//! applies the no-grid-charge safety guard, and records every attempt
//! as an immutable [`DispatchEvent`].
//!
//! Three independent triggers drive the engine:
//!
//! - **Scheduled**: instructions whose `execution_time` crossed between
//!   the previous and current tick are delivered exactly once
//! - **Heartbeat**: the currently active instruction per resource is
//!   periodically re-sent to guard against actuator-side state loss
//! - **Force**: an explicit request immediately re-sends the active
//!   instruction for an optional resource subset
//!
//! ## Idempotency
//!
//! Every logical delivery has a deterministic key over
//! `(resource_id, execution_time, dispatch_kind)`. A key that already
//! reached `Sent` is re-emitted as an identical audit event without a
//! new outbound HTTP call.

pub mod http;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use eoslink_core::{EventId, RunId};

pub use http::HttpWebhookSender;
pub use memory::MemoryWebhookSender;

use crate::error::{Error, Result};
use crate::guard::{GridSignalSource, GuardDecision, GuardPolicy};
use crate::metrics as flow_metrics;
use crate::plan::{active_instructions, PlanInstruction};
use crate::store::RunStore;

/// Which trigger produced a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchKind {
    /// Execution-time crossing detected by the scheduled ticker.
    Scheduled,
    /// Periodic re-send of the active instruction.
    Heartbeat,
    /// Operator-requested immediate re-send.
    Force,
}

impl std::fmt::Display for DispatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Heartbeat => write!(f, "heartbeat"),
            Self::Force => write!(f, "force"),
        }
    }
}

/// Terminal (or intermediate) state of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// Delivered; `http_status` holds the upstream response code.
    Sent,
    /// Suppressed by the safety guard. A decision, not an error.
    Blocked,
    /// All retries exhausted; `error_text` holds the diagnosis.
    Failed,
    /// Intermediate: an attempt failed and another retry follows.
    Retrying,
    /// No enabled output target configured for the resource.
    SkippedNoTarget,
}

impl std::fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Blocked => write!(f, "blocked"),
            Self::Failed => write!(f, "failed"),
            Self::Retrying => write!(f, "retrying"),
            Self::SkippedNoTarget => write!(f, "skipped_no_target"),
        }
    }
}

/// A configured actuator endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputTarget {
    /// The resource this target actuates.
    pub resource_id: String,
    /// Webhook URL to deliver instructions to.
    pub webhook_url: String,
    /// HTTP method (`POST` or `PUT`).
    #[serde(default = "default_method")]
    pub method: String,
    /// Extra request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Whether the target participates in dispatch.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Maximum retry attempts after the first failure.
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
    /// Optional payload template; `{resource_id}`, `{operation_mode_id}`,
    /// `{factor}` and `{execution_time}` placeholders are substituted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_template: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

const fn default_enabled() -> bool {
    true
}

const fn default_timeout_seconds() -> u64 {
    10
}

const fn default_retry_max() -> u32 {
    2
}

/// An immutable audit record of one delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEvent {
    /// Unique event identifier.
    pub id: EventId,
    /// The run whose plan produced the instruction, when resolvable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    /// The resource addressed.
    pub resource_id: String,
    /// The instruction's activation instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<DateTime<Utc>>,
    /// Which trigger produced the attempt.
    pub dispatch_kind: DispatchKind,
    /// The webhook URL targeted (empty when no target existed).
    pub target_url: String,
    /// The payload that was (or would have been) sent.
    pub request_payload: Value,
    /// Outcome of the attempt.
    pub status: DispatchStatus,
    /// Upstream HTTP status, when a response was received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Failure detail, when the attempt did not succeed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    /// Deterministic key identifying the logical dispatch.
    pub idempotency_key: String,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

/// Computes the deterministic idempotency key for a logical dispatch.
///
/// `dispatch_kind` is part of the key, so heartbeat re-sends never
/// collide with the scheduled send for the same instant.
#[must_use]
pub fn idempotency_key(
    resource_id: &str,
    execution_time: Option<DateTime<Utc>>,
    kind: DispatchKind,
) -> String {
    let time = execution_time.map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
    let digest = Sha256::digest(format!("{resource_id}|{time}|{kind}").as_bytes());
    let hex = format!("{digest:x}");
    hex[..32].to_string()
}

/// An outbound webhook request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRequest {
    /// Target URL.
    pub url: String,
    /// HTTP method.
    pub method: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// JSON body, pre-rendered.
    pub body: String,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
}

/// Webhook delivery abstraction.
///
/// The HTTP implementation performs real requests; the in-memory
/// implementation records them for tests.
#[async_trait]
pub trait WebhookSender: Send + Sync {
    /// Performs one delivery attempt and returns the HTTP status.
    ///
    /// # Errors
    ///
    /// Returns a dispatch error for transport-level failures (connect,
    /// timeout). Non-2xx responses are returned as `Ok(status)` so the
    /// engine can decide retry behavior uniformly.
    async fn send(&self, request: WebhookRequest) -> Result<u16>;
}

/// Dispatch engine configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    /// Scheduled ticker resolution in seconds.
    pub scheduled_tick_seconds: u64,
    /// Heartbeat ticker interval in seconds.
    pub heartbeat_seconds: u64,
    /// Safety-guard policy.
    pub guard: GuardPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            scheduled_tick_seconds: 15,
            heartbeat_seconds: 60,
            guard: GuardPolicy::default(),
        }
    }
}

/// The output dispatch engine.
pub struct DispatchEngine {
    store: Arc<dyn RunStore>,
    sender: Arc<dyn WebhookSender>,
    signal: Arc<dyn GridSignalSource>,
    config: DispatchConfig,
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DispatchEngine {
    /// Creates an engine over the given store, sender, and signal source.
    #[must_use]
    pub fn new(
        store: Arc<dyn RunStore>,
        sender: Arc<dyn WebhookSender>,
        signal: Arc<dyn GridSignalSource>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            sender,
            signal,
            config,
        }
    }

    /// Returns the engine configuration.
    #[must_use]
    pub const fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Scheduled tick: delivers instructions whose `execution_time`
    /// crossed into `(window_start, now]`.
    ///
    /// # Errors
    ///
    /// Returns storage errors; per-instruction delivery failures are
    /// absorbed into dispatch events, not propagated.
    pub async fn tick_scheduled(
        &self,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let Some(run) = self.store.latest_dispatchable_run().await? else {
            return Ok(0);
        };
        let instructions = self.store.instructions_for_run(run.id).await?;

        let mut delivered = 0;
        for instruction in &instructions {
            let Some(at) = instruction.execution_time else {
                continue;
            };
            if at > window_start && at <= now {
                self.deliver(instruction, DispatchKind::Scheduled, now).await?;
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Heartbeat tick: re-sends the currently active instruction for
    /// every enabled target.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn tick_heartbeat(&self, now: DateTime<Utc>) -> Result<usize> {
        self.resend_active(None, DispatchKind::Heartbeat, now).await
    }

    /// Force dispatch: immediately re-sends each in-scope resource's
    /// currently active instruction.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn force(
        &self,
        resource_ids: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.resend_active(resource_ids, DispatchKind::Force, now).await
    }

    async fn resend_active(
        &self,
        resource_ids: Option<&[String]>,
        kind: DispatchKind,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let Some(run) = self.store.latest_dispatchable_run().await? else {
            return Ok(0);
        };
        let instructions = self.store.instructions_for_run(run.id).await?;
        let targets = self.store.list_output_targets().await?;

        let mut sent = 0;
        for instruction in active_instructions(&instructions, now) {
            if let Some(scope) = resource_ids {
                if !scope.contains(&instruction.resource_id) {
                    continue;
                }
            }
            // Heartbeats only go to enabled targets; a force request for
            // an unconfigured resource still produces an audit record.
            if kind == DispatchKind::Heartbeat
                && !targets
                    .iter()
                    .any(|t| t.resource_id == instruction.resource_id && t.enabled)
            {
                continue;
            }
            self.deliver(&instruction, kind, now).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Runs the full per-delivery pipeline for one instruction.
    ///
    /// Idempotency check, safety guard, target lookup, HTTP send with
    /// bounded retries; every outcome is recorded as a dispatch event.
    ///
    /// # Errors
    ///
    /// Returns storage errors; HTTP failures become events.
    pub async fn deliver(
        &self,
        instruction: &PlanInstruction,
        kind: DispatchKind,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let key = idempotency_key(&instruction.resource_id, instruction.execution_time, kind);

        // A key that already reached Sent is authoritative: re-emit the
        // audit record, never re-deliver.
        if let Some(prior) = self.store.last_sent_event_for_key(&key).await? {
            tracing::debug!(
                resource_id = %instruction.resource_id,
                idempotency_key = %key,
                "dispatch already sent, suppressing re-delivery"
            );
            let duplicate = DispatchEvent {
                id: EventId::generate(),
                created_at: Utc::now(),
                ..prior
            };
            self.store.record_dispatch_event(duplicate).await?;
            return Ok(());
        }

        let target = self
            .store
            .get_output_target(&instruction.resource_id)
            .await?
            .filter(|t| t.enabled);

        let payload = target.as_ref().map_or_else(
            || default_payload(instruction),
            |t| render_payload(instruction, t.payload_template.as_deref()),
        );

        // Safety guard: suppress charge-directed dispatch that would pull
        // from the grid beyond the threshold.
        if instruction.is_charge_directed() {
            let sample = self.signal.latest_grid_import().await?;
            if self.config.guard.evaluate(sample, now) == GuardDecision::Block {
                tracing::info!(
                    resource_id = %instruction.resource_id,
                    "no-grid-charge guard blocked dispatch"
                );
                self.record(
                    instruction,
                    kind,
                    &key,
                    target.as_ref().map(|t| t.webhook_url.as_str()),
                    payload,
                    DispatchStatus::Blocked,
                    None,
                    Some("no-grid-charge guard: grid import above threshold".to_string()),
                )
                .await?;
                return Ok(());
            }
        }

        let Some(target) = target else {
            self.record(
                instruction,
                kind,
                &key,
                None,
                payload,
                DispatchStatus::SkippedNoTarget,
                None,
                None,
            )
            .await?;
            return Ok(());
        };

        self.send_with_retries(instruction, kind, &key, &target, payload)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        instruction: &PlanInstruction,
        kind: DispatchKind,
        key: &str,
        target_url: Option<&str>,
        payload: Value,
        status: DispatchStatus,
        http_status: Option<u16>,
        error_text: Option<String>,
    ) -> Result<()> {
        flow_metrics::record_dispatch_event(status);
        self.store
            .record_dispatch_event(DispatchEvent {
                id: EventId::generate(),
                run_id: Some(instruction.run_id),
                resource_id: instruction.resource_id.clone(),
                execution_time: instruction.execution_time,
                dispatch_kind: kind,
                target_url: target_url.unwrap_or_default().to_string(),
                request_payload: payload,
                status,
                http_status,
                error_text,
                idempotency_key: key.to_string(),
                created_at: Utc::now(),
            })
            .await
    }

    async fn send_with_retries(
        &self,
        instruction: &PlanInstruction,
        kind: DispatchKind,
        key: &str,
        target: &OutputTarget,
        payload: Value,
    ) -> Result<()> {
        let request = WebhookRequest {
            url: target.webhook_url.clone(),
            method: target.method.clone(),
            headers: target.headers.clone(),
            body: payload.to_string(),
            timeout_seconds: target.timeout_seconds,
        };

        let max_attempts = target.retry_max.saturating_add(1);
        let mut last_error = String::new();
        let mut last_status = None;

        for attempt in 1..=max_attempts {
            match self.sender.send(request.clone()).await {
                Ok(status) if (200..300).contains(&status) => {
                    self.record(
                        instruction,
                        kind,
                        key,
                        Some(&target.webhook_url),
                        payload,
                        DispatchStatus::Sent,
                        Some(status),
                        None,
                    )
                    .await?;
                    return Ok(());
                }
                Ok(status) => {
                    last_error = format!("target returned status {status}");
                    last_status = Some(status);
                    if attempt < max_attempts {
                        self.record(
                            instruction,
                            kind,
                            key,
                            Some(&target.webhook_url),
                            payload.clone(),
                            DispatchStatus::Retrying,
                            Some(status),
                            Some(last_error.clone()),
                        )
                        .await?;
                    }
                }
                Err(Error::Dispatch { message }) => {
                    last_error = message;
                    last_status = None;
                    if attempt < max_attempts {
                        self.record(
                            instruction,
                            kind,
                            key,
                            Some(&target.webhook_url),
                            payload.clone(),
                            DispatchStatus::Retrying,
                            None,
                            Some(last_error.clone()),
                        )
                        .await?;
                    }
                }
                Err(other) => return Err(other),
            }
        }

        tracing::warn!(
            resource_id = %instruction.resource_id,
            error = %last_error,
            "dispatch failed after {max_attempts} attempts"
        );
        self.record(
            instruction,
            kind,
            key,
            Some(&target.webhook_url),
            payload,
            DispatchStatus::Failed,
            last_status,
            Some(last_error),
        )
        .await
    }
}

/// Default JSON payload when the target carries no template.
fn default_payload(instruction: &PlanInstruction) -> Value {
    json!({
        "resource_id": instruction.resource_id,
        "instruction_type": instruction.instruction_type,
        "operation_mode_id": instruction.operation_mode_id,
        "operation_mode_factor": instruction.operation_mode_factor,
        "execution_time": instruction.execution_time.map(|t| t.to_rfc3339()),
    })
}

/// Renders a target's payload template, falling back to the default
/// payload when the template is absent or not valid JSON after
/// substitution.
fn render_payload(instruction: &PlanInstruction, template: Option<&str>) -> Value {
    let Some(template) = template else {
        return default_payload(instruction);
    };

    let rendered = template
        .replace("{resource_id}", &instruction.resource_id)
        .replace(
            "{operation_mode_id}",
            instruction.operation_mode_id.as_deref().unwrap_or(""),
        )
        .replace(
            "{factor}",
            &instruction
                .operation_mode_factor
                .map_or_else(String::new, |f| f.to_string()),
        )
        .replace(
            "{execution_time}",
            &instruction
                .execution_time
                .map_or_else(String::new, |t| t.to_rfc3339()),
        );

    serde_json::from_str(&rendered).unwrap_or_else(|_| default_payload(instruction))
}
