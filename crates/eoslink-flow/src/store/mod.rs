//! Pluggable storage for orchestration state.
//!
//! The [`RunStore`] trait defines the persistence layer for runs,
//! artifacts, derived plan instructions, output targets, and dispatch
//! audit events.
//!
//! ## Design Principles
//!
//! - **Transactional writes**: every mutation is atomic; readers see a
//!   consistent snapshot
//! - **Append-once artifacts**: `(run_id, kind, key)` is written at most
//!   once
//! - **Idempotent finalize**: re-finalizing with the same terminal
//!   status is a no-op; a conflicting status is an error
//! - **Testability**: in-memory implementation for tests and
//!   single-instance deployments

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use eoslink_core::RunId;

use crate::artifact::{Artifact, ArtifactKind};
use crate::dispatch::{DispatchEvent, OutputTarget};
use crate::error::Result;
use crate::plan::PlanInstruction;
use crate::run::{Run, RunStatus, TriggerSource};

/// Storage abstraction for orchestration state.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from the
/// collector, scheduler, dispatch tickers, and request handlers.
#[async_trait]
pub trait RunStore: Send + Sync {
    // --- Run Operations ---

    /// Creates a run in `Running` state and returns it.
    async fn create_run(&self, trigger_source: TriggerSource, run_mode: &str) -> Result<Run>;

    /// Saves mutations to an existing run (e.g. the detection marker).
    async fn save_run(&self, run: &Run) -> Result<()>;

    /// Finalizes a run to a terminal status.
    ///
    /// Idempotent for a repeated identical terminal status; returns an
    /// error when called with a conflicting status after finalization.
    async fn finalize_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        error_text: Option<String>,
    ) -> Result<()>;

    /// Gets a run by ID. Returns `None` if the run does not exist.
    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>>;

    /// Lists the most recent runs, newest first.
    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>>;

    /// Returns the most recent `Success`/`Partial` run that has at least
    /// one dispatch-relevant instruction.
    ///
    /// Prediction-only runs never carry instructions and are skipped, so
    /// dispatch is never starved of a usable plan by a forecast refresh.
    async fn latest_dispatchable_run(&self) -> Result<Option<Run>>;

    // --- Artifact Operations ---

    /// Appends an artifact to a run. Append-once per `(run_id, kind, key)`.
    async fn append_artifact(
        &self,
        run_id: RunId,
        kind: ArtifactKind,
        key: &str,
        payload: Value,
    ) -> Result<()>;

    /// Gets the primary (empty-key) artifact of a kind for a run.
    async fn get_artifact(&self, run_id: RunId, kind: ArtifactKind) -> Result<Option<Artifact>>;

    /// Lists every artifact attached to a run, in append order.
    async fn artifacts_for_run(&self, run_id: RunId) -> Result<Vec<Artifact>>;

    /// Counts artifacts attached to a run.
    async fn count_artifacts(&self, run_id: RunId) -> Result<usize>;

    // --- Plan Instruction Operations ---

    /// Stores the instructions derived from a run's plan artifact.
    async fn insert_instructions(
        &self,
        run_id: RunId,
        instructions: Vec<PlanInstruction>,
    ) -> Result<()>;

    /// Returns the instructions derived for a run, in plan order.
    async fn instructions_for_run(&self, run_id: RunId) -> Result<Vec<PlanInstruction>>;

    // --- Output Target Operations ---

    /// Creates or replaces the output target for a resource.
    async fn upsert_output_target(&self, target: OutputTarget) -> Result<()>;

    /// Gets the output target configured for a resource.
    async fn get_output_target(&self, resource_id: &str) -> Result<Option<OutputTarget>>;

    /// Lists all configured output targets.
    async fn list_output_targets(&self) -> Result<Vec<OutputTarget>>;

    // --- Dispatch Event Operations ---

    /// Records one dispatch audit event.
    async fn record_dispatch_event(&self, event: DispatchEvent) -> Result<()>;

    /// Lists the most recent dispatch events, newest first.
    async fn list_dispatch_events(&self, limit: usize) -> Result<Vec<DispatchEvent>>;

    /// Returns the latest `Sent` event for an idempotency key, if any.
    ///
    /// The final state for a key is authoritative: a `Sent` result here
    /// means the logical dispatch must not be re-delivered.
    async fn last_sent_event_for_key(&self, idempotency_key: &str)
        -> Result<Option<DispatchEvent>>;
}
