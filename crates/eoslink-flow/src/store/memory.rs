//! In-memory store implementation.
//!
//! [`MemoryRunStore`] is a thread-safe implementation of [`RunStore`]
//! backed by a single `RwLock`, suitable for tests and single-instance
//! deployments.
//!
//! ## Limitations
//!
//! - **Single-process only**: State is not shared across process
//!   boundaries
//! - **No persistence**: All state is lost when the process exits

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use eoslink_core::RunId;

use super::RunStore;
use crate::artifact::{Artifact, ArtifactKind};
use crate::dispatch::{DispatchEvent, DispatchStatus, OutputTarget};
use crate::error::{Error, Result};
use crate::plan::PlanInstruction;
use crate::run::{Run, RunStatus, TriggerSource};

#[derive(Debug, Default)]
struct Inner {
    // BTreeMap keyed by RunId: ULIDs sort by creation time, so iteration
    // order is the run total order.
    runs: BTreeMap<RunId, Run>,
    artifacts: Vec<Artifact>,
    instructions: HashMap<RunId, Vec<PlanInstruction>>,
    targets: BTreeMap<String, OutputTarget>,
    events: Vec<DispatchEvent>,
}

/// In-memory run store.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    inner: RwLock<Inner>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl MemoryRunStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of runs currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn run_count(&self) -> Result<usize> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.runs.len())
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, trigger_source: TriggerSource, run_mode: &str) -> Result<Run> {
        let run = Run::new(trigger_source, run_mode);
        {
            let mut inner = self.inner.write().map_err(poison_err)?;
            inner.runs.insert(run.id, run.clone());
        }
        Ok(run)
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if !inner.runs.contains_key(&run.id) {
            return Err(Error::RunNotFound { run_id: run.id });
        }
        inner.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn finalize_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        error_text: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or(Error::RunNotFound { run_id })?;
        run.finalize(status, error_text)
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.runs.values().rev().take(limit).cloned().collect())
    }

    async fn latest_dispatchable_run(&self) -> Result<Option<Run>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let run = inner
            .runs
            .values()
            .rev()
            .filter(|run| matches!(run.status, RunStatus::Success | RunStatus::Partial))
            .find(|run| {
                inner
                    .instructions
                    .get(&run.id)
                    .is_some_and(|list| list.iter().any(PlanInstruction::is_dispatchable))
            })
            .cloned();
        Ok(run)
    }

    async fn append_artifact(
        &self,
        run_id: RunId,
        kind: ArtifactKind,
        key: &str,
        payload: Value,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if !inner.runs.contains_key(&run_id) {
            return Err(Error::RunNotFound { run_id });
        }
        let exists = inner
            .artifacts
            .iter()
            .any(|a| a.run_id == run_id && a.kind == kind && a.key == key);
        if exists {
            return Err(Error::ArtifactExists {
                run_id,
                kind: kind.to_string(),
                key: key.to_string(),
            });
        }
        inner.artifacts.push(Artifact::new(run_id, kind, key, payload));
        Ok(())
    }

    async fn get_artifact(&self, run_id: RunId, kind: ArtifactKind) -> Result<Option<Artifact>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .artifacts
            .iter()
            .find(|a| a.run_id == run_id && a.kind == kind && a.key.is_empty())
            .cloned())
    }

    async fn artifacts_for_run(&self, run_id: RunId) -> Result<Vec<Artifact>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .artifacts
            .iter()
            .filter(|a| a.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn count_artifacts(&self, run_id: RunId) -> Result<usize> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.artifacts.iter().filter(|a| a.run_id == run_id).count())
    }

    async fn insert_instructions(
        &self,
        run_id: RunId,
        instructions: Vec<PlanInstruction>,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if !inner.runs.contains_key(&run_id) {
            return Err(Error::RunNotFound { run_id });
        }
        inner.instructions.insert(run_id, instructions);
        Ok(())
    }

    async fn instructions_for_run(&self, run_id: RunId) -> Result<Vec<PlanInstruction>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.instructions.get(&run_id).cloned().unwrap_or_default())
    }

    async fn upsert_output_target(&self, target: OutputTarget) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.targets.insert(target.resource_id.clone(), target);
        Ok(())
    }

    async fn get_output_target(&self, resource_id: &str) -> Result<Option<OutputTarget>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.targets.get(resource_id).cloned())
    }

    async fn list_output_targets(&self) -> Result<Vec<OutputTarget>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.targets.values().cloned().collect())
    }

    async fn record_dispatch_event(&self, event: DispatchEvent) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.events.push(event);
        Ok(())
    }

    async fn list_dispatch_events(&self, limit: usize) -> Result<Vec<DispatchEvent>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.events.iter().rev().take(limit).cloned().collect())
    }

    async fn last_sent_event_for_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<DispatchEvent>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .events
            .iter()
            .rev()
            .find(|e| e.idempotency_key == idempotency_key && e.status == DispatchStatus::Sent)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::plan::derive_instructions;

    #[tokio::test]
    async fn create_and_get_run() -> Result<()> {
        let store = MemoryRunStore::new();
        let run = store.create_run(TriggerSource::Automatic, "collector").await?;
        let fetched = store.get_run(run.id).await?.expect("run exists");
        assert_eq!(fetched.run_mode, "collector");
        assert_eq!(fetched.status, RunStatus::Running);
        Ok(())
    }

    #[tokio::test]
    async fn finalize_is_idempotent_for_same_status() -> Result<()> {
        let store = MemoryRunStore::new();
        let run = store.create_run(TriggerSource::Automatic, "collector").await?;

        store.finalize_run(run.id, RunStatus::Partial, Some("plan unavailable: 404".into())).await?;
        store.finalize_run(run.id, RunStatus::Partial, None).await?;

        let fetched = store.get_run(run.id).await?.expect("run exists");
        assert_eq!(fetched.status, RunStatus::Partial);
        assert_eq!(fetched.error_text.as_deref(), Some("plan unavailable: 404"));
        Ok(())
    }

    #[tokio::test]
    async fn finalize_with_conflicting_status_errors() -> Result<()> {
        let store = MemoryRunStore::new();
        let run = store.create_run(TriggerSource::ForceRun, "pulse_then_legacy").await?;

        store.finalize_run(run.id, RunStatus::Success, None).await?;
        let err = store.finalize_run(run.id, RunStatus::Failed, None).await;
        assert!(matches!(err, Err(Error::InvalidStateTransition { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn artifacts_are_append_once() -> Result<()> {
        let store = MemoryRunStore::new();
        let run = store.create_run(TriggerSource::Automatic, "collector").await?;

        store.append_artifact(run.id, ArtifactKind::Plan, "", json!({"a": 1})).await?;
        let err = store
            .append_artifact(run.id, ArtifactKind::Plan, "", json!({"a": 2}))
            .await;
        assert!(matches!(err, Err(Error::ArtifactExists { .. })));

        // Same kind with a different key is fine.
        store
            .append_artifact(run.id, ArtifactKind::Plan, "pre_force_latest", json!({"a": 3}))
            .await?;
        assert_eq!(store.count_artifacts(run.id).await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn list_runs_newest_first() -> Result<()> {
        let store = MemoryRunStore::new();
        let first = store.create_run(TriggerSource::Automatic, "a").await?;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = store.create_run(TriggerSource::Automatic, "b").await?;

        let listed = store.list_runs(10).await?;
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
        Ok(())
    }

    #[tokio::test]
    async fn dispatchable_run_skips_prediction_only() -> Result<()> {
        let store = MemoryRunStore::new();

        // Run A: success with instructions.
        let run_a = store.create_run(TriggerSource::Automatic, "collector").await?;
        let plan = json!([{
            "resource_id": "battery-1",
            "type": "charge",
            "execution_time": "2026-08-30T14:00:00Z"
        }]);
        store
            .insert_instructions(run_a.id, derive_instructions(run_a.id, &plan))
            .await?;
        store.finalize_run(run_a.id, RunStatus::Success, None).await?;

        tokio::time::sleep(std::time::Duration::from_millis(2)).await;

        // Run B: prediction refresh, partial, no instructions.
        let run_b = store
            .create_run(TriggerSource::PredictionRefresh, "all")
            .await?;
        store
            .finalize_run(run_b.id, RunStatus::Partial, Some("pv failed".into()))
            .await?;

        let latest = store.latest_dispatchable_run().await?.expect("run A");
        assert_eq!(latest.id, run_a.id);
        Ok(())
    }

    #[tokio::test]
    async fn dispatchable_run_ignores_running_and_failed() -> Result<()> {
        let store = MemoryRunStore::new();
        let run = store.create_run(TriggerSource::Automatic, "collector").await?;
        let plan = json!([{
            "resource_id": "battery-1",
            "type": "charge",
            "execution_time": "2026-08-30T14:00:00Z"
        }]);
        store
            .insert_instructions(run.id, derive_instructions(run.id, &plan))
            .await?;

        // Still running: not dispatchable.
        assert!(store.latest_dispatchable_run().await?.is_none());

        store.finalize_run(run.id, RunStatus::Failed, Some("x".into())).await?;
        assert!(store.latest_dispatchable_run().await?.is_none());
        Ok(())
    }
}
