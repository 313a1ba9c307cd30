//! Automatic run detection.
//!
//! The collector polls EOS health on a fixed interval and watches the
//! `last_run_datetime` completion marker. When the marker moves, the
//! optimizer finished an automatic cycle on its own; the collector
//! materializes that cycle as a [`Run`] with its plan and solution
//! artifacts.
//!
//! Classification is deliberately lenient: a missing plan or solution
//! is **not** fatal — it is expected whenever the optimizer is not in
//! automatic-optimization mode, and downgrades the run to `Partial`.
//! Only transport errors during artifact fetch fail the run. Transport
//! errors on the health call itself never create a run at all; they are
//! recorded in the status snapshot and retried on the next tick.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::eos::{EosClient, EosError, Fetched};
use crate::error::{Error, Result};
use crate::metrics as flow_metrics;
use crate::plan::derive_instructions;
use crate::run::{Run, RunStatus, TriggerSource};
use crate::store::RunStore;
use crate::artifact::ArtifactKind;

/// Collector configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorConfig {
    /// Health poll interval in seconds.
    pub poll_seconds: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self { poll_seconds: 30 }
    }
}

/// Observable collector state for the runtime snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorSnapshot {
    /// Last EOS completion marker the collector has seen.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_observed_eos_run_datetime: Option<DateTime<Utc>>,
    /// When the collector last polled health.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_poll_ts: Option<DateTime<Utc>>,
    /// Last transient poll error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Materializes one optimizer cycle as a run with artifacts and
/// derived instructions.
///
/// Shared by the collector and the force-run controller: both produce
/// runs the same way, differing only in trigger source and mode label.
///
/// # Errors
///
/// Returns storage errors. EOS fetch outcomes are folded into the run's
/// terminal status, not propagated.
pub async fn materialize_run(
    store: &Arc<dyn RunStore>,
    eos: &Arc<dyn EosClient>,
    trigger_source: TriggerSource,
    run_mode: &str,
    eos_last_run_datetime: Option<DateTime<Utc>>,
) -> Result<Run> {
    let mut run = store.create_run(trigger_source, run_mode).await?;
    flow_metrics::record_run_created(trigger_source);

    run.eos_last_run_datetime = eos_last_run_datetime;
    store.save_run(&run).await?;

    complete_run_with_artifacts(store, eos, run).await
}

/// Fetches plan and solution for an already-created run, appends them as
/// artifacts, derives instructions, and finalizes the run.
///
/// Split out of [`materialize_run`] so the force-run controller can
/// complete a run it created before pulsing the optimizer.
///
/// # Errors
///
/// Returns storage errors. EOS fetch outcomes are folded into the run's
/// terminal status, not propagated.
pub async fn complete_run_with_artifacts(
    store: &Arc<dyn RunStore>,
    eos: &Arc<dyn EosClient>,
    run: Run,
) -> Result<Run> {
    let mut gaps: Vec<String> = Vec::new();

    match eos.get_plan().await {
        Ok(Fetched::Found(plan)) => {
            store
                .append_artifact(run.id, ArtifactKind::Plan, "", plan.clone())
                .await?;
            let instructions = derive_instructions(run.id, &plan);
            store.insert_instructions(run.id, instructions).await?;
        }
        Ok(Fetched::NotFound { detail }) => {
            gaps.push(format!("plan unavailable: {detail}"));
        }
        Err(err) => return fail_run(store, run, &err).await,
    }

    match eos.get_solution().await {
        Ok(Fetched::Found(solution)) => {
            store
                .append_artifact(run.id, ArtifactKind::Solution, "", solution)
                .await?;
        }
        Ok(Fetched::NotFound { detail }) => {
            gaps.push(format!("solution unavailable: {detail}"));
        }
        Err(err) => return fail_run(store, run, &err).await,
    }

    let (status, error_text) = if gaps.is_empty() {
        (RunStatus::Success, None)
    } else {
        (RunStatus::Partial, Some(gaps.join("; ")))
    };

    store.finalize_run(run.id, status, error_text).await?;
    flow_metrics::record_run_finalized(status);

    store
        .get_run(run.id)
        .await?
        .ok_or(Error::RunNotFound { run_id: run.id })
}

async fn fail_run(store: &Arc<dyn RunStore>, run: Run, err: &EosError) -> Result<Run> {
    store
        .finalize_run(run.id, RunStatus::Failed, Some(err.summary()))
        .await?;
    flow_metrics::record_run_finalized(RunStatus::Failed);
    store
        .get_run(run.id)
        .await?
        .ok_or(Error::RunNotFound { run_id: run.id })
}

/// Background poller that detects externally-completed automatic runs.
pub struct Collector {
    store: Arc<dyn RunStore>,
    eos: Arc<dyn EosClient>,
    config: CollectorConfig,
    state: RwLock<CollectorSnapshot>,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Collector {
    /// Creates a collector over the given store and optimizer client.
    #[must_use]
    pub fn new(
        store: Arc<dyn RunStore>,
        eos: Arc<dyn EosClient>,
        config: CollectorConfig,
    ) -> Self {
        Self {
            store,
            eos,
            config,
            state: RwLock::new(CollectorSnapshot::default()),
        }
    }

    /// Returns the current observable state.
    #[must_use]
    pub fn snapshot(&self) -> CollectorSnapshot {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Performs one poll cycle.
    ///
    /// Returns the materialized run when a new completion marker was
    /// detected, `None` otherwise.
    ///
    /// # Errors
    ///
    /// Returns storage errors only; EOS transport failures are absorbed
    /// into the snapshot and retried next tick.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<Option<Run>> {
        let health = match self.eos.health().await {
            Ok(health) => health,
            Err(err) => {
                flow_metrics::record_collector_poll_error();
                tracing::debug!(error = %err, "EOS health poll failed");
                if let Ok(mut state) = self.state.write() {
                    state.last_poll_ts = Some(now);
                    state.last_error = Some(err.summary());
                }
                return Ok(None);
            }
        };

        let previous = {
            let mut state = self
                .state
                .write()
                .map_err(|_| Error::storage("collector state lock poisoned"))?;
            state.last_poll_ts = Some(now);
            state.last_error = None;
            let previous = state.last_observed_eos_run_datetime;
            state.last_observed_eos_run_datetime = health.last_run_datetime;
            previous
        };

        let Some(marker) = health.last_run_datetime else {
            return Ok(None);
        };

        match previous {
            // First observation is a baseline; replaying a marker from
            // before this process started would duplicate history.
            None => Ok(None),
            Some(previous) if previous == marker => Ok(None),
            Some(_) => {
                tracing::info!(marker = %marker, "detected new EOS automatic run");
                let run = materialize_run(
                    &self.store,
                    &self.eos,
                    TriggerSource::Automatic,
                    "eos_detected",
                    Some(marker),
                )
                .await?;
                Ok(Some(run))
            }
        }
    }

    /// Runs the poll loop until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.poll_seconds.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once(Utc::now()).await {
                        tracing::error!(error = %err, "collector poll cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("collector shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eos::mock::MockEosClient;
    use crate::store::memory::MemoryRunStore;
    use serde_json::json;

    fn stores() -> (Arc<dyn RunStore>, Arc<MockEosClient>) {
        let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
        let eos = Arc::new(MockEosClient::new());
        (store, eos)
    }

    fn marker(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn first_observation_is_baseline() -> Result<()> {
        let (store, eos) = stores();
        eos.set_last_run_datetime(Some(marker("2026-08-30T14:00:00Z")));
        let collector = Collector::new(
            Arc::clone(&store),
            eos.clone() as Arc<dyn EosClient>,
            CollectorConfig::default(),
        );

        assert!(collector.poll_once(Utc::now()).await?.is_none());
        assert_eq!(store.list_runs(10).await?.len(), 0);

        let snapshot = collector.snapshot();
        assert_eq!(
            snapshot.last_observed_eos_run_datetime,
            Some(marker("2026-08-30T14:00:00Z"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn changed_marker_materializes_automatic_run() -> Result<()> {
        let (store, eos) = stores();
        eos.set_last_run_datetime(Some(marker("2026-08-30T14:00:00Z")));
        eos.set_plan(Some(json!([{
            "resource_id": "battery-1",
            "type": "charge",
            "execution_time": "2026-08-30T14:00:00Z"
        }])));
        eos.set_solution(Some(json!({"total_cost": 1.25})));

        let collector = Collector::new(
            Arc::clone(&store),
            eos.clone() as Arc<dyn EosClient>,
            CollectorConfig::default(),
        );

        collector.poll_once(Utc::now()).await?;
        eos.set_last_run_datetime(Some(marker("2026-08-30T14:15:00Z")));

        let run = collector.poll_once(Utc::now()).await?.expect("run detected");
        assert_eq!(run.trigger_source, TriggerSource::Automatic);
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(
            run.eos_last_run_datetime,
            Some(marker("2026-08-30T14:15:00Z"))
        );
        assert_eq!(store.instructions_for_run(run.id).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_plan_and_solution_is_partial_not_failed() -> Result<()> {
        let (store, eos) = stores();
        eos.set_last_run_datetime(Some(marker("2026-08-30T14:00:00Z")));
        eos.set_plan(None);
        eos.set_solution(None);

        let collector = Collector::new(
            Arc::clone(&store),
            eos.clone() as Arc<dyn EosClient>,
            CollectorConfig::default(),
        );
        collector.poll_once(Utc::now()).await?;
        eos.set_last_run_datetime(Some(marker("2026-08-30T14:15:00Z")));

        let run = collector.poll_once(Utc::now()).await?.expect("run detected");
        assert_eq!(run.status, RunStatus::Partial);
        let text = run.error_text.unwrap_or_default();
        assert!(text.contains("plan unavailable"), "got: {text}");
        assert!(text.contains("solution unavailable"), "got: {text}");
        Ok(())
    }

    #[tokio::test]
    async fn health_transport_error_creates_no_run() -> Result<()> {
        let (store, eos) = stores();
        eos.fail_health_with(EosError::transient("connection refused"));

        let collector = Collector::new(
            Arc::clone(&store),
            eos.clone() as Arc<dyn EosClient>,
            CollectorConfig::default(),
        );

        assert!(collector.poll_once(Utc::now()).await?.is_none());
        assert_eq!(store.list_runs(10).await?.len(), 0);
        assert!(collector
            .snapshot()
            .last_error
            .unwrap_or_default()
            .contains("connection refused"));
        Ok(())
    }

    #[tokio::test]
    async fn unchanged_marker_creates_no_run() -> Result<()> {
        let (store, eos) = stores();
        eos.set_last_run_datetime(Some(marker("2026-08-30T14:00:00Z")));
        let collector = Collector::new(
            Arc::clone(&store),
            eos.clone() as Arc<dyn EosClient>,
            CollectorConfig::default(),
        );

        collector.poll_once(Utc::now()).await?;
        assert!(collector.poll_once(Utc::now()).await?.is_none());
        assert_eq!(store.list_runs(10).await?.len(), 0);
        Ok(())
    }
}
