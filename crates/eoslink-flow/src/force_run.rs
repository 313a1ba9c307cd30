//! Force-run controller ("pulse then legacy").
//!
//! Forcing a run is a two-phase strategy. The pulse phase sets the
//! optimizer's automatic run interval to a minimal value and waits,
//! bounded, for a new `last_run_datetime` marker; when the marker moves
//! the run is materialized exactly as the collector would. When the
//! marker never moves within the timeout, the legacy fallback calls the
//! optimizer's single-shot optimize endpoint directly, warm-started
//! from the previous successful run's solution.
//!
//! At most one force run executes at a time. The in-progress flag is
//! shared with the prediction-refresh controller and released on every
//! exit path via an RAII guard.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use eoslink_core::RunId;

use crate::artifact::ArtifactKind;
use crate::collector::complete_run_with_artifacts;
use crate::eos::{EosClient, PredictionProvider};
use crate::error::{Error, Result};
use crate::metrics as flow_metrics;
use crate::plan::derive_instructions;
use crate::run::{Run, RunStatus, TriggerSource};
use crate::store::RunStore;

/// Force-run controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceRunConfig {
    /// Interval value written during the pulse phase, in seconds.
    pub pulse_interval_seconds: u64,
    /// Bound on the wait for a new completion marker, in seconds.
    pub wait_timeout_seconds: u64,
    /// Marker poll interval while waiting, in seconds.
    pub poll_seconds: u64,
    /// Whether the legacy optimize fallback runs after a timeout.
    pub legacy_fallback_enabled: bool,
    /// Providers refreshed before the pulse. Refresh failures here are
    /// logged and never fail the run.
    pub pre_refresh_providers: Vec<PredictionProvider>,
}

impl Default for ForceRunConfig {
    fn default() -> Self {
        Self {
            pulse_interval_seconds: 5,
            wait_timeout_seconds: 90,
            poll_seconds: 2,
            legacy_fallback_enabled: true,
            pre_refresh_providers: Vec::new(),
        }
    }
}

/// Phases of the pulse-then-legacy strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcePhase {
    /// Writing the minimal run interval to provoke an automatic cycle.
    Pulsing,
    /// Polling for a new completion marker.
    Waiting,
    /// A new marker appeared; the run is being materialized.
    Materialized,
    /// The wait timed out; the legacy optimize call is running.
    FallingBack,
    /// The run reached a terminal status.
    Done,
}

impl std::fmt::Display for ForcePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pulsing => write!(f, "pulsing"),
            Self::Waiting => write!(f, "waiting"),
            Self::Materialized => write!(f, "materialized"),
            Self::FallingBack => write!(f, "falling_back"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Observable force-run state for the runtime snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceRunSnapshot {
    /// Whether a force run (or prediction refresh) is executing now.
    pub in_progress: bool,
    /// Phase reached by the most recent force run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_phase: Option<ForcePhase>,
    /// Run created by the most recent force run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<RunId>,
}

/// Releases the in-progress flag on every exit path.
struct InProgressGuard(Arc<AtomicBool>);

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives the pulse-then-legacy force-run strategy.
pub struct ForceRunController {
    store: Arc<dyn RunStore>,
    eos: Arc<dyn EosClient>,
    config: ForceRunConfig,
    in_progress: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
    state: RwLock<ForceRunSnapshot>,
}

impl std::fmt::Debug for ForceRunController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForceRunController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ForceRunController {
    /// Creates a controller sharing the orchestrator's in-progress flag
    /// and shutdown signal.
    #[must_use]
    pub fn new(
        store: Arc<dyn RunStore>,
        eos: Arc<dyn EosClient>,
        config: ForceRunConfig,
        in_progress: Arc<AtomicBool>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            eos,
            config,
            in_progress,
            shutdown,
            state: RwLock::new(ForceRunSnapshot::default()),
        }
    }

    /// Returns the current observable state.
    #[must_use]
    pub fn snapshot(&self) -> ForceRunSnapshot {
        let mut snapshot = self.state.read().map(|s| s.clone()).unwrap_or_default();
        snapshot.in_progress = self.in_progress.load(Ordering::Acquire);
        snapshot
    }

    fn set_phase(&self, phase: ForcePhase, run_id: Option<RunId>) {
        if let Ok(mut state) = self.state.write() {
            state.last_phase = Some(phase);
            if run_id.is_some() {
                state.last_run_id = run_id;
            }
        }
    }

    /// Executes one force run end to end.
    ///
    /// Synchronous from the caller's perspective: the returned run is
    /// terminal. A second concurrent call fails fast.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ForceRunInProgress`] when another force run or
    /// prediction refresh holds the flag, and storage errors otherwise.
    /// Optimizer failures are folded into the run's terminal status.
    pub async fn execute(&self) -> Result<Run> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::ForceRunInProgress);
        }
        let _guard = InProgressGuard(Arc::clone(&self.in_progress));

        let result = self.execute_inner().await;
        self.set_phase(ForcePhase::Done, None);
        result
    }

    async fn execute_inner(&self) -> Result<Run> {
        let baseline = self
            .eos
            .health()
            .await
            .ok()
            .and_then(|health| health.last_run_datetime);

        let run = self
            .store
            .create_run(TriggerSource::ForceRun, "pulse_then_legacy")
            .await?;
        flow_metrics::record_run_created(TriggerSource::ForceRun);
        self.set_phase(ForcePhase::Pulsing, Some(run.id));
        tracing::info!(run_id = %run.id, baseline = ?baseline, "force run started");

        // Snapshot the previous solution before anything changes: the
        // operator can diff it against the forced outcome, and the
        // legacy fallback warm-starts from it.
        let previous_solution = self.latest_solution().await?;
        if let Some(previous) = &previous_solution {
            self.store
                .append_artifact(
                    run.id,
                    ArtifactKind::Solution,
                    "pre_force_latest",
                    previous.clone(),
                )
                .await?;
        }

        for provider in &self.config.pre_refresh_providers {
            if let Err(err) = self.eos.refresh_prediction(*provider).await {
                tracing::warn!(provider = %provider, error = %err, "pre-force prediction refresh failed");
            }
        }

        if let Err(err) = self
            .eos
            .set_run_interval(self.config.pulse_interval_seconds)
            .await
        {
            tracing::warn!(error = %err, "pulse failed, skipping to fallback");
            return self
                .fallback(run, previous_solution, format!("pulse failed: {}", err.summary()))
                .await;
        }

        self.set_phase(ForcePhase::Waiting, None);
        match self.wait_for_marker(baseline).await {
            WaitOutcome::NewMarker(marker) => {
                self.set_phase(ForcePhase::Materialized, None);
                tracing::info!(run_id = %run.id, marker = %marker, "optimizer produced a forced run");
                let mut run = run;
                run.eos_last_run_datetime = Some(marker);
                self.store.save_run(&run).await?;
                complete_run_with_artifacts(&self.store, &self.eos, run).await
            }
            WaitOutcome::TimedOut => {
                let reason = format!(
                    "no new optimizer run within {}s",
                    self.config.wait_timeout_seconds
                );
                self.fallback(run, previous_solution, reason).await
            }
            WaitOutcome::Shutdown => {
                self.store
                    .finalize_run(
                        run.id,
                        RunStatus::Failed,
                        Some("shutdown during force run".to_string()),
                    )
                    .await?;
                flow_metrics::record_run_finalized(RunStatus::Failed);
                self.fetch(run.id).await
            }
        }
    }

    async fn wait_for_marker(&self, baseline: Option<DateTime<Utc>>) -> WaitOutcome {
        let mut shutdown = self.shutdown.clone();
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.wait_timeout_seconds);
        let poll = Duration::from_secs(self.config.poll_seconds.max(1));

        loop {
            if let Ok(health) = self.eos.health().await {
                if let Some(marker) = health.last_run_datetime {
                    if baseline != Some(marker) {
                        return WaitOutcome::NewMarker(marker);
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return WaitOutcome::TimedOut;
            }

            tokio::select! {
                () = tokio::time::sleep(poll) => {}
                changed = shutdown.changed() => match changed {
                    Ok(()) => return WaitOutcome::Shutdown,
                    // Sender dropped without signaling; keep waiting on
                    // the poll timer instead of treating it as shutdown.
                    Err(_) => tokio::time::sleep(poll).await,
                },
            }
        }
    }

    /// Legacy fallback: call the single-shot optimize endpoint directly
    /// and record its result as the run's outcome.
    async fn fallback(
        &self,
        run: Run,
        previous_solution: Option<Value>,
        reason: String,
    ) -> Result<Run> {
        if !self.config.legacy_fallback_enabled {
            tracing::warn!(run_id = %run.id, reason = %reason, "force run failed, fallback disabled");
            self.store
                .finalize_run(run.id, RunStatus::Failed, Some(reason))
                .await?;
            flow_metrics::record_run_finalized(RunStatus::Failed);
            return self.fetch(run.id).await;
        }

        self.set_phase(ForcePhase::FallingBack, None);
        tracing::info!(run_id = %run.id, reason = %reason, "falling back to legacy optimize");

        match self.eos.optimize(legacy_request(previous_solution)).await {
            Ok(solution) => {
                self.store
                    .append_artifact(run.id, ArtifactKind::Solution, "", solution.clone())
                    .await?;
                let instructions = derive_instructions(run.id, &solution);
                self.store.insert_instructions(run.id, instructions).await?;
                self.store
                    .finalize_run(run.id, RunStatus::Success, None)
                    .await?;
                flow_metrics::record_run_finalized(RunStatus::Success);
                self.fetch(run.id).await
            }
            Err(err) => {
                let text = format!("{reason}; legacy fallback failed: {}", err.summary());
                self.store
                    .finalize_run(run.id, RunStatus::Failed, Some(text))
                    .await?;
                flow_metrics::record_run_finalized(RunStatus::Failed);
                self.fetch(run.id).await
            }
        }
    }

    /// Newest solution artifact among terminal successful runs.
    async fn latest_solution(&self) -> Result<Option<Value>> {
        for run in self.store.list_runs(50).await? {
            if run.status != RunStatus::Success {
                continue;
            }
            if let Some(artifact) = self
                .store
                .get_artifact(run.id, ArtifactKind::Solution)
                .await?
            {
                return Ok(Some(artifact.payload));
            }
        }
        Ok(None)
    }

    async fn fetch(&self, run_id: RunId) -> Result<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or(Error::RunNotFound { run_id })
    }
}

enum WaitOutcome {
    NewMarker(DateTime<Utc>),
    TimedOut,
    Shutdown,
}

fn legacy_request(previous_solution: Option<Value>) -> Value {
    let mut body = serde_json::Map::new();
    if let Some(previous) = previous_solution {
        body.insert("start_solution".to_string(), previous);
    }
    Value::Object(body)
}
