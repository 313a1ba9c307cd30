//! Orchestrator runtime: wiring, background loops, and status snapshot.
//!
//! A single [`Orchestrator`] is constructed at process start with
//! injected collaborators (store, optimizer client, webhook sender,
//! grid-signal source) and owns everything mutable: the force-run
//! in-progress flag, the collector and scheduler status snapshots, and
//! the shutdown channel distributed to every background loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::aligned::{next_due, AlignedConfig, AlignedScheduler, AlignedSnapshot};
use crate::collector::{Collector, CollectorConfig, CollectorSnapshot};
use crate::dispatch::{DispatchConfig, DispatchEngine, WebhookSender};
use crate::eos::EosClient;
use crate::error::{Error, Result};
use crate::force_run::{ForceRunConfig, ForceRunController, ForceRunSnapshot};
use crate::guard::GridSignalSource;
use crate::prediction::{PredictionRefreshController, RefreshScope};
use crate::run::Run;
use crate::store::RunStore;

/// Top-level orchestration configuration, one section per loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfig {
    /// Collector poll loop.
    pub collector: CollectorConfig,
    /// Aligned wall-clock scheduler.
    pub aligned: AlignedConfig,
    /// Force-run controller.
    pub force_run: ForceRunConfig,
    /// Output dispatch engine.
    pub dispatch: DispatchConfig,
}

impl FlowConfig {
    /// Loads configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the offending variable.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an injectable lookup, for tests.
    ///
    /// Unset variables keep their defaults. Recognized variables:
    /// `EOS_POLL_SECONDS`, `EOS_ALIGNED_ENABLED`,
    /// `EOS_ALIGNED_MINUTE_MARKS`, `EOS_ALIGNED_DELAY_SECONDS`,
    /// `EOS_PULSE_INTERVAL_SECONDS`, `EOS_FORCE_RUN_TIMEOUT_SECONDS`,
    /// `EOS_LEGACY_FALLBACK_ENABLED`, `DISPATCH_SCHEDULED_SECONDS`,
    /// `DISPATCH_HEARTBEAT_SECONDS`, `GUARD_NO_GRID_CHARGE_ENABLED`,
    /// `GUARD_THRESHOLD_WATTS`, `GUARD_SIGNAL_MAX_AGE_SECONDS`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the offending variable.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup("EOS_POLL_SECONDS") {
            config.collector.poll_seconds = parse_positive(&value, "EOS_POLL_SECONDS")?;
        }
        if let Some(value) = lookup("EOS_ALIGNED_ENABLED") {
            config.aligned.enabled = parse_bool(&value, "EOS_ALIGNED_ENABLED")?;
        }
        if let Some(value) = lookup("EOS_ALIGNED_MINUTE_MARKS") {
            config.aligned.minute_marks = parse_minute_marks(&value)?;
        }
        if let Some(value) = lookup("EOS_ALIGNED_DELAY_SECONDS") {
            config.aligned.delay_seconds = parse_u64(&value, "EOS_ALIGNED_DELAY_SECONDS")?;
        }
        if let Some(value) = lookup("EOS_PULSE_INTERVAL_SECONDS") {
            config.force_run.pulse_interval_seconds =
                parse_positive(&value, "EOS_PULSE_INTERVAL_SECONDS")?;
        }
        if let Some(value) = lookup("EOS_FORCE_RUN_TIMEOUT_SECONDS") {
            config.force_run.wait_timeout_seconds =
                parse_positive(&value, "EOS_FORCE_RUN_TIMEOUT_SECONDS")?;
        }
        if let Some(value) = lookup("EOS_LEGACY_FALLBACK_ENABLED") {
            config.force_run.legacy_fallback_enabled =
                parse_bool(&value, "EOS_LEGACY_FALLBACK_ENABLED")?;
        }
        if let Some(value) = lookup("DISPATCH_SCHEDULED_SECONDS") {
            config.dispatch.scheduled_tick_seconds =
                parse_positive(&value, "DISPATCH_SCHEDULED_SECONDS")?;
        }
        if let Some(value) = lookup("DISPATCH_HEARTBEAT_SECONDS") {
            config.dispatch.heartbeat_seconds =
                parse_positive(&value, "DISPATCH_HEARTBEAT_SECONDS")?;
        }
        if let Some(value) = lookup("GUARD_NO_GRID_CHARGE_ENABLED") {
            config.dispatch.guard.enabled = parse_bool(&value, "GUARD_NO_GRID_CHARGE_ENABLED")?;
        }
        if let Some(value) = lookup("GUARD_THRESHOLD_WATTS") {
            config.dispatch.guard.threshold_watts = value.parse::<f64>().map_err(|_| {
                Error::configuration(format!("GUARD_THRESHOLD_WATTS: not a number: {value}"))
            })?;
        }
        if let Some(value) = lookup("GUARD_SIGNAL_MAX_AGE_SECONDS") {
            config.dispatch.guard.signal_max_age_seconds =
                parse_positive(&value, "GUARD_SIGNAL_MAX_AGE_SECONDS")?;
        }

        Ok(config)
    }
}

fn parse_u64(value: &str, name: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| Error::configuration(format!("{name}: not a non-negative integer: {value}")))
}

fn parse_positive(value: &str, name: &str) -> Result<u64> {
    let parsed = parse_u64(value, name)?;
    if parsed == 0 {
        return Err(Error::configuration(format!("{name}: must be greater than zero")));
    }
    Ok(parsed)
}

fn parse_bool(value: &str, name: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(Error::configuration(format!("{name}: not a boolean: {value}"))),
    }
}

fn parse_minute_marks(value: &str) -> Result<Vec<u32>> {
    let mut marks = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mark: u32 = part.parse().map_err(|_| {
            Error::configuration(format!("EOS_ALIGNED_MINUTE_MARKS: not a minute: {part}"))
        })?;
        if mark >= 60 {
            return Err(Error::configuration(format!(
                "EOS_ALIGNED_MINUTE_MARKS: minute out of range: {mark}"
            )));
        }
        marks.push(mark);
    }
    if marks.is_empty() {
        return Err(Error::configuration(
            "EOS_ALIGNED_MINUTE_MARKS: no minute marks given",
        ));
    }
    marks.sort_unstable();
    marks.dedup();
    Ok(marks)
}

/// Serializable orchestrator status for the runtime endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSnapshot {
    /// Whether the last optimizer health probe succeeded.
    pub eos_healthy: bool,
    /// Optimizer-reported completion marker, when health succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eos_last_run_datetime: Option<DateTime<Utc>>,
    /// Collector poll state.
    pub collector: CollectorSnapshot,
    /// Aligned scheduler state.
    pub aligned: AlignedSnapshot,
    /// Force-run state, including the shared in-progress flag.
    pub force_run: ForceRunSnapshot,
}

/// Owns all orchestration components and their background loops.
pub struct Orchestrator {
    store: Arc<dyn RunStore>,
    eos: Arc<dyn EosClient>,
    config: FlowConfig,
    force_in_progress: Arc<AtomicBool>,
    collector: Arc<Collector>,
    aligned: Arc<AlignedScheduler>,
    dispatch: Arc<DispatchEngine>,
    force_run: ForceRunController,
    prediction: PredictionRefreshController,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Wires all components over the injected collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn RunStore>,
        eos: Arc<dyn EosClient>,
        sender: Arc<dyn WebhookSender>,
        signal: Arc<dyn GridSignalSource>,
        config: FlowConfig,
    ) -> Self {
        let force_in_progress = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let collector = Arc::new(Collector::new(
            Arc::clone(&store),
            Arc::clone(&eos),
            config.collector,
        ));
        let aligned = Arc::new(AlignedScheduler::new(
            Arc::clone(&store),
            Arc::clone(&eos),
            config.aligned.clone(),
            Arc::clone(&force_in_progress),
        ));
        let dispatch = Arc::new(DispatchEngine::new(
            Arc::clone(&store),
            sender,
            signal,
            config.dispatch.clone(),
        ));
        let force_run = ForceRunController::new(
            Arc::clone(&store),
            Arc::clone(&eos),
            config.force_run.clone(),
            Arc::clone(&force_in_progress),
            shutdown_rx,
        );
        let prediction = PredictionRefreshController::new(
            Arc::clone(&store),
            Arc::clone(&eos),
            Arc::clone(&force_in_progress),
        );

        Self {
            store,
            eos,
            config,
            force_in_progress,
            collector,
            aligned,
            dispatch,
            force_run,
            prediction,
            shutdown_tx,
        }
    }

    /// The run repository shared by all components.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// The dispatch engine, for force-dispatch requests.
    #[must_use]
    pub fn dispatch(&self) -> &DispatchEngine {
        &self.dispatch
    }

    /// Executes a force run end to end.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ForceRunInProgress`] when another force run or
    /// prediction refresh is executing, and storage errors otherwise.
    pub async fn force_run(&self) -> Result<Run> {
        self.force_run.execute().await
    }

    /// Executes a prediction refresh for the given scope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ForceRunInProgress`] when a force run or another
    /// refresh is executing, and storage errors otherwise.
    pub async fn refresh_predictions(&self, scope: RefreshScope) -> Result<Run> {
        self.prediction.refresh(scope).await
    }

    /// Whether a force run or prediction refresh is executing now.
    #[must_use]
    pub fn force_run_in_progress(&self) -> bool {
        self.force_in_progress.load(Ordering::Acquire)
    }

    /// Collects the live status snapshot, probing optimizer health.
    pub async fn snapshot(&self) -> RuntimeSnapshot {
        let health = self.eos.health().await.ok();
        let mut aligned = self.aligned.snapshot();
        if aligned.next_due_ts.is_none() {
            // The loop has not computed a slot yet (or is disabled);
            // derive it so the endpoint always shows the schedule.
            aligned.next_due_ts = Some(next_due(
                Utc::now(),
                &self.config.aligned.minute_marks,
                self.config.aligned.delay_seconds,
            ));
        }

        RuntimeSnapshot {
            eos_healthy: health.is_some(),
            eos_last_run_datetime: health.and_then(|h| h.last_run_datetime),
            collector: self.collector.snapshot(),
            aligned,
            force_run: self.force_run.snapshot(),
        }
    }

    /// Spawns the collector, aligned scheduler, and dispatch tickers.
    ///
    /// Returns the task handles; loops exit when [`Self::shutdown`] is
    /// called.
    pub fn spawn_loops(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(
            Arc::clone(&self.collector).run(self.shutdown_tx.subscribe()),
        ));
        handles.push(tokio::spawn(
            Arc::clone(&self.aligned).run(self.shutdown_tx.subscribe()),
        ));
        handles.push(tokio::spawn(dispatch_loop(
            Arc::clone(&self.dispatch),
            self.config.dispatch.clone(),
            self.shutdown_tx.subscribe(),
        )));

        handles
    }

    /// Signals every background loop to exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Drives the scheduled and heartbeat dispatch tickers in one task.
async fn dispatch_loop(
    engine: Arc<DispatchEngine>,
    config: DispatchConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut scheduled =
        tokio::time::interval(Duration::from_secs(config.scheduled_tick_seconds.max(1)));
    scheduled.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut heartbeat = tokio::time::interval(Duration::from_secs(config.heartbeat_seconds.max(1)));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut window_start = Utc::now();

    loop {
        tokio::select! {
            _ = scheduled.tick() => {
                let now = Utc::now();
                if let Err(err) = engine.tick_scheduled(window_start, now).await {
                    tracing::error!(error = %err, "scheduled dispatch tick failed");
                }
                window_start = now;
            }
            _ = heartbeat.tick() => {
                if let Err(err) = engine.tick_heartbeat(Utc::now()).await {
                    tracing::error!(error = %err, "heartbeat dispatch tick failed");
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("dispatch loops shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::memory::MemoryWebhookSender;
    use crate::eos::mock::MockEosClient;
    use crate::guard::StaticSignalSource;
    use crate::store::memory::MemoryRunStore;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            Arc::new(MemoryRunStore::new()),
            Arc::new(MockEosClient::new()),
            Arc::new(MemoryWebhookSender::new()),
            Arc::new(StaticSignalSource::new()),
            FlowConfig::default(),
        )
    }

    #[test]
    fn defaults_when_environment_is_empty() -> Result<()> {
        let config = FlowConfig::from_env_with(|_| None)?;
        assert_eq!(config.collector.poll_seconds, 30);
        assert!(!config.aligned.enabled);
        assert_eq!(config.dispatch.scheduled_tick_seconds, 15);
        assert_eq!(config.dispatch.heartbeat_seconds, 60);
        Ok(())
    }

    #[test]
    fn full_environment_parses() -> Result<()> {
        let config = FlowConfig::from_env_with(lookup_from(&[
            ("EOS_POLL_SECONDS", "10"),
            ("EOS_ALIGNED_ENABLED", "true"),
            ("EOS_ALIGNED_MINUTE_MARKS", "0, 30"),
            ("EOS_ALIGNED_DELAY_SECONDS", "2"),
            ("EOS_PULSE_INTERVAL_SECONDS", "3"),
            ("EOS_FORCE_RUN_TIMEOUT_SECONDS", "120"),
            ("EOS_LEGACY_FALLBACK_ENABLED", "false"),
            ("DISPATCH_SCHEDULED_SECONDS", "5"),
            ("DISPATCH_HEARTBEAT_SECONDS", "30"),
            ("GUARD_NO_GRID_CHARGE_ENABLED", "yes"),
            ("GUARD_THRESHOLD_WATTS", "75.5"),
            ("GUARD_SIGNAL_MAX_AGE_SECONDS", "120"),
        ]))?;

        assert_eq!(config.collector.poll_seconds, 10);
        assert!(config.aligned.enabled);
        assert_eq!(config.aligned.minute_marks, vec![0, 30]);
        assert_eq!(config.force_run.wait_timeout_seconds, 120);
        assert!(!config.force_run.legacy_fallback_enabled);
        assert!(config.dispatch.guard.enabled);
        assert!((config.dispatch.guard.threshold_watts - 75.5).abs() < f64::EPSILON);
        Ok(())
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = FlowConfig::from_env_with(lookup_from(&[("EOS_POLL_SECONDS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("EOS_POLL_SECONDS"));

        let err =
            FlowConfig::from_env_with(lookup_from(&[("EOS_ALIGNED_MINUTE_MARKS", "0,99")]))
                .unwrap_err();
        assert!(err.to_string().contains("minute out of range"));

        let err = FlowConfig::from_env_with(lookup_from(&[("DISPATCH_SCHEDULED_SECONDS", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }

    #[tokio::test]
    async fn snapshot_reports_health_and_schedule() {
        let orchestrator = orchestrator();
        let snapshot = orchestrator.snapshot().await;
        assert!(snapshot.eos_healthy);
        assert!(snapshot.aligned.next_due_ts.is_some());
        assert!(!snapshot.force_run.in_progress);
    }

    #[tokio::test]
    async fn force_and_refresh_share_the_flag() -> Result<()> {
        let orchestrator = orchestrator();
        // No concurrent run: sequential calls both succeed.
        orchestrator.refresh_predictions(RefreshScope::Pv).await?;
        assert!(!orchestrator.force_run_in_progress());
        Ok(())
    }

    #[tokio::test]
    async fn loops_exit_on_shutdown() {
        let orchestrator = orchestrator();
        let handles = orchestrator.spawn_loops();
        orchestrator.shutdown();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("loop exited")
                .expect("loop did not panic");
        }
    }
}
