//! Aligned wall-clock run scheduling.
//!
//! Triggers runs at fixed minute marks within the hour (e.g. 0/15/30/45)
//! plus a small fixed delay, rather than on a rolling interval. The next
//! slot is always recomputed from wall-clock time, so clock drift and
//! process restarts cannot accumulate offset.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::collector::materialize_run;
use crate::eos::EosClient;
use crate::error::Result;
use crate::metrics as flow_metrics;
use crate::run::{RunStatus, TriggerSource};
use crate::store::RunStore;

/// Aligned scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignedConfig {
    /// Whether the scheduler triggers runs at all.
    pub enabled: bool,
    /// Minute marks within the hour, each in `0..60`.
    pub minute_marks: Vec<u32>,
    /// Fixed delay added after each slot, in seconds.
    pub delay_seconds: u64,
}

impl Default for AlignedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            minute_marks: vec![0, 15, 30, 45],
            delay_seconds: 10,
        }
    }
}

/// Computes the next due instant strictly after `now`.
///
/// The due instant is the next configured minute mark plus `delay`
/// seconds. An instant exactly equal to `now` is not re-triggered; the
/// following slot is returned instead.
#[must_use]
pub fn next_due(now: DateTime<Utc>, minute_marks: &[u32], delay_seconds: u64) -> DateTime<Utc> {
    let delay = Duration::seconds(i64::try_from(delay_seconds).unwrap_or(0));
    let hour_start = now
        .duration_trunc(Duration::hours(1))
        .unwrap_or(now);

    let mut marks: Vec<u32> = minute_marks
        .iter()
        .copied()
        .filter(|m| *m < 60)
        .collect();
    if marks.is_empty() {
        marks.push(0);
    }
    marks.sort_unstable();
    marks.dedup();

    // Candidate slots in this hour and the next cover every case.
    for hour_offset in 0..=1 {
        let base = hour_start + Duration::hours(hour_offset);
        for mark in &marks {
            let due = base + Duration::minutes(i64::from(*mark)) + delay;
            if due > now {
                return due;
            }
        }
    }

    // Unreachable: the first mark of the next hour is always after now.
    hour_start + Duration::hours(1) + delay
}

/// Observable scheduler state for the runtime snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignedSnapshot {
    /// The next computed due instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_due_ts: Option<DateTime<Utc>>,
    /// When the scheduler last triggered a run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trigger_ts: Option<DateTime<Utc>>,
    /// Why the last slot was skipped, if it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_skip_reason: Option<String>,
}

/// Background task that triggers runs at aligned wall-clock slots.
pub struct AlignedScheduler {
    store: Arc<dyn RunStore>,
    eos: Arc<dyn EosClient>,
    config: AlignedConfig,
    run_in_progress: Arc<AtomicBool>,
    state: RwLock<AlignedSnapshot>,
}

impl std::fmt::Debug for AlignedScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedScheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AlignedScheduler {
    /// Creates a scheduler sharing the orchestrator's run-in-progress flag.
    #[must_use]
    pub fn new(
        store: Arc<dyn RunStore>,
        eos: Arc<dyn EosClient>,
        config: AlignedConfig,
        run_in_progress: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            eos,
            config,
            run_in_progress,
            state: RwLock::new(AlignedSnapshot::default()),
        }
    }

    /// Returns the current observable state.
    #[must_use]
    pub fn snapshot(&self) -> AlignedSnapshot {
        self.state.read().map(|s| s.clone()).unwrap_or_default()
    }

    fn set_next_due(&self, due: DateTime<Utc>) {
        if let Ok(mut state) = self.state.write() {
            state.next_due_ts = Some(due);
        }
    }

    fn record_skip(&self, reason: &str) {
        flow_metrics::record_aligned_trigger("skipped");
        if let Ok(mut state) = self.state.write() {
            state.last_skip_reason = Some(reason.to_string());
        }
    }

    /// Fires one due slot: executes the shared run-execution routine
    /// unless disabled or another run is in progress.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn fire_slot(&self, now: DateTime<Utc>) -> Result<()> {
        if !self.config.enabled {
            self.record_skip("scheduler disabled");
            return Ok(());
        }
        if self.run_in_progress.load(Ordering::Acquire) {
            self.record_skip("run already in progress");
            return Ok(());
        }
        if self.has_running_run().await? {
            self.record_skip("run already in progress");
            return Ok(());
        }

        tracing::info!("aligned slot due, executing run");
        flow_metrics::record_aligned_trigger("fired");
        materialize_run(
            &self.store,
            &self.eos,
            TriggerSource::Automatic,
            "aligned_schedule",
            None,
        )
        .await?;

        if let Ok(mut state) = self.state.write() {
            state.last_trigger_ts = Some(now);
            state.last_skip_reason = None;
        }
        Ok(())
    }

    async fn has_running_run(&self) -> Result<bool> {
        let recent = self.store.list_runs(10).await?;
        Ok(recent.iter().any(|r| r.status == RunStatus::Running))
    }

    /// Runs the slot loop until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let now = Utc::now();
            let due = next_due(now, &self.config.minute_marks, self.config.delay_seconds);
            self.set_next_due(due);

            let sleep_for = (due - now)
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(1));

            tokio::select! {
                () = tokio::time::sleep(sleep_for) => {
                    if let Err(err) = self.fire_slot(Utc::now()).await {
                        tracing::error!(error = %err, "aligned slot execution failed");
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("aligned scheduler shutting down");
                    return;
                }
            }
        }
    }
}
