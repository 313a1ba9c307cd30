//! Optimization run tracking.
//!
//! A run represents a single attempt to obtain a fresh optimization
//! decision from the external EOS service, capturing:
//!
//! - **Trigger**: How the run came to exist (automatic detection,
//!   force-run, prediction refresh)
//! - **Timing**: When the run started and finished
//! - **Status**: Current state and any error text
//!
//! The status machine is terminal-once: a run starts `Running` and
//! transitions exactly once to `Success`, `Partial`, or `Failed`.
//! Re-finalizing with the same terminal status is a no-op at the store
//! layer; re-finalizing with a different status is a programming error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use eoslink_core::RunId;

use crate::error::{Error, Result};

/// What caused a run to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Detected from the optimizer's own automatic cycle.
    Automatic,
    /// Operator-initiated force run.
    ForceRun,
    /// Forecast-only refresh; never carries plan or solution.
    PredictionRefresh,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Automatic => write!(f, "automatic"),
            Self::ForceRun => write!(f, "force_run"),
            Self::PredictionRefresh => write!(f, "prediction_refresh"),
        }
    }
}

/// Run status machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, execution in progress.
    Running,
    /// Plan and solution both materialized.
    Success,
    /// Completed with expected gaps (e.g. plan not produced by EOS).
    Partial,
    /// Terminal failure; `error_text` holds the diagnosis.
    Failed,
}

impl RunStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Partial | Self::Failed)
    }

    /// Returns true if the transition from self to target is valid.
    ///
    /// Re-asserting the same terminal status is permitted (idempotent
    /// finalize); any other transition out of a terminal status is not.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Running => target.is_terminal(),
            Self::Success | Self::Partial | Self::Failed => *self == target,
        }
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Running
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One optimization attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// Unique run identifier (monotonic by creation time).
    pub id: RunId,
    /// What caused this run.
    pub trigger_source: TriggerSource,
    /// Free-form mode label, e.g. `aligned_schedule` or `pulse_then_legacy`.
    pub run_mode: String,
    /// Current status.
    pub status: RunStatus,
    /// When the run was created.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// The EOS-reported completion marker that triggered detection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eos_last_run_datetime: Option<DateTime<Utc>>,
    /// Terminal error text, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

impl Run {
    /// Creates a new run in `Running` state.
    #[must_use]
    pub fn new(trigger_source: TriggerSource, run_mode: impl Into<String>) -> Self {
        Self {
            id: RunId::generate(),
            trigger_source,
            run_mode: run_mode.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            eos_last_run_datetime: None,
            error_text: None,
        }
    }

    /// Returns true if the run is in a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transitions to a terminal status.
    ///
    /// Sets `finished_at` and `error_text`. A repeated call with the
    /// same terminal status is a no-op; a conflicting call is an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the transition is
    /// invalid.
    pub fn finalize(&mut self, target: RunStatus, error_text: Option<String>) -> Result<()> {
        if self.status == target && self.status.is_terminal() {
            // Idempotent re-finalize.
            return Ok(());
        }
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: "run already finalized".into(),
            });
        }
        if !target.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: "finalize target must be terminal".into(),
            });
        }

        self.status = target;
        self.finished_at = Some(Utc::now());
        self.error_text = error_text;
        Ok(())
    }
}
