//! No-grid-charge safety guard.
//!
//! Before a charge-directed instruction is delivered, the guard checks
//! the latest observed grid-import power sample. When the policy is
//! enabled and the sample exceeds the configured threshold, the
//! delivery is suppressed and audited as blocked instead.
//!
//! Stale-signal policy: **fail-open**. The signal store is best-effort;
//! if no sample newer than `signal_max_age` exists the guard cannot
//! evaluate and dispatch proceeds. Failing closed would silence all
//! actuator traffic on any ingest hiccup.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One observed grid-import power sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalSample {
    /// Grid import power in watts (positive = importing).
    pub watts: f64,
    /// When the sample was observed.
    pub observed_at: DateTime<Utc>,
}

/// Read-only source of the latest grid-import signal.
///
/// Supplied by the external live-signal store; absence of a value is a
/// legitimate outcome.
#[async_trait]
pub trait GridSignalSource: Send + Sync {
    /// Returns the latest grid-import sample, if one exists.
    async fn latest_grid_import(&self) -> Result<Option<SignalSample>>;
}

/// No-grid-charge policy configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardPolicy {
    /// Whether the guard is active at all.
    pub enabled: bool,
    /// Grid-import threshold in watts above which charging is blocked.
    pub threshold_watts: f64,
    /// Maximum sample age before the guard declines to evaluate.
    pub signal_max_age_seconds: u64,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_watts: 50.0,
            signal_max_age_seconds: 300,
        }
    }
}

/// Outcome of evaluating the guard for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// Delivery may proceed.
    Allow,
    /// Delivery must be suppressed and audited as blocked.
    Block,
}

impl GuardPolicy {
    /// Evaluates the policy against a sample at wall-clock `now`.
    ///
    /// Only charge-directed instructions are ever blocked; the caller
    /// checks directionality before consulting the guard.
    #[must_use]
    pub fn evaluate(&self, sample: Option<SignalSample>, now: DateTime<Utc>) -> GuardDecision {
        if !self.enabled {
            return GuardDecision::Allow;
        }
        let Some(sample) = sample else {
            tracing::debug!("no grid-import sample available, guard fail-open");
            return GuardDecision::Allow;
        };

        let max_age = Duration::seconds(i64::try_from(self.signal_max_age_seconds).unwrap_or(300));
        if now - sample.observed_at > max_age {
            tracing::debug!(
                observed_at = %sample.observed_at,
                "grid-import sample stale, guard fail-open"
            );
            return GuardDecision::Allow;
        }

        if sample.watts > self.threshold_watts {
            GuardDecision::Block
        } else {
            GuardDecision::Allow
        }
    }
}

/// Fixed-value signal source for tests and deployments without a
/// live-signal feed.
#[derive(Debug, Default)]
pub struct StaticSignalSource {
    sample: std::sync::RwLock<Option<SignalSample>>,
}

impl StaticSignalSource {
    /// Creates a source with no sample.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current sample.
    pub fn set(&self, sample: Option<SignalSample>) {
        if let Ok(mut slot) = self.sample.write() {
            *slot = sample;
        }
    }
}

#[async_trait]
impl GridSignalSource for StaticSignalSource {
    async fn latest_grid_import(&self) -> Result<Option<SignalSample>> {
        Ok(self.sample.read().map(|s| *s).unwrap_or(None))
    }
}
