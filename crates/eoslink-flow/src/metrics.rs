//! Observability metrics for the orchestration core.
//!
//! Exposed via the `metrics` crate facade; install any compatible
//! exporter in the binary to publish them.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `eoslink_runs_total` | Counter | `source` | Runs created by trigger source |
//! | `eoslink_runs_finalized_total` | Counter | `status` | Runs finalized by terminal status |
//! | `eoslink_dispatch_events_total` | Counter | `status` | Dispatch events by outcome |
//! | `eoslink_collector_poll_errors_total` | Counter | - | Collector health-poll failures |
//! | `eoslink_aligned_triggers_total` | Counter | `outcome` | Aligned slots fired vs skipped |

use metrics::counter;

use crate::dispatch::DispatchStatus;
use crate::run::{RunStatus, TriggerSource};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: runs created by trigger source.
    pub const RUNS_TOTAL: &str = "eoslink_runs_total";
    /// Counter: runs finalized by terminal status.
    pub const RUNS_FINALIZED_TOTAL: &str = "eoslink_runs_finalized_total";
    /// Counter: dispatch events by outcome.
    pub const DISPATCH_EVENTS_TOTAL: &str = "eoslink_dispatch_events_total";
    /// Counter: collector health-poll failures.
    pub const COLLECTOR_POLL_ERRORS_TOTAL: &str = "eoslink_collector_poll_errors_total";
    /// Counter: aligned-scheduler slot outcomes.
    pub const ALIGNED_TRIGGERS_TOTAL: &str = "eoslink_aligned_triggers_total";
}

/// Records a run creation.
pub fn record_run_created(source: TriggerSource) {
    counter!(names::RUNS_TOTAL, "source" => source.to_string()).increment(1);
}

/// Records a run finalization.
pub fn record_run_finalized(status: RunStatus) {
    counter!(names::RUNS_FINALIZED_TOTAL, "status" => status.to_string()).increment(1);
}

/// Records one dispatch audit event.
pub fn record_dispatch_event(status: DispatchStatus) {
    counter!(names::DISPATCH_EVENTS_TOTAL, "status" => status.to_string()).increment(1);
}

/// Records a collector poll failure.
pub fn record_collector_poll_error() {
    counter!(names::COLLECTOR_POLL_ERRORS_TOTAL).increment(1);
}

/// Records an aligned-scheduler slot outcome (`fired` or `skipped`).
pub fn record_aligned_trigger(outcome: &'static str) {
    counter!(names::ALIGNED_TRIGGERS_TOTAL, "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_exporter_is_a_noop() {
        record_run_created(TriggerSource::Automatic);
        record_run_finalized(RunStatus::Partial);
        record_dispatch_event(DispatchStatus::Blocked);
        record_collector_poll_error();
        record_aligned_trigger("fired");
    }
}
