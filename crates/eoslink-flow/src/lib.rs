//! # eoslink-flow
//!
//! Orchestration engine for the eoslink EOS bridge.
//!
//! This crate drives an external energy-optimization service ("EOS")
//! through repeated optimization runs and forwards the resulting control
//! decisions to physical actuators:
//!
//! - **Run lifecycle**: Reliable run state management with a
//!   terminal-once status machine
//! - **Run triggering**: Automatic detection (collector), aligned
//!   wall-clock scheduling, and manual force-run with a legacy fallback
//! - **Output dispatch**: Scheduled, heartbeat, and forced delivery of
//!   plan instructions to webhook targets, gated by a safety guard and
//!   recorded as an idempotent audit trail
//!
//! ## Core Concepts
//!
//! - **Run**: One attempt to obtain a fresh optimization decision, with
//!   persisted artifacts (plan, solution, prediction refresh results)
//! - **Instruction**: One plan entry: a resource, an operation mode, a
//!   scaling factor, and an activation time
//! - **Dispatch**: Delivery of an instruction's effect to a configured
//!   actuator endpoint over HTTP, audited per attempt
//!
//! ## Guarantees
//!
//! - **Terminal-once runs**: A run's status leaves `Running` exactly once
//! - **Idempotent dispatch**: A logical dispatch that already reached
//!   `Sent` is never re-delivered
//! - **Auditable**: Every delivery attempt, block, and skip is recorded

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod aligned;
pub mod artifact;
pub mod collector;
pub mod dispatch;
pub mod eos;
pub mod error;
pub mod force_run;
pub mod guard;
pub mod metrics;
pub mod plan;
pub mod plausibility;
pub mod prediction;
pub mod run;
pub mod runtime;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::aligned::{next_due, AlignedConfig, AlignedScheduler};
    pub use crate::collector::{Collector, CollectorConfig};
    pub use crate::dispatch::{
        DispatchEngine, DispatchEvent, DispatchKind, DispatchStatus, OutputTarget, WebhookSender,
    };
    pub use crate::eos::{EosClient, EosError, Fetched};
    pub use crate::error::{Error, Result};
    pub use crate::force_run::{ForceRunConfig, ForceRunController};
    pub use crate::guard::{GridSignalSource, GuardPolicy};
    pub use crate::plan::PlanInstruction;
    pub use crate::plausibility::{check_run, Finding, Severity};
    pub use crate::prediction::{PredictionRefreshController, RefreshScope};
    pub use crate::run::{Run, RunStatus, TriggerSource};
    pub use crate::runtime::{Orchestrator, RuntimeSnapshot};
    pub use crate::store::{memory::MemoryRunStore, RunStore};
}
