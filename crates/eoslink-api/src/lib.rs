//! # eoslink-api
//!
//! HTTP composition layer for the eoslink EOS bridge.
//!
//! This crate provides the operator-facing API surface, handling:
//!
//! - **Routing**: the `/api/eos/...` endpoint tree
//! - **Service wiring**: construction of the orchestrator and its
//!   background loops from environment configuration
//! - **Observability**: health checks and the runtime status snapshot
//!
//! ## Design Principles
//!
//! This crate is a **thin composition layer** with no domain policy.
//! All orchestration and dispatch logic lives in `eoslink-flow`.
//!
//! ## Endpoints
//!
//! ```text
//! GET  /health                              - Liveness check
//! POST /api/eos/runs/force                  - Trigger a force run
//! POST /api/eos/runs/predictions/refresh    - Refresh forecast data
//! GET  /api/eos/runs                        - List runs
//! GET  /api/eos/runs/{id}                   - Run detail + artifact counts
//! GET  /api/eos/runs/{id}/plan              - Plan artifact + instructions
//! GET  /api/eos/runs/{id}/solution          - Solution artifact
//! GET  /api/eos/runs/{id}/context           - All artifacts of a run
//! GET  /api/eos/runs/{id}/plausibility      - Plausibility findings
//! GET  /api/eos/outputs/current             - Active instruction per resource
//! GET  /api/eos/outputs/timeline            - Instruction timeline
//! GET  /api/eos/outputs/events              - Dispatch audit events
//! POST /api/eos/outputs/dispatch/force      - Force re-dispatch
//! GET  /api/eos/output-targets              - List targets
//! POST /api/eos/output-targets              - Create/replace a target
//! PUT  /api/eos/output-targets/{resource}   - Update a target
//! GET  /api/eos/runtime                     - Orchestrator status snapshot
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod routes;
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{ApiError, ApiResult};
    pub use crate::server::Server;
}
