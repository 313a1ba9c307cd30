//! Observability infrastructure for eoslink.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers used by every binary in the workspace.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `eoslink_flow=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for run orchestration operations.
#[must_use]
pub fn run_span(operation: &str, run_id: &str) -> Span {
    tracing::info_span!("run", op = operation, run_id = run_id)
}

/// Creates a span for dispatch operations.
#[must_use]
pub fn dispatch_span(operation: &str, resource_id: &str) -> Span {
    tracing::info_span!("dispatch", op = operation, resource_id = resource_id)
}
