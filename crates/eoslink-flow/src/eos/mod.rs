//! EOS optimizer client contract.
//!
//! The core never talks raw HTTP to the optimizer; it depends on the
//! [`EosClient`] trait and its typed outcomes. The critical contract is
//! the error taxonomy: run classification depends on distinguishing
//! "not found" (expected absence, downgrades a run to partial) from
//! transient transport failure (retried by the next poll tick) from
//! other fatal upstream errors.

pub mod http;
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use http::HttpEosClient;

/// Errors surfaced by the optimizer client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EosError {
    /// The requested artifact does not exist upstream (HTTP 404).
    ///
    /// Expected when the optimizer is not in automatic-optimization
    /// mode; never fatal for run classification.
    #[error("not found: {message}")]
    NotFound {
        /// Upstream detail.
        message: String,
    },

    /// Connect failure, timeout, or 5xx — retryable on the next tick.
    #[error("transient EOS failure: {message}")]
    Transient {
        /// Upstream detail.
        message: String,
    },

    /// Any other non-retryable upstream error (4xx, malformed body).
    #[error("EOS error: {message}")]
    Fatal {
        /// Upstream detail.
        message: String,
    },
}

impl EosError {
    /// Creates a not-found outcome.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Creates a transient failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a fatal failure.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Returns true for the not-found outcome.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for transient transport failures.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns the first line of the error, for concise run summaries.
    #[must_use]
    pub fn summary(&self) -> String {
        self.to_string().lines().next().unwrap_or_default().to_string()
    }
}

/// The result type for optimizer calls.
pub type EosResult<T> = std::result::Result<T, EosError>;

/// Optimizer health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EosHealth {
    /// Whether the optimizer reports itself healthy.
    pub ok: bool,
    /// Completion marker of the optimizer's last automatic run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_datetime: Option<DateTime<Utc>>,
}

/// Outcome of fetching an artifact that may legitimately not exist.
#[derive(Debug, Clone)]
pub enum Fetched<T> {
    /// The artifact was produced by the optimizer.
    Found(T),
    /// The optimizer has not produced this artifact.
    NotFound {
        /// Upstream detail, used in partial-run summaries.
        detail: String,
    },
}

impl<T> Fetched<T> {
    /// Returns the payload if found.
    pub fn into_found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::NotFound { .. } => None,
        }
    }

    /// Returns true if the artifact was found.
    #[must_use]
    pub const fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// Prediction provider scopes understood by the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionProvider {
    /// Photovoltaic forecast.
    Pv,
    /// Electricity price forecast.
    Prices,
    /// Load forecast.
    Load,
}

impl std::fmt::Display for PredictionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pv => write!(f, "pv"),
            Self::Prices => write!(f, "prices"),
            Self::Load => write!(f, "load"),
        }
    }
}

/// Client abstraction over the external EOS optimizer HTTP API.
///
/// All calls are timeout-bounded by the implementation; none may block
/// indefinitely.
#[async_trait]
pub trait EosClient: Send + Sync {
    /// Reads optimizer health and the last-run completion marker.
    async fn health(&self) -> EosResult<EosHealth>;

    /// Reads the optimizer's runtime configuration document.
    async fn get_config(&self) -> EosResult<Value>;

    /// Sets the optimizer's automatic run interval, in seconds.
    ///
    /// Setting a minimal interval is the "pulse" step of a force run.
    async fn set_run_interval(&self, seconds: u64) -> EosResult<()>;

    /// Reads the current plan document. May legitimately be absent.
    async fn get_plan(&self) -> EosResult<Fetched<Value>>;

    /// Reads the current solution document. May legitimately be absent.
    async fn get_solution(&self) -> EosResult<Fetched<Value>>;

    /// Triggers a provider-specific prediction refresh.
    async fn refresh_prediction(&self, provider: PredictionProvider) -> EosResult<Value>;

    /// Legacy single-shot optimize call with a full scenario payload.
    ///
    /// Returns a solution-shaped document. Used as the fallback when
    /// pulsing the run interval does not produce a fresh automatic run.
    async fn optimize(&self, request: Value) -> EosResult<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(EosError::not_found("no plan").is_not_found());
        assert!(EosError::transient("timeout").is_transient());
        assert!(!EosError::fatal("422").is_transient());
    }

    #[test]
    fn summary_is_first_line() {
        let err = EosError::fatal("first line\nsecond line\nthird");
        assert_eq!(err.summary(), "EOS error: first line");
    }

    #[test]
    fn fetched_into_found() {
        let found: Fetched<i32> = Fetched::Found(7);
        assert_eq!(found.into_found(), Some(7));
        let missing: Fetched<i32> = Fetched::NotFound {
            detail: "404".into(),
        };
        assert!(missing.into_found().is_none());
    }
}
