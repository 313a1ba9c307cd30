//! Run artifacts.
//!
//! An artifact is a named payload attached to a run: the raw plan and
//! solution documents fetched from EOS, prediction refresh results, or
//! the pre-force snapshot taken before a forced run. Artifacts are
//! immutable once written and append-once per `(run_id, kind, key)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use eoslink_core::RunId;

/// The kind of payload an artifact carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// The optimizer's time-ordered instruction plan.
    Plan,
    /// The optimizer's full optimization result.
    Solution,
    /// Result document of a provider prediction refresh.
    PredictionRefresh,
    /// Prediction key listing fetched during a refresh.
    PredictionKeys,
    /// Prediction series data fetched during a refresh.
    PredictionSeries,
    /// Measurement payload pushed to the optimizer.
    MeasurementPush,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plan => write!(f, "plan"),
            Self::Solution => write!(f, "solution"),
            Self::PredictionRefresh => write!(f, "prediction_refresh"),
            Self::PredictionKeys => write!(f, "prediction_keys"),
            Self::PredictionSeries => write!(f, "prediction_series"),
            Self::MeasurementPush => write!(f, "measurement_push"),
        }
    }
}

/// A named payload attached to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// The run this artifact belongs to.
    pub run_id: RunId,
    /// What the payload is.
    pub kind: ArtifactKind,
    /// Disambiguates multiple artifacts of the same kind
    /// (e.g. `pre_force_latest`). Empty for the primary artifact.
    pub key: String,
    /// The opaque structured document.
    pub payload: serde_json::Value,
    /// When the artifact was written.
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Creates a new artifact stamped with the current time.
    #[must_use]
    pub fn new(
        run_id: RunId,
        kind: ArtifactKind,
        key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            run_id,
            kind,
            key: key.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}
