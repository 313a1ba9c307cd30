//! Error types for the orchestration domain.

use eoslink_core::RunId;

/// The result type used throughout eoslink-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A run was not found.
    #[error("run not found: {run_id}")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: RunId,
    },

    /// An invalid run status transition was attempted.
    #[error("invalid status transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current status.
        from: String,
        /// The attempted target status.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// An artifact with the same `(run_id, kind, key)` already exists.
    #[error("artifact already appended: run {run_id}, kind {kind}, key '{key}'")]
    ArtifactExists {
        /// The run the artifact belongs to.
        run_id: RunId,
        /// The artifact kind.
        kind: String,
        /// The artifact key.
        key: String,
    },

    /// A force-run (or prediction refresh) is already in progress.
    #[error("force run already in progress")]
    ForceRunInProgress,

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// A dispatch delivery attempt failed.
    #[error("dispatch error: {message}")]
    Dispatch {
        /// Description of the dispatch failure.
        message: String,
    },

    /// A configuration value is missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An error talking to the EOS optimizer.
    #[error(transparent)]
    Eos(#[from] crate::eos::EosError),

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from eoslink-core.
    #[error("core error: {0}")]
    Core(#[from] eoslink_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a new dispatch error.
    #[must_use]
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}
