//! Prediction-refresh controller.
//!
//! A prediction refresh is a narrow run variant: it asks the optimizer
//! to refresh forecast data for one provider or all of them, and by
//! contract never fetches plan or solution. Provider failures are
//! isolated: one failing provider downgrades the run to partial with a
//! one-line summary instead of failing the whole refresh, so an
//! all-scope request still benefits from the providers that succeeded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::artifact::ArtifactKind;
use crate::eos::{EosClient, PredictionProvider};
use crate::error::{Error, Result};
use crate::metrics as flow_metrics;
use crate::run::{Run, RunStatus, TriggerSource};
use crate::store::RunStore;

/// Which providers a refresh request covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshScope {
    /// All known providers.
    #[default]
    All,
    /// Photovoltaic forecast only.
    Pv,
    /// Electricity price forecast only.
    Prices,
    /// Load forecast only.
    Load,
}

impl RefreshScope {
    /// The providers this scope expands to, in refresh order.
    #[must_use]
    pub fn providers(self) -> Vec<PredictionProvider> {
        match self {
            Self::All => vec![
                PredictionProvider::Pv,
                PredictionProvider::Prices,
                PredictionProvider::Load,
            ],
            Self::Pv => vec![PredictionProvider::Pv],
            Self::Prices => vec![PredictionProvider::Prices],
            Self::Load => vec![PredictionProvider::Load],
        }
    }
}

impl std::fmt::Display for RefreshScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Pv => write!(f, "pv"),
            Self::Prices => write!(f, "prices"),
            Self::Load => write!(f, "load"),
        }
    }
}

/// Drives provider-scoped prediction refreshes.
pub struct PredictionRefreshController {
    store: Arc<dyn RunStore>,
    eos: Arc<dyn EosClient>,
    in_progress: Arc<AtomicBool>,
}

impl std::fmt::Debug for PredictionRefreshController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionRefreshController")
            .finish_non_exhaustive()
    }
}

/// Releases the shared in-progress flag on every exit path.
struct InProgressGuard(Arc<AtomicBool>);

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PredictionRefreshController {
    /// Creates a controller sharing the force-run in-progress flag.
    #[must_use]
    pub fn new(
        store: Arc<dyn RunStore>,
        eos: Arc<dyn EosClient>,
        in_progress: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            eos,
            in_progress,
        }
    }

    /// Refreshes the providers in `scope` as one run.
    ///
    /// Never fetches plan or solution. Providers fail independently; a
    /// run with at least one failed provider finalizes partial, never
    /// failed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ForceRunInProgress`] when a force run or another
    /// refresh holds the flag, and storage errors otherwise.
    pub async fn refresh(&self, scope: RefreshScope) -> Result<Run> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::ForceRunInProgress);
        }
        let _guard = InProgressGuard(Arc::clone(&self.in_progress));

        let run_mode = format!("refresh_{scope}");
        let run = self
            .store
            .create_run(TriggerSource::PredictionRefresh, &run_mode)
            .await?;
        flow_metrics::record_run_created(TriggerSource::PredictionRefresh);
        tracing::info!(run_id = %run.id, scope = %scope, "prediction refresh started");

        let mut failures: Vec<String> = Vec::new();
        let mut refreshed: Vec<String> = Vec::new();

        for provider in scope.providers() {
            match self.eos.refresh_prediction(provider).await {
                Ok(payload) => {
                    self.store
                        .append_artifact(
                            run.id,
                            ArtifactKind::PredictionRefresh,
                            &provider.to_string(),
                            payload,
                        )
                        .await?;
                    refreshed.push(provider.to_string());
                }
                Err(err) => {
                    tracing::warn!(provider = %provider, error = %err, "provider refresh failed");
                    failures.push(format!("{provider}: {}", err.summary()));
                }
            }
        }

        self.store
            .append_artifact(
                run.id,
                ArtifactKind::PredictionKeys,
                "",
                json!({ "scope": scope.to_string(), "refreshed": refreshed }),
            )
            .await?;

        let (status, error_text) = if failures.is_empty() {
            (RunStatus::Success, None)
        } else {
            (RunStatus::Partial, Some(failures.join("; ")))
        };
        self.store.finalize_run(run.id, status, error_text).await?;
        flow_metrics::record_run_finalized(status);

        self.store
            .get_run(run.id)
            .await?
            .ok_or(Error::RunNotFound { run_id: run.id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eos::mock::MockEosClient;
    use crate::eos::EosError;
    use crate::store::memory::MemoryRunStore;

    fn controller() -> (
        Arc<dyn RunStore>,
        Arc<MockEosClient>,
        Arc<AtomicBool>,
        PredictionRefreshController,
    ) {
        let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
        let eos = Arc::new(MockEosClient::new());
        let flag = Arc::new(AtomicBool::new(false));
        let c = PredictionRefreshController::new(
            Arc::clone(&store),
            eos.clone() as Arc<dyn EosClient>,
            Arc::clone(&flag),
        );
        (store, eos, flag, c)
    }

    #[test]
    fn scope_expansion() {
        assert_eq!(RefreshScope::All.providers().len(), 3);
        assert_eq!(
            RefreshScope::Prices.providers(),
            vec![PredictionProvider::Prices]
        );
    }

    #[tokio::test]
    async fn all_scope_success() -> Result<()> {
        let (store, _eos, _flag, c) = controller();

        let run = c.refresh(RefreshScope::All).await?;
        assert_eq!(run.trigger_source, TriggerSource::PredictionRefresh);
        assert_eq!(run.run_mode, "refresh_all");
        assert_eq!(run.status, RunStatus::Success);
        // Three provider artifacts plus the summary keys artifact.
        assert_eq!(store.count_artifacts(run.id).await?, 4);
        Ok(())
    }

    #[tokio::test]
    async fn single_provider_failure_is_partial_not_failed() -> Result<()> {
        let (_store, eos, _flag, c) = controller();
        eos.fail_refresh_for(PredictionProvider::Prices, EosError::transient("price feed down"));

        let run = c.refresh(RefreshScope::All).await?;
        assert_eq!(run.status, RunStatus::Partial);
        let text = run.error_text.unwrap_or_default();
        assert!(text.contains("prices:"), "got: {text}");
        assert!(text.contains("price feed down"), "got: {text}");
        Ok(())
    }

    #[tokio::test]
    async fn scoped_refresh_touches_only_its_provider() -> Result<()> {
        let (_store, eos, _flag, c) = controller();
        // A failure scripted for a provider outside the scope must not
        // affect the run.
        eos.fail_refresh_for(PredictionProvider::Load, EosError::fatal("boom"));

        let run = c.refresh(RefreshScope::Pv).await?;
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.run_mode, "refresh_pv");
        Ok(())
    }

    #[tokio::test]
    async fn refresh_respects_force_run_flag() -> Result<()> {
        let (store, _eos, flag, c) = controller();
        flag.store(true, Ordering::Release);

        let err = c.refresh(RefreshScope::All).await.unwrap_err();
        assert!(matches!(err, Error::ForceRunInProgress));
        assert_eq!(store.list_runs(10).await?.len(), 0);

        flag.store(false, Ordering::Release);
        assert!(c.refresh(RefreshScope::All).await.is_ok());
        Ok(())
    }
}
