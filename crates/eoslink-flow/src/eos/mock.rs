//! Scriptable EOS client for testing.
//!
//! [`MockEosClient`] implements [`EosClient`] entirely in memory. Tests
//! script its health marker, plan/solution documents, per-provider
//! refresh outcomes, and the legacy optimize call, and can observe the
//! run-interval writes made by the force-run pulse step.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::{EosClient, EosError, EosHealth, EosResult, Fetched, PredictionProvider};

#[derive(Debug, Default)]
struct Inner {
    last_run_datetime: Option<DateTime<Utc>>,
    health_failure: Option<EosError>,
    plan: Option<Value>,
    solution: Option<Value>,
    config: Value,
    interval_writes: Vec<u64>,
    marker_on_pulse: Option<DateTime<Utc>>,
    refresh_failures: HashMap<PredictionProvider, EosError>,
    optimize_result: Option<EosResult<Value>>,
    optimize_requests: Vec<Value>,
}

/// In-memory, scriptable optimizer client.
#[derive(Debug, Default)]
pub struct MockEosClient {
    inner: Mutex<Inner>,
}

impl MockEosClient {
    /// Creates a healthy client with no plan, solution, or marker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Mutex poisoning can only happen if a test already panicked.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Sets the reported `last_run_datetime` marker.
    pub fn set_last_run_datetime(&self, marker: Option<DateTime<Utc>>) {
        self.lock().last_run_datetime = marker;
    }

    /// Makes every health call fail with the given error.
    pub fn fail_health_with(&self, err: EosError) {
        self.lock().health_failure = Some(err);
    }

    /// Clears a scripted health failure.
    pub fn clear_health_failure(&self) {
        self.lock().health_failure = None;
    }

    /// Sets the plan document; `None` means "not produced" (404).
    pub fn set_plan(&self, plan: Option<Value>) {
        self.lock().plan = plan;
    }

    /// Sets the solution document; `None` means "not produced" (404).
    pub fn set_solution(&self, solution: Option<Value>) {
        self.lock().solution = solution;
    }

    /// When set, a `set_run_interval` call (the pulse) advances the
    /// health marker to this value, simulating an immediate automatic
    /// cycle.
    pub fn set_marker_on_pulse(&self, marker: Option<DateTime<Utc>>) {
        self.lock().marker_on_pulse = marker;
    }

    /// Makes refreshes for one provider fail.
    pub fn fail_refresh_for(&self, provider: PredictionProvider, err: EosError) {
        self.lock().refresh_failures.insert(provider, err);
    }

    /// Scripts the legacy optimize call outcome.
    pub fn set_optimize_result(&self, result: EosResult<Value>) {
        self.lock().optimize_result = Some(result);
    }

    /// Returns the run-interval values written so far.
    #[must_use]
    pub fn interval_writes(&self) -> Vec<u64> {
        self.lock().interval_writes.clone()
    }

    /// Returns the scenario payloads passed to the optimize call.
    #[must_use]
    pub fn optimize_requests(&self) -> Vec<Value> {
        self.lock().optimize_requests.clone()
    }
}

#[async_trait]
impl EosClient for MockEosClient {
    async fn health(&self) -> EosResult<EosHealth> {
        let inner = self.lock();
        if let Some(err) = &inner.health_failure {
            return Err(err.clone());
        }
        Ok(EosHealth {
            ok: true,
            last_run_datetime: inner.last_run_datetime,
        })
    }

    async fn get_config(&self) -> EosResult<Value> {
        Ok(self.lock().config.clone())
    }

    async fn set_run_interval(&self, seconds: u64) -> EosResult<()> {
        let mut inner = self.lock();
        inner.interval_writes.push(seconds);
        if let Some(marker) = inner.marker_on_pulse {
            inner.last_run_datetime = Some(marker);
        }
        Ok(())
    }

    async fn get_plan(&self) -> EosResult<Fetched<Value>> {
        Ok(self.lock().plan.clone().map_or(
            Fetched::NotFound {
                detail: "404: no plan".to_string(),
            },
            Fetched::Found,
        ))
    }

    async fn get_solution(&self) -> EosResult<Fetched<Value>> {
        Ok(self.lock().solution.clone().map_or(
            Fetched::NotFound {
                detail: "404: no solution".to_string(),
            },
            Fetched::Found,
        ))
    }

    async fn refresh_prediction(&self, provider: PredictionProvider) -> EosResult<Value> {
        let inner = self.lock();
        if let Some(err) = inner.refresh_failures.get(&provider) {
            return Err(err.clone());
        }
        Ok(json!({ "provider": provider.to_string(), "refreshed": true }))
    }

    async fn optimize(&self, request: Value) -> EosResult<Value> {
        let mut inner = self.lock();
        inner.optimize_requests.push(request);
        match inner.optimize_result.clone() {
            Some(result) => result,
            None => Ok(json!({ "solution": {}, "from": "legacy_optimize" })),
        }
    }
}
