//! Read-only plausibility analysis of a finished run.
//!
//! Produces structured findings over a run's artifacts and derived
//! instructions for operator consumption. Findings never mutate run
//! state; a run full of `Error` findings stays exactly as it was.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use eoslink_core::RunId;

use crate::artifact::ArtifactKind;
use crate::error::{Error, Result};
use crate::plan::PlanInstruction;
use crate::run::{Run, TriggerSource};
use crate::store::RunStore;

/// How serious a finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Nothing wrong; informational.
    Ok,
    /// Worth an operator's look, but dispatch can proceed.
    Warn,
    /// The run's outputs are not trustworthy as-is.
    Error,
}

/// One plausibility finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    /// Severity classification.
    pub severity: Severity,
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable explanation.
    pub message: String,
}

impl Finding {
    fn new(severity: Severity, code: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Loads a run's artifacts and instructions and evaluates all checks.
///
/// # Errors
///
/// Returns [`Error::RunNotFound`] for an unknown id and storage errors
/// otherwise.
pub async fn check_run(store: &Arc<dyn RunStore>, run_id: RunId) -> Result<Vec<Finding>> {
    let run = store
        .get_run(run_id)
        .await?
        .ok_or(Error::RunNotFound { run_id })?;

    let has_plan = store
        .get_artifact(run_id, ArtifactKind::Plan)
        .await?
        .is_some();
    let has_solution = store
        .get_artifact(run_id, ArtifactKind::Solution)
        .await?
        .is_some();
    let instructions = store.instructions_for_run(run_id).await?;

    Ok(evaluate(&run, has_plan, has_solution, &instructions))
}

/// Pure evaluation over already-loaded run data.
#[must_use]
pub fn evaluate(
    run: &Run,
    has_plan: bool,
    has_solution: bool,
    instructions: &[PlanInstruction],
) -> Vec<Finding> {
    let mut findings = Vec::new();

    // Prediction-refresh runs never carry plan or solution by contract.
    if run.trigger_source == TriggerSource::PredictionRefresh {
        findings.push(Finding::new(
            Severity::Ok,
            "prediction_only",
            "prediction-refresh run; plan and solution are not expected",
        ));
        return findings;
    }

    if !has_plan {
        findings.push(Finding::new(
            Severity::Error,
            "plan_missing",
            "run has no plan artifact; nothing can be dispatched from it",
        ));
    }
    if !has_solution {
        findings.push(Finding::new(
            Severity::Warn,
            "solution_missing",
            "run has no solution artifact; costs and flows cannot be inspected",
        ));
    }

    if has_plan {
        let dispatchable = instructions.iter().filter(|i| i.is_dispatchable()).count();
        if dispatchable == 0 {
            findings.push(Finding::new(
                Severity::Warn,
                "no_dispatchable_instructions",
                "plan yields zero instructions with a resolvable execution time",
            ));
        }

        let unresolved = instructions.len() - dispatchable;
        if unresolved > 0 {
            findings.push(Finding::new(
                Severity::Warn,
                "unresolved_execution_time",
                format!("{unresolved} instruction(s) lack a resolvable execution time"),
            ));
        }
    }

    for instruction in instructions {
        if let Some(factor) = instruction.operation_mode_factor {
            if !(0.0..=1.0).contains(&factor) {
                findings.push(Finding::new(
                    Severity::Error,
                    "factor_out_of_range",
                    format!(
                        "instruction {} for {} has operation-mode factor {factor} outside 0..=1",
                        instruction.index, instruction.resource_id
                    ),
                ));
            }
        }
    }

    if !monotonic_per_resource(instructions) {
        findings.push(Finding::new(
            Severity::Warn,
            "non_monotonic_execution_times",
            "instruction execution times are not monotonically increasing per resource",
        ));
    }

    if findings.is_empty() {
        findings.push(Finding::new(
            Severity::Ok,
            "plausible",
            "plan and solution pass all plausibility checks",
        ));
    }
    findings
}

fn monotonic_per_resource(instructions: &[PlanInstruction]) -> bool {
    use std::collections::HashMap;

    let mut last: HashMap<&str, chrono::DateTime<chrono::Utc>> = HashMap::new();
    for instruction in instructions {
        let Some(at) = instruction.execution_time else {
            continue;
        };
        if let Some(previous) = last.get(instruction.resource_id.as_str()) {
            if at < *previous {
                return false;
            }
        }
        last.insert(instruction.resource_id.as_str(), at);
    }
    true
}
