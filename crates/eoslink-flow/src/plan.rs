//! Plan instruction derivation.
//!
//! EOS plan documents carry a list of raw actuation directives. This
//! module extracts them once per run into typed [`PlanInstruction`]s.
//!
//! The authoritative activation instant is resolved with a fallback
//! order over the raw document's fields: an explicit `execution_time`,
//! then `effective_at`, then `starts_at`/`start_datetime`. The first
//! present, well-formed timestamp wins. An instruction with none of
//! these is still persisted for inspection but carries
//! `execution_time: None` and is excluded from dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use eoslink_core::RunId;

/// One actuation directive extracted from a run's plan artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanInstruction {
    /// The run whose plan produced this instruction.
    pub run_id: RunId,
    /// Position within the plan document.
    pub index: usize,
    /// The actuator resource this instruction addresses.
    pub resource_id: String,
    /// Raw instruction type label from the plan.
    pub instruction_type: String,
    /// Operation mode identifier, if the plan names one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_mode_id: Option<String>,
    /// Scaling factor in `0..=1`, if the plan names one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_mode_factor: Option<f64>,
    /// The instant the instruction becomes active. `None` when the raw
    /// entry carried no resolvable timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<DateTime<Utc>>,
    /// When the instruction stops being active, if bounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
}

impl PlanInstruction {
    /// Returns true if this instruction can be scheduled against
    /// wall-clock time.
    #[must_use]
    pub const fn is_dispatchable(&self) -> bool {
        self.execution_time.is_some()
    }

    /// Returns true if the instruction directs the resource to import
    /// power (charge). Used by the no-grid-charge safety guard.
    #[must_use]
    pub fn is_charge_directed(&self) -> bool {
        let ty = self.instruction_type.to_ascii_lowercase();
        ty.contains("charge") && !ty.contains("discharge")
    }
}

/// Fields consulted, in order, to resolve an instruction's activation
/// instant.
const EXECUTION_TIME_FIELDS: [&str; 4] =
    ["execution_time", "effective_at", "starts_at", "start_datetime"];

/// Extracts typed instructions from a raw plan artifact payload.
///
/// Accepts either a bare array of instruction objects or a document
/// with an `instructions` array. Entries that are not objects or lack
/// a resource identifier are skipped.
#[must_use]
pub fn derive_instructions(run_id: RunId, plan: &Value) -> Vec<PlanInstruction> {
    let raw_entries = match plan {
        Value::Array(entries) => entries.as_slice(),
        Value::Object(map) => map
            .get("instructions")
            .and_then(Value::as_array)
            .map_or(&[][..], Vec::as_slice),
        _ => &[],
    };

    raw_entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| parse_instruction(run_id, index, entry))
        .collect()
}

fn parse_instruction(run_id: RunId, index: usize, entry: &Value) -> Option<PlanInstruction> {
    let obj = entry.as_object()?;

    let resource_id = obj
        .get("resource_id")
        .or_else(|| obj.get("device_id"))
        .and_then(Value::as_str)?
        .to_string();

    let instruction_type = obj
        .get("instruction_type")
        .or_else(|| obj.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let operation_mode_id = obj
        .get("operation_mode_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    let operation_mode_factor = obj
        .get("operation_mode_factor")
        .or_else(|| obj.get("factor"))
        .and_then(Value::as_f64);

    let execution_time = EXECUTION_TIME_FIELDS
        .iter()
        .find_map(|field| parse_timestamp(obj.get(*field)));

    let ends_at = parse_timestamp(obj.get("ends_at").or_else(|| obj.get("end_datetime")));

    Some(PlanInstruction {
        run_id,
        index,
        resource_id,
        instruction_type,
        operation_mode_id,
        operation_mode_factor,
        execution_time,
        ends_at,
    })
}

fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Returns the currently active instruction for each resource: the most
/// recent instruction whose `execution_time` is at or before `now`.
#[must_use]
pub fn active_instructions(
    instructions: &[PlanInstruction],
    now: DateTime<Utc>,
) -> Vec<PlanInstruction> {
    use std::collections::BTreeMap;

    let mut active: BTreeMap<&str, &PlanInstruction> = BTreeMap::new();
    for instruction in instructions {
        let Some(at) = instruction.execution_time else {
            continue;
        };
        if at > now {
            continue;
        }
        let replace = active
            .get(instruction.resource_id.as_str())
            .and_then(|current| current.execution_time)
            .is_none_or(|current_at| at >= current_at);
        if replace {
            active.insert(instruction.resource_id.as_str(), instruction);
        }
    }
    active.into_values().cloned().collect()
}
