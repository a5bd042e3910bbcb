//! Phase selection
//!
//! Decides which of the four phases (prepare, pre-process, run,
//! post-process) are active and parses their configuration once, so the
//! graph builder only ever matches on [`PhaseSpec`].

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::job::JobRecord;

/// Activation state of one phase
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseSpec<T> {
    Disabled,
    Active(T),
}

impl<T> PhaseSpec<T> {
    pub fn is_active(&self) -> bool {
        matches!(self, PhaseSpec::Active(_))
    }

    pub fn active(&self) -> Option<&T> {
        match self {
            PhaseSpec::Active(config) => Some(config),
            PhaseSpec::Disabled => None,
        }
    }
}

/// Configuration of a pre-process, run or post-process step
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepConfig {
    /// Container image the step runs in
    #[serde(default)]
    pub image: String,
    /// Shell command executed inside every example folder
    #[serde(default)]
    pub command: String,
    /// Example folders (glob patterns) used when no upstream phase feeds this one
    #[serde(default)]
    pub example: Vec<String>,
    /// Examples per remote step; 0 puts all examples into one step
    #[serde(default)]
    pub group_size: Option<usize>,
    /// Files shipped next to every example
    #[serde(default)]
    pub extra_files: Vec<String>,
    /// Sub folder of the save path results are filed under
    #[serde(default)]
    pub sub_save_path: String,
    /// Executor settings handed to the engine untouched
    #[serde(default, alias = "bohrium", alias = "dispatcher")]
    pub executor: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Configuration of the prepare phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareConfig {
    /// Example folders (glob patterns) to expand
    #[serde(default)]
    pub example_template: Vec<String>,
    /// Parameter file rewritten for every mix_input combination
    #[serde(default = "default_input_template")]
    pub input_template: String,
    /// key -> candidate values; the cartesian product yields sub-examples
    #[serde(default)]
    pub mix_input: BTreeMap<String, Vec<Value>>,
    /// Files copied into every prepared example
    #[serde(default)]
    pub extra_files: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_input_template() -> String {
    "INPUT".to_string()
}

/// The four activation decisions of one job
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSet {
    pub prepare: PhaseSpec<PrepareConfig>,
    pub pre_dft: PhaseSpec<StepConfig>,
    /// Non-empty whenever active
    pub run_dft: PhaseSpec<Vec<StepConfig>>,
    pub post_dft: PhaseSpec<StepConfig>,
}

impl PhaseSet {
    pub fn is_empty(&self) -> bool {
        !(self.prepare.is_active()
            || self.pre_dft.is_active()
            || self.run_dft.is_active()
            || self.post_dft.is_active())
    }
}

/// Loose truthiness used for `ifrun` flags
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Select the active phases of a job
pub fn select_phases(job: &JobRecord) -> PhaseSet {
    PhaseSet {
        prepare: select_single(&job.prepare, "prepare"),
        pre_dft: select_single(&job.pre_dft, "pre_dft"),
        run_dft: select_run(&job.run_dft),
        post_dft: select_single(&job.post_dft, "post_dft"),
    }
}

/// `Some(fields without ifrun)` when the entry is an enabled object
fn enabled_fields(value: &Value) -> Option<Map<String, Value>> {
    let mut fields = value.as_object()?.clone();
    let enabled = fields.remove("ifrun").map(|v| truthy(&v)).unwrap_or(true);
    enabled.then_some(fields)
}

fn select_single<T: DeserializeOwned>(value: &Value, phase: &str) -> PhaseSpec<T> {
    if !value.is_object() {
        warn!(phase, "phase setting should be a mapping, phase disabled");
        return PhaseSpec::Disabled;
    }
    let Some(fields) = enabled_fields(value) else {
        return PhaseSpec::Disabled;
    };
    match serde_json::from_value(Value::Object(fields)) {
        Ok(config) => PhaseSpec::Active(config),
        Err(e) => {
            warn!(phase, error = %e, "malformed phase setting, phase disabled");
            PhaseSpec::Disabled
        }
    }
}

fn select_run(value: &Value) -> PhaseSpec<Vec<StepConfig>> {
    let entries: Vec<&Value> = match value {
        Value::Object(_) => vec![value],
        Value::Array(items) => items.iter().collect(),
        _ => {
            warn!(phase = "run_dft", "run_dft should be a mapping or a list, phase disabled");
            return PhaseSpec::Disabled;
        }
    };

    let mut runs = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        if !entry.is_object() {
            warn!(phase = "run_dft", index, "run_dft entry is not a mapping, dropped");
            continue;
        }
        let Some(fields) = enabled_fields(entry) else {
            continue;
        };
        match serde_json::from_value::<StepConfig>(Value::Object(fields)) {
            Ok(config) => runs.push(config),
            Err(e) => {
                warn!(phase = "run_dft", index, error = %e, "malformed run_dft entry, dropped")
            }
        }
    }

    if runs.is_empty() {
        PhaseSpec::Disabled
    } else {
        PhaseSpec::Active(runs)
    }
}
