//! Job description parsing
//!
//! Turns a raw job document into a canonical [`JobRecord`]: phase slots are
//! defaulted, the group name is resolved, display abbreviations are copied.
//! Phase contents stay raw here; [`crate::phase::select_phases`] decides
//! what is actually active.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::warn;

use crate::config::parse_labels;

/// Group name used when nothing else is configured
pub const DEFAULT_GROUP_NAME: &str = "abacustesting";

/// Label prefixes rewritten to short group names
const LABEL_PREFIXES: &[(&str, &str)] = &[("sched-abacustest-", "s-"), ("job-abacustest-", "j-")];

/// Canonical job description
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub save_path: Option<String>,
    pub prepare: Value,
    pub pre_dft: Value,
    pub run_dft: Value,
    pub post_dft: Value,
    pub report: Option<Value>,
    pub group_name: String,
    pub abbreviation: BTreeMap<String, String>,
}

impl JobRecord {
    /// Display name for an image (falls back to the image itself)
    pub fn abbreviate<'a>(&'a self, image: &'a str) -> &'a str {
        self.abbreviation
            .get(image)
            .map(String::as_str)
            .unwrap_or(image)
    }
}

/// Sentinel stored for a phase the document does not mention
fn disabled_phase() -> Value {
    json!({ "ifrun": false })
}

/// Parse a raw job document
///
/// `group_name` overrides the document's `bohrium_group_name` when non-empty.
pub fn parse_job(document: &Value, group_name: Option<&str>) -> JobRecord {
    let phase = |key: &str| document.get(key).cloned().unwrap_or_else(disabled_phase);

    let explicit = group_name
        .filter(|name| !name.is_empty())
        .or_else(|| {
            document
                .get("bohrium_group_name")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
        });

    let group_name = match explicit {
        Some(name) => name.to_string(),
        None => launching_job(document)
            .map(|label| group_name_from_label(&label))
            .unwrap_or_else(|| DEFAULT_GROUP_NAME.to_string()),
    };

    JobRecord {
        save_path: document
            .get("save_path")
            .and_then(Value::as_str)
            .map(str::to_string),
        prepare: phase("prepare"),
        pre_dft: phase("pre_dft"),
        run_dft: phase("run_dft"),
        post_dft: phase("post_dft"),
        report: document.get("report").cloned(),
        group_name,
        abbreviation: parse_abbreviation(document.get("ABBREVIATION")),
    }
}

fn launching_job(document: &Value) -> Option<String> {
    let labels = document.get("config")?.get("dflow_labels")?;
    parse_labels(labels)?
        .remove("launching-job")
        .filter(|job| !job.is_empty())
}

/// Derive a short group name from a `launching-job` label
pub fn group_name_from_label(label: &str) -> String {
    for (prefix, short) in LABEL_PREFIXES {
        if let Some(rest) = label.strip_prefix(prefix) {
            return format!("{}{}", short, rest);
        }
    }
    label.to_string()
}

fn parse_abbreviation(value: Option<&Value>) -> BTreeMap<String, String> {
    let Some(value) = value else {
        return BTreeMap::new();
    };
    let Some(map) = value.as_object() else {
        warn!("ABBREVIATION should be a mapping, ignored");
        return BTreeMap::new();
    };

    map.iter()
        .filter_map(|(k, v)| match v.as_str() {
            Some(s) => Some((k.clone(), s.to_string())),
            None => {
                warn!(key = %k, "ABBREVIATION value is not a string, skipped");
                None
            }
        })
        .collect()
}
