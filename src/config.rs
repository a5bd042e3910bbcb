//! Run configuration
//!
//! Two pieces of state are built once at startup and passed by reference:
//!
//! - [`RemoteConfig`]: engine endpoints and credentials, merged from the
//!   job file's `config` block and the environment.
//! - [`RunContext`]: everything a run needs (job document, save folder,
//!   override flag, job address, start time).
//!
//! ## Lookup order (highest to lowest)
//!
//! 1. `config.<key>` in the job file
//! 2. `config.<legacy_key>` in the job file
//! 3. `<KEY>` environment variable
//! 4. `<LEGACY_KEY>` environment variable
//!
//! ## Relative paths
//!
//! Paths written in the job file (example patterns, extra files,
//! `save_path`) are relative to the job file's folder. `--save` is a
//! command line path and stays relative to the working directory.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{Result, SuiteError};

/// Default engine host when neither the job file nor the env sets one
pub const DEFAULT_HOST: &str = "https://127.0.0.1:2746";

/// Default engine namespace
pub const DEFAULT_NAMESPACE: &str = "argo";

/// Default result folder when neither `save_path` nor `--save` is given
pub const DEFAULT_SAVE_FOLDER: &str = "result";

/// Dashboard prefix for jobs launched by the hosted app (launching-job label)
const JOB_ADDRESS_PREFIX: &str =
    "https://labs.dp.tech/projects/abacustest/?request=GET%3A%2Fapplications%2Fabacustest%2Fjobs%2F";

/// (current key, legacy key) pairs understood in the `config` block
const KEY_ALIASES: &[(&str, &str)] = &[
    ("bohrium_username", "lbg_username"),
    ("bohrium_password", "lbg_password"),
    ("bohrium_ticket", "bohrium_ticket"),
    ("bohrium_project_id", "project_id"),
    ("dflow_host", "config_host"),
    ("dflow_s3_config_endpoint", "s3_config_endpoint"),
    ("dflow_k8s_api_server", "config_k8s_api_server"),
    ("dflow_token", "config_token"),
    ("dflow_labels", "dflow_labels"),
    ("aim_access_token", "AIM_ACCESS_TOKEN"),
];

/// Engine endpoints and credentials
#[derive(Clone, Default, PartialEq)]
pub struct RemoteConfig {
    pub bohrium_username: Option<String>,
    pub bohrium_password: Option<String>,
    pub bohrium_ticket: Option<String>,
    pub bohrium_project_id: Option<String>,
    pub dflow_host: Option<String>,
    pub dflow_s3_config_endpoint: Option<String>,
    pub dflow_k8s_api_server: Option<String>,
    pub dflow_token: Option<String>,
    pub dflow_labels: Option<BTreeMap<String, String>>,
    pub aim_access_token: Option<String>,
    /// Keys not listed in the alias table, kept verbatim
    pub extra: Map<String, Value>,
}

impl RemoteConfig {
    /// Resolve from the job document's `config` block and the process env
    pub fn from_document(document: &Value) -> Self {
        let user = match document.get("config") {
            Some(Value::Object(map)) => map.clone(),
            _ => {
                warn!("\"config\" is not detected in parameter file, reading config from the environment");
                Map::new()
            }
        };
        Self::resolve(user, |key| std::env::var(key).ok())
    }

    /// Resolve with an injectable env lookup
    pub fn resolve<F>(mut user: Map<String, Value>, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut resolved: BTreeMap<&str, Value> = BTreeMap::new();

        for (key, legacy) in KEY_ALIASES {
            let value = user
                .remove(*key)
                .or_else(|| user.remove(*legacy))
                .or_else(|| env(&key.to_uppercase()).map(Value::String))
                .or_else(|| env(&legacy.to_uppercase()).map(Value::String));
            if let Some(value) = value {
                resolved.insert(*key, value);
            }
        }

        let text = |key: &str| resolved.get(key).and_then(value_to_string);

        Self {
            bohrium_username: text("bohrium_username"),
            bohrium_password: text("bohrium_password"),
            bohrium_ticket: text("bohrium_ticket"),
            bohrium_project_id: text("bohrium_project_id"),
            dflow_host: text("dflow_host"),
            dflow_s3_config_endpoint: text("dflow_s3_config_endpoint"),
            dflow_k8s_api_server: text("dflow_k8s_api_server"),
            dflow_token: text("dflow_token"),
            dflow_labels: resolved.get("dflow_labels").and_then(parse_labels),
            aim_access_token: text("aim_access_token"),
            extra: user,
        }
    }

    /// Engine host, trailing slash stripped
    pub fn host(&self) -> String {
        self.dflow_host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_HOST)
            .trim_end_matches('/')
            .to_string()
    }

    /// Engine namespace (`dflow_namespace` extra key)
    pub fn namespace(&self) -> String {
        self.extra
            .get("dflow_namespace")
            .and_then(Value::as_str)
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE)
            .to_string()
    }

    /// Value of the `launching-job` label, if any
    pub fn launching_job(&self) -> Option<&str> {
        self.dflow_labels
            .as_ref()
            .and_then(|labels| labels.get("launching-job"))
            .map(String::as_str)
    }

    /// Dashboard address of the hosted job that launched this run
    pub fn job_address(&self) -> Option<String> {
        self.launching_job()
            .map(|job| format!("{}{}", JOB_ADDRESS_PREFIX, job))
    }
}

// Passwords and tokens never reach the logs.
impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("bohrium_username", &self.bohrium_username)
            .field("bohrium_project_id", &self.bohrium_project_id)
            .field("dflow_host", &self.host())
            .field("dflow_k8s_api_server", &self.dflow_k8s_api_server)
            .field("dflow_labels", &self.dflow_labels)
            .field("has_token", &self.dflow_token.is_some())
            .finish()
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}

/// Parse `dflow_labels`, given either as an object or as a JSON string.
///
/// An empty string means "no labels".
pub fn parse_labels(value: &Value) -> Option<BTreeMap<String, String>> {
    let parsed;
    let map = match value {
        Value::Object(map) => map,
        Value::String(s) if s.trim().is_empty() => return None,
        Value::String(s) => {
            parsed = match serde_json::from_str::<Value>(s.trim()) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "dflow_labels is not a valid JSON object, ignored");
                    return None;
                }
            };
            parsed.as_object()?
        }
        _ => return None,
    };

    Some(
        map.iter()
            .filter_map(|(k, v)| value_to_string(v).map(|v| (k.clone(), v)))
            .collect(),
    )
}

// ============================================================================
// RUN CONTEXT
// ============================================================================

/// Options collected from the command line for `run`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub param: PathBuf,
    pub save: Option<PathBuf>,
    pub override_existing: bool,
    pub debug: bool,
}

/// Everything a run needs, built once and passed by reference
#[derive(Debug, Clone)]
pub struct RunContext {
    /// File name of the job description (used for parameter snapshots)
    pub param_file_name: String,
    /// Raw job document
    pub document: Value,
    /// Folder of the job file; relative paths inside the job resolve here
    pub base_dir: PathBuf,
    /// Root result folder
    pub save_folder: PathBuf,
    pub override_existing: bool,
    pub debug: bool,
    pub remote: RemoteConfig,
    pub job_address: Option<String>,
    pub started_at: DateTime<Local>,
}

impl RunContext {
    /// Read the job file and resolve settings
    pub fn load(options: &RunOptions) -> Result<Self> {
        let document = load_document(&options.param)?;
        info!(path = %options.param.display(), "Read parameter setting");
        Ok(Self::from_document(document, options))
    }

    /// Build from an already parsed document
    pub fn from_document(document: Value, options: &RunOptions) -> Self {
        let param_file_name = options
            .param
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job.json".to_string());

        let base_dir = match options.param.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let save_folder = document
            .get("save_path")
            .and_then(Value::as_str)
            .and_then(clean_save_path)
            .map(|p| resolve_in(&base_dir, Path::new(p)))
            .or_else(|| options.save.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SAVE_FOLDER));
        info!(folder = %save_folder.display(), "Set save folder");

        let remote = RemoteConfig::from_document(&document);
        let job_address = remote.job_address();

        Self {
            param_file_name,
            document,
            base_dir,
            save_folder,
            override_existing: options.override_existing,
            debug: options.debug,
            remote,
            job_address,
            started_at: Local::now(),
        }
    }

    /// The `report` block, if present and enabled
    pub fn report_settings(&self) -> Option<&Value> {
        let report = self.document.get("report")?;
        let enabled = report
            .get("ifrun")
            .map(crate::phase::truthy)
            .unwrap_or(true);
        (report.is_object() && enabled).then_some(report)
    }
}

/// `save_path` without surrounding blanks or trailing slashes
pub fn clean_save_path(raw: &str) -> Option<&str> {
    Some(raw.trim().trim_end_matches('/')).filter(|p| !p.is_empty())
}

/// Resolve a job-file path against the job folder
///
/// Absolute paths are kept, and a `.` base leaves the path untouched.
pub fn resolve_in(base_dir: &Path, path: &Path) -> PathBuf {
    if base_dir == Path::new(".") {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Load a job description (JSON, or YAML by extension)
pub fn load_document(path: &Path) -> Result<Value> {
    if !path.is_file() {
        return Err(SuiteError::ParamNotFound {
            path: path.display().to_string(),
        });
    }
    let content = fs::read_to_string(path)?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        Ok(serde_yaml::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn as_map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn current_key_wins_over_legacy() {
        let cfg = RemoteConfig::resolve(
            as_map(json!({"dflow_host": "https://new", "config_host": "https://old"})),
            no_env,
        );
        assert_eq!(cfg.host(), "https://new");
    }

    #[test]
    fn legacy_key_is_accepted() {
        let cfg = RemoteConfig::resolve(
            as_map(json!({"lbg_username": "alice", "project_id": 42})),
            no_env,
        );
        assert_eq!(cfg.bohrium_username.as_deref(), Some("alice"));
        assert_eq!(cfg.bohrium_project_id.as_deref(), Some("42"));
    }

    #[test]
    fn env_is_used_when_document_is_silent() {
        let cfg = RemoteConfig::resolve(Map::new(), |key| {
            (key == "CONFIG_TOKEN").then(|| "tok".to_string())
        });
        assert_eq!(cfg.dflow_token.as_deref(), Some("tok"));
    }

    #[test]
    fn labels_from_string() {
        let cfg = RemoteConfig::resolve(
            as_map(json!({"dflow_labels": "{\"launching-job\": \"job-abacustest-1\"}"})),
            no_env,
        );
        assert_eq!(cfg.launching_job(), Some("job-abacustest-1"));
        assert!(cfg.job_address().unwrap().ends_with("job-abacustest-1"));
    }

    #[test]
    fn empty_label_string_is_absent() {
        let cfg = RemoteConfig::resolve(as_map(json!({"dflow_labels": "  "})), no_env);
        assert!(cfg.dflow_labels.is_none());
    }

    #[test]
    fn unknown_keys_are_kept() {
        let cfg = RemoteConfig::resolve(as_map(json!({"dflow_namespace": "dft"})), no_env);
        assert_eq!(cfg.namespace(), "dft");
        assert_eq!(cfg.host(), DEFAULT_HOST);
    }

    #[test]
    fn save_folder_prefers_document() {
        let options = RunOptions {
            param: PathBuf::from("jobs/job.json"),
            save: Some(PathBuf::from("cli")),
            ..Default::default()
        };
        let ctx = RunContext::from_document(json!({"save_path": "doc/", "config": {}}), &options);
        assert_eq!(ctx.save_folder, PathBuf::from("jobs/doc"));
        assert_eq!(ctx.base_dir, PathBuf::from("jobs"));
        assert_eq!(ctx.param_file_name, "job.json");

        let ctx = RunContext::from_document(json!({"config": {}}), &options);
        assert_eq!(ctx.save_folder, PathBuf::from("cli"));
    }

    #[test]
    fn job_paths_share_the_job_folder() {
        let options = RunOptions {
            param: PathBuf::from("job.json"),
            ..Default::default()
        };
        let ctx = RunContext::from_document(json!({"save_path": " out "}), &options);
        assert_eq!(ctx.base_dir, PathBuf::from("."));
        assert_eq!(ctx.save_folder, PathBuf::from("out"));

        assert_eq!(resolve_in(Path::new("/jobs"), Path::new("/abs/out")), PathBuf::from("/abs/out"));
        assert_eq!(resolve_in(Path::new("/jobs"), Path::new("out")), PathBuf::from("/jobs/out"));
        assert_eq!(clean_save_path(" / "), None);
    }

    #[test]
    fn disabled_report_is_hidden() {
        let options = RunOptions::default();
        let ctx = RunContext::from_document(
            json!({"config": {}, "report": {"ifrun": false, "content": []}}),
            &options,
        );
        assert!(ctx.report_settings().is_none());
    }
}
