//! # Workflow engine
//!
//! The remote side of a run: submit an [`ExecutionPlan`] as one workflow,
//! then answer per-step and whole-workflow status queries and fetch leaf
//! artifacts.
//!
//! - [`WorkflowEngine`] - async trait the runner and tracker talk to
//! - [`ArgoEngine`] - Argo Workflows REST API
//! - [`MockEngine`] - scripted engine for tests
//!
//! ```rust
//! use dftsuite::engine::StepPhase;
//!
//! assert!(StepPhase::parse("Failed").is_terminal());
//! assert!(!StepPhase::parse("Running").is_terminal());
//! ```

mod argo;
mod mock;

pub use argo::ArgoEngine;
pub use mock::MockEngine;

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tar::Archive;

use crate::graph::ExecutionPlan;

/// Workflow status reported when the engine cannot be reached
pub const NOT_RUNNING: &str = "not-running";

/// Workflow status that stops the completion loop
pub const STATUS_FAILED: &str = "Failed";

/// Phase of one remote step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
    Skipped,
    Omitted,
    Other(String),
}

impl StepPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "" | "Pending" => StepPhase::Pending,
            "Running" => StepPhase::Running,
            "Succeeded" => StepPhase::Succeeded,
            "Failed" => StepPhase::Failed,
            "Error" => StepPhase::Error,
            "Skipped" => StepPhase::Skipped,
            "Omitted" => StepPhase::Omitted,
            other => StepPhase::Other(other.to_string()),
        }
    }

    /// Everything except pending/running counts as finished
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepPhase::Pending | StepPhase::Running)
    }
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepPhase::Other(s) => f.write_str(s),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Output artifact of a remote step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteArtifact {
    /// Display name of the producing step
    pub step: String,
    /// Engine-side node identifier
    pub node_id: String,
    pub name: String,
}

/// Queried state of a remote step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStep {
    pub name: String,
    pub phase: StepPhase,
    pub output: Option<RemoteArtifact>,
}

/// Identity of a submitted workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub uid: String,
}

/// Remote workflow engine
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Engine name (e.g. "argo", "mock")
    fn name(&self) -> &str;

    /// Render the plan into the engine's workflow manifest
    fn render(&self, plan: &ExecutionPlan) -> Result<Value>;

    /// Submit the plan as one workflow
    async fn submit(&self, plan: &ExecutionPlan) -> Result<Submission>;

    /// Query a step by its display name; `None` when not scheduled yet
    async fn query_step(&self, name: &str) -> Result<Option<RemoteStep>>;

    /// Query several steps at once, answers in the order of `names`
    ///
    /// Engines that can read every node in one request should override this;
    /// the tracker calls it once per sweep.
    async fn query_steps(&self, names: &[String]) -> Result<Vec<Option<RemoteStep>>> {
        let mut steps = Vec::with_capacity(names.len());
        for name in names {
            steps.push(self.query_step(name).await?);
        }
        Ok(steps)
    }

    /// Overall workflow status (e.g. "Running", "Succeeded", "Failed")
    async fn query_status(&self) -> Result<String>;

    /// Download an artifact and unpack it into `dest`, returning `dest`
    async fn download(&self, artifact: &RemoteArtifact, dest: &Path) -> Result<PathBuf>;

    /// Dashboard address of the submitted workflow
    fn dashboard_url(&self) -> String;
}

/// Unpack a gzipped tarball artifact into `dest`
///
/// Directory artifacts are archived under their folder name, so a leading
/// `root` component is stripped and the files land directly in `dest`.
/// Entries that are not plain files or folders, or that would leave `dest`,
/// are skipped. Returns the number of files written.
pub fn unpack_artifact(bytes: &[u8], root: &str, dest: &Path) -> Result<usize> {
    fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;

    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut files = 0;
    for entry in archive.entries().context("Artifact is not a gzipped tarball")? {
        let mut entry = entry.context("Failed to read artifact entry")?;
        let kind = entry.header().entry_type();
        let path = entry.path().context("Invalid path in artifact")?.into_owned();

        let Some(relative) = entry_target(&path, root) else {
            tracing::warn!(entry = %path.display(), "artifact entry escapes the save folder, skipped");
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&relative);

        if kind.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else if kind.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            entry
                .unpack(&target)
                .with_context(|| format!("Failed to write {}", target.display()))?;
            files += 1;
        } else {
            tracing::debug!(entry = %path.display(), "skipped non-regular artifact entry");
        }
    }
    Ok(files)
}

/// Path of an archive entry relative to the destination; `None` if unsafe
fn entry_target(path: &Path, root: &str) -> Option<PathBuf> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.first().is_some_and(|first| *first == root) {
        parts.remove(0);
    }
    Some(parts.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_phases() {
        assert_eq!(StepPhase::parse("Succeeded"), StepPhase::Succeeded);
        assert_eq!(StepPhase::parse(""), StepPhase::Pending);
        assert_eq!(
            StepPhase::parse("Weird"),
            StepPhase::Other("Weird".to_string())
        );
    }

    #[test]
    fn terminal_phases() {
        for phase in ["Succeeded", "Failed", "Error", "Skipped", "Omitted", "Weird"] {
            assert!(StepPhase::parse(phase).is_terminal(), "{}", phase);
        }
        assert!(!StepPhase::Pending.is_terminal());
        assert!(!StepPhase::Running.is_terminal());
    }

    #[test]
    fn display() {
        assert_eq!(StepPhase::Failed.to_string(), "Failed");
        assert_eq!(StepPhase::Other("X".into()).to_string(), "X");
    }

    #[test]
    fn entry_targets() {
        assert_eq!(
            entry_target(Path::new("outputs/Si/INPUT"), "outputs"),
            Some(PathBuf::from("Si/INPUT"))
        );
        assert_eq!(
            entry_target(Path::new("./metrics.json"), "outputs"),
            Some(PathBuf::from("metrics.json"))
        );
        assert_eq!(entry_target(Path::new("outputs/"), "outputs"), Some(PathBuf::new()));
        assert_eq!(entry_target(Path::new("outputs/../../etc/passwd"), "outputs"), None);
        assert_eq!(entry_target(Path::new("/etc/passwd"), "outputs"), None);
    }

    #[test]
    fn unpack_strips_the_artifact_folder() {
        let dir = tempfile::TempDir::new().unwrap();
        let bytes = mock::pack_files(
            "outputs",
            &[
                ("metrics.json".to_string(), "{\"Si\": 1}".to_string()),
                ("Si/OUT.ABACUS/running_scf.log".to_string(), "converged".to_string()),
            ],
        )
        .unwrap();

        let written = unpack_artifact(&bytes, "outputs", dir.path()).unwrap();
        assert_eq!(written, 2);
        assert_eq!(
            fs::read_to_string(dir.path().join("metrics.json")).unwrap(),
            "{\"Si\": 1}"
        );
        assert!(dir.path().join("Si/OUT.ABACUS/running_scf.log").is_file());
        assert!(!dir.path().join("outputs").exists());
    }

    #[test]
    fn unpack_skips_escaping_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        let save = dir.path().join("save");

        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        let mut header = tar::Header::new_old();
        let name = b"outputs/../../evil.txt";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &b"evil"[..]).unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        assert_eq!(unpack_artifact(&bytes, "outputs", &save).unwrap(), 0);
        assert!(!dir.path().join("evil.txt").exists());
        assert!(save.is_dir());
    }

    #[test]
    fn unpack_rejects_plain_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(unpack_artifact(b"not an archive", "outputs", dir.path()).is_err());
    }
}
