//! Mock engine for testing
//!
//! Scripted per-step phase sequences and workflow status sequences; no
//! network. Every call is recorded for assertions. Downloads pack the
//! step's scripted files into a gzipped tarball and unpack it like a real
//! artifact.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{unpack_artifact, RemoteArtifact, RemoteStep, StepPhase, Submission, WorkflowEngine};
use crate::graph::{ExecutionPlan, OUTPUT_ARTIFACT};

const MOCK_HOST: &str = "https://mock.local";

#[derive(Default)]
struct MockState {
    /// Per step: phases returned by successive queries (the last one repeats)
    phases: HashMap<String, Vec<StepPhase>>,
    /// Workflow statuses returned by successive queries (the last one repeats)
    statuses: Vec<String>,
    failing_downloads: HashSet<String>,
    /// Per step: `(relative path, content)` files inside its artifact
    outputs: HashMap<String, Vec<(String, String)>>,
    submissions: Vec<ExecutionPlan>,
    step_queries: Vec<String>,
    status_queries: usize,
    downloads: Vec<(String, PathBuf)>,
}

/// Engine returning scripted answers
pub struct MockEngine {
    id: String,
    state: Mutex<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            id: "mock-workflow".to_string(),
            state: Mutex::new(MockState {
                statuses: vec!["Running".to_string()],
                ..Default::default()
            }),
        }
    }

    /// Script the phases returned for a step (unscripted steps are never found)
    pub fn with_step(self, name: impl Into<String>, phases: Vec<StepPhase>) -> Self {
        self.state.lock().phases.insert(name.into(), phases);
        self
    }

    /// Script the workflow statuses returned after each sweep
    pub fn with_statuses(self, statuses: &[&str]) -> Self {
        self.state.lock().statuses = statuses.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Make downloads of this step fail
    pub fn with_failing_download(self, step: impl Into<String>) -> Self {
        self.state.lock().failing_downloads.insert(step.into());
        self
    }

    /// Script the files inside a step's artifact (default: `<step>.log`)
    pub fn with_output(self, step: impl Into<String>, files: &[(&str, &str)]) -> Self {
        let files = files
            .iter()
            .map(|(path, content)| (path.to_string(), content.to_string()))
            .collect();
        self.state.lock().outputs.insert(step.into(), files);
        self
    }

    pub fn submissions(&self) -> Vec<ExecutionPlan> {
        self.state.lock().submissions.clone()
    }

    pub fn step_queries(&self) -> Vec<String> {
        self.state.lock().step_queries.clone()
    }

    pub fn status_queries(&self) -> usize {
        self.state.lock().status_queries
    }

    /// `(step, destination)` of every successful download
    pub fn downloads(&self) -> Vec<(String, PathBuf)> {
        self.state.lock().downloads.clone()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Gzipped tarball with every file under `root/`
pub(crate) fn pack_files(root: &str, files: &[(String, String)]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, format!("{}/{}", root, path), content.as_bytes())?;
    }
    Ok(builder.into_inner()?.finish()?)
}

/// Pop the head of a script, repeating its last element
fn next_scripted<T: Clone>(script: &mut Vec<T>) -> Option<T> {
    if script.len() > 1 {
        Some(script.remove(0))
    } else {
        script.first().cloned()
    }
}

#[async_trait]
impl WorkflowEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn render(&self, plan: &ExecutionPlan) -> Result<Value> {
        Ok(json!({
            "engine": "mock",
            "steps": plan.step_count(),
            "jobs": serde_json::to_value(plan)?,
        }))
    }

    async fn submit(&self, plan: &ExecutionPlan) -> Result<Submission> {
        self.state.lock().submissions.push(plan.clone());
        Ok(Submission {
            id: self.id.clone(),
            uid: format!("{}-uid", self.id),
        })
    }

    async fn query_step(&self, name: &str) -> Result<Option<RemoteStep>> {
        let mut state = self.state.lock();
        state.step_queries.push(name.to_string());
        let Some(phase) = state.phases.get_mut(name).and_then(next_scripted) else {
            return Ok(None);
        };
        let output = phase.is_terminal().then(|| RemoteArtifact {
            step: name.to_string(),
            node_id: format!("{}-node", name),
            name: OUTPUT_ARTIFACT.to_string(),
        });
        Ok(Some(RemoteStep {
            name: name.to_string(),
            phase,
            output,
        }))
    }

    async fn query_status(&self) -> Result<String> {
        let mut state = self.state.lock();
        state.status_queries += 1;
        Ok(next_scripted(&mut state.statuses).unwrap_or_else(|| "Running".to_string()))
    }

    async fn download(&self, artifact: &RemoteArtifact, dest: &Path) -> Result<PathBuf> {
        let files = {
            let state = self.state.lock();
            if state.failing_downloads.contains(&artifact.step) {
                bail!("artifact of step {} is not available", artifact.step);
            }
            state.outputs.get(&artifact.step).cloned().unwrap_or_else(|| {
                vec![(format!("{}.log", artifact.step), artifact.node_id.clone())]
            })
        };

        let bytes = pack_files(&artifact.name, &files)?;
        unpack_artifact(&bytes, &artifact.name, dest)?;
        self.state
            .lock()
            .downloads
            .push((artifact.step.clone(), dest.to_path_buf()));
        Ok(dest.to_path_buf())
    }

    fn dashboard_url(&self) -> String {
        format!("{}/{}?tab=workflow", MOCK_HOST, self.id)
    }
}
