//! Argo Workflows engine
//!
//! Talks to the Argo server REST API:
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | submit    | `POST {host}/api/v1/workflows/{ns}` |
//! | query     | `GET {host}/api/v1/workflows/{ns}/{id}` |
//! | download  | `GET {host}/artifacts/{ns}/{id}/{node}/{artifact}` |
//!
//! A sweep reads every step from one workflow query. Downloaded artifacts
//! are gzipped tarballs and get unpacked into the save folder.
//!
//! Each job group becomes one steps template whose step groups are the
//! phases; every leaf step gets its own container template.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use url::{Host, Url};
use walkdir::WalkDir;

use super::{unpack_artifact, RemoteArtifact, RemoteStep, StepPhase, Submission, WorkflowEngine};
use crate::config::RemoteConfig;
use crate::graph::{ExecutionPlan, InputSource, PhaseSteps, StepNode, OUTPUT_ARTIFACT};

const API_VERSION: &str = "argoproj.io/v1alpha1";
const ENTRYPOINT: &str = "main";
const INPUT_DIR: &str = "/tmp/inputs";
const RAW_DIR: &str = "/tmp/inputs/raw";
const EXTRA_DIR: &str = "/tmp/extra";
/// Archived under its basename, which is also `OUTPUT_ARTIFACT`
const OUTPUT_DIR: &str = "/tmp/outputs";
const EXECUTOR_ANNOTATION: &str = "dftsuite/executor";

/// Engine backed by an Argo server
pub struct ArgoEngine {
    client: reqwest::Client,
    host: String,
    namespace: String,
    token: Option<String>,
    labels: BTreeMap<String, String>,
    /// Directory example paths are relative to
    base_dir: PathBuf,
    workflow: RwLock<Option<Submission>>,
}

impl ArgoEngine {
    pub fn new(remote: &RemoteConfig, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let host = remote.host().trim_end_matches('/').to_string();
        let parsed = Url::parse(&host).with_context(|| format!("invalid dflow_host '{}'", host))?;

        // The bundled server on a local port uses a self-signed certificate.
        let loopback = match parsed.host() {
            Some(Host::Ipv4(ip)) => ip.is_loopback(),
            Some(Host::Ipv6(ip)) => ip.is_loopback(),
            Some(Host::Domain(domain)) => domain == "localhost",
            None => false,
        };
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(loopback)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            host,
            namespace: remote.namespace(),
            token: remote.dflow_token.clone().filter(|t| !t.is_empty()),
            labels: remote.dflow_labels.clone().unwrap_or_default(),
            base_dir: base_dir.into(),
            workflow: RwLock::new(None),
        })
    }

    /// Engine bound to an already submitted workflow
    pub fn attach(remote: &RemoteConfig, id: impl Into<String>) -> Result<Self> {
        let engine = Self::new(remote, ".")?;
        *engine.workflow.write() = Some(Submission {
            id: id.into(),
            uid: String::new(),
        });
        Ok(engine)
    }

    fn workflow_id(&self) -> Result<String> {
        self.workflow
            .read()
            .as_ref()
            .map(|w| w.id.clone())
            .ok_or_else(|| anyhow!("no workflow has been submitted"))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to send {} request to {}", what, self.host))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(engine = "argo", status = %status, error = %body, "Argo API error");
            bail!("Argo API error on {} ({}): {}", what, status, body);
        }
        Ok(response)
    }

    async fn fetch_workflow(&self) -> Result<Value> {
        let id = self.workflow_id()?;
        let url = format!("{}/api/v1/workflows/{}/{}", self.host, self.namespace, id);
        let response = self.send(self.request(reqwest::Method::GET, &url), "query").await?;
        response
            .json()
            .await
            .context("Failed to parse Argo workflow response")
    }

    // ========================================================================
    // MANIFEST
    // ========================================================================

    fn manifest(&self, plan: &ExecutionPlan) -> Result<Value> {
        let mut templates = Vec::new();
        let mut groups = Vec::new();

        for job in &plan.jobs {
            groups.push(json!({ "name": job.graph.name, "template": job.graph.name }));

            let mut phases = Vec::new();
            for phase in &job.graph.phases {
                let mut parallel = Vec::new();
                for step in &phase.steps {
                    let (template, arguments) = self.step_template(step, phase)?;
                    templates.push(template);
                    let mut entry = json!({ "name": step.name, "template": step.name });
                    if !arguments.is_empty() {
                        entry["arguments"] = json!({ "artifacts": arguments });
                    }
                    parallel.push(entry);
                }
                phases.push(Value::Array(parallel));
            }
            templates.push(json!({ "name": job.graph.name, "steps": phases }));
        }
        templates.insert(0, json!({ "name": ENTRYPOINT, "steps": [groups] }));

        let generate_name = plan
            .jobs
            .first()
            .map(|j| format!("{}-", j.graph.name))
            .unwrap_or_else(|| "dftsuite-".to_string());

        let mut metadata = json!({ "generateName": generate_name });
        if !self.labels.is_empty() {
            metadata["labels"] = json!(self.labels);
        }

        Ok(json!({
            "apiVersion": API_VERSION,
            "kind": "Workflow",
            "metadata": metadata,
            "spec": {
                "entrypoint": ENTRYPOINT,
                "templates": templates,
            }
        }))
    }

    /// Container template of one leaf plus the arguments its caller passes
    fn step_template(&self, step: &StepNode, phase: &PhaseSteps) -> Result<(Value, Vec<Value>)> {
        let mut inputs = Vec::new();
        let mut arguments = Vec::new();

        let from_predecessor = match &phase.input {
            InputSource::FromPredecessor(output) => {
                for (i, artifact) in output.artifacts.iter().enumerate() {
                    let name = format!("in-{}", i);
                    inputs.push(json!({ "name": name, "path": format!("{}/{}", INPUT_DIR, i) }));
                    arguments.push(json!({
                        "name": name,
                        "from": format!(
                            "{{{{steps.{}.outputs.artifacts.{}}}}}",
                            artifact.step, artifact.name
                        ),
                    }));
                }
                true
            }
            InputSource::FromRawExamples(_) | InputSource::Unspecified => {
                for (path, data) in self.example_files(&step.examples)? {
                    inputs.push(raw_artifact(inputs.len(), &format!("{}/{}", RAW_DIR, path), data));
                }
                false
            }
        };

        let mut extra_names = Vec::new();
        for file in &step.extra_files {
            let local = self.base_dir.join(file);
            let Some(name) = local.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            match read_text(&local)? {
                Some(data) => {
                    inputs.push(raw_artifact(inputs.len(), &format!("{}/{}", EXTRA_DIR, name), data));
                    extra_names.push(name);
                }
                None => tracing::warn!(file = %local.display(), "extra file is not UTF-8 text, skipped"),
            }
        }

        let mut template = json!({
            "name": step.name,
            "container": {
                "image": step.image,
                "command": ["sh", "-c"],
                "args": [step_script(step, from_predecessor, &extra_names)],
            },
            "outputs": {
                "artifacts": [{ "name": OUTPUT_ARTIFACT, "path": OUTPUT_DIR }]
            }
        });
        if !inputs.is_empty() {
            template["inputs"] = json!({ "artifacts": inputs });
        }
        if let Some(executor) = &step.executor {
            template["metadata"] = json!({
                "annotations": { EXECUTOR_ANNOTATION: executor.to_string() }
            });
        }
        Ok((template, arguments))
    }

    /// `(relative path, content)` of every text file under the examples
    fn example_files(&self, examples: &[String]) -> Result<Vec<(String, String)>> {
        let mut files = Vec::new();
        for example in examples {
            let root = self.base_dir.join(example);
            for entry in WalkDir::new(&root).sort_by_file_name() {
                let entry = entry.with_context(|| format!("Failed to read example '{}'", example))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&self.base_dir) else {
                    continue;
                };
                match read_text(entry.path())? {
                    Some(data) => files.push((rel.to_string_lossy().into_owned(), data)),
                    None => tracing::warn!(
                        file = %entry.path().display(),
                        "binary file can not be shipped as a raw artifact, skipped"
                    ),
                }
            }
        }
        Ok(files)
    }
}

fn raw_artifact(index: usize, path: &str, data: String) -> Value {
    json!({ "name": format!("raw-{}", index), "path": path, "raw": { "data": data } })
}

fn read_text(path: &Path) -> Result<Option<String>> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(String::from_utf8(bytes).ok())
}

/// Single-quote for `sh`
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Script run by a leaf: stage inputs into the output folder, then run the
/// command inside every example (or once, for a standalone step)
fn step_script(step: &StepNode, from_predecessor: bool, extra_files: &[String]) -> String {
    let source = if from_predecessor {
        format!("{}/*", INPUT_DIR)
    } else {
        RAW_DIR.to_string()
    };
    let mut lines = vec![format!("mkdir -p {}", OUTPUT_DIR)];

    let copy_extras = |lines: &mut Vec<String>, target: &str| {
        for file in extra_files {
            lines.push(format!("cp {}/{} {}/", EXTRA_DIR, shell_quote(file), target));
        }
    };

    if step.examples.is_empty() {
        copy_extras(&mut lines, OUTPUT_DIR);
        if !step.command.is_empty() {
            lines.push(format!("cd {} && {}", OUTPUT_DIR, step.command));
        }
        return lines.join("\n");
    }

    for example in &step.examples {
        let target = format!("{}/{}", OUTPUT_DIR, shell_quote(example));
        lines.push(format!(
            "for src in {}; do if [ -d \"$src\"/{ex} ]; then mkdir -p {t} && cp -r \"$src\"/{ex}/. {t}/; fi; done",
            source,
            ex = shell_quote(example),
            t = target
        ));
        copy_extras(&mut lines, &target);
        if !step.command.is_empty() {
            lines.push(format!(
                "(cd {t} && {cmd}) || echo \"command failed in {ex}\" >&2",
                t = target,
                cmd = step.command,
                ex = example.replace('"', "")
            ));
        }
    }
    lines.join("\n")
}

/// Node of the queried workflow with the given display name
fn find_node<'a>(workflow: &'a Value, name: &str) -> Option<&'a Map<String, Value>> {
    let nodes = workflow.get("status")?.get("nodes")?.as_object()?;
    let mut matches = nodes
        .values()
        .filter_map(Value::as_object)
        .filter(|n| n.get("displayName").and_then(Value::as_str) == Some(name));
    let first = matches.next()?;
    if first.get("type").and_then(Value::as_str) == Some("Pod") {
        return Some(first);
    }
    matches
        .find(|n| n.get("type").and_then(Value::as_str) == Some("Pod"))
        .or(Some(first))
}

fn node_step(name: &str, node: &Map<String, Value>) -> RemoteStep {
    let phase = StepPhase::parse(node.get("phase").and_then(Value::as_str).unwrap_or(""));
    let node_id = node
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let output = node
        .get("outputs")
        .and_then(|o| o.get("artifacts"))
        .and_then(Value::as_array)
        .and_then(|artifacts| {
            artifacts
                .iter()
                .find(|a| a.get("name").and_then(Value::as_str) == Some(OUTPUT_ARTIFACT))
        })
        .map(|_| RemoteArtifact {
            step: name.to_string(),
            node_id,
            name: OUTPUT_ARTIFACT.to_string(),
        });
    RemoteStep {
        name: name.to_string(),
        phase,
        output,
    }
}

fn lookup_steps(workflow: &Value, names: &[String]) -> Vec<Option<RemoteStep>> {
    names
        .iter()
        .map(|name| find_node(workflow, name).map(|node| node_step(name, node)))
        .collect()
}

#[async_trait]
impl WorkflowEngine for ArgoEngine {
    fn name(&self) -> &str {
        "argo"
    }

    fn render(&self, plan: &ExecutionPlan) -> Result<Value> {
        self.manifest(plan)
    }

    async fn submit(&self, plan: &ExecutionPlan) -> Result<Submission> {
        let manifest = self.manifest(plan)?;
        let url = format!("{}/api/v1/workflows/{}", self.host, self.namespace);

        tracing::debug!(
            engine = "argo",
            host = %self.host,
            steps = plan.step_count(),
            "Submitting workflow"
        );

        let response = self
            .send(
                self.request(reqwest::Method::POST, &url)
                    .json(&json!({ "workflow": manifest })),
                "submit",
            )
            .await?;
        let created: Value = response
            .json()
            .await
            .context("Failed to parse Argo submit response")?;

        let meta = created.get("metadata").cloned().unwrap_or(Value::Null);
        let id = meta
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("Argo submit response has no workflow name"))?
            .to_string();
        let uid = meta
            .get("uid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let submission = Submission { id, uid };
        *self.workflow.write() = Some(submission.clone());
        Ok(submission)
    }

    async fn query_step(&self, name: &str) -> Result<Option<RemoteStep>> {
        let workflow = self.fetch_workflow().await?;
        Ok(find_node(&workflow, name).map(|node| node_step(name, node)))
    }

    async fn query_steps(&self, names: &[String]) -> Result<Vec<Option<RemoteStep>>> {
        let workflow = self.fetch_workflow().await?;
        Ok(lookup_steps(&workflow, names))
    }

    async fn query_status(&self) -> Result<String> {
        let workflow = self.fetch_workflow().await?;
        let phase = workflow
            .get("status")
            .and_then(|s| s.get("phase"))
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .unwrap_or("Pending");
        Ok(phase.to_string())
    }

    async fn download(&self, artifact: &RemoteArtifact, dest: &Path) -> Result<PathBuf> {
        let id = self.workflow_id()?;
        let url = format!(
            "{}/artifacts/{}/{}/{}/{}",
            self.host, self.namespace, id, artifact.node_id, artifact.name
        );
        let response = self
            .send(self.request(reqwest::Method::GET, &url), "download")
            .await
            .with_context(|| format!("step {}", artifact.step))?;
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read artifact of step {}", artifact.step))?;

        let files = unpack_artifact(&bytes, &artifact.name, dest)
            .with_context(|| format!("Failed to unpack artifact of step {}", artifact.step))?;
        tracing::debug!(engine = "argo", step = %artifact.step, files, "Unpacked artifact");
        Ok(dest.to_path_buf())
    }

    fn dashboard_url(&self) -> String {
        let id = self
            .workflow
            .read()
            .as_ref()
            .map(|w| w.id.clone())
            .unwrap_or_default();
        format!("{}/{}?tab=workflow", self.host, id)
    }
}
