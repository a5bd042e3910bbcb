//! # Step graph
//!
//! The submittable representation of a test-suite run.
//!
//! ```text
//! ExecutionPlan
//!   └─ PlannedJob (one per job group)
//!        ├─ StepGraph: PhaseSteps(pre) → PhaseSteps(run) → PhaseSteps(post)
//!        │                each PhaseSteps = N leaf StepNodes in parallel
//!        └─ leaves: [(step name, save_path, sub_path)] of the final phase
//! ```
//!
//! Each phase is bound to exactly one [`InputSource`]; a phase fed by its
//! predecessor mounts every leaf artifact of that predecessor.

mod builder;

pub use builder::{sanitize_name, StepGraphBuilder};

use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;

/// Remote phases (prepare runs locally and never becomes a step)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    PreDft,
    RunDft,
    PostDft,
}

impl PhaseKind {
    /// Short label used in step names
    pub fn label(&self) -> &'static str {
        match self {
            PhaseKind::PreDft => "predft",
            PhaseKind::RunDft => "rundft",
            PhaseKind::PostDft => "postdft",
        }
    }
}

/// Name of the single output artifact every step produces
pub const OUTPUT_ARTIFACT: &str = "outputs";

/// Symbolic reference to a step's output artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRef {
    pub step: String,
    pub name: String,
}

impl ArtifactRef {
    pub fn outputs(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            name: OUTPUT_ARTIFACT.to_string(),
        }
    }
}

/// Gathered output of a phase, consumable by the next one
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseOutput {
    pub phase: PhaseKind,
    pub artifacts: Vec<ArtifactRef>,
    /// Example folders contained in the artifacts
    pub examples: Vec<String>,
}

/// Where a phase takes its inputs from
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InputSource {
    /// The gathered output of the previous phase
    FromPredecessor(PhaseOutput),
    /// Local example folders produced by the prepare phase
    FromRawExamples(Vec<String>),
    /// The phase configuration names its own examples
    Unspecified,
}

/// One schedulable unit of remote work
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepNode {
    pub name: String,
    pub phase: PhaseKind,
    pub image: String,
    pub command: String,
    /// Example folders this step works on (may be empty for standalone steps)
    pub examples: Vec<String>,
    pub extra_files: Vec<String>,
    pub executor: Option<Value>,
    pub output: ArtifactRef,
    /// Local placement only, never part of the remote graph
    #[serde(skip)]
    pub sub_path: String,
}

/// The leaf steps of one phase and their shared input binding
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseSteps {
    pub phase: PhaseKind,
    pub input: InputSource,
    /// Whether the output feeds a later phase
    pub gather: bool,
    pub steps: Vec<StepNode>,
}

impl PhaseSteps {
    /// Example folders covered by this phase, in step order
    pub fn examples(&self) -> Vec<String> {
        self.steps
            .iter()
            .flat_map(|s| s.examples.iter().cloned())
            .collect()
    }

    /// Leaf artifacts of this phase
    pub fn artifacts(&self) -> Vec<ArtifactRef> {
        self.steps.iter().map(|s| s.output.clone()).collect()
    }

    /// Output for the next phase; `None` when the phase is not gathered
    pub fn output(&self) -> Option<PhaseOutput> {
        self.gather.then(|| PhaseOutput {
            phase: self.phase,
            artifacts: self.artifacts(),
            examples: self.examples(),
        })
    }
}

/// Ordered phase chain of one job group
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepGraph {
    pub name: String,
    pub phases: Vec<PhaseSteps>,
}

impl StepGraph {
    /// Externally visible output: the final phase's leaf artifacts
    pub fn output(&self) -> Vec<ArtifactRef> {
        self.phases
            .last()
            .map(PhaseSteps::artifacts)
            .unwrap_or_default()
    }

    /// Leaf steps of the final phase
    pub fn final_steps(&self) -> &[StepNode] {
        self.phases
            .last()
            .map(|p| p.steps.as_slice())
            .unwrap_or(&[])
    }

    pub fn step_count(&self) -> usize {
        self.phases.iter().map(|p| p.steps.len()).sum()
    }

    pub fn phase(&self, kind: PhaseKind) -> Option<&PhaseSteps> {
        self.phases.iter().find(|p| p.phase == kind)
    }
}

/// Where a finished leaf's results are filed locally
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SaveTarget {
    pub save_path: PathBuf,
    /// Empty when no finer split applies
    pub sub_path: String,
}

impl SaveTarget {
    pub fn folder(&self) -> PathBuf {
        if self.sub_path.is_empty() {
            self.save_path.clone()
        } else {
            self.save_path.join(&self.sub_path)
        }
    }
}

/// A leaf step tracked for completion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeafStep {
    pub name: String,
    pub save: SaveTarget,
}

/// The graph of one job group and its leaf index
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedJob {
    pub graph: StepGraph,
    /// Positionally matches the remote names of the final phase's steps
    pub leaves: Vec<LeafStep>,
}

/// Everything to submit in one workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionPlan {
    pub jobs: Vec<PlannedJob>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn step_count(&self) -> usize {
        self.jobs.iter().map(|j| j.graph.step_count()).sum()
    }

    /// `[group][leaf]` view of the leaf index
    pub fn leaves(&self) -> Vec<Vec<LeafStep>> {
        self.jobs.iter().map(|j| j.leaves.clone()).collect()
    }
}
