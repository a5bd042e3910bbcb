//! dftsuite - DFT test-suite orchestration on a remote workflow engine

pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod job;
pub mod phase;
pub mod prepare;
pub mod report;
pub mod runner;
pub mod save;
pub mod tracker;

pub use config::{RemoteConfig, RunContext, RunOptions};
pub use engine::{ArgoEngine, MockEngine, WorkflowEngine};
pub use error::{FixSuggestion, SuiteError};
pub use graph::{ExecutionPlan, StepGraph, StepGraphBuilder};
pub use job::{parse_job, JobRecord};
pub use phase::{select_phases, PhaseSet, PhaseSpec};
pub use report::ReportRenderer;
pub use runner::{RunResult, Runner};
pub use tracker::{CompletionMatrix, CompletionTracker, WaitOptions, WaitOutcome};
