//! Run orchestration
//!
//! `run` glues the pieces together:
//!
//! ```text
//! RunContext → parse_job → StepGraphBuilder → ExecutionPlan
//!     ├─ empty       → "No step is produced" → report
//!     ├─ debug       → manifest written to the save folder
//!     └─ submit      → CompletionTracker → report
//! ```
//!
//! The report is built whenever the job has an enabled `report` block, so a
//! report-only job renders results already on disk.

use std::fs;
use std::path::PathBuf;

use colored::Colorize;
use tracing::{info, warn};

use crate::config::RunContext;
use crate::engine::{Submission, WorkflowEngine, NOT_RUNNING};
use crate::error::{Result, SuiteError};
use crate::graph::{ExecutionPlan, StepGraphBuilder};
use crate::job::parse_job;
use crate::prepare::LocalPreparer;
use crate::report::{ReportMeta, ReportRenderer, DEFAULT_REPORT_FILE};
use crate::tracker::{CompletionTracker, WaitOptions, WaitOutcome};

/// Manifest file written in debug mode
pub const DEBUG_MANIFEST_FILE: &str = "workflow.debug.json";

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    /// Every phase was disabled or matched nothing
    NothingToRun { report: Option<PathBuf> },
    /// Debug mode: manifest rendered, nothing submitted
    Rendered { manifest: PathBuf },
    /// Submitted without waiting
    Submitted { submission: Submission },
    Finished {
        submission: Submission,
        outcome: WaitOutcome,
        report: Option<PathBuf>,
    },
}

/// Runs a job description against a workflow engine
pub struct Runner {
    submit_only: bool,
    wait: WaitOptions,
    verbose: bool,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        Self {
            submit_only: false,
            wait: WaitOptions::default(),
            verbose: true,
        }
    }

    /// Return right after submission
    pub fn submit_only(mut self, submit_only: bool) -> Self {
        self.submit_only = submit_only;
        self
    }

    pub fn with_wait(mut self, wait: WaitOptions) -> Self {
        self.wait = wait;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Build the execution plan of the job description
    pub fn plan(&self, ctx: &RunContext) -> ExecutionPlan {
        let job = parse_job(&ctx.document, None);
        let preparer = LocalPreparer::new(&ctx.base_dir);
        let builder = StepGraphBuilder::new(&preparer, &ctx.base_dir);
        builder.build_plan(&[job], &ctx.save_folder)
    }

    pub async fn run(&self, ctx: &RunContext, engine: &dyn WorkflowEngine) -> Result<RunResult> {
        let plan = self.plan(ctx);
        if plan.is_empty() {
            info!("No step is produced, exit!!!");
            if self.verbose {
                println!("{} No step is produced", "→".cyan());
            }
            let report = self.report(ctx);
            return Ok(RunResult::NothingToRun { report });
        }
        info!(steps = plan.step_count(), "Execution plan built");

        if ctx.debug {
            let manifest = engine.render(&plan).map_err(|e| SuiteError::Engine {
                details: format!("{:#}", e),
            })?;
            fs::create_dir_all(&ctx.save_folder)?;
            let path = ctx.save_folder.join(DEBUG_MANIFEST_FILE);
            fs::write(&path, serde_json::to_string_pretty(&manifest)?)?;
            if self.verbose {
                println!(
                    "{} Debug mode, workflow manifest written to {}",
                    "→".cyan(),
                    path.display().to_string().cyan()
                );
            }
            return Ok(RunResult::Rendered { manifest: path });
        }

        let submission = engine.submit(&plan).await.map_err(|e| SuiteError::Submit {
            details: format!("{:#}", e),
        })?;
        info!(id = %submission.id, uid = %submission.uid, "Workflow submitted");
        if self.verbose {
            println!(
                "{} job ID: {}, UID: {}",
                "✓".green(),
                submission.id.bold(),
                submission.uid
            );
            println!(
                "  You can track the flow by using your browser to access the URL:\n  {}",
                engine.dashboard_url().cyan()
            );
        }

        if self.submit_only {
            return Ok(RunResult::Submitted { submission });
        }

        let mut tracker = CompletionTracker::new(engine, ctx, plan.leaves());
        let outcome = tracker.wait(&self.wait).await?;
        if self.verbose {
            match &outcome {
                WaitOutcome::Completed => println!("{} All steps finished", "✓".green()),
                WaitOutcome::WorkflowFailed => println!(
                    "{} The workflow is failed, please check on: {}",
                    "✗".red(),
                    engine.dashboard_url()
                ),
                WaitOutcome::LimitReached { unfinished } => println!(
                    "{} Stopped waiting with {} unfinished steps",
                    "!".yellow(),
                    unfinished.len()
                ),
            }
        }

        let report = self.report(ctx);
        Ok(RunResult::Finished {
            submission,
            outcome,
            report,
        })
    }

    /// Render the report when the job enables one
    fn report(&self, ctx: &RunContext) -> Option<PathBuf> {
        let settings = ctx.report_settings()?;
        if self.verbose {
            println!("{} Generate html report ...", "→".cyan());
        }
        match generate_report(ctx, settings) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "Report generation failed");
                None
            }
        }
    }
}

/// Write the report of a finished run into its save folder
pub fn generate_report(ctx: &RunContext, settings: &serde_json::Value) -> Result<PathBuf> {
    let dir = if ctx.save_folder.is_dir() {
        ctx.save_folder.clone()
    } else {
        PathBuf::from(".")
    };
    let meta = ReportMeta::collect(&dir, ctx.started_at, ctx.job_address.clone());
    ReportRenderer::new(&dir, meta).write(settings, &dir.join(DEFAULT_REPORT_FILE))
}

/// Overall status of a workflow, `not-running` when it can not be queried
pub async fn check_status(engine: &dyn WorkflowEngine) -> String {
    match engine.query_status().await {
        Ok(status) => status,
        Err(e) => {
            warn!(error = %format!("{:#}", e), "Query status error");
            NOT_RUNNING.to_string()
        }
    }
}
