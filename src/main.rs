//! dftsuite CLI - DFT test-suite runner

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{Map, Value};
use tracing::warn;

use dftsuite::config::{load_document, RemoteConfig, RunContext, RunOptions};
use dftsuite::engine::ArgoEngine;
use dftsuite::error::{FixSuggestion, Result, SuiteError};
use dftsuite::report::{ReportMeta, ReportRenderer, DEFAULT_REPORT_FILE};
use dftsuite::runner::{check_status, RunResult, Runner};
use dftsuite::tracker::{WaitOptions, WaitOutcome};

#[derive(Parser)]
#[command(name = "dftsuite")]
#[command(about = "dftsuite - run DFT test suites on a remote workflow engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, submit and track the steps of a job description
    Run {
        /// Job description file (.json, .yaml); example patterns, extra files
        /// and save_path inside it are relative to its folder
        #[arg(short, long)]
        param: PathBuf,

        /// Result folder when the job has no save_path, relative to the
        /// working directory
        #[arg(short, long)]
        save: Option<PathBuf>,

        /// Reuse existing result folders instead of backing them up
        #[arg(long = "override")]
        override_existing: bool,

        /// Write the workflow manifest instead of submitting it
        #[arg(long)]
        debug: bool,

        /// Return right after submission
        #[arg(long)]
        submit_only: bool,

        /// Seconds between status sweeps
        #[arg(long, default_value_t = 4)]
        poll_interval: u64,

        /// Stop waiting after this many sweeps
        #[arg(long)]
        max_sweeps: Option<usize>,

        /// Stop waiting after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Print the status of a submitted workflow
    Status {
        /// Workflow ID
        job_id: String,

        /// File holding the engine config (a job description or a bare config block)
        #[arg(short, long)]
        param: Option<PathBuf>,
    },

    /// Render the report block of a job description
    Report {
        /// Job description file
        #[arg(short, long)]
        param: PathBuf,

        /// Output HTML file
        #[arg(short, long, default_value = DEFAULT_REPORT_FILE)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    // Load .env file (ignore if not present)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let level = match &cli.command {
        Commands::Run { debug: true, .. } => tracing::Level::DEBUG,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let result = match cli.command {
        Commands::Run {
            param,
            save,
            override_existing,
            debug,
            submit_only,
            poll_interval,
            max_sweeps,
            timeout,
        } => {
            let options = RunOptions {
                param,
                save,
                override_existing,
                debug,
            };
            let mut wait = WaitOptions {
                poll_interval: Duration::from_secs(poll_interval),
                max_sweeps,
                deadline: None,
            };
            if let Some(secs) = timeout {
                wait = wait.with_timeout(Duration::from_secs(secs));
            }
            run_jobs(&options, submit_only, wait).await
        }
        Commands::Status { job_id, param } => show_status(&job_id, param.as_deref()).await,
        Commands::Report { param, output } => write_report(&param, &output),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

async fn run_jobs(options: &RunOptions, submit_only: bool, wait: WaitOptions) -> Result<()> {
    let ctx = RunContext::load(options)?;
    let engine = ArgoEngine::new(&ctx.remote, &ctx.base_dir).map_err(|e| SuiteError::Config {
        reason: format!("{:#}", e),
    })?;

    println!(
        "{} Using engine: {} | save folder: {}",
        "→".cyan(),
        ctx.remote.host().cyan().bold(),
        ctx.save_folder.display().to_string().cyan()
    );

    let result = Runner::new()
        .submit_only(submit_only)
        .with_wait(wait)
        .run(&ctx, &engine)
        .await?;

    let (report, outcome) = match result {
        RunResult::NothingToRun { report } => (report, None),
        RunResult::Finished {
            outcome, report, ..
        } => (report, Some(outcome)),
        RunResult::Rendered { .. } | RunResult::Submitted { .. } => (None, None),
    };
    if let Some(path) = report {
        println!("{} Report written to {}", "✓".green(), path.display());
    }
    if let Some(WaitOutcome::LimitReached { unfinished }) = outcome {
        for name in unfinished {
            println!("  {} {}", "unfinished:".yellow(), name);
        }
    }
    Ok(())
}

/// Engine settings from a status config file
fn status_config(param: Option<&Path>) -> Result<Map<String, Value>> {
    let Some(path) = param.filter(|p| p.is_file()) else {
        warn!("config file is not found, use the default setting");
        return Ok(Map::new());
    };
    let document = load_document(path)?;
    let block = document
        .get("config")
        .or_else(|| document.get("USER"))
        .unwrap_or(&document);
    Ok(block.as_object().cloned().unwrap_or_default())
}

async fn show_status(job_id: &str, param: Option<&Path>) -> Result<()> {
    let remote = RemoteConfig::resolve(status_config(param)?, |key| std::env::var(key).ok());
    let engine = ArgoEngine::attach(&remote, job_id).map_err(|e| SuiteError::Config {
        reason: format!("{:#}", e),
    })?;
    println!("{}", check_status(&engine).await);
    Ok(())
}

fn write_report(param: &Path, output: &Path) -> Result<()> {
    let document = load_document(param)?;
    let settings = match document.get("report") {
        Some(Value::Object(map)) if !map.is_empty() => Value::Object(map.clone()),
        _ => {
            return Err(SuiteError::Report {
                details: "report section is empty".to_string(),
            })
        }
    };

    let job_address = RemoteConfig::from_document(&document).job_address();
    let meta = ReportMeta::collect(Path::new("."), Local::now(), job_address);
    let path = ReportRenderer::new(".", meta).write(&settings, output)?;
    println!("{} Report written to {}", "✓".green(), path.display());
    Ok(())
}
