//! # Completion tracking
//!
//! Polls every leaf step of a submitted plan until all of them reach a
//! terminal phase, downloading each leaf's output as soon as it finishes.
//!
//! ```text
//! sweep:
//!   query all unfinished leaves (one engine round trip)
//!   for each leaf in [group][leaf] order:
//!       terminal? → finish once → folder + snapshot once → download
//!   workflow status == Failed? → stop
//!   all finished? → done
//! ```
//!
//! Leaves are never re-queried after finishing. A failed download or an
//! unusable save folder only costs that leaf its results.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::RunContext;
use crate::engine::{RemoteStep, StepPhase, WorkflowEngine, STATUS_FAILED};
use crate::error::{Result, SuiteError};
use crate::graph::LeafStep;
use crate::save::{make_save_folder, write_param_snapshot};

/// Default pause between sweeps
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(4);

/// Finished flags indexed `[group][leaf]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionMatrix {
    finished: Vec<Vec<bool>>,
}

impl CompletionMatrix {
    pub fn new(leaves: &[Vec<LeafStep>]) -> Self {
        Self {
            finished: leaves.iter().map(|g| vec![false; g.len()]).collect(),
        }
    }

    pub fn is_finished(&self, group: usize, leaf: usize) -> bool {
        self.finished
            .get(group)
            .and_then(|g| g.get(leaf))
            .copied()
            .unwrap_or(false)
    }

    /// Mark a leaf finished; `true` only the first time
    pub fn finish(&mut self, group: usize, leaf: usize) -> bool {
        match self.finished.get_mut(group).and_then(|g| g.get_mut(leaf)) {
            Some(flag) if !*flag => {
                *flag = true;
                true
            }
            _ => false,
        }
    }

    /// Unfinished `(group, leaf)` positions in order
    pub fn pending(&self) -> Vec<(usize, usize)> {
        self.finished
            .iter()
            .enumerate()
            .flat_map(|(g, leaves)| {
                leaves
                    .iter()
                    .enumerate()
                    .filter(|(_, done)| !**done)
                    .map(move |(l, _)| (g, l))
            })
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.finished.iter().flatten().filter(|done| !**done).count()
    }

    pub fn all_finished(&self) -> bool {
        self.remaining() == 0
    }
}

/// Polling limits
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub poll_interval: Duration,
    /// Stop after this many sweeps
    pub max_sweeps: Option<usize>,
    /// Stop once this instant has passed
    pub deadline: Option<Instant>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_sweeps: None,
            deadline: None,
        }
    }
}

impl WaitOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }
}

/// How the wait loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    WorkflowFailed,
    LimitReached { unfinished: Vec<String> },
}

/// Wait loop state for one submitted plan
pub struct CompletionTracker<'a> {
    engine: &'a dyn WorkflowEngine,
    ctx: &'a RunContext,
    leaves: Vec<Vec<LeafStep>>,
    matrix: CompletionMatrix,
    roots: HashSet<PathBuf>,
    folders: HashSet<PathBuf>,
}

impl<'a> CompletionTracker<'a> {
    pub fn new(engine: &'a dyn WorkflowEngine, ctx: &'a RunContext, leaves: Vec<Vec<LeafStep>>) -> Self {
        let matrix = CompletionMatrix::new(&leaves);
        Self {
            engine,
            ctx,
            leaves,
            matrix,
            roots: HashSet::new(),
            folders: HashSet::new(),
        }
    }

    pub fn matrix(&self) -> &CompletionMatrix {
        &self.matrix
    }

    /// Poll until every leaf finished, the workflow failed, or a limit hit
    pub async fn wait(&mut self, options: &WaitOptions) -> Result<WaitOutcome> {
        let mut sweeps = 0usize;
        info!(steps = self.matrix.remaining(), "Waiting for steps to finish");

        loop {
            sweeps += 1;
            self.sweep().await;

            match self.engine.query_status().await {
                Ok(status) if status == STATUS_FAILED => {
                    error!(
                        dashboard = %self.engine.dashboard_url(),
                        "Workflow is failed, please check on the dashboard"
                    );
                    return Ok(WaitOutcome::WorkflowFailed);
                }
                Ok(status) => debug!(sweep = sweeps, status = %status, "workflow status"),
                Err(e) => warn!(error = %format!("{:#}", e), "Query workflow status failed"),
            }

            if self.matrix.all_finished() {
                info!("All steps are finished");
                return Ok(WaitOutcome::Completed);
            }

            let sweeps_exhausted = options.max_sweeps.is_some_and(|max| sweeps >= max);
            let deadline_passed = options.deadline.is_some_and(|d| Instant::now() >= d);
            if sweeps_exhausted || deadline_passed {
                let unfinished = self.unfinished_names();
                warn!(unfinished = unfinished.len(), sweeps, "Stop waiting, limit reached");
                return Ok(WaitOutcome::LimitReached { unfinished });
            }

            tokio::time::sleep(options.poll_interval).await;
        }
    }

    fn unfinished_names(&self) -> Vec<String> {
        self.matrix
            .pending()
            .into_iter()
            .map(|(g, l)| self.leaves[g][l].name.clone())
            .collect()
    }

    /// One pass over all unfinished leaves
    async fn sweep(&mut self) {
        let pending = self.matrix.pending();
        if pending.is_empty() {
            return;
        }
        let names: Vec<String> = pending
            .iter()
            .map(|&(g, l)| self.leaves[g][l].name.clone())
            .collect();

        let steps = match self.engine.query_steps(&names).await {
            Ok(steps) => steps,
            Err(e) => {
                warn!(
                    steps = names.len(),
                    error = %format!("{:#}", e),
                    "Query steps failed, will retry"
                );
                return;
            }
        };

        for ((g, l), step) in pending.into_iter().zip(steps) {
            if let Some(step) = step.filter(|s| s.phase.is_terminal()) {
                self.finish_leaf(g, l, step).await;
            }
        }
    }

    async fn finish_leaf(&mut self, group: usize, leaf: usize, step: RemoteStep) {
        if !self.matrix.finish(group, leaf) {
            return;
        }
        let target = self.leaves[group][leaf].clone();

        info!(
            step = %target.name,
            remaining = self.matrix.remaining(),
            "{} is finished, remaining {} jobs",
            target.name,
            self.matrix.remaining()
        );

        if step.phase != StepPhase::Succeeded {
            warn!(
                step = %target.name,
                phase = %step.phase,
                dashboard = %self.engine.dashboard_url(),
                "Step is not succeeded, please check on the dashboard"
            );
        }

        if let Err(e) = self.prepare_folder(&target) {
            let e = SuiteError::SaveFolder {
                step: target.name.clone(),
                path: target.save.folder().display().to_string(),
                details: format!("{:#}", e),
            };
            error!(error = %e, "Save folder is not usable, step results are missing");
            return;
        }

        let Some(artifact) = step.output else {
            let e = SuiteError::MissingArtifact { step: target.name };
            warn!(error = %e, "Nothing to download");
            return;
        };

        match self.engine.download(&artifact, &target.save.save_path).await {
            Ok(path) => info!(step = %target.name, path = %path.display(), "Downloaded outputs"),
            Err(e) => {
                let e = SuiteError::Download {
                    step: target.name.clone(),
                    details: format!("{:#}", e),
                };
                error!(error = %e, "Download failed, step results are missing");
            }
        }
    }

    /// Back up a previous run once per root, then fill sub folders in place
    fn prepare_folder(&mut self, target: &LeafStep) -> Result<()> {
        if self.roots.insert(target.save.save_path.clone()) {
            make_save_folder(&target.save.save_path, self.ctx.override_existing)?;
        }
        let folder = target.save.folder();
        if !self.folders.contains(&folder) {
            fs::create_dir_all(&folder)?;
            write_param_snapshot(
                &folder,
                &self.ctx.param_file_name,
                &self.ctx.document,
                self.ctx.override_existing,
            )?;
            self.folders.insert(folder);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SaveTarget;

    fn leaves() -> Vec<Vec<LeafStep>> {
        let leaf = |name: &str| LeafStep {
            name: name.to_string(),
            save: SaveTarget {
                save_path: PathBuf::from("r"),
                sub_path: String::new(),
            },
        };
        vec![vec![leaf("a"), leaf("b")], vec![], vec![leaf("c")]]
    }

    #[test]
    fn matrix_finishes_once() {
        let mut m = CompletionMatrix::new(&leaves());
        assert_eq!(m.remaining(), 3);
        assert!(m.finish(0, 1));
        assert!(!m.finish(0, 1));
        assert!(!m.finish(5, 0));
        assert!(m.is_finished(0, 1));
        assert_eq!(m.pending(), vec![(0, 0), (2, 0)]);
    }

    #[test]
    fn empty_matrix_is_finished() {
        assert!(CompletionMatrix::new(&[]).all_finished());
        assert!(CompletionMatrix::new(&[vec![]]).all_finished());
    }

    #[test]
    fn default_options() {
        let options = WaitOptions::default();
        assert_eq!(options.poll_interval, Duration::from_secs(4));
        assert!(options.max_sweeps.is_none());
        assert!(options.deadline.is_none());
        assert!(options.with_timeout(Duration::from_secs(1)).deadline.is_some());
    }
}
