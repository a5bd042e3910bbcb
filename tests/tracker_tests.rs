//! # Completion tracker tests
//!
//! Drive the wait loop against `MockEngine` with scripted step phases and
//! workflow statuses; no sleeping between sweeps.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dftsuite::config::{RunContext, RunOptions};
use dftsuite::engine::{MockEngine, StepPhase};
use dftsuite::graph::{LeafStep, SaveTarget};
use dftsuite::tracker::{CompletionTracker, WaitOptions, WaitOutcome};
use serde_json::json;
use tempfile::TempDir;

// ============================================================================
// TEST HELPERS
// ============================================================================

fn context(dir: &Path) -> RunContext {
    let options = RunOptions {
        param: dir.join("job.json"),
        save: Some(dir.join("result")),
        override_existing: false,
        debug: false,
    };
    RunContext::from_document(
        json!({"run_dft": {"image": "abacus"}, "config": {"dflow_token": "secret"}}),
        &options,
    )
}

fn leaf(name: &str, save_path: &Path, sub_path: &str) -> LeafStep {
    LeafStep {
        name: name.to_string(),
        save: SaveTarget {
            save_path: save_path.to_path_buf(),
            sub_path: sub_path.to_string(),
        },
    }
}

fn fast() -> WaitOptions {
    WaitOptions {
        poll_interval: Duration::ZERO,
        ..Default::default()
    }
}

fn slow_phases() -> Vec<StepPhase> {
    vec![StepPhase::Pending, StepPhase::Pending, StepPhase::Succeeded]
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test]
async fn two_by_two_finishes_each_leaf_once() {
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path());
    let g0 = dir.path().join("g0");
    let g1 = dir.path().join("g1");
    let leaves = vec![
        vec![leaf("a", &g0, ""), leaf("b", &g0, "")],
        vec![leaf("c", &g1, "x"), leaf("d", &g1, "y")],
    ];

    let engine = ["a", "b", "c", "d"]
        .iter()
        .fold(MockEngine::new(), |e, name| e.with_step(*name, slow_phases()));

    let mut tracker = CompletionTracker::new(&engine, &ctx, leaves);
    let outcome = tracker.wait(&fast()).await.unwrap();

    assert_eq!(outcome, WaitOutcome::Completed);
    assert!(tracker.matrix().all_finished());

    // finished leaves are never queried again
    let queries = engine.step_queries();
    for name in ["a", "b", "c", "d"] {
        assert_eq!(queries.iter().filter(|q| *q == name).count(), 3, "{}", name);
    }
    assert_eq!(engine.status_queries(), 3);

    let downloads = engine.downloads();
    assert_eq!(downloads.len(), 4);
    assert!(downloads.contains(&("a".to_string(), g0.clone())));
    assert!(downloads.contains(&("d".to_string(), g1.clone())));

    // the shared folder got exactly one snapshot
    assert!(g0.join("job.json").exists());
    assert!(!g0.join("job.json.1").exists());
    assert!(g1.join("x/job.json").exists());
    assert!(g1.join("y/job.json").exists());

    let snapshot = fs::read_to_string(g0.join("job.json")).unwrap();
    assert!(!snapshot.contains("secret"));
}

#[tokio::test]
async fn workflow_failure_stops_the_loop() {
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path());
    let save = dir.path().join("r");
    let leaves = vec![vec![leaf("a", &save, ""), leaf("b", &save, "")]];

    let engine = MockEngine::new()
        .with_step("a", vec![StepPhase::Running, StepPhase::Failed])
        .with_step("b", vec![StepPhase::Running])
        .with_statuses(&["Running", "Failed"]);

    let mut tracker = CompletionTracker::new(&engine, &ctx, leaves);
    let outcome = tracker.wait(&fast()).await.unwrap();

    assert_eq!(outcome, WaitOutcome::WorkflowFailed);
    assert_eq!(engine.status_queries(), 2);
    // the failed step finished on sweep 2 and was still downloaded
    assert_eq!(engine.downloads().len(), 1);
    assert!(tracker.matrix().is_finished(0, 0));
    assert!(!tracker.matrix().is_finished(0, 1));
}

#[tokio::test]
async fn download_failure_does_not_block_other_leaves() {
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path());
    let save = dir.path().join("r");
    let leaves = vec![vec![leaf("bad", &save, ""), leaf("good", &save, "")]];

    let engine = MockEngine::new()
        .with_step("bad", vec![StepPhase::Succeeded])
        .with_step("good", vec![StepPhase::Succeeded])
        .with_failing_download("bad");

    let mut tracker = CompletionTracker::new(&engine, &ctx, leaves);
    let outcome = tracker.wait(&fast()).await.unwrap();

    assert_eq!(outcome, WaitOutcome::Completed);
    assert!(tracker.matrix().is_finished(0, 0));
    assert!(tracker.matrix().is_finished(0, 1));
    assert_eq!(engine.downloads(), vec![("good".to_string(), save.clone())]);
    assert_eq!(fs::read_to_string(save.join("good.log")).unwrap(), "good-node");
    assert!(!save.join("bad.log").exists());
}

#[tokio::test]
async fn unknown_steps_stay_pending_until_the_limit() {
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path());
    let save = dir.path().join("r");
    let leaves = vec![vec![leaf("never", &save, ""), leaf("done", &save, "")]];

    let engine = MockEngine::new().with_step("done", vec![StepPhase::Skipped]);
    let options = WaitOptions {
        max_sweeps: Some(2),
        ..fast()
    };

    let mut tracker = CompletionTracker::new(&engine, &ctx, leaves);
    let outcome = tracker.wait(&options).await.unwrap();

    assert_eq!(
        outcome,
        WaitOutcome::LimitReached {
            unfinished: vec!["never".to_string()]
        }
    );
    assert_eq!(engine.status_queries(), 2);
}

#[tokio::test]
async fn existing_results_are_backed_up() {
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path());
    let save = dir.path().join("r");
    fs::create_dir_all(&save).unwrap();
    fs::write(save.join("old.log"), "previous run").unwrap();

    let engine = MockEngine::new().with_step("a", vec![StepPhase::Succeeded]);
    let mut tracker = CompletionTracker::new(&engine, &ctx, vec![vec![leaf("a", &save, "")]]);
    tracker.wait(&fast()).await.unwrap();

    let backup = PathBuf::from(format!("{}.bk1", save.display()));
    assert!(backup.join("old.log").exists());
    assert!(!save.join("old.log").exists());
    assert!(save.join("a.log").exists());
}

#[tokio::test]
async fn unusable_save_folder_only_costs_its_own_leaf() {
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path());
    let blocked = dir.path().join("blocked");
    fs::write(&blocked, "a file where a folder should be").unwrap();
    let open = dir.path().join("open");
    let leaves = vec![vec![leaf("a", &blocked, "")], vec![leaf("b", &open, "")]];

    let engine = MockEngine::new()
        .with_step("a", vec![StepPhase::Succeeded])
        .with_step("b", vec![StepPhase::Succeeded]);

    let mut tracker = CompletionTracker::new(&engine, &ctx, leaves);
    let outcome = tracker.wait(&fast()).await.unwrap();

    assert_eq!(outcome, WaitOutcome::Completed);
    assert!(tracker.matrix().is_finished(0, 0));
    assert!(tracker.matrix().is_finished(1, 0));
    assert_eq!(engine.downloads(), vec![("b".to_string(), open.clone())]);
    assert!(open.join("b.log").exists());
    assert!(open.join("job.json").exists());
    assert!(blocked.is_file());
}

#[tokio::test]
async fn artifacts_are_unpacked_into_the_save_folder() {
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path());
    let save = dir.path().join("r");

    let engine = MockEngine::new()
        .with_step("a", vec![StepPhase::Running, StepPhase::Succeeded])
        .with_output(
            "a",
            &[
                ("metrics.json", r#"{"Si": {"energy_diff": 0.0001}}"#),
                ("Si/OUT.ABACUS/running_scf.log", "charge density convergence is achieved"),
            ],
        );

    let mut tracker = CompletionTracker::new(&engine, &ctx, vec![vec![leaf("a", &save, "v1")]]);
    assert_eq!(tracker.wait(&fast()).await.unwrap(), WaitOutcome::Completed);

    // outputs land in the root, the snapshot in the sub folder
    let metrics = fs::read_to_string(save.join("metrics.json")).unwrap();
    assert!(metrics.contains("energy_diff"));
    assert!(save.join("Si/OUT.ABACUS/running_scf.log").is_file());
    assert!(save.join("v1/job.json").is_file());
    assert!(!save.join("outputs").exists());
}

#[tokio::test]
async fn empty_plan_completes_immediately() {
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path());
    let engine = MockEngine::new();
    let mut tracker = CompletionTracker::new(&engine, &ctx, vec![vec![]]);
    assert_eq!(tracker.wait(&fast()).await.unwrap(), WaitOutcome::Completed);
    assert!(engine.step_queries().is_empty());
}
