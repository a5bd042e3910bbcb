//! Step graph builder
//!
//! Compiles a [`PhaseSet`] into a chain of at most three phase groups
//! (prepare runs locally) and binds each to exactly one input source:
//!
//! | Phase | Input |
//! |-------|-------|
//! | pre   | prepared examples, else its own `example` patterns |
//! | run   | pre output, else prepared examples, else own patterns |
//! | post  | run output, else prepared examples, else own patterns |
//!
//! Nothing here is fatal: a phase that ends up with no work is logged and
//! treated as absent.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use super::{
    ArtifactRef, ExecutionPlan, InputSource, LeafStep, PhaseKind, PhaseOutput, PhaseSteps,
    PlannedJob, SaveTarget, StepGraph, StepNode,
};
use crate::config::{clean_save_path, resolve_in};
use crate::job::JobRecord;
use crate::phase::{select_phases, PhaseSet, PrepareConfig, StepConfig};
use crate::prepare::{resolve_examples, ExamplePreparer};

/// Characters not allowed in remote step names
static INVALID_NAME_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9-]+").unwrap());

/// Lowercase, `[a-z0-9-]` only, no leading/trailing dashes
pub fn sanitize_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let cleaned = INVALID_NAME_CHARS.replace_all(&lowered, "-");
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "job".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Builds step graphs for job records
pub struct StepGraphBuilder<'a> {
    preparer: &'a dyn ExamplePreparer,
    base_dir: &'a Path,
}

impl<'a> StepGraphBuilder<'a> {
    pub fn new(preparer: &'a dyn ExamplePreparer, base_dir: &'a Path) -> Self {
        Self { preparer, base_dir }
    }

    /// Build the plan for several job records, skipping those with no steps
    pub fn build_plan(&self, jobs: &[JobRecord], default_save: &Path) -> ExecutionPlan {
        let jobs = jobs
            .iter()
            .filter_map(|job| self.build_job(job, default_save))
            .collect();
        ExecutionPlan { jobs }
    }

    /// Build the graph and leaf index of one job record
    pub fn build_job(&self, job: &JobRecord, default_save: &Path) -> Option<PlannedJob> {
        info!(group = %job.group_name, "Building steps");
        let phases = select_phases(job);
        let graph = self.build_graph(&job.group_name, &phases)?;

        let save_path = job
            .save_path
            .as_deref()
            .and_then(clean_save_path)
            .map(|p| resolve_in(self.base_dir, Path::new(p)))
            .unwrap_or_else(|| default_save.to_path_buf());

        let leaves = graph
            .final_steps()
            .iter()
            .map(|step| LeafStep {
                name: step.name.clone(),
                save: SaveTarget {
                    save_path: save_path.clone(),
                    sub_path: step.sub_path.clone(),
                },
            })
            .collect();

        info!(group = %job.group_name, steps = graph.step_count(), "Complete the preparing");
        Some(PlannedJob { graph, leaves })
    }

    /// Compile the active phases into a chain; `None` when nothing is produced
    pub fn build_graph(&self, group: &str, phases: &PhaseSet) -> Option<StepGraph> {
        let prefix = sanitize_name(group);
        let raw_examples = phases
            .prepare
            .active()
            .and_then(|config| self.prepare_examples(config));

        let raw_input = || match &raw_examples {
            Some(paths) => InputSource::FromRawExamples(paths.clone()),
            None => InputSource::Unspecified,
        };

        let mut chain: Vec<PhaseSteps> = Vec::new();

        let mut pre_output: Option<PhaseOutput> = None;
        if let Some(pre) = phases.pre_dft.active() {
            let gather = phases.run_dft.is_active() || phases.post_dft.is_active();
            match self.phase_steps(&prefix, PhaseKind::PreDft, &[pre], raw_input(), gather) {
                Some(steps) => {
                    pre_output = steps.output();
                    chain.push(steps);
                }
                None => warn!(group, "has defined pre_dft, but no examples matched, skip it"),
            }
        }

        let mut run_output: Option<PhaseOutput> = None;
        if let Some(runs) = phases.run_dft.active() {
            let gather = phases.post_dft.is_active();
            let input = match &pre_output {
                Some(out) => InputSource::FromPredecessor(out.clone()),
                None => raw_input(),
            };
            let entries: Vec<&StepConfig> = runs.iter().collect();
            match self.phase_steps(&prefix, PhaseKind::RunDft, &entries, input, gather) {
                Some(steps) => {
                    run_output = steps.output();
                    chain.push(steps);
                }
                None => warn!(group, "has defined run_dft, but no examples matched, skip it"),
            }
        }

        if let Some(post) = phases.post_dft.active() {
            let input = match run_output {
                Some(out) => InputSource::FromPredecessor(out),
                None => raw_input(),
            };
            match self.phase_steps(&prefix, PhaseKind::PostDft, &[post], input, false) {
                Some(steps) => chain.push(steps),
                None => warn!(group, "has defined post_dft, but no examples matched, skip it"),
            }
        }

        if chain.is_empty() {
            debug!(group, "no step produced");
            return None;
        }
        Some(StepGraph {
            name: prefix,
            phases: chain,
        })
    }

    /// Prepared leaf examples, `None` when nothing survived the check
    fn prepare_examples(&self, config: &PrepareConfig) -> Option<Vec<String>> {
        let prepared = match self.preparer.prepare(config) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(error = %e, "prepare failed, continuing without prepared examples");
                return None;
            }
        };

        let paths: Vec<String> = prepared
            .iter()
            .flat_map(|example| example.candidates.iter())
            .filter(|candidate| self.preparer.check(candidate))
            .map(|candidate| candidate.path.clone())
            .collect();

        if paths.is_empty() {
            warn!("defined prepare, but no examples matched, skip it");
            None
        } else {
            info!(count = paths.len(), "prepared examples");
            Some(paths)
        }
    }

    /// Examples an entry works on; `Some(vec![])` marks a standalone step
    fn entry_examples(&self, config: &StepConfig, input: &InputSource) -> Option<Vec<String>> {
        match input {
            InputSource::FromPredecessor(out) if !out.examples.is_empty() => {
                Some(out.examples.clone())
            }
            // Upstream examples are unknown locally: take the names as given.
            InputSource::FromPredecessor(_) => Some(config.example.clone()),
            InputSource::FromRawExamples(paths) => Some(paths.clone()),
            InputSource::Unspecified if config.example.is_empty() => Some(Vec::new()),
            InputSource::Unspecified => match resolve_examples(self.base_dir, &config.example) {
                Ok(found) if found.is_empty() => None,
                Ok(found) => Some(found),
                Err(e) => {
                    warn!(error = %e, "invalid example pattern, entry skipped");
                    None
                }
            },
        }
    }

    fn phase_steps(
        &self,
        prefix: &str,
        phase: PhaseKind,
        entries: &[&StepConfig],
        input: InputSource,
        gather: bool,
    ) -> Option<PhaseSteps> {
        let multi = entries.len() > 1;
        let mut steps = Vec::new();

        for (index, config) in entries.iter().enumerate() {
            let Some(examples) = self.entry_examples(config, &input) else {
                continue;
            };
            if examples.is_empty() && phase == PhaseKind::RunDft {
                warn!(entry = index, "run_dft entry has no examples, skipped");
                continue;
            }
            if config.image.is_empty() {
                warn!(phase = phase.label(), entry = index, "no image defined for step");
            }

            let step_prefix = if multi {
                format!("{}-{}{}", prefix, phase.label(), index)
            } else {
                format!("{}-{}", prefix, phase.label())
            };

            for (n, chunk) in chunk_examples(examples, group_size(config, phase))
                .into_iter()
                .enumerate()
            {
                let name = format!("{}-{}", step_prefix, n);
                steps.push(StepNode {
                    output: ArtifactRef::outputs(&name),
                    name,
                    phase,
                    image: config.image.clone(),
                    command: config.command.clone(),
                    examples: chunk,
                    extra_files: config.extra_files.clone(),
                    executor: config.executor.clone(),
                    sub_path: config.sub_save_path.trim_matches('/').to_string(),
                });
            }
        }

        if steps.is_empty() {
            return None;
        }
        debug!(phase = phase.label(), steps = steps.len(), gather, "phase steps built");
        Some(PhaseSteps {
            phase,
            input,
            gather,
            steps,
        })
    }
}

fn group_size(config: &StepConfig, phase: PhaseKind) -> usize {
    config.group_size.unwrap_or(match phase {
        PhaseKind::RunDft => 1,
        PhaseKind::PreDft | PhaseKind::PostDft => 0,
    })
}

/// Split examples into leaves; size 0 or no examples yields a single leaf
fn chunk_examples(examples: Vec<String>, size: usize) -> Vec<Vec<String>> {
    if size == 0 || examples.is_empty() {
        return vec![examples];
    }
    examples.chunks(size).map(<[String]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::job::parse_job;
    use crate::prepare::{Candidate, PreparedExample};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    /// Preparer returning fixed candidates; names starting with "bad" fail the check
    struct FixedPreparer(Vec<&'static str>);

    impl ExamplePreparer for FixedPreparer {
        fn prepare(&self, _config: &PrepareConfig) -> Result<Vec<PreparedExample>> {
            Ok(vec![PreparedExample {
                source: "src".to_string(),
                candidates: self
                    .0
                    .iter()
                    .map(|p| Candidate {
                        path: p.to_string(),
                        setting: BTreeMap::new(),
                    })
                    .collect(),
            }])
        }

        fn check(&self, candidate: &Candidate) -> bool {
            !candidate.path.starts_with("bad")
        }
    }

    fn build(doc: Value, prepared: Vec<&'static str>) -> Option<StepGraph> {
        let preparer = FixedPreparer(prepared);
        let builder = StepGraphBuilder::new(&preparer, Path::new("."));
        let job = parse_job(&doc, None);
        builder.build_graph(&job.group_name, &select_phases(&job))
    }

    fn prepare() -> Value {
        json!({"example_template": ["ex/*"]})
    }

    #[test]
    fn sanitize() {
        assert_eq!(sanitize_name("My_Group.1"), "my-group-1");
        assert_eq!(sanitize_name("--"), "job");
        assert_eq!(sanitize_name("s-foo123"), "s-foo123");
    }

    #[test]
    fn all_disabled_yields_no_graph() {
        assert!(build(json!({}), vec!["a"]).is_none());
        assert!(build(json!({"run_dft": [{"ifrun": false}]}), vec!["a"]).is_none());
    }

    #[test]
    fn prepare_only_yields_no_graph() {
        assert!(build(json!({"prepare": prepare()}), vec!["a"]).is_none());
    }

    #[test]
    fn run_leaves_one_per_example() {
        let graph = build(
            json!({"prepare": prepare(), "run_dft": {"image": "abacus", "command": "abacus"}}),
            vec!["a", "bad1", "b"],
        )
        .unwrap();
        let run = graph.phase(PhaseKind::RunDft).unwrap();
        let names: Vec<_> = run.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["abacustesting-rundft-0", "abacustesting-rundft-1"]);
        assert_eq!(
            run.input,
            InputSource::FromRawExamples(vec!["a".to_string(), "b".to_string()])
        );
        assert!(!run.gather);
    }

    #[test]
    fn gather_flags() {
        let doc = json!({
            "prepare": prepare(),
            "pre_dft": {"image": "py"},
            "run_dft": {"image": "abacus"},
            "post_dft": {"image": "py"}
        });
        let graph = build(doc, vec!["a"]).unwrap();
        assert!(graph.phase(PhaseKind::PreDft).unwrap().gather);
        assert!(graph.phase(PhaseKind::RunDft).unwrap().gather);
        assert!(!graph.phase(PhaseKind::PostDft).unwrap().gather);

        let graph = build(json!({"prepare": prepare(), "pre_dft": {}, "run_dft": {}}), vec!["a"])
            .unwrap();
        assert!(graph.phase(PhaseKind::PreDft).unwrap().gather);
        assert!(!graph.phase(PhaseKind::RunDft).unwrap().gather);

        let graph = build(json!({"prepare": prepare(), "pre_dft": {}}), vec!["a"]).unwrap();
        assert!(!graph.phase(PhaseKind::PreDft).unwrap().gather);
    }

    #[test]
    fn run_consumes_pre_output() {
        let graph = build(
            json!({"prepare": prepare(), "pre_dft": {}, "run_dft": {}}),
            vec!["a", "b"],
        )
        .unwrap();
        let run = graph.phase(PhaseKind::RunDft).unwrap();
        match &run.input {
            InputSource::FromPredecessor(out) => {
                assert_eq!(out.phase, PhaseKind::PreDft);
                assert_eq!(out.artifacts, vec![ArtifactRef::outputs("abacustesting-predft-0")]);
                assert_eq!(out.examples, ["a", "b"]);
            }
            other => panic!("unexpected input {:?}", other),
        }
        assert_eq!(run.steps.len(), 2);
    }

    #[test]
    fn post_prefers_run_output() {
        let graph = build(
            json!({"prepare": prepare(), "run_dft": {}, "post_dft": {}}),
            vec!["a", "b"],
        )
        .unwrap();
        let post = graph.phase(PhaseKind::PostDft).unwrap();
        match &post.input {
            InputSource::FromPredecessor(out) => {
                assert_eq!(out.phase, PhaseKind::RunDft);
                assert_eq!(out.artifacts.len(), 2);
            }
            other => panic!("unexpected input {:?}", other),
        }
        assert_eq!(post.steps.len(), 1);
        assert_eq!(graph.final_steps()[0].name, "abacustesting-postdft-0");
    }

    #[test]
    fn post_falls_back_to_raw_examples() {
        let graph = build(
            json!({"prepare": prepare(), "run_dft": {"ifrun": false}, "post_dft": {}}),
            vec!["a"],
        )
        .unwrap();
        let post = graph.phase(PhaseKind::PostDft).unwrap();
        assert_eq!(post.input, InputSource::FromRawExamples(vec!["a".to_string()]));
        assert_eq!(graph.phases.len(), 1);
    }

    #[test]
    fn post_without_upstream_is_standalone() {
        let graph = build(json!({"post_dft": {"command": "collect"}}), vec![]).unwrap();
        let post = graph.phase(PhaseKind::PostDft).unwrap();
        assert_eq!(post.input, InputSource::Unspecified);
        assert_eq!(post.steps.len(), 1);
        assert!(post.steps[0].examples.is_empty());
    }

    #[test]
    fn run_with_nothing_matched_is_treated_as_absent() {
        let graph = build(
            json!({"prepare": prepare(), "run_dft": {}, "post_dft": {}}),
            vec!["bad-only"],
        )
        .unwrap();
        assert!(graph.phase(PhaseKind::RunDft).is_none());
        let post = graph.phase(PhaseKind::PostDft).unwrap();
        assert_eq!(post.input, InputSource::Unspecified);
    }

    #[test]
    fn multiple_run_entries_get_indexed_names_and_sub_paths() {
        let graph = build(
            json!({
                "bohrium_group_name": "Bench",
                "prepare": prepare(),
                "run_dft": [
                    {"image": "v1", "sub_save_path": "v1"},
                    {"ifrun": false},
                    {"image": "v2", "sub_save_path": "v2/", "group_size": 2}
                ]
            }),
            vec!["a", "b", "c"],
        )
        .unwrap();
        let names: Vec<_> = graph.final_steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "bench-rundft0-0",
                "bench-rundft0-1",
                "bench-rundft0-2",
                "bench-rundft1-0",
                "bench-rundft1-1"
            ]
        );
        assert_eq!(graph.final_steps()[4].sub_path, "v2");
        assert_eq!(graph.final_steps()[4].examples, ["c"]);
    }

    #[test]
    fn chunking() {
        let ex = |n: usize| (0..n).map(|i| i.to_string()).collect::<Vec<_>>();
        assert_eq!(chunk_examples(ex(5), 2).len(), 3);
        assert_eq!(chunk_examples(ex(5), 0).len(), 1);
        assert_eq!(chunk_examples(vec![], 3), vec![Vec::<String>::new()]);
    }

    #[test]
    fn plan_keeps_leaf_index_aligned() {
        let preparer = FixedPreparer(vec!["a", "b"]);
        let builder = StepGraphBuilder::new(&preparer, Path::new("."));
        let jobs = vec![
            parse_job(&json!({"prepare": prepare(), "run_dft": {}, "save_path": "out/"}), None),
            parse_job(&json!({}), None),
        ];
        let plan = builder.build_plan(&jobs, Path::new("result"));
        assert_eq!(plan.jobs.len(), 1);
        let job = &plan.jobs[0];
        for (leaf, step) in job.leaves.iter().zip(job.graph.final_steps()) {
            assert_eq!(leaf.name, step.name);
            assert_eq!(leaf.save.save_path, PathBuf::from("out"));
            assert_eq!(leaf.save.sub_path, "");
        }
    }
}
