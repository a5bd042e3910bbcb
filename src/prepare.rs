//! Example preparation
//!
//! Expands the prepare phase into concrete example folders. Each example
//! matched by `example_template` is copied into the work folder; when
//! `mix_input` is set, one sub-example is written per combination of values
//! with the parameter file rewritten accordingly.
//!
//! The work folder mirrors the example's path under the base dir, so
//! `a/Si` and `b/Si` become `prepared/a/Si` and `prepared/b/Si`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Result, SuiteError};
use crate::phase::PrepareConfig;

/// Folder (under the base dir) prepared examples are written to
pub const PREPARED_DIR: &str = "prepared";

/// One candidate leaf example produced by the prepare phase
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Path relative to the base dir
    pub path: String,
    /// The mix_input values applied to this candidate
    pub setting: BTreeMap<String, Value>,
}

/// All candidates derived from one source example
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedExample {
    pub source: String,
    pub candidates: Vec<Candidate>,
}

/// Expands a prepare configuration into example folders
pub trait ExamplePreparer {
    /// Enumerate every (example, sub-example) candidate
    fn prepare(&self, config: &PrepareConfig) -> Result<Vec<PreparedExample>>;

    /// Whether a candidate is usable as a leaf example
    fn check(&self, candidate: &Candidate) -> bool;
}

/// Prepares examples on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalPreparer {
    base_dir: PathBuf,
    work_dir: PathBuf,
}

impl LocalPreparer {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let work_dir = base_dir.join(PREPARED_DIR);
        Self { base_dir, work_dir }
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.base_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Work folder of a source example
    fn work_folder(&self, source: &Path) -> PathBuf {
        let relative = source.strip_prefix(&self.base_dir).unwrap_or(source);
        let mut folder = self.work_dir.clone();
        for component in relative.components() {
            if let Component::Normal(part) = component {
                folder.push(part);
            }
        }
        if folder == self.work_dir {
            folder.push("example");
        }
        folder
    }

    fn materialize(
        &self,
        source: &Path,
        target: &Path,
        config: &PrepareConfig,
        setting: &BTreeMap<String, Value>,
    ) -> Result<()> {
        if target.exists() {
            fs::remove_dir_all(target)?;
        }
        copy_dir(source, target)?;

        for extra in &config.extra_files {
            let from = self.base_dir.join(extra);
            match from.file_name() {
                Some(name) if from.is_file() => {
                    fs::copy(&from, target.join(name))?;
                }
                _ => warn!(file = %from.display(), "extra file not found, skipped"),
            }
        }

        if !setting.is_empty() {
            let input = target.join(&config.input_template);
            let original = fs::read_to_string(&input).unwrap_or_default();
            fs::write(&input, rewrite_input(&original, setting))?;
        }
        Ok(())
    }
}

impl ExamplePreparer for LocalPreparer {
    fn prepare(&self, config: &PrepareConfig) -> Result<Vec<PreparedExample>> {
        let sources = glob_dirs(&self.base_dir, &config.example_template)?;
        let combos = combinations(&config.mix_input);
        let mut prepared = Vec::with_capacity(sources.len());

        for source in sources {
            let root = self.work_folder(&source);

            let mut candidates = Vec::new();
            if combos.is_empty() {
                self.materialize(&source, &root, config, &BTreeMap::new())?;
                candidates.push(Candidate {
                    path: self.relative(&root),
                    setting: BTreeMap::new(),
                });
            } else {
                for (index, setting) in combos.iter().enumerate() {
                    let target = root.join(format!("{:03}", index));
                    self.materialize(&source, &target, config, setting)?;
                    candidates.push(Candidate {
                        path: self.relative(&target),
                        setting: setting.clone(),
                    });
                }
            }

            let source = self.relative(&source);
            debug!(example = %source, count = candidates.len(), "prepared example");
            prepared.push(PreparedExample { source, candidates });
        }

        Ok(prepared)
    }

    fn check(&self, candidate: &Candidate) -> bool {
        let path = self.base_dir.join(&candidate.path);
        fs::read_dir(&path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }
}

/// Cartesian product of mix_input values, keys in sorted order.
///
/// Keys with no candidate values are ignored.
pub fn combinations(mix: &BTreeMap<String, Vec<Value>>) -> Vec<BTreeMap<String, Value>> {
    let mut combos: Vec<BTreeMap<String, Value>> = Vec::new();
    for (key, values) in mix {
        if values.is_empty() {
            warn!(key = %key, "mix_input key has no values, ignored");
            continue;
        }
        combos = if combos.is_empty() {
            values
                .iter()
                .map(|v| BTreeMap::from([(key.clone(), v.clone())]))
                .collect()
        } else {
            combos
                .iter()
                .flat_map(|base| {
                    values.iter().map(move |v| {
                        let mut next = base.clone();
                        next.insert(key.clone(), v.clone());
                        next
                    })
                })
                .collect()
        };
    }
    combos
}

/// Rewrite `key value` lines of a parameter file, appending missing keys
pub fn rewrite_input(original: &str, setting: &BTreeMap<String, Value>) -> String {
    let mut pending: BTreeSet<&str> = setting.keys().map(String::as_str).collect();
    let mut lines: Vec<String> = Vec::new();

    for line in original.lines() {
        let key = line.split_whitespace().next().unwrap_or("");
        match setting.get_key_value(key) {
            Some((k, v)) => {
                lines.push(format!("{} {}", k, render_value(v)));
                pending.remove(k.as_str());
            }
            None => lines.push(line.to_string()),
        }
    }

    if lines.is_empty() {
        lines.push("INPUT_PARAMETERS".to_string());
    }
    for key in pending {
        lines.push(format!("{} {}", key, render_value(&setting[key])));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}

fn copy_dir(source: &Path, target: &Path) -> Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| SuiteError::Prepare {
            details: e.to_string(),
        })?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let dest = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Expand glob patterns (relative to `base_dir`) into sorted, unique paths
pub fn glob_paths(base_dir: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut found = BTreeSet::new();
    for pattern in patterns {
        let full = base_dir.join(pattern);
        let full = full.to_string_lossy();
        let paths = glob::glob(&full).map_err(|e| SuiteError::Pattern {
            pattern: pattern.clone(),
            details: e.to_string(),
        })?;
        for path in paths.flatten() {
            found.insert(path);
        }
    }
    Ok(found.into_iter().collect())
}

fn glob_dirs(base_dir: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    Ok(glob_paths(base_dir, patterns)?
        .into_iter()
        .filter(|p| p.is_dir())
        .collect())
}

/// Resolve a step's own example patterns to base-relative identifiers
pub fn resolve_examples(base_dir: &Path, patterns: &[String]) -> Result<Vec<String>> {
    Ok(glob_paths(base_dir, patterns)?
        .into_iter()
        .map(|p| {
            p.strip_prefix(base_dir)
                .unwrap_or(&p)
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn prepare_config(value: Value) -> PrepareConfig {
        serde_json::from_value(value).unwrap()
    }

    fn make_example(root: &Path, name: &str) {
        let dir = root.join("examples").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("INPUT"), "INPUT_PARAMETERS\necutwfc 50\nbasis_type pw\n").unwrap();
        fs::write(dir.join("STRU"), "ATOMIC_SPECIES\n").unwrap();
    }

    #[test]
    fn combinations_are_a_cartesian_product() {
        let mix = BTreeMap::from([
            ("ecutwfc".to_string(), vec![json!(50), json!(60)]),
            ("kspacing".to_string(), vec![json!(0.1), json!(0.2), json!(0.3)]),
        ]);
        let combos = combinations(&mix);
        assert_eq!(combos.len(), 6);
        assert_eq!(combos[0]["ecutwfc"], json!(50));
        assert_eq!(combos[0]["kspacing"], json!(0.1));
        assert_eq!(combos[5]["ecutwfc"], json!(60));
        assert_eq!(combos[5]["kspacing"], json!(0.3));
    }

    #[test]
    fn empty_value_lists_are_ignored() {
        let mix = BTreeMap::from([("a".to_string(), vec![]), ("b".to_string(), vec![json!(1)])]);
        assert_eq!(combinations(&mix).len(), 1);
    }

    #[test]
    fn rewrite_replaces_and_appends() {
        let setting = BTreeMap::from([
            ("ecutwfc".to_string(), json!(80)),
            ("kspacing".to_string(), json!([0.1, 0.1, 0.2])),
        ]);
        let out = rewrite_input("INPUT_PARAMETERS\necutwfc 50\nbasis_type pw\n", &setting);
        assert_eq!(
            out,
            "INPUT_PARAMETERS\necutwfc 80\nbasis_type pw\nkspacing 0.1 0.1 0.2\n"
        );
    }

    #[test]
    fn prepare_without_mix_copies_each_example() {
        let tmp = TempDir::new().unwrap();
        make_example(tmp.path(), "Si");
        make_example(tmp.path(), "Fe");

        let preparer = LocalPreparer::new(tmp.path());
        let config = prepare_config(json!({"example_template": ["examples/*"]}));
        let prepared = preparer.prepare(&config).unwrap();

        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[0].candidates[0].path, "prepared/examples/Fe");
        assert!(preparer.check(&prepared[0].candidates[0]));
        assert!(tmp.path().join("prepared/examples/Si/STRU").is_file());
    }

    #[test]
    fn prepare_with_mix_writes_sub_examples() {
        let tmp = TempDir::new().unwrap();
        make_example(tmp.path(), "Si");

        let preparer = LocalPreparer::new(tmp.path());
        let config = prepare_config(json!({
            "example_template": ["examples/Si"],
            "mix_input": {"ecutwfc": [60, 70]}
        }));
        let prepared = preparer.prepare(&config).unwrap();
        let paths: Vec<_> = prepared[0].candidates.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, ["prepared/examples/Si/000", "prepared/examples/Si/001"]);

        let input = fs::read_to_string(tmp.path().join("prepared/examples/Si/001/INPUT")).unwrap();
        assert!(input.contains("ecutwfc 70"));
    }

    #[test]
    fn same_named_examples_keep_separate_folders() {
        let tmp = TempDir::new().unwrap();
        for (set, marker) in [("a", "from-a"), ("b", "from-b")] {
            let dir = tmp.path().join(set).join("Si");
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("STRU"), marker).unwrap();
        }

        let preparer = LocalPreparer::new(tmp.path());
        let config = prepare_config(json!({"example_template": ["a/Si", "b/Si"]}));
        let prepared = preparer.prepare(&config).unwrap();

        let paths: Vec<_> = prepared
            .iter()
            .map(|p| p.candidates[0].path.as_str())
            .collect();
        assert_eq!(paths, ["prepared/a/Si", "prepared/b/Si"]);
        for (path, marker) in paths.iter().zip(["from-a", "from-b"]) {
            let content = fs::read_to_string(tmp.path().join(path).join("STRU")).unwrap();
            assert_eq!(content, marker);
        }
    }

    #[test]
    fn check_rejects_missing_and_empty_folders() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("empty")).unwrap();
        let preparer = LocalPreparer::new(tmp.path());
        let candidate = |path: &str| Candidate {
            path: path.to_string(),
            setting: BTreeMap::new(),
        };
        assert!(!preparer.check(&candidate("empty")));
        assert!(!preparer.check(&candidate("missing")));
    }

    #[test]
    fn resolve_examples_is_sorted_and_relative() {
        let tmp = TempDir::new().unwrap();
        make_example(tmp.path(), "b");
        make_example(tmp.path(), "a");
        let found = resolve_examples(tmp.path(), &["examples/*".to_string()]).unwrap();
        assert_eq!(found, ["examples/a", "examples/b"]);
    }
}
