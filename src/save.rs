//! Result folders and parameter snapshots

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{info, warn};

use crate::error::Result;

/// Blocks whose secret-looking keys are masked in snapshots
const EXECUTOR_BLOCKS: &[&str] = &["dispatcher", "executor", "bohrium"];

/// Key fragments treated as secrets
const SECRET_MARKERS: &[&str] = &["password", "passwd", "token", "ticket", "secret", "access_key"];

const MASK: &str = "******";

/// Create a result folder, moving a non-empty existing one aside
///
/// Without `override_existing`, a non-empty folder is renamed to
/// `<path>.bkN` (smallest unused `N >= 1`) and recreated empty. Returns the
/// backup path when one was made.
pub fn make_save_folder(path: &Path, override_existing: bool) -> Result<Option<PathBuf>> {
    let mut backup = None;
    if path.is_dir() && !override_existing && !is_empty_dir(path)? {
        let target = backup_path(path);
        fs::rename(path, &target)?;
        warn!(
            folder = %path.display(),
            backup = %target.display(),
            "Save folder exists, moved the old one aside"
        );
        backup = Some(target);
    }
    fs::create_dir_all(path)?;
    Ok(backup)
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

fn backup_path(path: &Path) -> PathBuf {
    let base = path.as_os_str().to_string_lossy().into_owned();
    (1..)
        .map(|n| PathBuf::from(format!("{}.bk{}", base, n)))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| PathBuf::from(format!("{}.bk", base)))
}

/// Write the job document into a result folder
///
/// The `config` block is dropped and secrets inside executor blocks are
/// masked. An existing file is kept unless `override_existing`; the
/// snapshot then goes to `<file_name>.<n>`.
pub fn write_param_snapshot(
    folder: &Path,
    file_name: &str,
    document: &Value,
    override_existing: bool,
) -> Result<PathBuf> {
    let mut snapshot = document.clone();
    if let Value::Object(map) = &mut snapshot {
        map.remove("config");
    }
    mask_secrets(&mut snapshot, false);

    let mut target = folder.join(file_name);
    if target.exists() && !override_existing {
        target = (1..)
            .map(|n| folder.join(format!("{}.{}", file_name, n)))
            .find(|candidate| !candidate.exists())
            .unwrap_or(target);
    }

    fs::create_dir_all(folder)?;
    fs::write(&target, serde_json::to_string_pretty(&snapshot)?)?;
    info!(path = %target.display(), "Saved parameter snapshot");
    Ok(target)
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_lowercase();
    SECRET_MARKERS.iter().any(|m| key.contains(m))
}

fn mask_secrets(value: &mut Value, inside_executor: bool) {
    match value {
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if inside_executor && is_secret_key(key) && !item.is_object() && !item.is_array() {
                    *item = Value::String(MASK.to_string());
                } else {
                    let nested = inside_executor || EXECUTOR_BLOCKS.contains(&key.as_str());
                    mask_secrets(item, nested);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                mask_secrets(item, inside_executor);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn creates_missing_folder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("result");
        assert!(make_save_folder(&path, false).unwrap().is_none());
        assert!(path.is_dir());
    }

    #[test]
    fn empty_folder_is_reused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("result");
        fs::create_dir(&path).unwrap();
        assert!(make_save_folder(&path, false).unwrap().is_none());
    }

    #[test]
    fn non_empty_folder_moves_to_smallest_free_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("result");
        fs::create_dir_all(dir.path().join("result.bk1")).unwrap();
        fs::create_dir(&path).unwrap();
        fs::write(path.join("old.txt"), "x").unwrap();

        let backup = make_save_folder(&path, false).unwrap().unwrap();
        assert_eq!(backup, dir.path().join("result.bk2"));
        assert!(backup.join("old.txt").exists());
        assert!(is_empty_dir(&path).unwrap());
    }

    #[test]
    fn override_keeps_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("result");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("old.txt"), "x").unwrap();
        assert!(make_save_folder(&path, true).unwrap().is_none());
        assert!(path.join("old.txt").exists());
    }

    #[test]
    fn snapshot_drops_config_and_masks_secrets() {
        let dir = TempDir::new().unwrap();
        let doc = json!({
            "config": {"bohrium_password": "p"},
            "run_dft": [{"image": "x", "bohrium": {"password": "p", "scass_type": "c4"}}],
            "post_dft": {"dispatcher": {"remote_profile": {"access_key": "k", "host": "h"}}},
            "token": "top-level-kept"
        });
        let path = write_param_snapshot(dir.path(), "job.json", &doc, false).unwrap();
        let saved: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert!(saved.get("config").is_none());
        assert_eq!(saved["run_dft"][0]["bohrium"]["password"], MASK);
        assert_eq!(saved["run_dft"][0]["bohrium"]["scass_type"], "c4");
        assert_eq!(saved["post_dft"]["dispatcher"]["remote_profile"]["access_key"], MASK);
        assert_eq!(saved["post_dft"]["dispatcher"]["remote_profile"]["host"], "h");
        assert_eq!(saved["token"], "top-level-kept");
    }

    #[test]
    fn snapshot_name_collision() {
        let dir = TempDir::new().unwrap();
        let doc = json!({});
        let first = write_param_snapshot(dir.path(), "job.json", &doc, false).unwrap();
        let second = write_param_snapshot(dir.path(), "job.json", &doc, false).unwrap();
        let third = write_param_snapshot(dir.path(), "job.json", &doc, true).unwrap();
        assert_eq!(first, dir.path().join("job.json"));
        assert_eq!(second, dir.path().join("job.json.1"));
        assert_eq!(third, first);
    }
}
