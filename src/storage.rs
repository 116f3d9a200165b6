//! Local persistence for the install history.
//!
//! Every state change of an installation is appended as one JSON line:
//!
//! ```text
//! <root>/
//!   installed_versions.jsonl   # Append-only install history
//! ```
//!
//! The pending and last-known-good targets are derived from the log on read;
//! nothing is cached in memory between calls. Older records superseded by a
//! later record of the same target and mark are dropped on write, so the log
//! grows with the number of distinct targets, not with the number of installs.

use std::{fs, io, path::PathBuf};

// Traits must be in scope for `.lines()` on BufReader and `.write_all()` on File.
use io::{BufRead, Write};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::model::Target;

const HISTORY_FILE: &str = "installed_versions.jsonl";
const HISTORY_TMP_FILE: &str = "installed_versions.jsonl.tmp";

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, StorageError>;

/// What happened to a target at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallMark {
    /// Installed and running.
    Current,
    /// Deployed, waiting for a reboot to be confirmed.
    Pending,
    /// Failed to boot or to start its applications.
    Failed,
}

/// One line of the install history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledVersion {
    pub target: Target,
    pub mark: InstallMark,
    pub recorded_at: Timestamp,
}

/// Local file-based storage for the install history.
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Creates a new storage instance rooted at the given directory.
    ///
    /// The directory is created if it doesn't exist.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Appends a history record for `target`.
    pub fn record(&self, target: &Target, mark: InstallMark) -> Result<()> {
        let entry = InstalledVersion {
            target: target.clone(),
            mark,
            recorded_at: Timestamp::now(),
        };
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(HISTORY_FILE))?;
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        tracing::debug!(name = %target.name, ?mark, "recorded install history");
        self.compact()
    }

    /// Rewrite the log without superseded records.
    ///
    /// Only the latest record per (target, mark) is kept, in log order. Every
    /// query below depends on the last such record alone.
    fn compact(&self) -> Result<()> {
        let history = self.history()?;
        let kept: Vec<&InstalledVersion> = history
            .iter()
            .enumerate()
            .filter(|(i, entry)| {
                !history[i + 1..]
                    .iter()
                    .any(|later| later.mark == entry.mark && later.target == entry.target)
            })
            .map(|(_, entry)| entry)
            .collect();
        if kept.len() == history.len() {
            return Ok(());
        }

        let mut contents = String::new();
        for entry in &kept {
            contents.push_str(&serde_json::to_string(entry)?);
            contents.push('\n');
        }
        let tmp = self.root.join(HISTORY_TMP_FILE);
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, self.root.join(HISTORY_FILE))?;
        tracing::debug!(dropped = history.len() - kept.len(), "compacted install history");
        Ok(())
    }

    /// Loads the full history, oldest first.
    pub fn history(&self) -> Result<Vec<InstalledVersion>> {
        let path = self.root.join(HISTORY_FILE);
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let reader = io::BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if !line.is_empty() {
                entries.push(serde_json::from_str(&line)?);
            }
        }
        Ok(entries)
    }

    /// The target waiting for a reboot to be confirmed, if any.
    ///
    /// A pending record is cleared by any later `Current` record, or by a
    /// `Failed` record for the same target.
    pub fn pending(&self) -> Result<Option<Target>> {
        let mut pending: Option<Target> = None;
        for entry in self.history()? {
            match entry.mark {
                InstallMark::Pending => pending = Some(entry.target),
                InstallMark::Current => pending = None,
                InstallMark::Failed => {
                    if pending.as_ref() == Some(&entry.target) {
                        pending = None;
                    }
                }
            }
        }
        Ok(pending)
    }

    /// The most recently recorded target with the given rootfs hash.
    pub fn find_by_hash(&self, hash: &str) -> Result<Option<Target>> {
        Ok(self
            .history()?
            .into_iter()
            .rev()
            .find(|e| e.target.hash == hash)
            .map(|e| e.target))
    }

    /// The latest known-good target whose hash differs from `exclude_hash`.
    ///
    /// Targets that were ever marked failed are never offered.
    pub fn rollback_target(&self, exclude_hash: &str) -> Result<Option<Target>> {
        let history = self.history()?;
        let failed: Vec<&str> = history
            .iter()
            .filter(|e| e.mark == InstallMark::Failed)
            .map(|e| e.target.hash.as_str())
            .collect();
        Ok(history
            .iter()
            .rev()
            .filter(|e| e.mark == InstallMark::Current)
            .find(|e| e.target.hash != exclude_hash && !failed.contains(&e.target.hash.as_str()))
            .map(|e| e.target.clone()))
    }

    /// Whether `target` has been recorded as failed before.
    pub fn is_failed(&self, target: &Target) -> Result<bool> {
        Ok(self
            .history()?
            .iter()
            .any(|e| e.mark == InstallMark::Failed && e.target == *target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tempfile::TempDir;

    fn test_storage() -> (TempDir, Storage) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("state")).unwrap();
        (dir, storage)
    }

    fn target(name: &str, version: i64) -> Target {
        Target::new(name, format!("{name}-hash"), version, json!({}))
    }

    #[test]
    fn empty_history() {
        let (_dir, storage) = test_storage();
        assert!(storage.history().unwrap().is_empty());
        assert!(storage.pending().unwrap().is_none());
        assert!(storage.rollback_target("x").unwrap().is_none());
    }

    #[test]
    fn record_and_load_history() {
        let (dir, storage) = test_storage();
        storage.record(&target("v1", 1), InstallMark::Current).unwrap();
        storage.record(&target("v2", 2), InstallMark::Pending).unwrap();

        let history = storage.history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].mark, InstallMark::Current);
        assert_eq!(history[1].target.name, "v2");
        assert!(dir.path().join("state").join(HISTORY_FILE).exists());
    }

    #[test]
    fn pending_cleared_by_current() {
        let (_dir, storage) = test_storage();
        storage.record(&target("v2", 2), InstallMark::Pending).unwrap();
        assert_eq!(storage.pending().unwrap().unwrap().name, "v2");

        storage.record(&target("v2", 2), InstallMark::Current).unwrap();
        assert!(storage.pending().unwrap().is_none());
    }

    #[test]
    fn pending_cleared_by_failure_of_same_target() {
        let (_dir, storage) = test_storage();
        storage.record(&target("v2", 2), InstallMark::Pending).unwrap();
        storage.record(&target("v3", 3), InstallMark::Failed).unwrap();
        assert!(storage.pending().unwrap().is_some());

        storage.record(&target("v2", 2), InstallMark::Failed).unwrap();
        assert!(storage.pending().unwrap().is_none());
    }

    #[test]
    fn rollback_target_skips_excluded_and_failed() {
        let (_dir, storage) = test_storage();
        storage.record(&target("v1", 1), InstallMark::Current).unwrap();
        storage.record(&target("v2", 2), InstallMark::Current).unwrap();
        storage.record(&target("v3", 3), InstallMark::Current).unwrap();
        storage.record(&target("v2", 2), InstallMark::Failed).unwrap();

        let rollback = storage.rollback_target("v3-hash").unwrap().unwrap();
        assert_eq!(rollback.name, "v1");
        assert!(storage.is_failed(&target("v2", 2)).unwrap());
        assert!(!storage.is_failed(&target("v1", 1)).unwrap());
    }

    #[test]
    fn repeated_records_are_compacted() {
        let (_dir, storage) = test_storage();
        let v1 = target("v1", 1);
        let v2 = target("v2", 2);
        for _ in 0..5 {
            storage.record(&v2, InstallMark::Pending).unwrap();
            storage.record(&v2, InstallMark::Failed).unwrap();
            storage.record(&v1, InstallMark::Current).unwrap();
        }
        storage.record(&v2, InstallMark::Pending).unwrap();

        let history = storage.history().unwrap();
        let marks: Vec<(&str, InstallMark)> =
            history.iter().map(|e| (e.target.name.as_str(), e.mark)).collect();
        assert_eq!(
            marks,
            vec![
                ("v2", InstallMark::Failed),
                ("v1", InstallMark::Current),
                ("v2", InstallMark::Pending),
            ]
        );
        assert_eq!(storage.pending().unwrap(), Some(v2.clone()));
        assert!(storage.is_failed(&v2).unwrap());
        assert_eq!(storage.rollback_target("v2-hash").unwrap(), Some(v1));
    }

    #[test]
    fn find_by_hash_returns_latest_record() {
        let (_dir, storage) = test_storage();
        let mut renamed = target("v1", 1);
        storage.record(&renamed, InstallMark::Current).unwrap();
        renamed.name = "v1-renamed".into();
        storage.record(&renamed, InstallMark::Current).unwrap();

        let found = storage.find_by_hash("v1-hash").unwrap().unwrap();
        assert_eq!(found.name, "v1-renamed");
        assert!(storage.find_by_hash("nope").unwrap().is_none());
    }
}
