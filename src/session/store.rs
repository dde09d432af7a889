//! Storage backends for session state.
//!
//! Keys are `/`-separated paths relative to the store root. Backends must make
//! `write_atomic` all-or-nothing: a reader sees either the old or the new
//! content, never a mix.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

pub trait StateStore: Send + Sync {
    /// Contents of `key`, or `None` if it does not exist.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace `key` atomically.
    fn write_atomic(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Append to `key`, creating it if needed, and flush to stable storage.
    fn append(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Names of the immediate children of `prefix`, sorted. Empty if absent.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove `prefix` and everything below it. Missing keys are not an error.
    fn remove_prefix(&self, prefix: &str) -> Result<()>;
}

/// Local filesystem store rooted at the configured state directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl StateStore for FsStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_atomic(&self, key: &str, data: &[u8]) -> Result<()> {
        let final_path = self.path(key);
        Self::ensure_parent(&final_path)?;
        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp_path = final_path.with_file_name(format!(".{file_name}.tmp"));

        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(data)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;

        // persist the rename itself
        if let Some(parent) = final_path.parent()
            && let Ok(dir) = File::open(parent)
        {
            let _ = dir.sync_all();
        }

        debug!(path = %final_path.display(), bytes = data.len(), "wrote state file");
        Ok(())
    }

    fn append(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path(key);
        Self::ensure_parent(&path)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = match fs::read_dir(self.path(prefix)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn remove_prefix(&self, prefix: &str) -> Result<()> {
        let path = self.path(prefix);
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        assert!(store.read("sessions/x/session.json").unwrap().is_none());
    }

    #[test]
    fn write_atomic_replaces_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        store.write_atomic("sessions/a/CURRENT", b"checkpoint-000001.json").unwrap();
        store.write_atomic("sessions/a/CURRENT", b"checkpoint-000002.json").unwrap();

        assert_eq!(
            store.read("sessions/a/CURRENT").unwrap().unwrap(),
            b"checkpoint-000002.json"
        );
        let files: Vec<_> = fs::read_dir(dir.path().join("sessions/a"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files.len(), 1, "temp file must not survive: {files:?}");
    }

    #[test]
    fn append_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        store.append("log.jsonl", b"one\n").unwrap();
        store.append("log.jsonl", b"two\n").unwrap();
        assert_eq!(store.read("log.jsonl").unwrap().unwrap(), b"one\ntwo\n");
    }

    #[test]
    fn list_is_sorted_and_hides_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        store.write_atomic("cp/checkpoint-000002.json", b"{}").unwrap();
        store.write_atomic("cp/checkpoint-000001.json", b"{}").unwrap();
        fs::write(dir.path().join("cp/.checkpoint-000003.json.tmp"), b"partial").unwrap();

        assert_eq!(
            store.list("cp").unwrap(),
            vec!["checkpoint-000001.json", "checkpoint-000002.json"]
        );
        assert!(store.list("nothing-here").unwrap().is_empty());
    }

    #[test]
    fn remove_prefix_drops_tree_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        store.write_atomic("sessions/a/session.json", b"{}").unwrap();
        store.append("sessions/a/records.jsonl", b"x\n").unwrap();

        store.remove_prefix("sessions/a").unwrap();
        assert!(store.list("sessions").unwrap().is_empty());
        store.remove_prefix("sessions/a").unwrap();
    }
}
