use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::task::DownloadTask;
use crate::backend::error::{PipelineError, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskList {
    #[serde(default)]
    tasks: Vec<DownloadTask>,
}

/// The persisted, ordered list of download tasks.
pub struct TaskStore {
    path: PathBuf,
    /// Version of the newest snapshot on disk.
    written: Mutex<u64>,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TaskStore {
            path: path.into(),
            written: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing and unreadable lists both load as empty.
    pub fn load(&self) -> Vec<DownloadTask> {
        if !self.path.exists() {
            return Vec::new();
        }
        match fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<TaskList>(&content) {
                Ok(list) => list.tasks,
                Err(e) => {
                    log::warn!("Ignoring corrupt task list {}: {}", self.path.display(), e);
                    Vec::new()
                }
            },
            Err(e) => {
                log::warn!("Could not read task list {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }

    /// Saves snapshot `version` unless a newer one already reached the disk.
    /// Snapshots may be written from several blocking threads at once.
    pub fn save_version(&self, version: u64, tasks: &[DownloadTask]) -> Result<bool> {
        let mut written = self.written.lock();
        if *written >= version {
            return Ok(false);
        }
        self.save(tasks)?;
        *written = version;
        Ok(true)
    }

    /// Replaces the stored list in one rename.
    pub fn save(&self, tasks: &[DownloadTask]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let content = serde_json::to_vec_pretty(&TaskList {
            tasks: tasks.to_vec(),
        })?;
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(&content)?;
        file.as_file().sync_all()?;
        file.persist(&self.path)
            .map_err(|e| PipelineError::storage(format!("{}: {}", self.path.display(), e.error)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::download::task::TaskState;
    use crate::backend::gallery::GalleryRef;

    #[test]
    fn saved_list_loads_back_in_order() {
        let temp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(temp.path().join("nested").join("downloads.json"));

        let mut second = DownloadTask::new(GalleryRef::new(2, "b"), "Second", None);
        second.state = TaskState::Downloading;
        second.completed_pages = 4;
        second.page_links.insert(5, "https://e-hentai.org/s/ff/2-6".into());
        let tasks = vec![DownloadTask::new(GalleryRef::new(1, "a"), "First", None), second];

        store.save(&tasks).unwrap();
        assert_eq!(store.load(), tasks);
    }

    #[test]
    fn missing_or_corrupt_list_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(temp.path().join("downloads.json"));
        assert!(store.load().is_empty());

        fs::write(store.path(), "{\"tasks\": [ {").unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn older_snapshot_does_not_replace_a_newer_one() {
        let temp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(temp.path().join("downloads.json"));
        let newer = vec![DownloadTask::new(GalleryRef::new(1, "a"), "Newer", None)];

        assert!(store.save_version(2, &newer).unwrap());
        assert!(!store.save_version(1, &[]).unwrap());
        assert_eq!(store.load(), newer);
    }

    #[test]
    fn save_leaves_no_temporary_files() {
        let temp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(temp.path().join("downloads.json"));
        store.save(&[]).unwrap();
        store.save(&[]).unwrap();
        let names: Vec<_> = fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(names.len(), 1);
    }
}
