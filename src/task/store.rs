#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::error::StoreError;
use crate::persist::{now_rfc3339, read_json, validate_key, write_json_atomic};
use crate::task::model::Task;

const KIND: &str = "task";

/// File-backed task records keyed by `(workspace, task_id)`:
/// `<root>/workspaces/<workspace>/tasks/<task_id>/task.json`.
#[derive(Debug, Clone)]
pub struct TaskStore {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl TaskStore {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// State directory shared with the workspace record (`run.lock` lives here).
    pub fn workspace_dir(&self, workspace: &str) -> Result<PathBuf, StoreError> {
        validate_key("workspace", workspace)?;
        Ok(self.root.join("workspaces").join(workspace))
    }

    fn tasks_dir(&self, workspace: &str) -> Result<PathBuf, StoreError> {
        Ok(self.workspace_dir(workspace)?.join("tasks"))
    }

    /// Directory holding the record and the task's artifacts.
    pub fn task_dir(&self, workspace: &str, id: &str) -> Result<PathBuf, StoreError> {
        validate_key(KIND, id)?;
        Ok(self.tasks_dir(workspace)?.join(id))
    }

    fn record_path(&self, workspace: &str, id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.task_dir(workspace, id)?.join("task.json"))
    }

    pub fn create(&self, task: &Task) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.record_path(&task.workspace, &task.id)?;
        if path.exists() {
            return Err(StoreError::AlreadyExists {
                kind: KIND,
                key: task.id.clone(),
            });
        }
        write_json_atomic(&path, KIND, &task.id, task)?;
        debug!(task_id = %task.id, workspace = %task.workspace, "task record created");
        Ok(())
    }

    pub fn get(&self, workspace: &str, id: &str) -> Result<Task, StoreError> {
        read_json(&self.record_path(workspace, id)?, KIND, id)
    }

    pub fn exists(&self, workspace: &str, id: &str) -> Result<bool, StoreError> {
        Ok(self.record_path(workspace, id)?.exists())
    }

    /// Replace the stored record; refreshes `updated_at`.
    pub fn update(&self, task: &mut Task) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.record_path(&task.workspace, &task.id)?;
        if !path.exists() {
            return Err(StoreError::NotFound {
                kind: KIND,
                key: task.id.clone(),
            });
        }
        task.updated_at = now_rfc3339();
        write_json_atomic(&path, KIND, &task.id, task)?;
        debug!(
            task_id = %task.id,
            status = %task.status,
            current_step = task.current_step,
            "task persisted"
        );
        Ok(())
    }

    /// Tasks of one workspace, oldest first.
    pub fn list(&self, workspace: &str) -> Result<Vec<Task>, StoreError> {
        let dir = self.tasks_dir(workspace)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut tasks: Vec<Task> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path().join("task.json");
            if !path.is_file() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            tasks.push(read_json(&path, KIND, &id)?);
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    pub fn latest(&self, workspace: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.list(workspace)?.pop())
    }

    pub fn delete(&self, workspace: &str, id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = self.task_dir(workspace, id)?;
        if !dir.exists() {
            return Ok(());
        }
        std::fs::remove_dir_all(&dir).map_err(|source| StoreError::Io { path: dir, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_task;

    #[test]
    fn round_trips_and_lists_in_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path().to_path_buf());

        let mut first = sample_task("ws", "task-a");
        first.created_at = "2026-01-01T00:00:00Z".to_owned();
        let mut second = sample_task("ws", "task-b");
        second.created_at = "2026-01-02T00:00:00Z".to_owned();
        store.create(&second).unwrap();
        store.create(&first).unwrap();

        let ids: Vec<String> = store.list("ws").unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["task-a".to_owned(), "task-b".to_owned()]);
        assert_eq!(store.latest("ws").unwrap().unwrap().id, "task-b");
        assert!(store.list("other").unwrap().is_empty());
    }

    #[test]
    fn update_requires_existing_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path().to_path_buf());
        let mut task = sample_task("ws", "task-x");
        assert!(store.update(&mut task).unwrap_err().is_not_found());

        store.create(&task).unwrap();
        task.current_step = 1;
        store.update(&mut task).unwrap();
        assert_eq!(store.get("ws", "task-x").unwrap().current_step, 1);
    }
}
