#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::error::StoreError;
use crate::persist::{now_rfc3339, read_json, validate_key, write_json_atomic};
use crate::workspace::model::Workspace;

const KIND: &str = "workspace";

/// File-backed workspace records under `<root>/workspaces/<name>/workspace.json`.
///
/// Writes go through a shared lock so concurrent read-modify-write cycles
/// from the same process (engine vs. interrupt handler) never interleave.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl WorkspaceStore {
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

    #[must_use]
    pub fn workspaces_dir(&self) -> PathBuf {
        self.root.join("workspaces")
    }

    /// Directory owning the record, its tasks and its run lock.
    pub fn workspace_dir(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_key(KIND, name)?;
        Ok(self.workspaces_dir().join(name))
    }

    fn record_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        Ok(self.workspace_dir(name)?.join("workspace.json"))
    }

    pub fn create(&self, ws: &Workspace) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.record_path(&ws.name)?;
        if path.exists() {
            return Err(StoreError::AlreadyExists {
                kind: KIND,
                key: ws.name.clone(),
            });
        }
        write_json_atomic(&path, KIND, &ws.name, ws)?;
        debug!(workspace = %ws.name, "workspace record created");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Workspace, StoreError> {
        read_json(&self.record_path(name)?, KIND, name)
    }

    pub fn exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.record_path(name)?.exists())
    }

    /// Replace an existing record. Fails with `NotFound` if it was never created.
    pub fn update(&self, ws: &mut Workspace) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.record_path(&ws.name)?;
        if !path.exists() {
            return Err(StoreError::NotFound {
                kind: KIND,
                key: ws.name.clone(),
            });
        }
        ws.updated_at = now_rfc3339();
        write_json_atomic(&path, KIND, &ws.name, ws)
    }

    /// Load, mutate and save a record as one step.
    pub fn modify<F>(&self, name: &str, f: F) -> Result<Workspace, StoreError>
    where
        F: FnOnce(&mut Workspace),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.record_path(name)?;
        let mut ws: Workspace = read_json(&path, KIND, name)?;
        f(&mut ws);
        ws.updated_at = now_rfc3339();
        write_json_atomic(&path, KIND, name, &ws)?;
        Ok(ws)
    }

    pub fn list(&self) -> Result<Vec<Workspace>, StoreError> {
        let dir = self.workspaces_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path().join("workspace.json");
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            out.push(read_json(&path, KIND, &name)?);
        }
        out.sort_by(|a: &Workspace, b: &Workspace| {
            b.updated_at.cmp(&a.updated_at).then_with(|| a.name.cmp(&b.name))
        });
        Ok(out)
    }

    /// Remove the record together with everything stored beneath it.
    pub fn delete(&self, name: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = self.workspace_dir(name)?;
        if !dir.exists() {
            return Err(StoreError::NotFound {
                kind: KIND,
                key: name.to_owned(),
            });
        }
        std::fs::remove_dir_all(&dir).map_err(|source| StoreError::Io { path: dir, source })?;
        debug!(workspace = %name, "workspace record deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::model::WorkspaceStatus;

    fn sample(name: &str) -> Workspace {
        Workspace {
            name: name.to_owned(),
            repository: PathBuf::from("/repo"),
            branch: format!("feat/{name}"),
            worktree_path: PathBuf::from(format!("/repo-{name}")),
            status: WorkspaceStatus::Active,
            created_at: now_rfc3339(),
            updated_at: now_rfc3339(),
            tasks: Vec::new(),
        }
    }

    #[test]
    fn create_get_update_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path().to_path_buf());

        let mut ws = sample("auth-fix");
        store.create(&ws).unwrap();
        assert!(store.exists("auth-fix").unwrap());
        assert!(matches!(
            store.create(&ws),
            Err(StoreError::AlreadyExists { .. })
        ));

        ws.status = WorkspaceStatus::Paused;
        store.update(&mut ws).unwrap();
        assert_eq!(store.get("auth-fix").unwrap().status, WorkspaceStatus::Paused);

        let ws = store
            .modify("auth-fix", |w| w.tasks.push("task-1".to_owned()))
            .unwrap();
        assert_eq!(ws.tasks, vec!["task-1".to_owned()]);

        store.delete("auth-fix").unwrap();
        assert!(!store.exists("auth-fix").unwrap());
        assert!(store.get("auth-fix").unwrap_err().is_not_found());
    }

    #[test]
    fn update_of_missing_record_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path().to_path_buf());
        let mut ws = sample("ghost");
        assert!(store.update(&mut ws).unwrap_err().is_not_found());
    }

    #[test]
    fn lists_all_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path().to_path_buf());
        store.create(&sample("a")).unwrap();
        store.create(&sample("b")).unwrap();
        let names: Vec<String> = store.list().unwrap().into_iter().map(|w| w.name).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"a".to_owned()));
        assert!(names.contains(&"b".to_owned()));
    }
}
