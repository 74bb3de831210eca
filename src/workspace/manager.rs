#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::core::naming::sanitize_workspace_name;
use crate::core::worktree::{BranchSource, WorktreeRequest, WorktreeRunner};
use crate::error::WorkspaceError;
use crate::persist::now_rfc3339;
use crate::workspace::model::{Workspace, WorkspaceStatus};
use crate::workspace::store::WorkspaceStore;

/// Layout knobs for new worktrees, taken from `[workspace]` config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeSettings {
    pub branch_prefix: String,
    pub remote: String,
    pub base_dir: Option<PathBuf>,
    pub path_template: String,
}

impl Default for WorktreeSettings {
    fn default() -> Self {
        Self {
            branch_prefix: "feat".to_owned(),
            remote: "origin".to_owned(),
            base_dir: None,
            path_template: "{{repo}}-{{name}}".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateWorkspace {
    pub name: String,
    pub repo: PathBuf,
    pub source: BranchSource,
    pub use_local: bool,
    /// Overrides `WorktreeSettings::branch_prefix` (templates carry their own).
    pub branch_prefix: Option<String>,
}

/// What `create` would do, computed without side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePreview {
    pub name: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub would_create: bool,
}

pub struct WorkspaceManager {
    store: WorkspaceStore,
    runner: Arc<dyn WorktreeRunner>,
    settings: WorktreeSettings,
}

impl WorkspaceManager {
    #[must_use]
    pub fn new(
        store: WorkspaceStore,
        runner: Arc<dyn WorktreeRunner>,
        settings: WorktreeSettings,
    ) -> Self {
        Self {
            store,
            runner,
            settings,
        }
    }

    #[must_use]
    pub fn store(&self) -> &WorkspaceStore {
        &self.store
    }

    pub fn repo_root(&self, dir: &std::path::Path) -> Result<PathBuf, WorkspaceError> {
        Ok(self.runner.repo_root(dir)?)
    }

    fn request(&self, name: &str, req: &CreateWorkspace) -> WorktreeRequest {
        WorktreeRequest {
            repo: req.repo.clone(),
            name: name.to_owned(),
            branch_prefix: req
                .branch_prefix
                .clone()
                .unwrap_or_else(|| self.settings.branch_prefix.clone()),
            source: req.source.clone(),
            use_local: req.use_local,
            remote: self.settings.remote.clone(),
            base_dir: self.settings.base_dir.clone(),
            path_template: self.settings.path_template.clone(),
        }
    }

    fn checked_name(raw: &str) -> Result<String, WorkspaceError> {
        let name = sanitize_workspace_name(raw);
        if name.is_empty() {
            return Err(WorkspaceError::InvalidName(raw.to_owned()));
        }
        Ok(name)
    }

    /// Create a workspace, or hand back the live one already using `name`.
    ///
    /// An `Active`/`Paused` record is returned unchanged; a `Closed` one is
    /// retired and replaced by a fresh worktree.
    pub fn create(&self, req: &CreateWorkspace) -> Result<Workspace, WorkspaceError> {
        let name = Self::checked_name(&req.name)?;

        let mut replacing = false;
        if self.store.exists(&name)? {
            let existing = self.store.get(&name)?;
            if !existing.is_closed() {
                info!(workspace = %name, status = %existing.status, "reusing existing workspace");
                return Ok(existing);
            }
            replacing = true;
        }

        // The closed record stays until the new worktree exists.
        let wt = self.runner.create(&self.request(&name, req))?;
        let now = now_rfc3339();
        let ws = Workspace {
            name: name.clone(),
            repository: req.repo.clone(),
            branch: wt.branch,
            worktree_path: wt.path,
            status: WorkspaceStatus::Active,
            created_at: now.clone(),
            updated_at: now,
            tasks: Vec::new(),
        };

        let stored = if replacing {
            info!(workspace = %name, "replacing closed workspace");
            self.store.delete(&name).and_then(|()| self.store.create(&ws))
        } else {
            self.store.create(&ws)
        };
        if let Err(e) = stored {
            // Without a record nobody could find the worktree again.
            if let Err(rm) = self.runner.remove(&ws.repository, &ws.worktree_path, true) {
                warn!(workspace = %name, error = %rm, "failed to roll back worktree");
            }
            return Err(e.into());
        }
        info!(workspace = %name, branch = %ws.branch, "workspace created");
        Ok(ws)
    }

    pub fn preview(&self, req: &CreateWorkspace) -> Result<WorkspacePreview, WorkspaceError> {
        let name = Self::checked_name(&req.name)?;
        if self.store.exists(&name)? {
            let existing = self.store.get(&name)?;
            if !existing.is_closed() {
                return Ok(WorkspacePreview {
                    name,
                    branch: existing.branch,
                    worktree_path: existing.worktree_path,
                    would_create: false,
                });
            }
        }
        let wt = self.runner.preview(&self.request(&name, req))?;
        Ok(WorkspacePreview {
            name,
            branch: wt.branch,
            worktree_path: wt.path,
            would_create: true,
        })
    }

    pub fn get(&self, name: &str) -> Result<Workspace, WorkspaceError> {
        Ok(self.store.get(name)?)
    }

    pub fn exists(&self, name: &str) -> Result<bool, WorkspaceError> {
        Ok(self.store.exists(name)?)
    }

    pub fn list(&self) -> Result<Vec<Workspace>, WorkspaceError> {
        Ok(self.store.list()?)
    }

    /// Remove the worktree and delete the record with all of its tasks.
    pub fn destroy(&self, name: &str) -> Result<(), WorkspaceError> {
        let ws = self.store.get(name)?;
        if !ws.is_closed() {
            self.runner.remove(&ws.repository, &ws.worktree_path, true)?;
        }
        self.store.delete(name)?;
        info!(workspace = %name, "workspace destroyed");
        Ok(())
    }

    /// Remove the worktree but keep the record (and its task history) as `Closed`.
    pub fn close(&self, name: &str) -> Result<Workspace, WorkspaceError> {
        let ws = self.store.get(name)?;
        if ws.is_closed() {
            return Ok(ws);
        }
        self.runner.remove(&ws.repository, &ws.worktree_path, true)?;
        let ws = self
            .store
            .modify(name, |w| w.status = WorkspaceStatus::Closed)?;
        info!(workspace = %name, "workspace closed");
        Ok(ws)
    }

    pub fn pause(&self, name: &str) -> Result<Workspace, WorkspaceError> {
        let ws = self.set_status(name, WorkspaceStatus::Paused)?;
        if !ws.worktree_path.exists() {
            error!(
                critical = true,
                workspace = %name,
                worktree = %ws.worktree_path.display(),
                "workspace paused but its worktree directory is missing; it was removed while the task was running"
            );
        }
        Ok(ws)
    }

    pub fn activate(&self, name: &str) -> Result<Workspace, WorkspaceError> {
        self.set_status(name, WorkspaceStatus::Active)
    }

    fn set_status(&self, name: &str, status: WorkspaceStatus) -> Result<Workspace, WorkspaceError> {
        let ws = self.store.modify(name, |w| w.status = status)?;
        info!(workspace = %name, status = %status, "workspace status updated");
        Ok(ws)
    }

    pub fn attach_task(&self, name: &str, task_id: &str) -> Result<Workspace, WorkspaceError> {
        Ok(self.store.modify(name, |w| {
            if !w.tasks.iter().any(|t| t == task_id) {
                w.tasks.push(task_id.to_owned());
            }
        })?)
    }
}
