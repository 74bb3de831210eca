#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::git::{BranchLocation, Git};
use crate::core::naming::{first_free, render_template};
use crate::error::{WorkspaceError, WorktreeError};

/// How the worktree's branch is chosen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BranchSource {
    /// Cut `<prefix>/<name>` from `base` (or the current HEAD).
    NewFromBase { base: Option<String> },
    /// Check out a branch that must already exist locally or on the remote.
    Target { branch: String },
}

impl BranchSource {
    /// At most one of `base` / `target` may be given.
    pub fn from_options(
        base: Option<String>,
        target: Option<String>,
    ) -> Result<Self, WorkspaceError> {
        let base = base.filter(|s| !s.trim().is_empty());
        let target = target.filter(|s| !s.trim().is_empty());
        match (base, target) {
            (Some(_), Some(_)) => Err(WorkspaceError::ConflictingBranchOptions),
            (None, Some(branch)) => Ok(Self::Target { branch }),
            (base, None) => Ok(Self::NewFromBase { base }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeRequest {
    pub repo: PathBuf,
    pub name: String,
    pub branch_prefix: String,
    pub source: BranchSource,
    /// Reuse an existing local branch instead of picking a fresh name.
    pub use_local: bool,
    pub remote: String,
    /// Parent directory for worktrees; the repository's parent when `None`.
    pub base_dir: Option<PathBuf>,
    pub path_template: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutAction {
    NewBranch { start_point: Option<String> },
    Existing,
    Tracking,
}

/// Resolved branch and path for a worktree, before or after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub action: CheckoutAction,
}

pub trait WorktreeRunner: Send + Sync {
    /// Top-level directory of the repository containing `dir`.
    fn repo_root(&self, dir: &Path) -> Result<PathBuf, WorktreeError>;

    /// Resolve branch and path without touching the repository.
    fn preview(&self, req: &WorktreeRequest) -> Result<WorktreeInfo, WorktreeError>;

    fn create(&self, req: &WorktreeRequest) -> Result<WorktreeInfo, WorktreeError>;

    fn remove(&self, repo: &Path, path: &Path, force: bool) -> Result<(), WorktreeError>;
}

/// Drives `git worktree` in the target repository.
#[derive(Debug, Clone)]
pub struct GitWorktreeRunner {
    program: PathBuf,
}

impl Default for GitWorktreeRunner {
    fn default() -> Self {
        Self::with_program("git")
    }
}

impl GitWorktreeRunner {
    #[must_use]
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn open(&self, dir: &Path) -> Result<Git, WorktreeError> {
        Ok(Git::from_dir(dir)?.with_program(&self.program))
    }

    fn plan(
        git: &Git,
        req: &WorktreeRequest,
        allow_fetch: bool,
    ) -> Result<WorktreeInfo, WorktreeError> {
        let path = worktree_path(git.repo_root(), req)?;
        match &req.source {
            BranchSource::Target { branch } => {
                let mut location = git.locate_branch(branch, &req.remote)?;
                if location.is_none() && allow_fetch {
                    if let Err(e) = git.fetch(&req.remote, branch) {
                        warn!(branch = %branch, error = %e, "fetch of target branch failed");
                    }
                    location = git.locate_branch(branch, &req.remote)?;
                }
                let action = match location {
                    None => return Err(WorktreeError::BranchNotFound(branch.clone())),
                    Some(BranchLocation::Local | BranchLocation::Both) => CheckoutAction::Existing,
                    Some(BranchLocation::Remote) => CheckoutAction::Tracking,
                };
                Ok(WorktreeInfo {
                    path,
                    branch: branch.clone(),
                    action,
                })
            }
            BranchSource::NewFromBase { base } => {
                let start_point = match base {
                    None => None,
                    Some(base) => Some(resolve_start_point(git, base, &req.remote)?),
                };
                let wanted = format!("{}/{}", req.branch_prefix.trim_matches('/'), req.name);
                if req.use_local
                    && matches!(
                        git.locate_branch(&wanted, &req.remote)?,
                        Some(BranchLocation::Local | BranchLocation::Both)
                    )
                {
                    return Ok(WorktreeInfo {
                        path,
                        branch: wanted,
                        action: CheckoutAction::Existing,
                    });
                }
                let branch = first_free(&wanted, |candidate| {
                    git.locate_branch(candidate, &req.remote).map(|l| l.is_some())
                })?
                .ok_or_else(|| WorktreeError::BranchTaken(wanted.clone()))?;
                Ok(WorktreeInfo {
                    path,
                    branch,
                    action: CheckoutAction::NewBranch { start_point },
                })
            }
        }
    }
}

impl WorktreeRunner for GitWorktreeRunner {
    fn repo_root(&self, dir: &Path) -> Result<PathBuf, WorktreeError> {
        Ok(self.open(dir)?.repo_root().to_path_buf())
    }

    fn preview(&self, req: &WorktreeRequest) -> Result<WorktreeInfo, WorktreeError> {
        let git = self.open(&req.repo)?;
        Self::plan(&git, req, false)
    }

    fn create(&self, req: &WorktreeRequest) -> Result<WorktreeInfo, WorktreeError> {
        let git = self.open(&req.repo)?;
        let info = Self::plan(&git, req, true)?;

        if let Some(parent) = info.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| WorktreeError::IoPath {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        match &info.action {
            CheckoutAction::NewBranch { start_point } => {
                git.add_worktree_new_branch(&info.path, &info.branch, start_point.as_deref())?;
            }
            CheckoutAction::Existing => git.add_worktree_existing(&info.path, &info.branch)?,
            CheckoutAction::Tracking => {
                git.add_worktree_tracking(&info.path, &info.branch, &req.remote)?;
            }
        }
        info!(
            path = %info.path.display(),
            branch = %info.branch,
            "worktree created"
        );
        Ok(info)
    }

    fn remove(&self, repo: &Path, path: &Path, force: bool) -> Result<(), WorktreeError> {
        let git = self.open(repo)?;
        if !path.exists() {
            warn!(path = %path.display(), "worktree directory already gone; pruning");
            return git.prune_worktrees();
        }
        git.remove_worktree(path, force)?;
        info!(path = %path.display(), "worktree removed");
        Ok(())
    }
}

fn resolve_start_point(git: &Git, base: &str, remote: &str) -> Result<String, WorktreeError> {
    match git.locate_branch(base, remote)? {
        Some(BranchLocation::Local | BranchLocation::Both) => Ok(base.to_owned()),
        Some(BranchLocation::Remote) => Ok(format!("{remote}/{base}")),
        // Tags and commit-ish values are accepted as-is.
        None => match git.run(&["rev-parse", "--verify", "--quiet", base]) {
            Ok(_) => Ok(base.to_owned()),
            Err(_) => Err(WorktreeError::BranchNotFound(base.to_owned())),
        },
    }
}

/// Render the path template and step past directories that are already taken.
fn worktree_path(repo_root: &Path, req: &WorktreeRequest) -> Result<PathBuf, WorktreeError> {
    let repo_name = repo_root
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("repo");
    let base_dir = req
        .base_dir
        .clone()
        .or_else(|| repo_root.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| repo_root.to_path_buf());
    let rel = render_template(&req.path_template, repo_name, &req.name);
    let wanted = base_dir.join(rel).to_string_lossy().to_string();
    let free = first_free(&wanted, |candidate| {
        Ok::<_, WorktreeError>(Path::new(candidate).exists())
    })?
    .ok_or_else(|| WorktreeError::PathOccupied(PathBuf::from(&wanted)))?;
    Ok(PathBuf::from(free))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_and_target_are_mutually_exclusive() {
        assert!(matches!(
            BranchSource::from_options(Some("main".into()), Some("feat/x".into())),
            Err(WorkspaceError::ConflictingBranchOptions)
        ));
        assert_eq!(
            BranchSource::from_options(None, Some("feat/x".into())).unwrap(),
            BranchSource::Target {
                branch: "feat/x".into()
            }
        );
        assert_eq!(
            BranchSource::from_options(Some(" ".into()), None).unwrap(),
            BranchSource::NewFromBase { base: None }
        );
    }

    #[test]
    fn worktree_path_skips_occupied_directories() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("api");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::create_dir_all(dir.path().join("api-fix")).unwrap();

        let req = WorktreeRequest {
            repo: repo.clone(),
            name: "fix".into(),
            branch_prefix: "feat".into(),
            source: BranchSource::NewFromBase { base: None },
            use_local: false,
            remote: "origin".into(),
            base_dir: None,
            path_template: "{{repo}}-{{name}}".into(),
        };
        assert_eq!(worktree_path(&repo, &req).unwrap(), dir.path().join("api-fix-2"));
    }

    #[test]
    fn missing_git_binary_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("api");
        std::fs::create_dir_all(repo.join(".git")).unwrap();
        let runner = GitWorktreeRunner::with_program(dir.path().join("no-such-git"));

        let req = WorktreeRequest {
            repo: repo.clone(),
            name: "fix".into(),
            branch_prefix: "feat".into(),
            source: BranchSource::NewFromBase { base: None },
            use_local: false,
            remote: "origin".into(),
            base_dir: None,
            path_template: "{{repo}}-{{name}}".into(),
        };
        assert!(matches!(runner.preview(&req), Err(WorktreeError::GitNotFound)));
        assert!(matches!(runner.create(&req), Err(WorktreeError::GitNotFound)));
        assert!(!dir.path().join("api-fix").exists());
    }
}
