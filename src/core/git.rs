#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tracing::debug;

use crate::error::WorktreeError;

/// Where a branch name resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchLocation {
    Local,
    Remote,
    Both,
}

#[derive(Debug, Clone)]
pub struct Git {
    repo_root: PathBuf,
    program: PathBuf,
}

const GIT: &str = "git";

impl Git {
    pub fn from_dir(dir: &Path) -> Result<Self, WorktreeError> {
        let repo_root =
            find_repo_root(dir).ok_or_else(|| WorktreeError::NotInGitRepo(dir.to_path_buf()))?;
        Ok(Self::new(repo_root))
    }

    #[must_use]
    pub fn new(repo_root: PathBuf) -> Self {
        Self {
            repo_root,
            program: PathBuf::from(GIT),
        }
    }

    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    #[must_use]
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn add_worktree_new_branch(
        &self,
        path: &Path,
        branch: &str,
        start_point: Option<&str>,
    ) -> Result<(), WorktreeError> {
        let path = path.to_string_lossy();
        if let Some(start) = start_point {
            let _ = self.run(&["worktree", "add", "-b", branch, &path, start])?;
        } else {
            let _ = self.run(&["worktree", "add", "-b", branch, &path])?;
        }
        Ok(())
    }

    pub fn add_worktree_existing(&self, path: &Path, branch: &str) -> Result<(), WorktreeError> {
        let path = path.to_string_lossy();
        let _ = self.run(&["worktree", "add", &path, branch])?;
        Ok(())
    }

    /// Create a local branch tracking `<remote>/<branch>` and check it out at `path`.
    pub fn add_worktree_tracking(
        &self,
        path: &Path,
        branch: &str,
        remote: &str,
    ) -> Result<(), WorktreeError> {
        let path = path.to_string_lossy();
        let upstream = format!("{remote}/{branch}");
        let _ = self.run(&["worktree", "add", "--track", "-b", branch, &path, &upstream])?;
        Ok(())
    }

    pub fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), WorktreeError> {
        let path = path.to_string_lossy();
        if force {
            let _ = self.run(&["worktree", "remove", "--force", &path])?;
        } else {
            let _ = self.run(&["worktree", "remove", &path])?;
        }
        Ok(())
    }

    pub fn prune_worktrees(&self) -> Result<(), WorktreeError> {
        let _ = self.run(&["worktree", "prune"])?;
        Ok(())
    }

    pub fn fetch(&self, remote: &str, branch: &str) -> Result<(), WorktreeError> {
        let _ = self.run(&["fetch", remote, branch])?;
        Ok(())
    }

    /// Check `refs/heads` and `refs/remotes/<remote>` for `branch`.
    pub fn locate_branch(
        &self,
        branch: &str,
        remote: &str,
    ) -> Result<Option<BranchLocation>, WorktreeError> {
        let local = self.ref_exists(&format!("refs/heads/{branch}"))?;
        let remote = self.ref_exists(&format!("refs/remotes/{remote}/{branch}"))?;
        Ok(match (local, remote) {
            (true, true) => Some(BranchLocation::Both),
            (true, false) => Some(BranchLocation::Local),
            (false, true) => Some(BranchLocation::Remote),
            (false, false) => None,
        })
    }

    fn ref_exists(&self, reference: &str) -> Result<bool, WorktreeError> {
        let out = self.run_raw(&["show-ref", "--verify", "--quiet", reference])?;
        Ok(out.status.success())
    }

    pub fn run(&self, args: &[&str]) -> Result<String, WorktreeError> {
        self.run_in_dir(&self.repo_root, args)
    }

    pub fn run_raw(&self, args: &[&str]) -> Result<Output, WorktreeError> {
        spawn_git(&self.program, &self.repo_root, args)
    }

    pub fn run_in_dir(&self, dir: &Path, args: &[&str]) -> Result<String, WorktreeError> {
        let out = spawn_git(&self.program, dir, args)?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Err(WorktreeError::Git {
                args: args.join(" "),
                stderr: stderr.trim().to_owned(),
            })
        }
    }
}

fn spawn_git(program: &Path, dir: &Path, args: &[&str]) -> Result<Output, WorktreeError> {
    debug!(dir = %dir.display(), args = %args.join(" "), "running git");
    Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => WorktreeError::GitNotFound,
            _ => WorktreeError::IoPath {
                path: dir.to_path_buf(),
                source: e,
            },
        })
}

/// Walk up from `start` to the directory containing `.git` (file or dir).
#[must_use]
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let mut cur = Some(start);
    while let Some(dir) = cur {
        let candidate = dir.join(".git");
        if candidate.is_dir() || candidate.is_file() {
            return Some(dir.to_path_buf());
        }
        cur = dir.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_repo_root_from_nested_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_repo_root(&nested).unwrap(), dir.path());
    }

    #[test]
    fn outside_repo_is_an_environment_error() {
        let dir = tempfile::tempdir().unwrap();
        // tempdirs normally live outside any repository; skip if not.
        if find_repo_root(dir.path()).is_some() {
            return;
        }
        assert!(matches!(
            Git::from_dir(dir.path()),
            Err(WorktreeError::NotInGitRepo(_))
        ));
    }
}
