#![forbid(unsafe_code)]

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Active,
    Paused,
    Closed,
}

impl WorkspaceStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workspace {
    pub name: String,
    pub repository: PathBuf,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub status: WorkspaceStatus,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub tasks: Vec<String>,
}

impl Workspace {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status == WorkspaceStatus::Closed
    }

    #[must_use]
    pub fn latest_task(&self) -> Option<&str> {
        self.tasks.last().map(String::as_str)
    }
}
