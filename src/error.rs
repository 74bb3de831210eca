#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::step::definition::StepType;
use crate::task::model::TaskStatus;

/// Coarse classification used by callers to pick an exit code and decide
/// whether anything needs cleaning up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad flags, unknown template, unknown agent or model.
    UserInput,
    /// Not in a repository, missing branch, missing binary.
    Environment,
    /// The task stopped in a state that `resume` can pick up.
    ResumableExecution,
    /// Nothing durable exists to resume.
    UnresumableExecution,
    /// Store corruption, impossible transitions, failed persistence.
    Internal,
    /// Operator interrupt; state was paused.
    Interrupted,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("unknown config key: {0}")]
    InvalidKey(String),

    #[error("invalid value for {key}: {msg}")]
    InvalidValue { key: String, msg: String },

    #[error("invalid duration '{0}' (use ms|s|m|h|d|w, e.g. 30m)")]
    InvalidDuration(String),
}

impl ConfigError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        ErrorClass::UserInput
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{key}' not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} '{key}' already exists")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("invalid {kind} key '{key}': {reason}")]
    InvalidKey {
        kind: &'static str,
        key: String,
        reason: &'static str,
    },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {kind} '{key}': {source}")]
    Encode {
        kind: &'static str,
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("not inside a git repository: {0}")]
    NotInGitRepo(PathBuf),

    #[error("git is required but was not found in PATH")]
    GitNotFound,

    #[error("branch not found: {0}")]
    BranchNotFound(String),

    #[error("no free worktree path near {0}")]
    PathOccupied(PathBuf),

    #[error("no free branch name near {0}")]
    BranchTaken(String),

    #[error("git {args}: {stderr}")]
    Git { args: String, stderr: String },

    #[error("io error at {path}: {source}")]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid workspace name '{0}': must contain at least one letter or digit")]
    InvalidName(String),

    #[error("--base and --target are mutually exclusive")]
    ConflictingBranchOptions,

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error("no executor registered for step type '{0}'")]
    NoExecutor(StepType),

    #[error("step cancelled")]
    Cancelled,

    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    #[error("validation failed: {summary}")]
    ValidationFailed { summary: String, output: String },

    #[error("git {operation} failed: {message}")]
    Git { operation: String, message: String },

    #[error("verification reported problems: {summary}")]
    Verification { summary: String, output: String },

    #[error("ci checks failed: {0}")]
    CiFailed(String),

    #[error("ci checks did not finish within {0:?}")]
    CiTimeout(Duration),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("ai agent failed: {0}")]
    Agent(String),

    #[error("{0}")]
    Failed(String),

    #[error("io error at {path}: {source}")]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StepError {
    /// Captured command or agent output attached to the failure, if any.
    #[must_use]
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::ValidationFailed { output, .. } | Self::Verification { output, .. } => {
                Some(output)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template '{0}' not found")]
    NotFound(String),

    #[error("template '{template}' step '{step}' has unknown step type '{step_type}'")]
    UnknownStepType {
        template: String,
        step: String,
        step_type: String,
    },

    #[error("template '{id}' is invalid: {reason}")]
    Invalid { id: String, reason: String },

    #[error("failed to parse template {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("io error at {path}: {source}")]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("task '{task_id}' in workspace '{workspace}' was interrupted")]
    Interrupted { workspace: String, task_id: String },

    #[error(
        "task '{task_id}' cannot be resumed: status is '{status}' (resumable: validation_failed, gh_failed, ci_failed, ci_timeout, interrupted, awaiting_approval)"
    )]
    NotResumable { task_id: String, status: TaskStatus },

    #[error("task '{task_id}' cannot {action} from status '{status}'")]
    WrongStatus {
        task_id: String,
        action: &'static str,
        status: TaskStatus,
    },

    #[error("invalid task transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("task '{task_id}' is already being executed by pid {pid} (lock: {lock})")]
    AlreadyRunning {
        task_id: String,
        pid: u32,
        lock: PathBuf,
    },

    #[error("workspace '{0}' has no tasks")]
    NoTask(String),

    #[error("unknown agent '{0}' (expected one of: claude, codex, gemini)")]
    UnknownAgent(String),

    #[error("model '{model}' is not valid for agent '{agent}' (expected one of: {allowed})")]
    InvalidModel {
        agent: String,
        model: String,
        allowed: String,
    },

    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<WorktreeError> for EngineError {
    fn from(e: WorktreeError) -> Self {
        Self::Workspace(WorkspaceError::Worktree(e))
    }
}

impl StoreError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Internal
    }
}

impl WorktreeError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotInGitRepo(_) | Self::GitNotFound | Self::BranchNotFound(_) => {
                ErrorClass::Environment
            }
            Self::PathOccupied(_)
            | Self::BranchTaken(_)
            | Self::Git { .. }
            | Self::IoPath { .. } => {
                ErrorClass::UnresumableExecution
            }
        }
    }
}

impl WorkspaceError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidName(_) | Self::ConflictingBranchOptions => ErrorClass::UserInput,
            Self::Worktree(e) => e.class(),
            Self::Store(e) => e.class(),
        }
    }
}

impl TemplateError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound(_) | Self::UnknownStepType { .. } | Self::Invalid { .. } => {
                ErrorClass::UserInput
            }
            Self::Parse { .. } | Self::IoPath { .. } => ErrorClass::Environment,
        }
    }
}

impl EngineError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Cancelled | Self::Interrupted { .. } => ErrorClass::Interrupted,
            Self::NotResumable { .. }
            | Self::WrongStatus { .. }
            | Self::UnknownAgent(_)
            | Self::InvalidModel { .. }
            | Self::Usage(_) => ErrorClass::UserInput,
            Self::AlreadyRunning { .. } | Self::NoTask(_) => ErrorClass::Environment,
            Self::InvalidTransition { .. } => ErrorClass::Internal,
            Self::Config(e) => e.class(),
            Self::Template(e) => e.class(),
            Self::Workspace(e) => e.class(),
            Self::Store(e) => e.class(),
        }
    }

    /// Sentinel check for the operator-interrupt path.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}
