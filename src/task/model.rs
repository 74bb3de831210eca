#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::step::definition::{StepDefinition, StepType};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Validating,
    AwaitingApproval,
    Completed,
    ValidationFailed,
    GhFailed,
    CiFailed,
    CiTimeout,
    Interrupted,
    Rejected,
    Abandoned,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 12] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Validating,
        TaskStatus::AwaitingApproval,
        TaskStatus::Completed,
        TaskStatus::ValidationFailed,
        TaskStatus::GhFailed,
        TaskStatus::CiFailed,
        TaskStatus::CiTimeout,
        TaskStatus::Interrupted,
        TaskStatus::Rejected,
        TaskStatus::Abandoned,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Validating => "validating",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::ValidationFailed => "validation_failed",
            Self::GhFailed => "gh_failed",
            Self::CiFailed => "ci_failed",
            Self::CiTimeout => "ci_timeout",
            Self::Interrupted => "interrupted",
            Self::Rejected => "rejected",
            Self::Abandoned => "abandoned",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Abandoned)
    }

    /// Failure states a run can stop in and later be resumed from.
    #[must_use]
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::ValidationFailed
                | Self::GhFailed
                | Self::CiFailed
                | Self::CiTimeout
                | Self::Interrupted
        )
    }

    #[must_use]
    pub fn is_resumable(self) -> bool {
        self.is_error() || self == Self::AwaitingApproval
    }

    /// A process is (or was, before crashing) executing steps.
    #[must_use]
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Validating)
    }

    /// Legal edges of the task state machine.
    #[must_use]
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus as S;
        match self {
            S::Pending => matches!(to, S::Running | S::Interrupted | S::Abandoned),
            S::Running => matches!(
                to,
                S::Validating
                    | S::AwaitingApproval
                    | S::Completed
                    | S::ValidationFailed
                    | S::GhFailed
                    | S::CiFailed
                    | S::CiTimeout
                    | S::Interrupted
                    | S::Rejected
            ),
            S::Validating => matches!(
                to,
                S::Running
                    | S::Completed
                    | S::ValidationFailed
                    | S::Interrupted
            ),
            S::AwaitingApproval => matches!(
                to,
                S::Running | S::Completed | S::Rejected | S::Abandoned | S::Interrupted
            ),
            S::ValidationFailed | S::GhFailed | S::CiFailed | S::CiTimeout | S::Interrupted => {
                matches!(to, S::Running | S::Abandoned)
            }
            S::Completed | S::Rejected | S::Abandoned => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known keys in `Task::metadata`.
pub mod meta {
    /// Agent chosen on the command line; overrides template defaults.
    pub const AGENT: &str = "agent";
    pub const MODEL: &str = "model";
    pub const BASE_BRANCH: &str = "base_branch";
    pub const PR_NUMBER: &str = "pr_number";
    pub const PR_URL: &str = "pr_url";
    pub const SPEC_PATH: &str = "spec_path";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Persisted state of one template step within a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    #[serde(flatten)]
    pub definition: StepDefinition,
    pub status: StepStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_changed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Step {
    #[must_use]
    pub fn pending(definition: StepDefinition) -> Self {
        Self {
            definition,
            status: StepStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            num_turns: None,
            files_changed: Vec::new(),
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    #[must_use]
    pub fn step_type(&self) -> StepType {
        self.definition.step_type()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub workspace: String,
    pub template_id: String,
    pub description: String,
    pub status: TaskStatus,
    pub current_step: usize,
    pub steps: Vec<Step>,
    pub branch: String,
    pub worktree_path: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

impl Task {
    #[must_use]
    pub fn new_id() -> String {
        let id = Uuid::new_v4().simple().to_string();
        let short: String = id.chars().take(8).collect();
        format!("task-{short}")
    }

    #[must_use]
    pub fn current(&self) -> Option<&Step> {
        self.steps.get(self.current_step)
    }

    #[must_use]
    pub fn current_mut(&mut self) -> Option<&mut Step> {
        self.steps.get_mut(self.current_step)
    }

    #[must_use]
    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    /// Name of the step the task stopped at, for resume messages.
    #[must_use]
    pub fn current_step_name(&self) -> &str {
        self.current().map_or("(none)", Step::name)
    }

    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(serde_json::Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resumable_partition() {
        let resumable = [
            TaskStatus::ValidationFailed,
            TaskStatus::GhFailed,
            TaskStatus::CiFailed,
            TaskStatus::CiTimeout,
            TaskStatus::Interrupted,
            TaskStatus::AwaitingApproval,
        ];
        let not_resumable = [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Validating,
            TaskStatus::Completed,
            TaskStatus::Rejected,
            TaskStatus::Abandoned,
        ];
        for s in resumable {
            assert!(s.is_resumable(), "{s} should be resumable");
        }
        for s in not_resumable {
            assert!(!s.is_resumable(), "{s} should not be resumable");
        }
        assert_eq!(resumable.len() + not_resumable.len(), TaskStatus::ALL.len());
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in TaskStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in TaskStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn every_resumable_state_can_return_to_running() {
        for s in TaskStatus::ALL.into_iter().filter(|s| s.is_resumable()) {
            assert!(s.can_transition_to(TaskStatus::Running), "{s}");
        }
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn status_serializes_snake_case() {
        let s = serde_json::to_string(&TaskStatus::GhFailed).unwrap();
        assert_eq!(s, "\"gh_failed\"");
        let s = serde_json::to_string(&TaskStatus::AwaitingApproval).unwrap();
        assert_eq!(s, "\"awaiting_approval\"");
    }
}
