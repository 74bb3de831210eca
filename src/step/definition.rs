#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Tag identifying which executor runs a step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Ai,
    Validation,
    Git,
    Verify,
    Sdd,
    Ci,
    Human,
    Loop,
}

impl StepType {
    pub const ALL: [StepType; 8] = [
        StepType::Ai,
        StepType::Validation,
        StepType::Git,
        StepType::Verify,
        StepType::Sdd,
        StepType::Ci,
        StepType::Human,
        StepType::Loop,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Validation => "validation",
            Self::Git => "git",
            Self::Verify => "verify",
            Self::Sdd => "sdd",
            Self::Ci => "ci",
            Self::Human => "human",
            Self::Loop => "loop",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStepType(pub String);

impl fmt::Display for UnknownStepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown step type '{}'", self.0)
    }
}

impl std::error::Error for UnknownStepType {}

impl FromStr for StepType {
    type Err = UnknownStepType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| UnknownStepType(s.to_owned()))
    }
}

/// One entry of a template's step list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(flatten)]
    pub config: StepConfig,
}

fn default_required() -> bool {
    true
}

impl StepDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, config: StepConfig) -> Self {
        Self {
            name: name.into(),
            description: None,
            required: true,
            config,
        }
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn step_type(&self) -> StepType {
        self.config.step_type()
    }
}

/// Type-specific configuration, decoded once when a template is loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepConfig {
    Ai(AiStepConfig),
    Validation(ValidationStepConfig),
    Git(GitStepConfig),
    Verify(VerifyStepConfig),
    Sdd(SddStepConfig),
    Ci(CiStepConfig),
    Human(HumanStepConfig),
    Loop(LoopStepConfig),
}

impl StepConfig {
    #[must_use]
    pub fn step_type(&self) -> StepType {
        match self {
            Self::Ai(_) => StepType::Ai,
            Self::Validation(_) => StepType::Validation,
            Self::Git(_) => StepType::Git,
            Self::Verify(_) => StepType::Verify,
            Self::Sdd(_) => StepType::Sdd,
            Self::Ci(_) => StepType::Ci,
            Self::Human(_) => StepType::Human,
            Self::Loop(_) => StepType::Loop,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AiStepConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Prompt template; `{{description}}` expands to the task description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationStepConfig {
    /// Commands that may rewrite files (formatters). Run first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub format_commands: Vec<String>,
    /// Commands that must pass. Empty means the configured defaults.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GitOperation {
    Commit,
    Push,
    CreatePr,
}

impl GitOperation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Push => "push",
            Self::CreatePr => "create_pr",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitStepConfig {
    pub operation: GitOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(default)]
    pub draft: bool,
}

impl GitStepConfig {
    #[must_use]
    pub fn new(operation: GitOperation) -> Self {
        Self {
            operation,
            message: None,
            base: None,
            draft: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyStepConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SddStepConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Where the spec document lands, relative to the worktree.
    /// `{{task_id}}` expands to the task ID.
    pub output: String,
}

impl Default for SddStepConfig {
    fn default() -> Self {
        Self {
            agent: None,
            model: None,
            output: "specs/{{task_id}}/spec.md".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CiStepConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Only these check names gate the step. Empty means all checks.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HumanStepConfig {
    pub prompt: String,
}

impl Default for HumanStepConfig {
    fn default() -> Self {
        Self {
            prompt: "Review the changes and approve".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoopUntil {
    /// Stop after the first iteration in which every nested step succeeded.
    #[default]
    Success,
    /// Stop once any nested step output contains `exit_signal`.
    Signal,
    /// Always run `max_iterations` times.
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopStepConfig {
    pub steps: Vec<StepDefinition>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub until: LoopUntil,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_signal: Option<String>,
}

fn default_max_iterations() -> u32 {
    3
}
