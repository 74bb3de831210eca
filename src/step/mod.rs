#![forbid(unsafe_code)]

pub mod ai;
pub mod ci;
pub mod definition;
pub mod dry_run;
pub mod git;
pub mod human;
pub mod loop_step;
pub mod sdd;
pub mod validation;
pub mod verify;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::parse_duration;
use crate::error::StepError;
use crate::runner::Runners;
use crate::runner::agent::Agent;
use crate::step::definition::{StepDefinition, StepType};
use crate::task::model::{Task, meta};

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSettings {
    pub agent: Agent,
    pub model: String,
    pub verify_agent: Option<Agent>,
    pub verify_model: Option<String>,
    pub ai_timeout: Duration,
    pub format_commands: Vec<String>,
    pub validation_commands: Vec<String>,
    pub command_timeout: Duration,
    pub ci_poll_interval: Duration,
    pub ci_timeout: Duration,
    /// Polls with no checks reported before the ci step gives up waiting for
    /// checks to appear and passes.
    pub ci_grace_polls: u32,
    pub remote: String,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            agent: Agent::Claude,
            model: Agent::Claude.default_model().to_owned(),
            verify_agent: None,
            verify_model: None,
            ai_timeout: Duration::from_secs(30 * 60),
            format_commands: Vec::new(),
            validation_commands: Vec::new(),
            command_timeout: Duration::from_secs(10 * 60),
            ci_poll_interval: Duration::from_secs(30),
            ci_timeout: Duration::from_secs(30 * 60),
            ci_grace_polls: 4,
            remote: "origin".to_owned(),
        }
    }
}

pub struct StepContext<'a> {
    pub cancel: &'a CancellationToken,
    pub worktree: &'a Path,
    pub settings: &'a ExecutionSettings,
    /// Used by `loop` steps to run their nested steps.
    pub registry: &'a ExecutorRegistry,
    /// Where AI executors stream their JSONL transcript, if anywhere.
    pub transcript: Option<PathBuf>,
}

impl StepContext<'_> {
    pub(crate) fn check_cancelled(&self) -> Result<(), StepError> {
        if self.cancel.is_cancelled() {
            Err(StepError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResult {
    pub output: String,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub num_turns: Option<u32>,
    pub files_changed: Vec<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Merged into the task's metadata (PR number, spec path, ...).
    pub task_metadata: BTreeMap<String, serde_json::Value>,
    /// The step is waiting for a human decision.
    pub awaiting_approval: bool,
}

impl StepResult {
    #[must_use]
    pub fn with_output(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_owned(), value.into());
        self
    }
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    fn step_type(&self) -> StepType;

    async fn execute(
        &self,
        cx: &StepContext<'_>,
        task: &Task,
        step: &StepDefinition,
    ) -> Result<StepResult, StepError>;
}

#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<StepType, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn standard(runners: &Runners) -> Self {
        let mut reg = Self::empty();
        for step_type in StepType::ALL {
            reg.register(executor_for(step_type, runners));
        }
        reg
    }

    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) -> Option<Arc<dyn StepExecutor>> {
        self.executors.insert(executor.step_type(), executor)
    }

    pub fn get(&self, step_type: StepType) -> Result<Arc<dyn StepExecutor>, StepError> {
        self.executors
            .get(&step_type)
            .cloned()
            .ok_or(StepError::NoExecutor(step_type))
    }

    #[must_use]
    pub fn contains(&self, step_type: StepType) -> bool {
        self.executors.contains_key(&step_type)
    }
}

// Names every StepType with no wildcard arm, like `simulator_for`.
fn executor_for(step_type: StepType, runners: &Runners) -> Arc<dyn StepExecutor> {
    match step_type {
        StepType::Ai => Arc::new(ai::AiExecutor::new(runners.ai.clone())),
        StepType::Validation => {
            Arc::new(validation::ValidationExecutor::new(runners.commands.clone()))
        }
        StepType::Git => Arc::new(git::GitExecutor::new(runners.hub.clone())),
        StepType::Verify => Arc::new(verify::VerifyExecutor::new(runners.ai.clone())),
        StepType::Sdd => Arc::new(sdd::SddExecutor::new(runners.ai.clone())),
        StepType::Ci => Arc::new(ci::CiExecutor::new(runners.hub.clone())),
        StepType::Human => Arc::new(human::HumanExecutor::new(runners.approval.clone())),
        StepType::Loop => Arc::new(loop_step::LoopExecutor),
    }
}

/// Agent and model for an AI-backed step.
///
/// `candidates` are `(agent, model)` pairs in precedence order. The first
/// candidate naming an agent wins; its model is used if given, otherwise the
/// first model from an agent-less candidate, then the configured default when
/// it belongs to the same agent, then the agent's default.
pub(crate) fn resolve_agent(
    candidates: &[(Option<&str>, Option<&str>)],
    settings: &ExecutionSettings,
) -> Result<(Agent, String), StepError> {
    let chosen = candidates.iter().find(|(a, _)| a.is_some());
    let agent = match chosen.and_then(|(a, _)| *a) {
        Some(name) => name
            .parse::<Agent>()
            .map_err(|e| StepError::Failed(e.to_string()))?,
        None => settings.agent,
    };
    let model = chosen
        .and_then(|(_, m)| *m)
        .or_else(|| {
            candidates
                .iter()
                .filter(|(a, _)| a.is_none())
                .find_map(|(_, m)| *m)
        })
        .map(str::to_owned)
        .unwrap_or_else(|| {
            if agent == settings.agent {
                settings.model.clone()
            } else {
                agent.default_model().to_owned()
            }
        });
    agent
        .validate_model(&model)
        .map_err(|e| StepError::Failed(e.to_string()))?;
    Ok((agent, model))
}

pub(crate) fn task_overrides(task: &Task) -> (Option<&str>, Option<&str>) {
    (task.metadata_str(meta::AGENT), task.metadata_str(meta::MODEL))
}

pub(crate) fn step_timeout(raw: Option<&str>, default: Duration) -> Result<Duration, StepError> {
    match raw {
        None => Ok(default),
        Some(s) => parse_duration(s).map_err(|e| StepError::Failed(e.to_string())),
    }
}

/// Expand `{{description}}`, `{{task_id}}`, `{{branch}}` and `{{workspace}}`.
#[must_use]
pub fn render_prompt(template: &str, task: &Task) -> String {
    template
        .replace("{{description}}", &task.description)
        .replace("{{task_id}}", &task.id)
        .replace("{{branch}}", &task.branch)
        .replace("{{workspace}}", &task.workspace)
}

/// Truncate long outputs for prompts, keeping the tail where errors usually are.
#[must_use]
pub(crate) fn tail_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    let skip = count - max;
    let start = s.char_indices().nth(skip).map_or(0, |(i, _)| i);
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_covers_every_step_type() {
        let reg = ExecutorRegistry::standard(&crate::testing::fake_runners().runners());
        for t in StepType::ALL {
            assert_eq!(reg.get(t).unwrap().step_type(), t);
        }
        assert!(matches!(
            ExecutorRegistry::empty().get(StepType::Ci),
            Err(StepError::NoExecutor(StepType::Ci))
        ));
    }

    #[test]
    fn agent_resolution_precedence() {
        let settings = ExecutionSettings::default();

        let (a, m) = resolve_agent(&[(None, None)], &settings).unwrap();
        assert_eq!((a, m.as_str()), (Agent::Claude, "sonnet"));

        let (a, m) = resolve_agent(&[(Some("codex"), None), (Some("claude"), None)], &settings)
            .unwrap();
        assert_eq!((a, m.as_str()), (Agent::Codex, "gpt-5-codex"));

        let (a, m) = resolve_agent(&[(None, Some("opus")), (Some("claude"), None)], &settings)
            .unwrap();
        assert_eq!((a, m.as_str()), (Agent::Claude, "opus"));

        assert!(resolve_agent(&[(Some("claude"), Some("gpt-5"))], &settings).is_err());
        assert!(resolve_agent(&[(Some("cursor"), None)], &settings).is_err());
    }

    #[test]
    fn renders_prompt_placeholders() {
        let task = crate::testing::sample_task("ws", "task-1");
        let p = render_prompt("{{task_id}} on {{branch}}: {{description}}", &task);
        assert_eq!(p, format!("task-1 on {}: {}", task.branch, task.description));
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("abc", 10), "abc");
        assert_eq!(tail_chars("ééé", 2), "éé");
    }
}
