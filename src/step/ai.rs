#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::StepError;
use crate::runner::ai::{AiRequest, AiRunner};
use crate::step::definition::{StepConfig, StepDefinition, StepType};
use crate::step::{
    StepContext, StepExecutor, StepResult, render_prompt, resolve_agent, step_timeout,
    task_overrides,
};
use crate::task::model::Task;

const DEFAULT_PROMPT: &str = "{{description}}";

/// Hands the task to an AI agent working directly in the worktree.
pub struct AiExecutor {
    runner: Arc<dyn AiRunner>,
}

impl AiExecutor {
    #[must_use]
    pub fn new(runner: Arc<dyn AiRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl StepExecutor for AiExecutor {
    fn step_type(&self) -> StepType {
        StepType::Ai
    }

    async fn execute(
        &self,
        cx: &StepContext<'_>,
        task: &Task,
        step: &StepDefinition,
    ) -> Result<StepResult, StepError> {
        cx.check_cancelled()?;
        let StepConfig::Ai(cfg) = &step.config else {
            return Err(StepError::Failed(format!(
                "step '{}' is not an ai step",
                step.name
            )));
        };

        let (agent, model) = resolve_agent(
            &[
                task_overrides(task),
                (cfg.agent.as_deref(), cfg.model.as_deref()),
            ],
            cx.settings,
        )?;
        let timeout = step_timeout(cfg.timeout.as_deref(), cx.settings.ai_timeout)?;
        let prompt = render_prompt(cfg.prompt.as_deref().unwrap_or(DEFAULT_PROMPT), task);

        info!(task_id = %task.id, step = %step.name, agent = %agent, model = %model, "ai step starting");
        let resp = self
            .runner
            .run(
                cx.cancel,
                &AiRequest {
                    agent,
                    model: model.clone(),
                    prompt,
                    workdir: cx.worktree.to_path_buf(),
                    timeout,
                    read_only: false,
                    transcript: cx.transcript.clone(),
                },
            )
            .await?;

        let mut result = StepResult::with_output(resp.output);
        result.agent = Some(agent.to_string());
        result.model = Some(model);
        result.num_turns = resp.num_turns;
        result.files_changed = resp.files_changed;
        if let Some(session) = resp.session_id {
            result = result.meta("session_id", session);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::agent::Agent;
    use crate::step::definition::AiStepConfig;
    use crate::testing::{ScriptedAiRunner, StepHarness};

    #[tokio::test]
    async fn runs_agent_with_task_overrides() {
        let ai = Arc::new(ScriptedAiRunner::new());
        ai.push_ok("implemented", &["src/lib.rs"]);
        let harness = StepHarness::new();
        let mut task = crate::testing::sample_task("ws", "task-1");
        task.metadata
            .insert("agent".into(), serde_json::json!("codex"));

        let step = StepDefinition::new(
            "implement",
            StepConfig::Ai(AiStepConfig {
                prompt: Some("Do: {{description}}".into()),
                ..AiStepConfig::default()
            }),
        );
        let res = AiExecutor::new(ai.clone())
            .execute(&harness.cx(), &task, &step)
            .await
            .unwrap();

        assert_eq!(res.output, "implemented");
        assert_eq!(res.files_changed, vec!["src/lib.rs".to_owned()]);
        assert_eq!(res.agent.as_deref(), Some("codex"));
        let req = ai.requests().pop().unwrap();
        assert_eq!(req.agent, Agent::Codex);
        assert_eq!(req.model, "gpt-5-codex");
        assert_eq!(req.prompt, format!("Do: {}", task.description));
        assert!(!req.read_only);
    }

    #[tokio::test]
    async fn agent_errors_propagate() {
        let ai = Arc::new(ScriptedAiRunner::new());
        ai.push_err(StepError::Timeout(std::time::Duration::from_secs(1)));
        let harness = StepHarness::new();
        let task = crate::testing::sample_task("ws", "task-1");
        let step = StepDefinition::new("implement", StepConfig::Ai(AiStepConfig::default()));
        let err = AiExecutor::new(ai)
            .execute(&harness.cx(), &task, &step)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Timeout(_)));
    }
}
