#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::StepError;
use crate::runner::ai::{AiRequest, AiRunner};
use crate::step::definition::{StepConfig, StepDefinition, StepType};
use crate::step::{
    StepContext, StepExecutor, StepResult, render_prompt, resolve_agent, task_overrides,
};
use crate::task::model::{Task, meta};

fn sdd_prompt(task: &Task, output: &str) -> String {
    format!(
        "Write a specification for the task below before any code is changed.\n\n\
         Task:\n{}\n\n\
         Cover the problem, the intended behaviour, edge cases, and how the change will be \
         tested. Write the document to `{output}` (create directories as needed) and do not \
         modify any other file. Reply with the document's content.",
        task.description.trim()
    )
}

/// Spec-driven development: have an agent write a spec document first.
pub struct SddExecutor {
    runner: Arc<dyn AiRunner>,
}

impl SddExecutor {
    #[must_use]
    pub fn new(runner: Arc<dyn AiRunner>) -> Self {
        Self { runner }
    }
}

fn write_spec(path: &Path, content: &str) -> Result<(), StepError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| StepError::IoPath {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, content).map_err(|source| StepError::IoPath {
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait]
impl StepExecutor for SddExecutor {
    fn step_type(&self) -> StepType {
        StepType::Sdd
    }

    async fn execute(
        &self,
        cx: &StepContext<'_>,
        task: &Task,
        step: &StepDefinition,
    ) -> Result<StepResult, StepError> {
        cx.check_cancelled()?;
        let StepConfig::Sdd(cfg) = &step.config else {
            return Err(StepError::Failed(format!(
                "step '{}' is not an sdd step",
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
        let rel = render_prompt(&cfg.output, task);
        let path = cx.worktree.join(&rel);

        let resp = self
            .runner
            .run(
                cx.cancel,
                &AiRequest {
                    agent,
                    model: model.clone(),
                    prompt: sdd_prompt(task, &rel),
                    workdir: cx.worktree.to_path_buf(),
                    timeout: cx.settings.ai_timeout,
                    read_only: false,
                    transcript: cx.transcript.clone(),
                },
            )
            .await?;

        if path.is_file() {
            debug!(path = %path.display(), "agent wrote the spec itself");
        } else {
            if resp.output.trim().is_empty() {
                return Err(StepError::Failed(
                    "agent produced no specification".to_owned(),
                ));
            }
            write_spec(&path, &resp.output)?;
        }
        info!(task_id = %task.id, spec = %rel, "specification ready");

        let mut res = StepResult::with_output(resp.output).meta("spec_path", rel.clone());
        res.agent = Some(agent.to_string());
        res.model = Some(model);
        res.num_turns = resp.num_turns;
        res.files_changed = vec![rel.clone()];
        res.task_metadata
            .insert(meta::SPEC_PATH.to_owned(), rel.into());
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::definition::SddStepConfig;
    use crate::testing::{ScriptedAiRunner, StepHarness, sample_task};

    #[tokio::test]
    async fn writes_spec_when_agent_only_replies() {
        let ai = Arc::new(ScriptedAiRunner::new());
        ai.push_ok("# Spec\n\nBehaviour...", &[]);
        let harness = StepHarness::new();
        let task = sample_task("ws", "task-1");
        let step = StepDefinition::new("spec", StepConfig::Sdd(SddStepConfig::default()));

        let res = SddExecutor::new(ai)
            .execute(&harness.cx(), &task, &step)
            .await
            .unwrap();

        let written = harness.worktree().join("specs/task-1/spec.md");
        assert_eq!(
            std::fs::read_to_string(written).unwrap(),
            "# Spec\n\nBehaviour..."
        );
        assert_eq!(res.task_metadata[meta::SPEC_PATH], "specs/task-1/spec.md");
    }

    #[tokio::test]
    async fn empty_reply_without_file_fails() {
        let ai = Arc::new(ScriptedAiRunner::new());
        ai.push_ok("   ", &[]);
        let harness = StepHarness::new();
        let task = sample_task("ws", "task-1");
        let step = StepDefinition::new("spec", StepConfig::Sdd(SddStepConfig::default()));
        assert!(
            SddExecutor::new(ai)
                .execute(&harness.cx(), &task, &step)
                .await
                .is_err()
        );
    }
}
