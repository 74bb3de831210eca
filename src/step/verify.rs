#![forbid(unsafe_code)]

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::StepError;
use crate::runner::ai::{AiRequest, AiRunner};
use crate::step::definition::{StepConfig, StepDefinition, StepType};
use crate::step::{StepContext, StepExecutor, StepResult, resolve_agent, task_overrides};
use crate::task::model::Task;

const DEFAULT_CHECKS: [&str; 3] = [
    "The change does what the task asks and nothing unrelated",
    "No obvious bugs, missing error handling or security problems",
    "Tests cover the new behaviour",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Pass,
    Fail,
}

/// The last `VERDICT: PASS|FAIL` line wins; no verdict counts as a failure.
pub(crate) fn parse_verdict(output: &str) -> Option<Verdict> {
    output.lines().rev().find_map(|line| {
        let rest = line.trim().trim_start_matches(['*', '#', ' ']).strip_prefix("VERDICT:")?;
        match rest.trim().trim_end_matches('*').trim().to_uppercase().as_str() {
            "PASS" => Some(Verdict::Pass),
            "FAIL" => Some(Verdict::Fail),
            _ => None,
        }
    })
}

fn verify_prompt(task: &Task, checks: &[String]) -> String {
    let mut p = format!(
        "You are reviewing uncommitted changes in this repository made for the following task:\n\n{}\n\nInspect the diff (git diff HEAD and untracked files) and check:\n",
        task.description.trim()
    );
    if checks.is_empty() {
        for c in DEFAULT_CHECKS {
            let _ = writeln!(p, "- {c}");
        }
    } else {
        for c in checks {
            let _ = writeln!(p, "- {c}");
        }
    }
    p.push_str(
        "\nDo not modify any files. List every problem you find, then finish with a single line \
         `VERDICT: PASS` if the change is acceptable or `VERDICT: FAIL` otherwise.",
    );
    p
}

/// Read-only review of the worktree by a (preferably different) model.
pub struct VerifyExecutor {
    runner: Arc<dyn AiRunner>,
}

impl VerifyExecutor {
    #[must_use]
    pub fn new(runner: Arc<dyn AiRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl StepExecutor for VerifyExecutor {
    fn step_type(&self) -> StepType {
        StepType::Verify
    }

    async fn execute(
        &self,
        cx: &StepContext<'_>,
        task: &Task,
        step: &StepDefinition,
    ) -> Result<StepResult, StepError> {
        cx.check_cancelled()?;
        let StepConfig::Verify(cfg) = &step.config else {
            return Err(StepError::Failed(format!(
                "step '{}' is not a verify step",
                step.name
            )));
        };
        let configured = (
            cx.settings.verify_agent.map(|a| a.as_str()),
            cx.settings.verify_model.as_deref(),
        );
        let (agent, model) = resolve_agent(
            &[
                (cfg.agent.as_deref(), cfg.model.as_deref()),
                configured,
                task_overrides(task),
            ],
            cx.settings,
        )?;

        let resp = self
            .runner
            .run(
                cx.cancel,
                &AiRequest {
                    agent,
                    model: model.clone(),
                    prompt: verify_prompt(task, &cfg.checks),
                    workdir: cx.worktree.to_path_buf(),
                    timeout: cx.settings.ai_timeout,
                    read_only: true,
                    transcript: cx.transcript.clone(),
                },
            )
            .await?;

        let verdict = parse_verdict(&resp.output);
        info!(task_id = %task.id, step = %step.name, verdict = ?verdict, "verification finished");
        match verdict {
            Some(Verdict::Pass) => {
                let mut res = StepResult::with_output(resp.output).meta("verdict", "pass");
                res.agent = Some(agent.to_string());
                res.model = Some(model);
                res.num_turns = resp.num_turns;
                Ok(res)
            }
            Some(Verdict::Fail) => Err(StepError::Verification {
                summary: format!("{agent}/{model} reported problems"),
                output: resp.output,
            }),
            None => Err(StepError::Verification {
                summary: format!("{agent}/{model} gave no verdict"),
                output: resp.output,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::agent::Agent;
    use crate::step::ExecutionSettings;
    use crate::step::definition::VerifyStepConfig;
    use crate::testing::{ScriptedAiRunner, StepHarness, sample_task};

    #[test]
    fn parses_verdicts() {
        assert_eq!(parse_verdict("looks fine\nVERDICT: PASS"), Some(Verdict::Pass));
        assert_eq!(parse_verdict("**VERDICT: FAIL**\n"), Some(Verdict::Fail));
        assert_eq!(
            parse_verdict("VERDICT: FAIL\nfixed on reflection\nVERDICT: pass"),
            Some(Verdict::Pass)
        );
        assert_eq!(parse_verdict("no idea"), None);
    }

    #[tokio::test]
    async fn uses_configured_verify_agent_read_only() {
        let ai = Arc::new(ScriptedAiRunner::new());
        ai.push_ok("1. missing test\nVERDICT: FAIL", &[]);
        let mut harness = StepHarness::new();
        harness.settings = ExecutionSettings {
            verify_agent: Some(Agent::Gemini),
            ..ExecutionSettings::default()
        };
        let task = sample_task("ws", "task-1");
        let step = StepDefinition::new("verify", StepConfig::Verify(VerifyStepConfig::default()));

        let err = VerifyExecutor::new(ai.clone())
            .execute(&harness.cx(), &task, &step)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Verification { .. }));
        assert_eq!(err.output(), Some("1. missing test\nVERDICT: FAIL"));

        let req = ai.requests().pop().unwrap();
        assert_eq!(req.agent, Agent::Gemini);
        assert_eq!(req.model, "gemini-2.5-pro");
        assert!(req.read_only);
        assert!(req.prompt.contains("Tests cover the new behaviour"));
    }
}
