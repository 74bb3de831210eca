#![forbid(unsafe_code)]

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::StepError;
use crate::step::definition::{LoopStepConfig, LoopUntil, StepConfig, StepDefinition, StepType};
use crate::step::{StepContext, StepExecutor, StepResult};
use crate::task::model::Task;

#[derive(Debug, Default)]
struct Iteration {
    failed: Option<StepError>,
    signalled: bool,
    output: String,
    files_changed: Vec<String>,
}

/// Repeats its nested steps until the exit condition holds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopExecutor;

impl LoopExecutor {
    async fn iterate(
        cx: &StepContext<'_>,
        task: &Task,
        cfg: &LoopStepConfig,
    ) -> Result<Iteration, StepError> {
        let mut it = Iteration::default();
        for nested in &cfg.steps {
            cx.check_cancelled()?;
            let executor = cx.registry.get(nested.step_type())?;
            match executor.execute(cx, task, nested).await {
                Ok(res) => {
                    if res.awaiting_approval {
                        return Err(StepError::Failed(format!(
                            "nested step '{}' cannot wait for approval inside a loop",
                            nested.name
                        )));
                    }
                    if let Some(signal) = &cfg.exit_signal
                        && res.output.contains(signal.as_str())
                    {
                        it.signalled = true;
                    }
                    it.files_changed.extend(res.files_changed);
                    it.output.push_str(&format!("[{}]\n{}\n", nested.name, res.output));
                }
                Err(StepError::Cancelled) => return Err(StepError::Cancelled),
                Err(e) if nested.required => {
                    warn!(task_id = %task.id, step = %nested.name, error = %e, "nested step failed");
                    it.output
                        .push_str(&format!("[{}] failed: {e}\n", nested.name));
                    if let Some(out) = e.output() {
                        it.output.push_str(out);
                        it.output.push('\n');
                    }
                    it.failed = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(task_id = %task.id, step = %nested.name, error = %e, "optional nested step failed");
                }
            }
            if it.signalled {
                break;
            }
        }
        Ok(it)
    }
}

#[async_trait]
impl StepExecutor for LoopExecutor {
    fn step_type(&self) -> StepType {
        StepType::Loop
    }

    async fn execute(
        &self,
        cx: &StepContext<'_>,
        task: &Task,
        step: &StepDefinition,
    ) -> Result<StepResult, StepError> {
        cx.check_cancelled()?;
        let StepConfig::Loop(cfg) = &step.config else {
            return Err(StepError::Failed(format!(
                "step '{}' is not a loop step",
                step.name
            )));
        };

        let mut files = Vec::new();
        let mut outputs = Vec::new();
        let mut last_failure = None;
        for n in 1..=cfg.max_iterations {
            info!(task_id = %task.id, step = %step.name, iteration = n, "loop iteration");
            let it = Self::iterate(cx, task, cfg).await?;
            files.extend(it.files_changed);
            outputs.push(format!("--- iteration {n} ---\n{}", it.output));
            let ok = it.failed.is_none();
            last_failure = it.failed;

            let done = match cfg.until {
                LoopUntil::Success => ok,
                LoopUntil::Signal => it.signalled,
                LoopUntil::Exhausted => false,
            };
            if done || (cfg.until == LoopUntil::Exhausted && n == cfg.max_iterations && ok) {
                files.sort();
                files.dedup();
                let mut res = StepResult::with_output(outputs.join("\n"))
                    .meta("iterations", n)
                    .meta("until", serde_json::to_value(cfg.until).unwrap_or_default());
                res.files_changed = files;
                return Ok(res);
            }
        }

        let reason = match (cfg.until, &last_failure) {
            (LoopUntil::Signal, _) => format!(
                "exit signal '{}' not seen in {} iteration(s)",
                cfg.exit_signal.as_deref().unwrap_or_default(),
                cfg.max_iterations
            ),
            (_, Some(e)) => format!(
                "still failing after {} iteration(s): {e}",
                cfg.max_iterations
            ),
            (_, None) => format!("did not finish in {} iteration(s)", cfg.max_iterations),
        };
        Err(StepError::ValidationFailed {
            summary: reason,
            output: outputs.join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::step::ExecutorRegistry;
    use crate::step::definition::{AiStepConfig, ValidationStepConfig};
    use crate::testing::{StepHarness, sample_task};

    fn loop_step(until: LoopUntil, max: u32, signal: Option<&str>) -> StepDefinition {
        StepDefinition::new(
            "iterate",
            StepConfig::Loop(LoopStepConfig {
                steps: vec![
                    StepDefinition::new("implement", StepConfig::Ai(AiStepConfig::default())),
                    StepDefinition::new(
                        "check",
                        StepConfig::Validation(ValidationStepConfig {
                            commands: vec!["test".into()],
                            ..ValidationStepConfig::default()
                        }),
                    ),
                ],
                max_iterations: max,
                until,
                exit_signal: signal.map(str::to_owned),
            }),
        )
    }

    #[tokio::test]
    async fn stops_on_first_successful_iteration() {
        let harness = StepHarness::new();
        harness.fakes.ai.push_ok("try 1", &[]);
        harness.fakes.ai.push_ok("try 2", &["a.rs"]);
        harness.fakes.commands.fail_times("test", 1, 1, "boom");

        let res = LoopExecutor
            .execute(&harness.cx(), &sample_task("ws", "t"), &loop_step(LoopUntil::Success, 3, None))
            .await
            .unwrap();
        assert_eq!(res.metadata["iterations"], 2);
        assert_eq!(res.files_changed, vec!["a.rs".to_owned()]);
        assert_eq!(harness.fakes.ai.requests().len(), 2);
    }

    #[tokio::test]
    async fn exhausting_iterations_fails() {
        let harness = StepHarness::new();
        harness.fakes.commands.fail("test", 1, "still broken");
        let err = LoopExecutor
            .execute(&harness.cx(), &sample_task("ws", "t"), &loop_step(LoopUntil::Success, 2, None))
            .await
            .unwrap_err();
        let StepError::ValidationFailed { summary, .. } = err else {
            panic!("unexpected {err:?}");
        };
        assert!(summary.starts_with("still failing after 2 iteration(s)"));
        assert_eq!(harness.fakes.ai.requests().len(), 2);
    }

    #[tokio::test]
    async fn signal_ends_the_loop() {
        let harness = StepHarness::new();
        harness.fakes.ai.push_ok("working", &[]);
        harness.fakes.ai.push_ok("ALL DONE", &[]);
        let res = LoopExecutor
            .execute(
                &harness.cx(),
                &sample_task("ws", "t"),
                &loop_step(LoopUntil::Signal, 5, Some("ALL DONE")),
            )
            .await
            .unwrap();
        assert_eq!(res.metadata["iterations"], 2);
        // The signal stops the iteration before its validation step.
        assert_eq!(harness.fakes.commands.history(), vec!["test"]);
    }

    #[tokio::test]
    async fn missing_nested_executor_is_reported() {
        let mut harness = StepHarness::new();
        let mut reg = ExecutorRegistry::empty();
        reg.register(Arc::new(LoopExecutor));
        harness.registry = reg;
        let err = LoopExecutor
            .execute(&harness.cx(), &sample_task("ws", "t"), &loop_step(LoopUntil::Success, 1, None))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::NoExecutor(StepType::Ai)));
    }
}
