#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::StepError;
use crate::runner::hub::{CheckRun, CheckState, HubRunner};
use crate::step::definition::{StepConfig, StepDefinition, StepType};
use crate::step::{StepContext, StepExecutor, StepResult, step_timeout};
use crate::task::model::{Task, meta};

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Pending,
    Passed,
    Failed(Vec<String>),
}

fn evaluate(checks: &[CheckRun], only: &[String]) -> Outcome {
    let relevant: Vec<&CheckRun> = checks
        .iter()
        .filter(|c| only.is_empty() || only.iter().any(|n| n == &c.name))
        .collect();
    let failed: Vec<String> = relevant
        .iter()
        .filter(|c| c.state == CheckState::Failed)
        .map(|c| c.name.clone())
        .collect();
    if !failed.is_empty() {
        return Outcome::Failed(failed);
    }
    if relevant.iter().any(|c| c.state == CheckState::Pending) {
        return Outcome::Pending;
    }
    // A named check that has not been reported yet is still pending.
    if only.iter().any(|n| !relevant.iter().any(|c| &c.name == n)) {
        return Outcome::Pending;
    }
    Outcome::Passed
}

/// Polls the pull request's checks until they settle or the deadline passes.
pub struct CiExecutor {
    hub: Arc<dyn HubRunner>,
}

impl CiExecutor {
    #[must_use]
    pub fn new(hub: Arc<dyn HubRunner>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl StepExecutor for CiExecutor {
    fn step_type(&self) -> StepType {
        StepType::Ci
    }

    async fn execute(
        &self,
        cx: &StepContext<'_>,
        task: &Task,
        step: &StepDefinition,
    ) -> Result<StepResult, StepError> {
        cx.check_cancelled()?;
        let StepConfig::Ci(cfg) = &step.config else {
            return Err(StepError::Failed(format!(
                "step '{}' is not a ci step",
                step.name
            )));
        };
        let pr = task
            .metadata
            .get(meta::PR_NUMBER)
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| {
                StepError::Failed("no pull request recorded for this task; run a create_pr step first".to_owned())
            })?;
        let interval = step_timeout(cfg.poll_interval.as_deref(), cx.settings.ci_poll_interval)?;
        let timeout = step_timeout(cfg.timeout.as_deref(), cx.settings.ci_timeout)?;
        let deadline = Instant::now() + timeout;

        info!(task_id = %task.id, pr, timeout = ?timeout, "waiting for ci");
        let mut empty_polls = 0u32;
        loop {
            let checks = self.hub.checks(cx.cancel, cx.worktree, pr).await?;
            match evaluate(&checks, &cfg.checks) {
                Outcome::Failed(names) => {
                    warn!(task_id = %task.id, pr, failed = %names.join(", "), "ci failed");
                    return Err(StepError::CiFailed(names.join(", ")));
                }
                Outcome::Passed if checks.is_empty() => {
                    empty_polls += 1;
                    if empty_polls > cx.settings.ci_grace_polls {
                        warn!(task_id = %task.id, pr, "no ci checks reported; treating as passed");
                        return Ok(StepResult::with_output("no checks reported")
                            .meta("checks", serde_json::json!([])));
                    }
                }
                Outcome::Passed => {
                    info!(task_id = %task.id, pr, checks = checks.len(), "ci passed");
                    let summary = checks
                        .iter()
                        .map(|c| format!("{}: {:?}", c.name, c.state))
                        .collect::<Vec<_>>()
                        .join("\n");
                    return Ok(StepResult::with_output(summary).meta(
                        "checks",
                        serde_json::to_value(&checks).unwrap_or_default(),
                    ));
                }
                Outcome::Pending => debug!(task_id = %task.id, pr, "ci still pending"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StepError::CiTimeout(timeout));
            }
            let wait = interval.min(deadline - now);
            tokio::select! {
                () = cx.cancel.cancelled() => return Err(StepError::Cancelled),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::step::ExecutionSettings;
    use crate::step::definition::{CiStepConfig, GitOperation, GitStepConfig};
    use crate::testing::{FakeHubRunner, StepHarness, sample_task};

    fn run(name: &str, state: CheckState) -> CheckRun {
        CheckRun {
            name: name.into(),
            state,
            link: None,
        }
    }

    #[test]
    fn evaluates_check_sets() {
        let checks = vec![run("build", CheckState::Passed), run("e2e", CheckState::Pending)];
        assert_eq!(evaluate(&checks, &[]), Outcome::Pending);
        assert_eq!(evaluate(&checks, &["build".into()]), Outcome::Passed);
        assert_eq!(evaluate(&checks, &["lint".into()]), Outcome::Pending);

        let checks = vec![run("build", CheckState::Failed), run("docs", CheckState::Skipped)];
        assert_eq!(evaluate(&checks, &[]), Outcome::Failed(vec!["build".into()]));
    }

    fn ci_task() -> Task {
        let mut task = sample_task("ws", "task-1");
        task.metadata.insert(meta::PR_NUMBER.into(), 7.into());
        task
    }

    fn fast_settings() -> ExecutionSettings {
        ExecutionSettings {
            ci_poll_interval: Duration::from_millis(5),
            ci_timeout: Duration::from_millis(200),
            ci_grace_polls: 1,
            ..ExecutionSettings::default()
        }
    }

    #[tokio::test]
    async fn passes_after_pending_polls() {
        let hub = Arc::new(FakeHubRunner::new());
        hub.push_checks(vec![run("build", CheckState::Pending)]);
        hub.push_checks(vec![run("build", CheckState::Passed)]);
        let mut harness = StepHarness::new();
        harness.settings = fast_settings();
        let step = StepDefinition::new("ci", StepConfig::Ci(CiStepConfig::default()));

        let res = CiExecutor::new(hub.clone())
            .execute(&harness.cx(), &ci_task(), &step)
            .await
            .unwrap();
        assert_eq!(res.output, "build: Passed");
        assert_eq!(hub.check_polls(), 2);
    }

    #[tokio::test]
    async fn failing_and_stuck_checks_map_to_distinct_errors() {
        let mut harness = StepHarness::new();
        harness.settings = fast_settings();
        let step = StepDefinition::new("ci", StepConfig::Ci(CiStepConfig::default()));

        let hub = Arc::new(FakeHubRunner::new());
        hub.push_checks(vec![run("lint", CheckState::Failed)]);
        let err = CiExecutor::new(hub)
            .execute(&harness.cx(), &ci_task(), &step)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::CiFailed(ref n) if n == "lint"));

        let hub = Arc::new(FakeHubRunner::new());
        hub.push_checks(vec![run("slow", CheckState::Pending)]);
        let err = CiExecutor::new(hub)
            .execute(&harness.cx(), &ci_task(), &step)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::CiTimeout(_)));
    }

    #[tokio::test]
    async fn requires_a_pull_request() {
        let harness = StepHarness::new();
        let step = StepDefinition::new("ci", StepConfig::Ci(CiStepConfig::default()));
        let err = CiExecutor::new(Arc::new(FakeHubRunner::new()))
            .execute(&harness.cx(), &sample_task("ws", "task-1"), &step)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Failed(_)));
    }

    #[tokio::test]
    async fn rejects_a_foreign_config() {
        let harness = StepHarness::new();
        let hub = Arc::new(FakeHubRunner::new());
        let step = StepDefinition::new("ci", StepConfig::Git(GitStepConfig::new(GitOperation::Push)));
        let err = CiExecutor::new(hub.clone())
            .execute(&harness.cx(), &ci_task(), &step)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Failed(ref m) if m.contains("not a ci step")));
        assert_eq!(hub.check_polls(), 0);
    }
}
