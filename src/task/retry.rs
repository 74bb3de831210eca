#![forbid(unsafe_code)]

//! AI-assisted repair of failed validation steps.
//!
//! Every attempt is recorded in the step's `ai_retry` metadata and persisted
//! before validation is re-run, so a run that is interrupted after a fix was
//! applied picks up by re-validating instead of asking for the same fix twice.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, StepError};
use crate::persist::now_rfc3339;
use crate::runner::ai::{AiRequest, AiRunner};
use crate::runner::command::CommandRunner;
use crate::step::definition::StepConfig;
use crate::step::validation::{ValidationPlan, run_validation};
use crate::step::{ExecutionSettings, StepResult, resolve_agent, tail_chars, task_overrides};
use crate::task::model::Task;
use crate::task::store::TaskStore;

pub const LEDGER_KEY: &str = "ai_retry";

const PROMPT_OUTPUT_CHARS: usize = 8_000;
const FINGERPRINT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_factor: f64,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff_factor: 2.0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// `initial_delay * backoff_factor^attempt`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX) as f64;
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX) as f64;
        let exp = i32::try_from(attempt.min(31)).unwrap_or(31);
        let ms = (initial_ms * self.backoff_factor.powi(exp)).min(max_ms).max(0.0);
        Duration::from_millis(ms as u64)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    /// The agent finished; validation has not been re-run yet.
    Applied,
    Passed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    /// Worktree fingerprint right after the fix was applied.
    pub fingerprint: String,
    pub at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryLedger {
    pub attempts: Vec<AttemptRecord>,
}

impl RetryLedger {
    #[must_use]
    pub fn load(task: &Task, index: usize) -> Self {
        task.steps
            .get(index)
            .and_then(|s| s.metadata.get(LEDGER_KEY))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    fn store(&self, task: &mut Task, index: usize) {
        if let Some(step) = task.steps.get_mut(index) {
            step.metadata.insert(
                LEDGER_KEY.to_owned(),
                serde_json::to_value(self).unwrap_or_default(),
            );
        }
    }

    pub fn clear(task: &mut Task, index: usize) {
        if let Some(step) = task.steps.get_mut(index) {
            step.metadata.remove(LEDGER_KEY);
        }
    }

    fn pending(&self) -> Option<&AttemptRecord> {
        self.attempts
            .last()
            .filter(|a| a.outcome == AttemptOutcome::Applied)
    }

    fn set_last(&mut self, outcome: AttemptOutcome) {
        if let Some(last) = self.attempts.last_mut() {
            last.outcome = outcome;
            last.at = now_rfc3339();
        }
    }
}

pub async fn fingerprint(
    commands: &dyn CommandRunner,
    cancel: &CancellationToken,
    worktree: &Path,
) -> Result<String, StepError> {
    let mut hasher = Sha256::new();
    for cmd in [
        "git status --porcelain --untracked-files=all",
        "git diff HEAD",
    ] {
        let out = commands.run(cancel, worktree, cmd, FINGERPRINT_TIMEOUT).await?;
        hasher.update(cmd.as_bytes());
        hasher.update(out.stdout.as_bytes());
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn fix_prompt(task: &Task, summary: &str, output: &str) -> String {
    format!(
        "Validation failed for the following task:\n\n{}\n\n{summary}\n\n\
         Command output (tail):\n```\n{}\n```\n\n\
         Fix the code so every validation command passes. Do not disable, skip or delete \
         tests or lints to make them pass.",
        task.description.trim(),
        tail_chars(output, PROMPT_OUTPUT_CHARS)
    )
}

/// Cancellation ends the run; any other error abandons the repair and lets
/// the original failure stand.
fn give_up(task_id: &str, e: StepError) -> Result<Option<StepResult>, EngineError> {
    match e {
        StepError::Cancelled => Err(EngineError::Cancelled),
        other => {
            warn!(task_id, error = %other, "ai retry could not continue");
            Ok(None)
        }
    }
}

pub struct RetryContext<'a> {
    pub cancel: &'a CancellationToken,
    pub worktree: &'a Path,
    pub settings: &'a ExecutionSettings,
    pub transcript: Option<PathBuf>,
}

#[derive(Clone)]
pub struct RetryHandler {
    ai: Arc<dyn AiRunner>,
    commands: Arc<dyn CommandRunner>,
    policy: RetryPolicy,
}

impl RetryHandler {
    #[must_use]
    pub fn new(ai: Arc<dyn AiRunner>, commands: Arc<dyn CommandRunner>, policy: RetryPolicy) -> Self {
        Self {
            ai,
            commands,
            policy,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Try to repair the validation step at `index`.
    ///
    /// `Ok(Some(_))` when a fix made validation pass, `Ok(None)` once the
    /// attempt budget is spent; the caller then reports the original failure.
    pub async fn run(
        &self,
        cx: &RetryContext<'_>,
        task: &mut Task,
        index: usize,
        store: &TaskStore,
        failure: &StepError,
    ) -> Result<Option<StepResult>, EngineError> {
        let Some(StepConfig::Validation(cfg)) = task.steps.get(index).map(|s| s.definition.config.clone())
        else {
            return Ok(None);
        };
        let plan = match ValidationPlan::resolve(&cfg, cx.settings, cx.worktree) {
            Ok(p) => p,
            Err(e) => return give_up(&task.id, e),
        };
        let (agent, model) = match resolve_agent(&[task_overrides(task)], cx.settings) {
            Ok(v) => v,
            Err(e) => return give_up(&task.id, e),
        };

        let mut ledger = RetryLedger::load(task, index);
        let mut summary = failure.to_string();
        let mut output = failure.output().unwrap_or_default().to_owned();
        let mut files_changed: Vec<String> = Vec::new();

        loop {
            if cx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let reuse = match ledger.pending() {
                Some(rec) => {
                    let now = match fingerprint(self.commands.as_ref(), cx.cancel, cx.worktree).await {
                        Ok(fp) => fp,
                        Err(e) => return give_up(&task.id, e),
                    };
                    (now == rec.fingerprint).then_some(rec.attempt)
                }
                None => None,
            };

            let attempt = match reuse {
                Some(attempt) => {
                    info!(task_id = %task.id, attempt, "fix already applied; re-validating");
                    attempt
                }
                None => {
                    if ledger.pending().is_some() {
                        // The worktree moved on since that fix; count it as spent.
                        ledger.set_last(AttemptOutcome::Failed);
                    }
                    let attempt = u32::try_from(ledger.attempts.len()).unwrap_or(u32::MAX) + 1;
                    if attempt > self.policy.max_attempts {
                        warn!(task_id = %task.id, attempts = ledger.attempts.len(), "ai retry budget exhausted");
                        ledger.store(task, index);
                        store.update(task)?;
                        return Ok(None);
                    }
                    info!(task_id = %task.id, attempt, max = self.policy.max_attempts, agent = %agent, "asking agent to fix validation failure");
                    let req = AiRequest {
                        agent,
                        model: model.clone(),
                        prompt: fix_prompt(task, &summary, &output),
                        workdir: cx.worktree.to_path_buf(),
                        timeout: cx.settings.ai_timeout,
                        read_only: false,
                        transcript: cx.transcript.clone(),
                    };
                    match self.ai.run(cx.cancel, &req).await {
                        Ok(resp) => files_changed.extend(resp.files_changed),
                        Err(StepError::Cancelled) => return Err(EngineError::Cancelled),
                        Err(e) => warn!(task_id = %task.id, attempt, error = %e, "fix attempt failed"),
                    }
                    let fp = match fingerprint(self.commands.as_ref(), cx.cancel, cx.worktree).await {
                        Ok(fp) => fp,
                        Err(e) => return give_up(&task.id, e),
                    };
                    ledger.attempts.push(AttemptRecord {
                        attempt,
                        outcome: AttemptOutcome::Applied,
                        fingerprint: fp,
                        at: now_rfc3339(),
                    });
                    ledger.store(task, index);
                    store.update(task)?;
                    attempt
                }
            };

            let report =
                match run_validation(self.commands.as_ref(), cx.cancel, cx.worktree, &plan).await {
                    Ok(r) => r,
                    Err(e) => return give_up(&task.id, e),
                };
            if report.passed() {
                ledger.set_last(AttemptOutcome::Passed);
                ledger.store(task, index);
                store.update(task)?;
                info!(task_id = %task.id, attempt, "validation passes after ai fix");
                files_changed.sort();
                files_changed.dedup();
                let mut res = StepResult::with_output(report.output).meta("ai_retry_attempts", attempt);
                res.files_changed = files_changed;
                res.agent = Some(agent.to_string());
                res.model = Some(model);
                return Ok(Some(res));
            }

            summary = report.summary();
            ledger.set_last(AttemptOutcome::Failed);
            ledger.store(task, index);
            store.update(task)?;
            debug!(task_id = %task.id, attempt, summary = %summary, "still failing after fix");
            output = report.output;

            if attempt >= self.policy.max_attempts {
                continue;
            }
            let delay = self.policy.delay_for(attempt);
            tokio::select! {
                () = cx.cancel.cancelled() => return Err(EngineError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::definition::{StepDefinition, ValidationStepConfig};
    use crate::task::model::Step;
    use crate::testing::{ScriptedAiRunner, ScriptedCommandRunner, sample_task};

    fn policy(max: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: max,
            backoff_factor: 2.0,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn setup(dir: &Path) -> (TaskStore, Task) {
        let store = TaskStore::new(dir.join("state"));
        let mut task = sample_task("ws", "task-1");
        task.steps = vec![Step::pending(StepDefinition::new(
            "validate",
            StepConfig::Validation(ValidationStepConfig {
                commands: vec!["test".into()],
                ..ValidationStepConfig::default()
            }),
        ))];
        store.create(&task).unwrap();
        (store, task)
    }

    fn failure() -> StepError {
        StepError::ValidationFailed {
            summary: "1 of 1 command(s) failed: test".into(),
            output: "original output".into(),
        }
    }

    #[test]
    fn delay_grows_geometrically_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            backoff_factor: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(2), Duration::from_millis(400));
        assert_eq!(p.delay_for(3), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn fix_that_passes_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut task) = setup(dir.path());
        let ai = Arc::new(ScriptedAiRunner::new());
        ai.push_ok("fixed", &["src/lib.rs"]);
        let cmds = Arc::new(ScriptedCommandRunner::new());
        let handler = RetryHandler::new(ai.clone(), cmds, policy(3));
        let cancel = CancellationToken::new();
        let settings = ExecutionSettings::default();
        let cx = RetryContext {
            cancel: &cancel,
            worktree: dir.path(),
            settings: &settings,
            transcript: None,
        };

        let res = handler
            .run(&cx, &mut task, 0, &store, &failure())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res.files_changed, vec!["src/lib.rs".to_owned()]);
        assert!(ai.requests()[0].prompt.contains("original output"));

        let stored = store.get("ws", "task-1").unwrap();
        let ledger = RetryLedger::load(&stored, 0);
        assert_eq!(ledger.attempts.len(), 1);
        assert_eq!(ledger.attempts[0].outcome, AttemptOutcome::Passed);
    }

    #[tokio::test]
    async fn exhaustion_returns_none_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut task) = setup(dir.path());
        let ai = Arc::new(ScriptedAiRunner::new());
        let cmds = Arc::new(ScriptedCommandRunner::new());
        cmds.fail("test", 1, "still broken");
        let handler = RetryHandler::new(ai.clone(), cmds, policy(2));
        let cancel = CancellationToken::new();
        let settings = ExecutionSettings::default();
        let cx = RetryContext {
            cancel: &cancel,
            worktree: dir.path(),
            settings: &settings,
            transcript: None,
        };

        let out = handler.run(&cx, &mut task, 0, &store, &failure()).await.unwrap();
        assert!(out.is_none());
        assert_eq!(ai.requests().len(), 2);
        // The second prompt sees the latest failure.
        assert!(ai.requests()[1].prompt.contains("still broken"));
        let ledger = RetryLedger::load(&store.get("ws", "task-1").unwrap(), 0);
        assert!(ledger.attempts.iter().all(|a| a.outcome == AttemptOutcome::Failed));
    }

    #[tokio::test]
    async fn applied_fix_is_not_requested_again_after_resume() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut task) = setup(dir.path());
        let ai = Arc::new(ScriptedAiRunner::new());
        let cmds = Arc::new(ScriptedCommandRunner::new());
        let cancel = CancellationToken::new();

        // Simulate a run that applied a fix and was interrupted before validating.
        let fp = fingerprint(cmds.as_ref(), &cancel, dir.path()).await.unwrap();
        let ledger = RetryLedger {
            attempts: vec![AttemptRecord {
                attempt: 1,
                outcome: AttemptOutcome::Applied,
                fingerprint: fp,
                at: now_rfc3339(),
            }],
        };
        ledger.store(&mut task, 0);
        store.update(&mut task).unwrap();

        let handler = RetryHandler::new(ai.clone(), cmds, policy(3));
        let settings = ExecutionSettings::default();
        let cx = RetryContext {
            cancel: &cancel,
            worktree: dir.path(),
            settings: &settings,
            transcript: None,
        };
        let res = handler.run(&cx, &mut task, 0, &store, &failure()).await.unwrap();
        assert!(res.is_some());
        assert!(ai.requests().is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_any_work() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut task) = setup(dir.path());
        let ai = Arc::new(ScriptedAiRunner::new());
        let handler = RetryHandler::new(ai.clone(), Arc::new(ScriptedCommandRunner::new()), policy(3));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let settings = ExecutionSettings::default();
        let cx = RetryContext {
            cancel: &cancel,
            worktree: dir.path(),
            settings: &settings,
            transcript: None,
        };
        assert!(matches!(
            handler.run(&cx, &mut task, 0, &store, &failure()).await,
            Err(EngineError::Cancelled)
        ));
        assert!(ai.requests().is_empty());
    }
}
