#![forbid(unsafe_code)]

//! Drives a task through its steps.
//!
//! The record is persisted after every step boundary, so a process that dies
//! between steps loses at most the step that was in flight. A failed required
//! step leaves `current_step` on that step; `resume` starts there again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, StepError, StoreError};
use crate::persist::now_rfc3339;
use crate::step::definition::StepType;
use crate::step::{ExecutionSettings, ExecutorRegistry, StepContext, StepResult, tail_chars};
use crate::task::artifacts::Artifacts;
use crate::task::lock::{RunLock, live_holder};
use crate::task::model::{Step, StepStatus, Task, TaskStatus, Transition, meta};
use crate::task::progress::{ProgressEvent, ProgressKind, ProgressSink};
use crate::task::retry::{RetryContext, RetryHandler, RetryLedger};
use crate::task::store::TaskStore;
use crate::task::template::Template;

const EVENT_OUTPUT_CHARS: usize = 2_000;

#[derive(Debug, Clone)]
pub struct NewTask<'a> {
    pub workspace: &'a str,
    pub branch: &'a str,
    pub worktree_path: &'a Path,
    pub template: &'a Template,
    pub description: &'a str,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

fn check(cancel: &CancellationToken) -> Result<(), EngineError> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Resumable status a failed required step leaves the task in.
#[must_use]
pub fn failure_status(step_type: StepType, err: &StepError) -> TaskStatus {
    match err {
        StepError::CiTimeout(_) => TaskStatus::CiTimeout,
        StepError::CiFailed(_) => TaskStatus::CiFailed,
        StepError::Git { .. } => TaskStatus::GhFailed,
        StepError::Rejected(_) => TaskStatus::Rejected,
        _ => match step_type {
            StepType::Git => TaskStatus::GhFailed,
            StepType::Ci => TaskStatus::CiFailed,
            _ => TaskStatus::ValidationFailed,
        },
    }
}

pub struct Engine {
    tasks: TaskStore,
    registry: ExecutorRegistry,
    settings: ExecutionSettings,
    retry: Option<RetryHandler>,
    artifacts: Artifacts,
    progress: ProgressSink,
}

impl Engine {
    #[must_use]
    pub fn new(tasks: TaskStore, registry: ExecutorRegistry, settings: ExecutionSettings) -> Self {
        Self {
            artifacts: Artifacts::new(tasks.clone()),
            tasks,
            registry,
            settings,
            retry: None,
            progress: ProgressSink::none(),
        }
    }

    /// Repair failed validation steps with the AI runner before giving up.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryHandler) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    #[must_use]
    pub fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }

    #[must_use]
    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    pub fn create_task(&self, cancel: &CancellationToken, req: NewTask<'_>) -> Result<Task, EngineError> {
        check(cancel)?;
        req.template.validate()?;
        let mut metadata = req.metadata;
        if let Some(agent) = &req.template.default_agent {
            metadata
                .entry(meta::AGENT.to_owned())
                .or_insert_with(|| agent.clone().into());
        }
        if let Some(model) = &req.template.default_model {
            metadata
                .entry(meta::MODEL.to_owned())
                .or_insert_with(|| model.clone().into());
        }
        let now = now_rfc3339();
        let task = Task {
            id: Task::new_id(),
            workspace: req.workspace.to_owned(),
            template_id: req.template.id.clone(),
            description: req.description.to_owned(),
            status: TaskStatus::Pending,
            current_step: 0,
            steps: req.template.steps.iter().cloned().map(Step::pending).collect(),
            branch: req.branch.to_owned(),
            worktree_path: req.worktree_path.display().to_string(),
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
            last_error: None,
            metadata,
            transitions: Vec::new(),
        };
        self.tasks.create(&task)?;
        info!(task_id = %task.id, workspace = %task.workspace, template = %task.template_id, steps = task.steps.len(), "task created");
        Ok(task)
    }

    pub async fn start(&self, cancel: &CancellationToken, req: NewTask<'_>) -> Result<Task, EngineError> {
        let mut task = self.create_task(cancel, req)?;
        self.execute(cancel, &mut task).await?;
        Ok(task)
    }

    /// Run `task` from `current_step`. The task must be `Pending` or
    /// resumable.
    ///
    /// Returns `Ok` when the run stopped at a step boundary, whatever the
    /// resulting status; `Err(Cancelled)` leaves the record as last persisted.
    pub async fn execute(&self, cancel: &CancellationToken, task: &mut Task) -> Result<(), EngineError> {
        check(cancel)?;
        if task.status != TaskStatus::Pending && !task.status.is_resumable() {
            return Err(EngineError::NotResumable {
                task_id: task.id.clone(),
                status: task.status,
            });
        }
        let _lock = RunLock::acquire(&self.tasks.workspace_dir(&task.workspace)?, &task.id)?;
        let reason = match task.status {
            TaskStatus::Pending => "started",
            _ => "resumed",
        };
        self.transition(task, TaskStatus::Running, Some(reason.to_owned()))?;
        self.run_steps(cancel, task).await
    }

    pub async fn resume(&self, cancel: &CancellationToken, workspace: &str, task_id: &str) -> Result<Task, EngineError> {
        check(cancel)?;
        let mut task = self.tasks.get(workspace, task_id)?;
        if !task.status.is_resumable() {
            return Err(EngineError::NotResumable {
                task_id: task.id,
                status: task.status,
            });
        }
        let index = task.current_step;
        if task.status == TaskStatus::ValidationFailed
            && task.current().is_some_and(|s| s.step_type() == StepType::Validation)
        {
            // An operator-initiated resume gets a fresh repair budget.
            RetryLedger::clear(&mut task, index);
        }
        if let Some(step) = task.current_mut() {
            step.status = StepStatus::Pending;
            step.error = None;
        }
        info!(task_id = %task.id, workspace, step = %task.current_step_name(), index, from = %task.status, "resuming task");
        self.execute(cancel, &mut task).await?;
        Ok(task)
    }

    pub async fn approve(&self, cancel: &CancellationToken, workspace: &str, task_id: &str) -> Result<Task, EngineError> {
        check(cancel)?;
        let mut task = self.tasks.get(workspace, task_id)?;
        if task.status != TaskStatus::AwaitingApproval {
            return Err(EngineError::WrongStatus {
                task_id: task.id,
                action: "approve",
                status: task.status,
            });
        }
        let _lock = RunLock::acquire(&self.tasks.workspace_dir(&task.workspace)?, &task.id)?;
        let now = now_rfc3339();
        if let Some(step) = task.current_mut() {
            step.status = StepStatus::Success;
            step.completed_at = Some(now);
            step.error = None;
            step.metadata.insert("decision".to_owned(), "approved".into());
        }
        task.current_step += 1;
        self.transition(&mut task, TaskStatus::Running, Some("approved".to_owned()))?;
        self.run_steps(cancel, &mut task).await?;
        Ok(task)
    }

    pub fn reject(&self, cancel: &CancellationToken, workspace: &str, task_id: &str, reason: &str) -> Result<Task, EngineError> {
        check(cancel)?;
        let mut task = self.tasks.get(workspace, task_id)?;
        if task.status != TaskStatus::AwaitingApproval {
            return Err(EngineError::WrongStatus {
                task_id: task.id,
                action: "reject",
                status: task.status,
            });
        }
        let now = now_rfc3339();
        if let Some(step) = task.current_mut() {
            step.status = StepStatus::Failed;
            step.completed_at = Some(now);
            step.error = Some(format!("rejected: {reason}"));
            step.metadata.insert("decision".to_owned(), "rejected".into());
        }
        task.last_error = Some(format!("rejected: {reason}"));
        self.transition(&mut task, TaskStatus::Rejected, Some(reason.to_owned()))?;
        Ok(task)
    }

    pub fn abandon(&self, cancel: &CancellationToken, workspace: &str, task_id: &str, reason: &str) -> Result<Task, EngineError> {
        check(cancel)?;
        let mut task = self.tasks.get(workspace, task_id)?;
        if !task.status.is_resumable() {
            return Err(EngineError::WrongStatus {
                task_id: task.id,
                action: "abandon",
                status: task.status,
            });
        }
        self.transition(&mut task, TaskStatus::Abandoned, Some(reason.to_owned()))?;
        Ok(task)
    }

    /// Record that the run of an in-progress task stopped. Tasks that are
    /// already stopped are returned unchanged.
    ///
    /// Called with a token that is independent of the one the run used.
    pub fn mark_interrupted(&self, cancel: &CancellationToken, workspace: &str, task_id: &str, reason: &str) -> Result<Task, EngineError> {
        check(cancel)?;
        let mut task = self.tasks.get(workspace, task_id)?;
        if !task.status.is_in_progress() {
            debug!(task_id, status = %task.status, "task already stopped; not marking interrupted");
            return Ok(task);
        }
        if let Some(step) = task.current_mut() {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Pending;
            }
        }
        self.transition(&mut task, TaskStatus::Interrupted, Some(reason.to_owned()))?;
        warn!(task_id, workspace, step = %task.current_step_name(), "task interrupted");
        Ok(task)
    }

    pub fn recover(&self, cancel: &CancellationToken, workspace: &str, task_id: &str) -> Result<Task, EngineError> {
        check(cancel)?;
        let task = self.tasks.get(workspace, task_id)?;
        if !task.status.is_in_progress() {
            return Err(EngineError::WrongStatus {
                task_id: task.id,
                action: "recover",
                status: task.status,
            });
        }
        let ws_dir = self.tasks.workspace_dir(workspace)?;
        if let Some(held) = live_holder(&ws_dir)? {
            return Err(EngineError::AlreadyRunning {
                task_id: held.task_id,
                pid: held.pid,
                lock: crate::task::lock::lock_path(&ws_dir),
            });
        }
        self.mark_interrupted(cancel, workspace, task_id, "recovered after crash")
    }

    fn persist(&self, task: &mut Task) -> Result<(), EngineError> {
        self.tasks.update(task).map_err(|e: StoreError| {
            error!(critical = true, task_id = %task.id, status = %task.status, error = %e, "failed to persist task");
            EngineError::from(e)
        })
    }

    fn transition(&self, task: &mut Task, to: TaskStatus, reason: Option<String>) -> Result<(), EngineError> {
        let from = task.status;
        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { from, to });
        }
        let at = now_rfc3339();
        if to.is_terminal() {
            task.completed_at = Some(at.clone());
        }
        task.transitions.push(Transition { from, to, at, reason });
        task.status = to;
        info!(task_id = %task.id, %from, %to, "task status changed");
        self.persist(task)
    }

    /// Move to a failure state, stepping out of `Validating` first when the
    /// target is only reachable from `Running`.
    fn fail(&self, task: &mut Task, to: TaskStatus, reason: String) -> Result<(), EngineError> {
        if task.status == TaskStatus::Validating && !TaskStatus::Validating.can_transition_to(to) {
            self.transition(task, TaskStatus::Running, None)?;
        }
        self.transition(task, to, Some(reason))
    }

    fn record_artifacts(&self, task: &Task, index: usize, output: &str) {
        if let Err(e) = self.artifacts.record(task, index, output) {
            warn!(task_id = %task.id, index, error = %e, "failed to write step artifacts");
        }
    }

    fn transcript(&self, task: &Task, index: usize) -> Option<PathBuf> {
        match self.artifacts.transcript_path(task, index) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(task_id = %task.id, index, error = %e, "no transcript path");
                None
            }
        }
    }

    async fn run_steps(&self, cancel: &CancellationToken, task: &mut Task) -> Result<(), EngineError> {
        let worktree = PathBuf::from(&task.worktree_path);
        let total = task.total_steps();

        while task.current_step < total {
            check(cancel)?;
            let index = task.current_step;
            let Some(step) = task.steps.get(index) else {
                break;
            };
            let def = step.definition.clone();
            let step_type = def.step_type();

            if step_type == StepType::Validation {
                self.transition(task, TaskStatus::Validating, Some(format!("step {}", def.name)))?;
            } else if task.status == TaskStatus::Validating {
                self.transition(task, TaskStatus::Running, None)?;
            }
            if let Some(step) = task.steps.get_mut(index) {
                step.status = StepStatus::Running;
                step.started_at = Some(now_rfc3339());
                step.completed_at = None;
                step.error = None;
                step.attempts += 1;
            }
            self.persist(task)?;

            info!(task_id = %task.id, step = %def.name, index, step_type = %step_type, "step started");
            self.progress.emit(&ProgressEvent::start(index, &def.name, total));

            let transcript = match step_type {
                StepType::Ai | StepType::Verify | StepType::Sdd | StepType::Loop => self.transcript(task, index),
                _ => None,
            };
            let started = Instant::now();
            let mut result = match self.registry.get(step_type) {
                Ok(executor) => {
                    let cx = StepContext {
                        cancel,
                        worktree: &worktree,
                        settings: &self.settings,
                        registry: &self.registry,
                        transcript: transcript.clone(),
                    };
                    executor.execute(&cx, task, &def).await
                }
                Err(e) => Err(e),
            };

            let repaired = match (&result, &self.retry) {
                (Err(failure @ StepError::ValidationFailed { .. }), Some(retry)) => {
                    let rcx = RetryContext {
                        cancel,
                        worktree: &worktree,
                        settings: &self.settings,
                        transcript: self.transcript(task, index),
                    };
                    retry.run(&rcx, task, index, &self.tasks, failure).await?
                }
                _ => None,
            };
            if let Some(fixed) = repaired {
                result = Ok(fixed);
            }
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match result {
                Ok(res) if res.awaiting_approval => {
                    self.finish_step(task, index, StepStatus::Pending, duration_ms, &res, None);
                    self.record_artifacts(task, index, &res.output);
                    self.transition(task, TaskStatus::AwaitingApproval, Some(format!("step {}", def.name)))?;
                    info!(task_id = %task.id, step = %def.name, "waiting for approval");
                    return Ok(());
                }
                Ok(res) => {
                    self.finish_step(task, index, StepStatus::Success, duration_ms, &res, None);
                    for (k, v) in &res.task_metadata {
                        task.metadata.insert(k.clone(), v.clone());
                    }
                    task.current_step += 1;
                    if task.status == TaskStatus::Validating {
                        task.transitions.push(Transition {
                            from: TaskStatus::Validating,
                            to: TaskStatus::Running,
                            at: now_rfc3339(),
                            reason: None,
                        });
                        task.status = TaskStatus::Running;
                    }
                    self.persist(task)?;
                    self.record_artifacts(task, index, &res.output);
                    info!(task_id = %task.id, step = %def.name, index, duration_ms, "step completed");
                    self.emit_complete(task, index, duration_ms, &res);
                }
                Err(StepError::Cancelled) => {
                    debug!(task_id = %task.id, step = %def.name, "step cancelled");
                    return Err(EngineError::Cancelled);
                }
                Err(e) if !def.required => {
                    let status = match e {
                        StepError::NoExecutor(_) => StepStatus::Skipped,
                        _ => StepStatus::Failed,
                    };
                    warn!(task_id = %task.id, step = %def.name, error = %e, "optional step did not succeed; continuing");
                    let res = StepResult::with_output(e.output().unwrap_or_default());
                    self.finish_step(task, index, status, duration_ms, &res, Some(e.to_string()));
                    task.current_step += 1;
                    self.persist(task)?;
                    self.record_artifacts(task, index, &res.output);
                    self.emit_complete(task, index, duration_ms, &res);
                }
                Err(e) => {
                    let to = failure_status(step_type, &e);
                    let message = e.to_string();
                    warn!(task_id = %task.id, step = %def.name, index, status = %to, error = %message, "required step failed");
                    let res = StepResult::with_output(e.output().unwrap_or(&message));
                    self.finish_step(task, index, StepStatus::Failed, duration_ms, &res, Some(message.clone()));
                    task.last_error = Some(message.clone());
                    self.fail(task, to, message)?;
                    self.record_artifacts(task, index, &res.output);
                    self.emit_complete(task, index, duration_ms, &res);
                    return Ok(());
                }
            }
        }

        task.last_error = None;
        if task.status == TaskStatus::Validating {
            self.transition(task, TaskStatus::Running, None)?;
        }
        self.transition(task, TaskStatus::Completed, Some("all steps finished".to_owned()))?;
        info!(task_id = %task.id, workspace = %task.workspace, "task completed");
        Ok(())
    }

    fn finish_step(
        &self,
        task: &mut Task,
        index: usize,
        status: StepStatus,
        duration_ms: u64,
        res: &StepResult,
        error: Option<String>,
    ) {
        let Some(step) = task.steps.get_mut(index) else {
            return;
        };
        step.status = status;
        step.completed_at = Some(now_rfc3339());
        step.duration_ms = Some(duration_ms);
        step.error = error;
        if res.num_turns.is_some() {
            step.num_turns = res.num_turns;
        }
        if !res.files_changed.is_empty() {
            step.files_changed.clone_from(&res.files_changed);
        }
        for (k, v) in &res.metadata {
            step.metadata.insert(k.clone(), v.clone());
        }
        if let Some(agent) = &res.agent {
            step.metadata.insert("agent".to_owned(), agent.clone().into());
        }
        if let Some(model) = &res.model {
            step.metadata.insert("model".to_owned(), model.clone().into());
        }
    }

    fn emit_complete(&self, task: &Task, index: usize, duration_ms: u64, res: &StepResult) {
        let mut ev = ProgressEvent::start(index, task.steps.get(index).map_or("", Step::name), task.total_steps());
        ev.kind = ProgressKind::Complete;
        ev.agent.clone_from(&res.agent);
        ev.model.clone_from(&res.model);
        ev.duration_ms = Some(duration_ms);
        ev.num_turns = res.num_turns;
        ev.files_changed_count = Some(res.files_changed.len());
        if !res.output.is_empty() {
            ev.output = Some(tail_chars(&res.output, EVENT_OUTPUT_CHARS).to_owned());
        }
        self.progress.emit(&ev);
    }
}
