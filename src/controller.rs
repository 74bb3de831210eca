#![forbid(unsafe_code)]

//! Ties workspaces, the task engine and operator interrupts together.
//!
//! An interrupt cancels the run's token; the task and workspace are then
//! written with a fresh token so the cleanup itself cannot be cancelled.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::naming::{generate_workspace_name, sanitize_workspace_name};
use crate::core::worktree::{BranchSource, GitWorktreeRunner};
use crate::error::{EngineError, StepError};
use crate::runner::Runners;
use crate::runner::agent::Agent;
use crate::step::ExecutorRegistry;
use crate::step::dry_run::{DryRunRegistry, DryRunReport, DryRunWorkspace, SimulationContext, build_report};
use crate::task::engine::{Engine, NewTask};
use crate::task::model::{Task, TaskStatus, meta};
use crate::task::progress::ProgressSink;
use crate::task::retry::RetryHandler;
use crate::task::store::TaskStore;
use crate::task::template::{Template, TemplateRegistry};
use crate::workspace::manager::{CreateWorkspace, WorkspaceManager};
use crate::workspace::model::{Workspace, WorkspaceStatus};
use crate::workspace::store::WorkspaceStore;

/// Operator interrupt, separate from any cancellation token.
#[derive(Debug, Clone)]
pub struct InterruptSignal {
    rx: watch::Receiver<bool>,
}

/// Fires an [`InterruptSignal`] created with [`InterruptSignal::manual`].
#[derive(Debug)]
pub struct InterruptTrigger {
    tx: watch::Sender<bool>,
}

impl InterruptTrigger {
    pub fn fire(&self) {
        let _ = self.tx.send(true);
    }
}

impl InterruptSignal {
    #[must_use]
    pub fn manual() -> (Self, InterruptTrigger) {
        let (tx, rx) = watch::channel(false);
        (Self { rx }, InterruptTrigger { tx })
    }

    /// Fires on Ctrl-C. Must be called inside a tokio runtime.
    #[must_use]
    pub fn from_ctrl_c() -> Self {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; stopping after cleanup");
                let _ = tx.send(true);
            }
            tx.closed().await;
        });
        Self { rx }
    }

    #[must_use]
    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal fires; never resolves if its trigger is gone.
    pub async fn fired(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Everything `start` and its dry run need from the command line.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Any directory inside the target repository.
    pub repo: PathBuf,
    pub template: String,
    pub description: String,
    /// Generated from the description when absent.
    pub workspace: Option<String>,
    pub base: Option<String>,
    pub target: Option<String>,
    pub use_local: bool,
    pub agent: Option<String>,
    pub model: Option<String>,
}

struct Prepared {
    template: Template,
    create: CreateWorkspace,
    agent: Agent,
    metadata: BTreeMap<String, serde_json::Value>,
}

pub struct Orchestrator {
    workspaces: WorkspaceManager,
    engine: Engine,
    templates: TemplateRegistry,
    simulators: DryRunRegistry,
    interrupt: InterruptSignal,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        workspaces: WorkspaceManager,
        engine: Engine,
        templates: TemplateRegistry,
        interrupt: InterruptSignal,
    ) -> Self {
        Self {
            workspaces,
            engine,
            templates,
            simulators: DryRunRegistry::standard(),
            interrupt,
        }
    }

    /// Production wiring: git worktrees and state under `workspace.state_dir`.
    pub fn from_config(
        cfg: &Config,
        runners: &Runners,
        interrupt: InterruptSignal,
        progress: ProgressSink,
    ) -> Result<Self, EngineError> {
        cfg.validate()?;
        let state = cfg.state_dir()?;
        let mut engine = Engine::new(
            TaskStore::new(state.clone()),
            ExecutorRegistry::standard(runners),
            cfg.execution_settings()?,
        )
        .with_progress(progress);
        if let Some(policy) = cfg.retry_policy()? {
            engine = engine.with_retry(RetryHandler::new(runners.ai.clone(), runners.commands.clone(), policy));
        }
        let workspaces = WorkspaceManager::new(
            WorkspaceStore::new(state),
            Arc::new(GitWorktreeRunner::default()),
            cfg.worktree_settings()?,
        );
        let templates = TemplateRegistry::load(cfg.templates_dir()?.as_deref())?;
        Ok(Self::new(workspaces, engine, templates, interrupt))
    }

    #[must_use]
    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    #[must_use]
    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    /// Checks shared by live and dry runs. Writes nothing.
    fn prepare(&self, req: &StartRequest) -> Result<Prepared, EngineError> {
        let description = req.description.trim();
        if description.is_empty() {
            return Err(EngineError::Usage("a task description is required".to_owned()));
        }
        let template = self.templates.get(&req.template)?.clone();
        let source = BranchSource::from_options(req.base.clone(), req.target.clone())?;

        let agent = match req.agent.as_deref().or(template.default_agent.as_deref()) {
            Some(name) => name.parse::<Agent>()?,
            None => self.engine.settings().agent,
        };
        if let Some(model) = req.model.as_deref().or(template.default_model.as_deref()) {
            agent.validate_model(model)?;
        }

        let repo = self.workspaces.repo_root(&req.repo)?;
        let name = match req.workspace.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => sanitize_workspace_name(name),
            _ => generate_workspace_name(description),
        };

        let mut metadata = BTreeMap::new();
        if req.agent.is_some() {
            metadata.insert(meta::AGENT.to_owned(), agent.as_str().into());
        }
        if let Some(model) = &req.model {
            metadata.insert(meta::MODEL.to_owned(), model.trim().into());
        }
        if let BranchSource::NewFromBase { base: Some(base) } = &source {
            metadata.insert(meta::BASE_BRANCH.to_owned(), base.clone().into());
        }

        Ok(Prepared {
            create: CreateWorkspace {
                name,
                repo,
                source,
                use_local: req.use_local,
                branch_prefix: Some(template.branch_prefix.clone()),
            },
            template,
            agent,
            metadata,
        })
    }

    /// Create (or reuse) the workspace, then create the task and run it.
    pub async fn start(&self, cancel: &CancellationToken, req: &StartRequest) -> Result<Task, EngineError> {
        check(cancel)?;
        let prepared = self.prepare(req)?;
        let fresh = !matches!(
            self.workspaces.get(&prepared.create.name),
            Ok(existing) if !existing.is_closed()
        );
        let mut ws = self.workspaces.create(&prepared.create)?;
        if ws.status != WorkspaceStatus::Active {
            ws = self.workspaces.activate(&ws.name)?;
        }

        let new_task = NewTask {
            workspace: &ws.name,
            branch: &ws.branch,
            worktree_path: &ws.worktree_path,
            template: &prepared.template,
            description: req.description.trim(),
            metadata: prepared.metadata,
        };
        let task = match self.engine.create_task(cancel, new_task) {
            Ok(task) => task,
            Err(e) => {
                if fresh {
                    warn!(workspace = %ws.name, error = %e, "task creation failed; removing new workspace");
                    if let Err(cleanup) = self.workspaces.destroy(&ws.name) {
                        error!(workspace = %ws.name, error = %cleanup, "failed to remove workspace");
                    }
                }
                return Err(e);
            }
        };
        self.workspaces.attach_task(&ws.name, &task.id)?;
        info!(
            workspace = %ws.name,
            task_id = %task.id,
            template = %prepared.template.id,
            worktree = %ws.worktree_path.display(),
            "starting task"
        );

        let (name, id) = (ws.name.as_str(), task.id.clone());
        self.guarded(cancel, name, &id, move |token| async move {
            let mut task = task;
            self.engine.execute(&token, &mut task).await?;
            Ok(task)
        })
        .await
    }

    /// What `start` would do, without writing anything.
    pub fn dry_run(&self, cancel: &CancellationToken, req: &StartRequest) -> Result<DryRunReport, EngineError> {
        check(cancel)?;
        let prepared = self.prepare(req)?;
        let preview = self.workspaces.preview(&prepared.create)?;
        let base = match &prepared.create.source {
            BranchSource::NewFromBase { base } => base.as_deref(),
            BranchSource::Target { .. } => None,
        };
        let cx = SimulationContext {
            settings: self.engine.settings(),
            repo: &prepared.create.repo,
            branch: &preview.branch,
            base,
            agent: req.agent.as_deref().or(prepared.template.default_agent.as_deref()),
            model: req.model.as_deref().or(prepared.template.default_model.as_deref()),
            registry: &self.simulators,
        };
        let workspace = DryRunWorkspace {
            name: preview.name.clone(),
            branch: preview.branch.clone(),
            would_create: preview.would_create,
        };
        build_report(&cx, &prepared.template.id, workspace, &prepared.template.steps).map_err(|e| match e {
            StepError::Cancelled => EngineError::Cancelled,
            other => EngineError::Usage(other.to_string()),
        })
    }

    /// The workspace and the task id an operator command refers to.
    fn target(&self, workspace: &str, task_id: Option<&str>) -> Result<(Workspace, String), EngineError> {
        let ws = self.workspaces.get(workspace)?;
        if ws.is_closed() {
            return Err(EngineError::Usage(format!("workspace '{workspace}' is closed")));
        }
        let id = match task_id {
            Some(id) => id.to_owned(),
            None => ws
                .latest_task()
                .map(str::to_owned)
                .ok_or_else(|| EngineError::NoTask(workspace.to_owned()))?,
        };
        Ok((ws, id))
    }

    /// Continue a stopped task at the step it stopped on.
    pub async fn resume(&self, cancel: &CancellationToken, workspace: &str, task_id: Option<&str>) -> Result<Task, EngineError> {
        check(cancel)?;
        let (ws, id) = self.target(workspace, task_id)?;
        let task = self.engine.tasks().get(&ws.name, &id)?;
        if !task.status.is_resumable() {
            return Err(EngineError::NotResumable {
                task_id: task.id,
                status: task.status,
            });
        }
        self.workspaces.activate(&ws.name)?;
        let (name, id) = (ws.name.as_str(), id.as_str());
        self.guarded(cancel, name, id, move |token| async move {
            self.engine.resume(&token, name, id).await
        })
        .await
    }

    pub async fn approve(&self, cancel: &CancellationToken, workspace: &str, task_id: Option<&str>) -> Result<Task, EngineError> {
        check(cancel)?;
        let (ws, id) = self.target(workspace, task_id)?;
        let task = self.engine.tasks().get(&ws.name, &id)?;
        if task.status != TaskStatus::AwaitingApproval {
            return Err(EngineError::WrongStatus {
                task_id: task.id,
                action: "approve",
                status: task.status,
            });
        }
        self.workspaces.activate(&ws.name)?;
        let (name, id) = (ws.name.as_str(), id.as_str());
        self.guarded(cancel, name, id, move |token| async move {
            self.engine.approve(&token, name, id).await
        })
        .await
    }

    pub fn reject(&self, cancel: &CancellationToken, workspace: &str, task_id: Option<&str>, reason: &str) -> Result<Task, EngineError> {
        check(cancel)?;
        let (ws, id) = self.target(workspace, task_id)?;
        self.engine.reject(cancel, &ws.name, &id, reason)
    }

    pub fn abandon(&self, cancel: &CancellationToken, workspace: &str, task_id: Option<&str>, reason: &str) -> Result<Task, EngineError> {
        check(cancel)?;
        let (ws, id) = self.target(workspace, task_id)?;
        self.engine.abandon(cancel, &ws.name, &id, reason)
    }

    /// Mark a task left running by a dead process as interrupted and pause
    /// its workspace.
    pub fn recover(&self, cancel: &CancellationToken, workspace: &str, task_id: Option<&str>) -> Result<Task, EngineError> {
        check(cancel)?;
        let (ws, id) = self.target(workspace, task_id)?;
        let task = self.engine.recover(cancel, &ws.name, &id)?;
        self.workspaces.pause(&ws.name)?;
        Ok(task)
    }

    /// Run `f` under a token the interrupt signal cancels, then settle the
    /// task and workspace according to how the run ended.
    async fn guarded<F, Fut>(
        &self,
        cancel: &CancellationToken,
        workspace: &str,
        task_id: &str,
        f: F,
    ) -> Result<Task, EngineError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<Task, EngineError>>,
    {
        let token = cancel.child_token();
        let listener = {
            let token = token.clone();
            let mut signal = self.interrupt.clone();
            tokio::spawn(async move {
                signal.fired().await;
                token.cancel();
            })
        };
        let outcome = f(token).await;
        listener.abort();

        match outcome {
            Ok(task) => {
                if task.status.is_resumable() {
                    if let Err(e) = self.workspaces.pause(workspace) {
                        error!(critical = true, workspace, task_id, error = %e, "failed to pause workspace");
                    }
                    info!(workspace, task_id, status = %task.status, "task stopped; workspace paused");
                }
                Ok(task)
            }
            Err(EngineError::Cancelled) => {
                let interrupted = self.interrupt.is_fired();
                let reason = if interrupted { "interrupted by operator" } else { "cancelled" };
                let task = self.settle_interruption(workspace, task_id, reason);
                if !interrupted {
                    return Err(EngineError::Cancelled);
                }
                if let Some(task) = &task {
                    match self.workspaces.get(workspace) {
                        Ok(ws) => eprint!("{}", interruption_summary(&ws, task)),
                        Err(e) => warn!(workspace, error = %e, "cannot print interruption summary"),
                    }
                }
                Err(EngineError::Interrupted {
                    workspace: workspace.to_owned(),
                    task_id: task_id.to_owned(),
                })
            }
            Err(e) => {
                match self.engine.tasks().get(workspace, task_id) {
                    Ok(task) if task.status.is_resumable() => {
                        if let Err(pause) = self.workspaces.pause(workspace) {
                            error!(critical = true, workspace, task_id, error = %pause, "failed to pause workspace");
                        }
                    }
                    Ok(_) => {}
                    Err(load) => warn!(workspace, task_id, error = %load, "cannot reload task after failure"),
                }
                Err(e)
            }
        }
    }

    /// Persist `interrupted`/`paused` with a token nothing can cancel.
    fn settle_interruption(&self, workspace: &str, task_id: &str, reason: &str) -> Option<Task> {
        let cleanup = CancellationToken::new();
        let task = match self.engine.mark_interrupted(&cleanup, workspace, task_id, reason) {
            Ok(task) => Some(task),
            Err(e) => {
                error!(critical = true, workspace, task_id, error = %e, "failed to record interruption; run `recover`");
                None
            }
        };
        if let Err(e) = self.workspaces.pause(workspace) {
            error!(critical = true, workspace, task_id, error = %e, "failed to pause workspace after interruption");
        }
        task
    }
}

fn check(cancel: &CancellationToken) -> Result<(), EngineError> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

#[must_use]
pub fn resume_command(workspace: &str) -> String {
    format!("tasksmith resume {workspace}")
}

/// Operator-facing text printed after an interrupt.
#[must_use]
pub fn interruption_summary(ws: &Workspace, task: &Task) -> String {
    let total = task.total_steps();
    let mut out = String::from("\nTask interrupted.\n");
    let _ = writeln!(out, "  Workspace:  {}", ws.name);
    let _ = writeln!(out, "  Worktree:   {}", ws.worktree_path.display());
    let _ = writeln!(out, "  Task:       {}", task.id);
    let _ = writeln!(
        out,
        "  Stopped at: step {}/{} ({})",
        (task.current_step + 1).min(total),
        total,
        task.current_step_name()
    );
    let _ = writeln!(out, "\nResume with:\n  {}", resume_command(&ws.name));
    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::{WorkspaceError, WorktreeError};
    use crate::exit_codes;
    use crate::runner::approval::{ApprovalDecision, ApprovalGate};
    use crate::step::ExecutionSettings;
    use crate::testing::{FakeRunners, FakeWorktreeRunner, fake_runners};
    use crate::workspace::manager::WorktreeSettings;

    /// Holds the human step open until the run is cancelled.
    struct BlockingGate;

    #[async_trait]
    impl ApprovalGate for BlockingGate {
        async fn request(
            &self,
            cancel: &CancellationToken,
            _task: &Task,
            _prompt: &str,
        ) -> Result<ApprovalDecision, StepError> {
            cancel.cancelled().await;
            Err(StepError::Cancelled)
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        fakes: FakeRunners,
        worktrees: Arc<FakeWorktreeRunner>,
        trigger: InterruptTrigger,
        orch: Orchestrator,
    }

    fn fixture_with(runners: impl FnOnce(&FakeRunners) -> Runners, settings: ExecutionSettings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let fakes = fake_runners();
        let worktrees = Arc::new(FakeWorktreeRunner::new(dir.path()));
        let state = dir.path().join("state");
        let engine = Engine::new(
            TaskStore::new(state.clone()),
            ExecutorRegistry::standard(&runners(&fakes)),
            settings,
        );
        let manager = WorkspaceManager::new(WorkspaceStore::new(state), worktrees.clone(), WorktreeSettings::default());

        let templates = dir.path().join("templates");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(
            templates.join("review.yaml"),
            "steps:\n  - name: implement\n    type: ai\n  - name: approve\n    type: human\n",
        )
        .unwrap();

        let (signal, trigger) = InterruptSignal::manual();
        let orch = Orchestrator::new(manager, engine, TemplateRegistry::load(Some(&templates)).unwrap(), signal);
        Fixture {
            dir,
            fakes,
            worktrees,
            trigger,
            orch,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FakeRunners::runners, ExecutionSettings::default())
    }

    fn blocking_fixture() -> Fixture {
        fixture_with(
            |fakes| {
                let mut runners = fakes.runners();
                runners.approval = Arc::new(BlockingGate);
                runners
            },
            ExecutionSettings::default(),
        )
    }

    impl Fixture {
        fn request(&self, template: &str, workspace: &str) -> StartRequest {
            StartRequest {
                repo: self.dir.path().to_path_buf(),
                template: template.into(),
                description: "Fix login redirect".into(),
                workspace: Some(workspace.into()),
                ..StartRequest::default()
            }
        }
    }

    #[tokio::test]
    async fn validation_failure_pauses_workspace_and_resume_continues_from_it() {
        let settings = ExecutionSettings {
            validation_commands: vec!["make check".into()],
            ..ExecutionSettings::default()
        };
        let f = fixture_with(FakeRunners::runners, settings);
        f.fakes.commands.fail("make check", 1, "lint error");

        let task = f.orch.start(&CancellationToken::new(), &f.request("commit", "tidy")).await.unwrap();
        assert_eq!(task.status, TaskStatus::ValidationFailed);
        assert_eq!(task.current_step, 0);
        assert_eq!(f.orch.workspaces().get("tidy").unwrap().status, WorkspaceStatus::Paused);

        f.fakes.commands.fix("make check");
        // The fake worktree is not a repository, so the commit step fails next.
        let resumed = f.orch.resume(&CancellationToken::new(), "tidy", None).await.unwrap();
        assert_eq!(resumed.status, TaskStatus::GhFailed);
        assert_eq!(resumed.current_step, 1);
        assert_eq!(f.worktrees.create_calls(), 1);
    }

    #[tokio::test]
    async fn interrupt_marks_task_and_pauses_workspace() {
        let f = blocking_fixture();
        let start = f.request("review", "login");
        let again = f.request("commit", "login");
        let trigger = f.trigger;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.fire();
        });

        let err = f
            .orch
            .start(&CancellationToken::new(), &start)
            .await
            .unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(exit_codes::for_class(err.class()), exit_codes::INTERRUPTED);

        let ws = f.orch.workspaces().get("login").unwrap();
        assert_eq!(ws.status, WorkspaceStatus::Paused);
        let task = f.orch.engine().tasks().get("login", ws.latest_task().unwrap()).unwrap();
        assert_eq!(task.status, TaskStatus::Interrupted);
        assert_eq!(task.current_step, 1);
        let summary = interruption_summary(&ws, &task);
        assert!(summary.contains("step 2/2 (approve)"));
        assert!(summary.contains("tasksmith resume login"));

        let preview = f.orch.dry_run(&CancellationToken::new(), &again).unwrap();
        assert!(!preview.workspace.would_create);
    }

    #[tokio::test]
    async fn plain_cancellation_records_interruption_without_sentinel() {
        let f = blocking_fixture();
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        let err = f.orch.start(&cancel, &f.request("review", "gate")).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        let ws = f.orch.workspaces().get("gate").unwrap();
        let task = f.orch.engine().tasks().get("gate", ws.latest_task().unwrap()).unwrap();
        assert_eq!(task.status, TaskStatus::Interrupted);
        assert_eq!(ws.status, WorkspaceStatus::Paused);
    }

    #[test]
    fn dry_run_writes_nothing() {
        let f = fixture();
        let report = f.orch.dry_run(&CancellationToken::new(), &f.request("feature", "login")).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.template, "feature");
        assert_eq!(report.workspace.branch, "feat/login");
        assert!(report.workspace.would_create);
        assert_eq!(
            report.summary.side_effects_prevented[0],
            crate::step::dry_run::WORKSPACE_SIDE_EFFECT
        );
        assert_eq!(f.worktrees.create_calls(), 0);
        assert!(!f.dir.path().join("state").exists());
    }

    #[tokio::test]
    async fn dry_run_reports_the_agent_the_run_uses() {
        let f = fixture();
        std::fs::write(
            f.dir.path().join("templates").join("pinned.yaml"),
            "steps:\n  - name: implement\n    type: ai\n    agent: codex\n",
        )
        .unwrap();
        let orch = Orchestrator::new(
            WorkspaceManager::new(
                WorkspaceStore::new(f.dir.path().join("state")),
                f.worktrees.clone(),
                WorktreeSettings::default(),
            ),
            Engine::new(
                TaskStore::new(f.dir.path().join("state")),
                ExecutorRegistry::standard(&f.fakes.runners()),
                ExecutionSettings::default(),
            ),
            TemplateRegistry::load(Some(&f.dir.path().join("templates"))).unwrap(),
            InterruptSignal::manual().0,
        );

        let req = f.request("pinned", "pinned");
        let report = orch.dry_run(&CancellationToken::new(), &req).unwrap();
        assert_eq!(report.steps[0].config.as_ref().unwrap()["agent"], "codex");

        orch.start(&CancellationToken::new(), &req).await.unwrap();
        assert_eq!(f.fakes.ai.requests()[0].agent, Agent::Codex);

        let mut req = f.request("pinned", "pinned-cli");
        req.agent = Some("gemini".into());
        let report = orch.dry_run(&CancellationToken::new(), &req).unwrap();
        assert_eq!(report.steps[0].config.as_ref().unwrap()["agent"], "gemini");
    }

    #[tokio::test]
    async fn approve_of_a_stopped_task_leaves_workspace_paused() {
        let settings = ExecutionSettings {
            validation_commands: vec!["make check".into()],
            ..ExecutionSettings::default()
        };
        let f = fixture_with(FakeRunners::runners, settings);
        f.fakes.commands.fail("make check", 1, "lint error");
        let task = f.orch.start(&CancellationToken::new(), &f.request("commit", "tidy")).await.unwrap();
        assert_eq!(task.status, TaskStatus::ValidationFailed);

        let err = f.orch.approve(&CancellationToken::new(), "tidy", None).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::WrongStatus { action: "approve", status: TaskStatus::ValidationFailed, .. }
        ));
        assert_eq!(f.orch.workspaces().get("tidy").unwrap().status, WorkspaceStatus::Paused);
    }

    #[test]
    fn dry_run_shares_upfront_validation() {
        let f = fixture();
        let cancel = CancellationToken::new();

        let req = f.request("nope", "login");
        assert!(matches!(f.orch.dry_run(&cancel, &req), Err(EngineError::Template(_))));

        let mut req = f.request("bugfix", "login");
        req.base = Some("main".into());
        req.target = Some("feat/x".into());
        assert!(matches!(
            f.orch.dry_run(&cancel, &req),
            Err(EngineError::Workspace(WorkspaceError::ConflictingBranchOptions))
        ));

        let mut req = f.request("bugfix", "login");
        req.agent = Some("cursor".into());
        assert!(matches!(f.orch.dry_run(&cancel, &req), Err(EngineError::UnknownAgent(_))));

        let mut req = f.request("bugfix", "login");
        req.model = Some("gpt-5".into());
        assert!(matches!(f.orch.dry_run(&cancel, &req), Err(EngineError::InvalidModel { .. })));

        let mut req = f.request("bugfix", "login");
        req.repo = f.dir.path().join("missing");
        assert!(matches!(
            f.orch.dry_run(&cancel, &req),
            Err(EngineError::Workspace(WorkspaceError::Worktree(WorktreeError::NotInGitRepo(_))))
        ));

        let mut req = f.request("bugfix", "login");
        req.description = "  ".into();
        assert!(matches!(f.orch.dry_run(&cancel, &req), Err(EngineError::Usage(_))));
    }

    #[tokio::test]
    async fn missing_target_branch_creates_nothing() {
        let f = fixture();
        let mut req = f.request("bugfix", "login");
        req.target = Some("feat/missing".into());
        let err = f.orch.start(&CancellationToken::new(), &req).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Workspace(WorkspaceError::Worktree(WorktreeError::BranchNotFound(ref b))) if b == "feat/missing"
        ));
        assert!(f.worktrees.created_paths().is_empty());
        assert!(!f.orch.workspaces().exists("login").unwrap());
    }

    #[tokio::test]
    async fn abandoned_task_cannot_be_resumed() {
        let f = fixture();
        let task = f.orch.start(&CancellationToken::new(), &f.request("bugfix", "login")).await.unwrap();
        assert_eq!(task.status, TaskStatus::GhFailed);

        f.orch.abandon(&CancellationToken::new(), "login", None, "not needed").unwrap();
        let err = f.orch.resume(&CancellationToken::new(), "login", None).await.unwrap_err();
        assert!(matches!(err, EngineError::NotResumable { status: TaskStatus::Abandoned, .. }));
        assert_eq!(exit_codes::for_class(err.class()), exit_codes::USAGE);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_any_side_effect() {
        let f = fixture();
        let cancel = CancellationToken::new();
        assert!(f.orch.resume(&cancel, "ghost", None).await.is_err());

        cancel.cancel();
        assert!(matches!(
            f.orch.start(&cancel, &f.request("bugfix", "login")).await,
            Err(EngineError::Cancelled)
        ));
        assert_eq!(f.worktrees.create_calls(), 0);
    }
}
