#![forbid(unsafe_code)]

//! In-memory stand-ins for git, agents, shells and the PR host, shared by the
//! unit tests and (behind the `test-support` feature) the integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::core::worktree::{
    BranchSource, CheckoutAction, WorktreeInfo, WorktreeRequest, WorktreeRunner,
};
use crate::error::{StepError, WorktreeError};
use crate::persist::now_rfc3339;
use crate::runner::Runners;
use crate::runner::ai::{AiRequest, AiResponse, AiRunner};
use crate::runner::approval::{ApprovalDecision, ApprovalGate};
use crate::runner::command::{CommandOutput, CommandRunner};
use crate::runner::hub::{CheckRun, HubRunner, PrRequest, PullRequest};
use crate::step::definition::{AiStepConfig, StepConfig, StepDefinition};
use crate::step::{ExecutionSettings, ExecutorRegistry, StepContext};
use crate::task::model::{Step, Task, TaskStatus};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A pending task with a single `ai` step.
#[must_use]
pub fn sample_task(workspace: &str, id: &str) -> Task {
    let now = now_rfc3339();
    Task {
        id: id.to_owned(),
        workspace: workspace.to_owned(),
        template_id: "task".to_owned(),
        description: "Add input validation to the signup form".to_owned(),
        status: TaskStatus::Pending,
        current_step: 0,
        steps: vec![Step::pending(StepDefinition::new(
            "implement",
            StepConfig::Ai(AiStepConfig::default()),
        ))],
        branch: format!("feat/{workspace}"),
        worktree_path: format!("/tmp/{workspace}"),
        created_at: now.clone(),
        updated_at: now,
        completed_at: None,
        last_error: None,
        metadata: BTreeMap::new(),
        transitions: Vec::new(),
    }
}

/// Records worktree operations and materializes directories under `root`.
pub struct FakeWorktreeRunner {
    root: PathBuf,
    branches: Mutex<BTreeSet<String>>,
    created: Mutex<Vec<PathBuf>>,
    creates: AtomicUsize,
    removes: AtomicUsize,
}

impl FakeWorktreeRunner {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            branches: Mutex::new(BTreeSet::from(["main".to_owned()])),
            created: Mutex::new(Vec::new()),
            creates: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
        }
    }

    pub fn add_branch(&self, branch: &str) {
        lock(&self.branches).insert(branch.to_owned());
    }

    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn remove_calls(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    /// Paths of worktrees that currently exist.
    #[must_use]
    pub fn created_paths(&self) -> Vec<PathBuf> {
        lock(&self.created).clone()
    }
}

impl WorktreeRunner for FakeWorktreeRunner {
    fn repo_root(&self, dir: &Path) -> Result<PathBuf, WorktreeError> {
        if dir.is_dir() {
            Ok(dir.to_path_buf())
        } else {
            Err(WorktreeError::NotInGitRepo(dir.to_path_buf()))
        }
    }

    fn preview(&self, req: &WorktreeRequest) -> Result<WorktreeInfo, WorktreeError> {
        let path = self.root.join("worktrees").join(&req.name);
        match &req.source {
            BranchSource::Target { branch } => {
                if !lock(&self.branches).contains(branch) {
                    return Err(WorktreeError::BranchNotFound(branch.clone()));
                }
                Ok(WorktreeInfo {
                    path,
                    branch: branch.clone(),
                    action: CheckoutAction::Existing,
                })
            }
            BranchSource::NewFromBase { base } => Ok(WorktreeInfo {
                path,
                branch: format!("{}/{}", req.branch_prefix.trim_matches('/'), req.name),
                action: CheckoutAction::NewBranch {
                    start_point: base.clone(),
                },
            }),
        }
    }

    fn create(&self, req: &WorktreeRequest) -> Result<WorktreeInfo, WorktreeError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let info = self.preview(req)?;
        std::fs::create_dir_all(&info.path).map_err(|source| WorktreeError::IoPath {
            path: info.path.clone(),
            source,
        })?;
        lock(&self.branches).insert(info.branch.clone());
        lock(&self.created).push(info.path.clone());
        Ok(info)
    }

    fn remove(&self, _repo: &Path, path: &Path, _force: bool) -> Result<(), WorktreeError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        lock(&self.created).retain(|p| p != path);
        if path.exists() {
            std::fs::remove_dir_all(path).map_err(|source| WorktreeError::IoPath {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }
}

/// Replies from a queue; once it is empty every call succeeds with `ok`.
#[derive(Default)]
pub struct ScriptedAiRunner {
    replies: Mutex<VecDeque<Result<AiResponse, StepError>>>,
    requests: Mutex<Vec<AiRequest>>,
}

impl ScriptedAiRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, output: &str, files_changed: &[&str]) {
        lock(&self.replies).push_back(Ok(AiResponse {
            output: output.to_owned(),
            num_turns: Some(1),
            session_id: None,
            files_changed: files_changed.iter().map(|f| (*f).to_owned()).collect(),
            duration: Duration::from_millis(5),
        }));
    }

    pub fn push_err(&self, err: StepError) {
        lock(&self.replies).push_back(Err(err));
    }

    #[must_use]
    pub fn requests(&self) -> Vec<AiRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl AiRunner for ScriptedAiRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        req: &AiRequest,
    ) -> Result<AiResponse, StepError> {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        lock(&self.requests).push(req.clone());
        lock(&self.replies).pop_front().unwrap_or_else(|| {
            Ok(AiResponse {
                output: "ok".to_owned(),
                num_turns: Some(1),
                ..AiResponse::default()
            })
        })
    }
}

struct Failure {
    exit_code: i32,
    output: String,
    /// `None` fails forever.
    remaining: Option<u32>,
}

/// Every command passes unless told otherwise.
#[derive(Default)]
pub struct ScriptedCommandRunner {
    failures: Mutex<BTreeMap<String, Failure>>,
    stdout: Mutex<BTreeMap<String, String>>,
    history: Mutex<Vec<String>>,
}

impl ScriptedCommandRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, command: &str, exit_code: i32, output: &str) {
        lock(&self.failures).insert(
            command.to_owned(),
            Failure {
                exit_code,
                output: output.to_owned(),
                remaining: None,
            },
        );
    }

    pub fn fail_times(&self, command: &str, exit_code: i32, times: u32, output: &str) {
        lock(&self.failures).insert(
            command.to_owned(),
            Failure {
                exit_code,
                output: output.to_owned(),
                remaining: Some(times),
            },
        );
    }

    /// Stop failing `command` from now on.
    pub fn fix(&self, command: &str) {
        lock(&self.failures).remove(command);
    }

    /// What a passing `command` prints.
    pub fn respond(&self, command: &str, stdout: &str) {
        lock(&self.stdout).insert(command.to_owned(), stdout.to_owned());
    }

    #[must_use]
    pub fn history(&self) -> Vec<String> {
        lock(&self.history).clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedCommandRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        _workdir: &Path,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, StepError> {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        lock(&self.history).push(command.to_owned());
        let mut failures = lock(&self.failures);
        if let Some(f) = failures.get_mut(command) {
            let out = CommandOutput {
                exit_code: Some(f.exit_code),
                stdout: f.output.clone(),
                stderr: String::new(),
                duration: Duration::from_millis(1),
            };
            match f.remaining {
                Some(n) if n <= 1 => {
                    failures.remove(command);
                }
                Some(n) => f.remaining = Some(n - 1),
                None => {}
            }
            return Ok(out);
        }
        drop(failures);
        Ok(CommandOutput {
            exit_code: Some(0),
            stdout: lock(&self.stdout).get(command).cloned().unwrap_or_default(),
            stderr: String::new(),
            duration: Duration::from_millis(1),
        })
    }
}

/// Numbers pull requests from 1; check responses are queued and the last one
/// repeats.
#[derive(Default)]
pub struct FakeHubRunner {
    created: Mutex<Vec<PrRequest>>,
    checks: Mutex<VecDeque<Vec<CheckRun>>>,
    polls: AtomicUsize,
}

impl FakeHubRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn created(&self) -> Vec<PrRequest> {
        lock(&self.created).clone()
    }

    pub fn push_checks(&self, checks: Vec<CheckRun>) {
        lock(&self.checks).push_back(checks);
    }

    #[must_use]
    pub fn check_polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HubRunner for FakeHubRunner {
    async fn create_pr(
        &self,
        cancel: &CancellationToken,
        req: &PrRequest,
    ) -> Result<PullRequest, StepError> {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        let mut created = lock(&self.created);
        created.push(req.clone());
        let number = created.len() as u64;
        Ok(PullRequest {
            number,
            url: format!("https://example.test/pull/{number}"),
        })
    }

    async fn checks(
        &self,
        cancel: &CancellationToken,
        _workdir: &Path,
        _pr: u64,
    ) -> Result<Vec<CheckRun>, StepError> {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut queue = lock(&self.checks);
        if queue.len() > 1 {
            Ok(queue.pop_front().unwrap_or_default())
        } else {
            Ok(queue.front().cloned().unwrap_or_default())
        }
    }
}

pub struct FixedApprovalGate {
    decision: ApprovalDecision,
}

impl FixedApprovalGate {
    #[must_use]
    pub fn new(decision: ApprovalDecision) -> Self {
        Self { decision }
    }
}

#[async_trait]
impl ApprovalGate for FixedApprovalGate {
    async fn request(
        &self,
        cancel: &CancellationToken,
        _task: &Task,
        _prompt: &str,
    ) -> Result<ApprovalDecision, StepError> {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        Ok(self.decision.clone())
    }
}

/// Concrete handles to the fakes behind a `Runners`.
#[derive(Clone)]
pub struct FakeRunners {
    pub ai: Arc<ScriptedAiRunner>,
    pub commands: Arc<ScriptedCommandRunner>,
    pub hub: Arc<FakeHubRunner>,
    pub approval: Arc<FixedApprovalGate>,
}

impl FakeRunners {
    #[must_use]
    pub fn runners(&self) -> Runners {
        Runners {
            ai: self.ai.clone(),
            commands: self.commands.clone(),
            hub: self.hub.clone(),
            approval: self.approval.clone(),
        }
    }
}

/// Fakes with a deferring approval gate.
#[must_use]
pub fn fake_runners() -> FakeRunners {
    FakeRunners {
        ai: Arc::new(ScriptedAiRunner::new()),
        commands: Arc::new(ScriptedCommandRunner::new()),
        hub: Arc::new(FakeHubRunner::new()),
        approval: Arc::new(FixedApprovalGate::new(ApprovalDecision::Deferred)),
    }
}

/// Owns everything a `StepContext` borrows.
pub struct StepHarness {
    pub dir: TempDir,
    pub cancel: CancellationToken,
    pub settings: ExecutionSettings,
    pub registry: ExecutorRegistry,
    pub fakes: FakeRunners,
}

impl StepHarness {
    /// # Panics
    /// If a temporary directory cannot be created.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let fakes = fake_runners();
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
            cancel: CancellationToken::new(),
            settings: ExecutionSettings::default(),
            registry: ExecutorRegistry::standard(&fakes.runners()),
            fakes,
        }
    }

    #[must_use]
    pub fn worktree(&self) -> &Path {
        self.dir.path()
    }

    #[must_use]
    pub fn cx(&self) -> StepContext<'_> {
        StepContext {
            cancel: &self.cancel,
            worktree: self.dir.path(),
            settings: &self.settings,
            registry: &self.registry,
            transcript: None,
        }
    }
}

impl Default for StepHarness {
    fn default() -> Self {
        Self::new()
    }
}
