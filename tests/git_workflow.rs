use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tasksmith::controller::{InterruptSignal, Orchestrator, StartRequest};
use tasksmith::core::worktree::GitWorktreeRunner;
use tasksmith::error::{EngineError, StepError, WorkspaceError, WorktreeError};
use tasksmith::runner::Runners;
use tasksmith::runner::ai::{AiRequest, AiResponse, AiRunner};
use tasksmith::runner::approval::DeferredApprovalGate;
use tasksmith::step::{ExecutionSettings, ExecutorRegistry};
use tasksmith::task::engine::Engine;
use tasksmith::task::model::{StepStatus, TaskStatus};
use tasksmith::task::store::TaskStore;
use tasksmith::task::template::TemplateRegistry;
use tasksmith::testing::{FakeHubRunner, ScriptedCommandRunner};
use tasksmith::workspace::manager::{WorkspaceManager, WorktreeSettings};
use tasksmith::workspace::model::WorkspaceStatus;
use tasksmith::workspace::store::WorkspaceStore;

const CHECK: &str = "make check";

/// Writes `hello.txt` into the worktree. With `block_once`, the first call
/// waits for cancellation instead.
#[derive(Default)]
struct WritingAgent {
    block_once: AtomicBool,
}

#[async_trait]
impl AiRunner for WritingAgent {
    async fn run(&self, cancel: &CancellationToken, req: &AiRequest) -> Result<AiResponse, StepError> {
        if self.block_once.swap(false, Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(StepError::Cancelled);
        }
        std::fs::write(req.workdir.join("hello.txt"), "hello\n").map_err(|e| StepError::Agent(e.to_string()))?;
        Ok(AiResponse {
            output: "wrote hello.txt".into(),
            num_turns: Some(1),
            files_changed: vec!["hello.txt".into()],
            ..AiResponse::default()
        })
    }
}

struct Env {
    td: tempfile::TempDir,
    repo: PathBuf,
    state: PathBuf,
    commands: Arc<ScriptedCommandRunner>,
}

impl Env {
    fn orchestrator(&self, ai: Arc<dyn AiRunner>, signal: InterruptSignal) -> Orchestrator {
        let runners = Runners {
            ai,
            commands: self.commands.clone(),
            hub: Arc::new(FakeHubRunner::new()),
            approval: Arc::new(DeferredApprovalGate),
        };
        let settings = ExecutionSettings {
            validation_commands: vec![CHECK.into()],
            ..ExecutionSettings::default()
        };
        let engine = Engine::new(
            TaskStore::new(self.state.clone()),
            ExecutorRegistry::standard(&runners),
            settings,
        );
        let manager = WorkspaceManager::new(
            WorkspaceStore::new(self.state.clone()),
            Arc::new(GitWorktreeRunner::default()),
            WorktreeSettings::default(),
        );
        Orchestrator::new(manager, engine, TemplateRegistry::builtin(), signal)
    }

    fn request(&self, workspace: &str) -> StartRequest {
        StartRequest {
            repo: self.repo.clone(),
            template: "task".into(),
            description: "Say hello".into(),
            workspace: Some(workspace.into()),
            ..StartRequest::default()
        }
    }
}

fn setup() -> Option<Env> {
    if Command::new("git").arg("--version").output().is_err() {
        eprintln!("skipping: git not found");
        return None;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let repo = td.path().join("repo");
    std::fs::create_dir_all(&repo).expect("mkdir repo");

    run(&repo, &["init", "-b", "main"]);
    run(&repo, &["config", "user.email", "test@example.com"]);
    run(&repo, &["config", "user.name", "Test"]);
    std::fs::write(repo.join("README.md"), "hello\n").expect("write");
    run(&repo, &["add", "."]);
    run(&repo, &["commit", "-m", "init"]);

    let state = td.path().join("state");
    Some(Env {
        td,
        repo,
        state,
        commands: Arc::new(ScriptedCommandRunner::new()),
    })
}

fn run(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git command");
    if !out.status.success() {
        panic!("git {:?} failed: {}", args, String::from_utf8_lossy(&out.stderr));
    }
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn tree(root: &Path) -> BTreeSet<PathBuf> {
    let mut out = BTreeSet::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).expect("read_dir") {
            let path = entry.expect("entry").path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            out.insert(path);
        }
    }
    out
}

#[tokio::test]
async fn start_commits_agent_changes_in_a_new_worktree() {
    let Some(env) = setup() else { return };
    let orch = env.orchestrator(Arc::new(WritingAgent::default()), InterruptSignal::manual().0);

    let task = orch
        .start(&CancellationToken::new(), &env.request("hello"))
        .await
        .expect("start");
    assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.last_error);
    assert!(task.steps.iter().all(|s| s.status == StepStatus::Success));

    let ws = orch.workspaces().get("hello").expect("workspace");
    assert_eq!(ws.branch, "task/hello");
    assert_eq!(ws.worktree_path, env.td.path().join("repo-hello"));
    let subject = run(&ws.worktree_path, &["log", "-1", "--format=%s"]);
    assert_eq!(subject.trim(), "chore: Say hello");
    assert!(!env.repo.join("hello.txt").exists());
    assert_eq!(env.commands.history(), vec![CHECK.to_owned()]);
}

#[tokio::test]
async fn missing_target_branch_leaves_no_worktree() {
    let Some(env) = setup() else { return };
    let orch = env.orchestrator(Arc::new(WritingAgent::default()), InterruptSignal::manual().0);
    let mut req = env.request("ghost");
    req.target = Some("feat/does-not-exist".into());

    let err = orch.start(&CancellationToken::new(), &req).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Workspace(WorkspaceError::Worktree(WorktreeError::BranchNotFound(_)))
    ));
    let worktrees = run(&env.repo, &["worktree", "list", "--porcelain"]);
    assert_eq!(worktrees.matches("worktree ").count(), 1);
    assert!(!orch.workspaces().exists("ghost").unwrap());
}

#[tokio::test]
async fn dry_run_touches_nothing() {
    let Some(env) = setup() else { return };
    let orch = env.orchestrator(Arc::new(WritingAgent::default()), InterruptSignal::manual().0);
    let before = tree(env.td.path());

    let mut req = env.request("preview");
    req.template = "bugfix".into();
    req.base = Some("main".into());
    let report = orch.dry_run(&CancellationToken::new(), &req).expect("dry run");

    assert_eq!(tree(env.td.path()), before);
    assert_eq!(report.workspace.branch, "fix/preview");
    assert!(report.workspace.would_create);
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["dry_run"], true);
    assert_eq!(json["summary"]["total_steps"], 5);
    assert_eq!(json["summary"]["side_effects_prevented"][0], "Workspace creation (git worktree)");
    assert_eq!(json["steps"][0]["status"], "would_execute");
}

#[tokio::test]
async fn state_survives_a_crash_mid_step() {
    let Some(env) = setup() else { return };
    env.commands.fail(CHECK, 2, "tests failed");
    let orch = env.orchestrator(Arc::new(WritingAgent::default()), InterruptSignal::manual().0);
    let task = orch
        .start(&CancellationToken::new(), &env.request("crash"))
        .await
        .expect("start");
    assert_eq!(task.status, TaskStatus::ValidationFailed);

    // Pretend a later run died while re-running validation.
    let store = orch.engine().tasks();
    let mut crashed = store.get("crash", &task.id).unwrap();
    assert_eq!(crashed.current_step, 1);
    assert_eq!(crashed.steps[0].status, StepStatus::Success);
    crashed.status = TaskStatus::Validating;
    crashed.steps[1].status = StepStatus::Running;
    store.update(&mut crashed).unwrap();

    let fresh = env.orchestrator(Arc::new(WritingAgent::default()), InterruptSignal::manual().0);
    let recovered = fresh.recover(&CancellationToken::new(), "crash", None).unwrap();
    assert_eq!(recovered.status, TaskStatus::Interrupted);
    assert_eq!(recovered.steps[1].status, StepStatus::Pending);
    assert_eq!(fresh.workspaces().get("crash").unwrap().status, WorkspaceStatus::Paused);

    env.commands.fix(CHECK);
    let done = fresh.resume(&CancellationToken::new(), "crash", None).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.steps[0].attempts, 1, "completed steps are not re-run");
}

#[tokio::test]
async fn interrupt_then_resume_round_trip() {
    let Some(env) = setup() else { return };
    let agent = Arc::new(WritingAgent {
        block_once: AtomicBool::new(true),
    });
    let (signal, trigger) = InterruptSignal::manual();
    let orch = env.orchestrator(agent.clone(), signal);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.fire();
    });

    let err = orch
        .start(&CancellationToken::new(), &env.request("pause"))
        .await
        .unwrap_err();
    assert!(err.is_interrupted());

    let ws = orch.workspaces().get("pause").unwrap();
    assert_eq!(ws.status, WorkspaceStatus::Paused);
    assert!(ws.worktree_path.is_dir());
    let task = orch.engine().tasks().get("pause", ws.latest_task().unwrap()).unwrap();
    assert_eq!(task.status, TaskStatus::Interrupted);
    assert_eq!(task.current_step, 0);

    let next = env.orchestrator(agent, InterruptSignal::manual().0);
    let done = next.resume(&CancellationToken::new(), "pause", None).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(next.workspaces().get("pause").unwrap().status, WorkspaceStatus::Active);
    assert!(done.transitions.iter().any(|t| t.to == TaskStatus::Interrupted));
}
