#![forbid(unsafe_code)]

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::StepError;
use crate::runner::command::run_process;
use crate::runner::hub::{HubRunner, PrRequest};
use crate::step::definition::{GitOperation, GitStepConfig, StepConfig, StepDefinition, StepType};
use crate::step::{StepContext, StepExecutor, StepResult, render_prompt};
use crate::task::model::{StepStatus, Task, meta};

/// Commit, push, and open the pull request for the task's branch.
pub struct GitExecutor {
    hub: Arc<dyn HubRunner>,
}

impl GitExecutor {
    #[must_use]
    pub fn new(hub: Arc<dyn HubRunner>) -> Self {
        Self { hub }
    }

    async fn create_pr(
        &self,
        cx: &StepContext<'_>,
        task: &Task,
        cfg: &GitStepConfig,
    ) -> Result<StepResult, StepError> {
        if let (Some(number), Some(url)) = (
            task.metadata.get(meta::PR_NUMBER).and_then(serde_json::Value::as_u64),
            task.metadata_str(meta::PR_URL),
        ) {
            info!(task_id = %task.id, number, "pull request already exists");
            return Ok(StepResult::with_output(url.to_owned()).meta("reused", true));
        }
        let req = PrRequest {
            workdir: cx.worktree.to_path_buf(),
            title: pr_title(task, cfg),
            body: pr_body(task),
            head: task.branch.clone(),
            base: cfg
                .base
                .clone()
                .or_else(|| task.metadata_str(meta::BASE_BRANCH).map(str::to_owned)),
            draft: cfg.draft,
        };
        let pr = self.hub.create_pr(cx.cancel, &req).await?;
        let mut res = StepResult::with_output(pr.url.clone());
        res.task_metadata
            .insert(meta::PR_NUMBER.to_owned(), pr.number.into());
        res.task_metadata
            .insert(meta::PR_URL.to_owned(), pr.url.into());
        Ok(res)
    }
}

const UNSTAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Run git in the worktree, killing it on cancel or timeout.
async fn git(
    cancel: &CancellationToken,
    cx: &StepContext<'_>,
    operation: GitOperation,
    args: &[&str],
    timeout: Duration,
) -> Result<String, StepError> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(cx.worktree);
    let out = match run_process(cmd, None, timeout, cancel, None).await {
        Ok(out) => out,
        Err(StepError::Failed(message)) => {
            return Err(StepError::Git {
                operation: operation.as_str().to_owned(),
                message,
            });
        }
        Err(e) => return Err(e),
    };
    if out.success() {
        Ok(out.stdout)
    } else {
        Err(StepError::Git {
            operation: operation.as_str().to_owned(),
            message: format!("git {}: {}", args.join(" "), out.combined()),
        })
    }
}

/// Conventional-commit style subject from the branch prefix and description.
fn commit_message(task: &Task, cfg: &GitStepConfig) -> String {
    if let Some(m) = &cfg.message {
        return render_prompt(m, task);
    }
    let kind = match task.branch.split('/').next() {
        Some("fix" | "bugfix" | "hotfix") => "fix",
        Some("feat" | "feature") => "feat",
        _ => "chore",
    };
    let first = task.description.lines().next().unwrap_or_default().trim();
    let subject: String = first.chars().take(72 - kind.len() - 2).collect();
    format!("{kind}: {subject}\n\nTask: {}", task.id)
}

fn pr_title(task: &Task, cfg: &GitStepConfig) -> String {
    commit_message(task, cfg)
        .lines()
        .next()
        .unwrap_or_default()
        .to_owned()
}

fn pr_body(task: &Task) -> String {
    let mut body = format!("{}\n\n### Steps\n", task.description.trim());
    for step in &task.steps {
        let mark = match step.status {
            StepStatus::Success => "x",
            _ => " ",
        };
        let _ = writeln!(body, "- [{mark}] {} ({})", step.name(), step.step_type());
    }
    let _ = write!(body, "\nTask `{}` in workspace `{}`.", task.id, task.workspace);
    body
}

async fn commit(cx: &StepContext<'_>, message: &str) -> Result<StepResult, StepError> {
    let op = GitOperation::Commit;
    let timeout = cx.settings.command_timeout;
    let status = git(cx.cancel, cx, op, &["status", "--porcelain"], timeout).await?;
    if status.trim().is_empty() {
        info!(worktree = %cx.worktree.display(), "nothing to commit");
        return Ok(StepResult::with_output("nothing to commit").meta("committed", false));
    }
    git(cx.cancel, cx, op, &["add", "-A"], timeout).await?;
    if let Err(e) = git(cx.cancel, cx, op, &["commit", "-m", message], timeout).await {
        // Leave the index as the agent left it so a retry starts clean.
        let unstage = CancellationToken::new();
        if let Err(reset) = git(&unstage, cx, op, &["reset", "--quiet"], UNSTAGE_TIMEOUT).await {
            warn!(error = %reset, "failed to unstage after commit failure");
        }
        return Err(e);
    }
    let sha = git(cx.cancel, cx, op, &["rev-parse", "HEAD"], timeout)
        .await?
        .trim()
        .to_owned();
    let files: Vec<String> = status
        .lines()
        .filter_map(|l| l.get(3..))
        .map(str::to_owned)
        .collect();
    let mut res = StepResult::with_output(format!("committed {sha}"))
        .meta("committed", true)
        .meta("sha", sha);
    res.files_changed = files;
    Ok(res)
}

async fn push(cx: &StepContext<'_>, branch: &str) -> Result<StepResult, StepError> {
    let remote = cx.settings.remote.as_str();
    let out = git(
        cx.cancel,
        cx,
        GitOperation::Push,
        &["push", "-u", remote, branch],
        cx.settings.command_timeout,
    )
    .await?;
    Ok(StepResult::with_output(out)
        .meta("remote", remote)
        .meta("branch", branch))
}

#[async_trait]
impl StepExecutor for GitExecutor {
    fn step_type(&self) -> StepType {
        StepType::Git
    }

    async fn execute(
        &self,
        cx: &StepContext<'_>,
        task: &Task,
        step: &StepDefinition,
    ) -> Result<StepResult, StepError> {
        cx.check_cancelled()?;
        let StepConfig::Git(cfg) = &step.config else {
            return Err(StepError::Failed(format!(
                "step '{}' is not a git step",
                step.name
            )));
        };
        info!(task_id = %task.id, step = %step.name, operation = cfg.operation.as_str(), "git step starting");
        match cfg.operation {
            GitOperation::Commit => commit(cx, &commit_message(task, cfg)).await,
            GitOperation::Push => push(cx, &task.branch).await,
            GitOperation::CreatePr => self.create_pr(cx, task, cfg).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHubRunner, StepHarness, sample_task};

    #[test]
    fn commit_message_follows_branch_prefix() {
        let mut task = sample_task("ws", "task-1");
        task.branch = "fix/login".into();
        task.description = "Handle expired tokens\nmore detail".into();
        let msg = commit_message(&task, &GitStepConfig::new(GitOperation::Commit));
        assert_eq!(msg, "fix: Handle expired tokens\n\nTask: task-1");

        let cfg = GitStepConfig {
            message: Some("custom {{task_id}}".into()),
            ..GitStepConfig::new(GitOperation::Commit)
        };
        assert_eq!(commit_message(&task, &cfg), "custom task-1");
    }

    #[tokio::test]
    async fn create_pr_records_number_and_is_idempotent() {
        let hub = Arc::new(FakeHubRunner::new());
        let harness = StepHarness::new();
        let mut task = sample_task("ws", "task-1");
        let step = StepDefinition::new(
            "pr",
            StepConfig::Git(GitStepConfig::new(GitOperation::CreatePr)),
        );
        let exec = GitExecutor::new(hub.clone());

        let res = exec.execute(&harness.cx(), &task, &step).await.unwrap();
        assert_eq!(res.task_metadata[meta::PR_NUMBER], 1);
        assert_eq!(hub.created().len(), 1);
        assert_eq!(hub.created()[0].head, task.branch);

        task.metadata.extend(res.task_metadata);
        let again = exec.execute(&harness.cx(), &task, &step).await.unwrap();
        assert_eq!(again.metadata["reused"], true);
        assert_eq!(hub.created().len(), 1);
    }

    fn sh(dir: &std::path::Path, script: &str) -> String {
        let out = std::process::Command::new("sh")
            .args(["-c", script])
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(out.status.success(), "{script}: {}", String::from_utf8_lossy(&out.stderr));
        String::from_utf8_lossy(&out.stdout).into_owned()
    }

    /// Repository whose pre-commit hook runs `hook`.
    fn repo_with_hook(harness: &StepHarness, hook: &str) -> bool {
        if std::process::Command::new("git").arg("--version").output().is_err() {
            eprintln!("git not found; skipping");
            return false;
        }
        let wt = harness.worktree();
        sh(
            wt,
            "git init -q && git config user.email t@example.com && git config user.name t \
             && git config commit.gpgsign false \
             && git commit -q --allow-empty --no-verify -m init",
        );
        std::fs::write(wt.join(".git/hooks/pre-commit"), format!("#!/bin/sh\n{hook}\n")).unwrap();
        sh(wt, "chmod +x .git/hooks/pre-commit");
        std::fs::write(wt.join("a.txt"), "hello\n").unwrap();
        true
    }

    fn commit_step() -> StepDefinition {
        StepDefinition::new("commit", StepConfig::Git(GitStepConfig::new(GitOperation::Commit)))
    }

    #[tokio::test]
    async fn failed_commit_unstages_changes() {
        let harness = StepHarness::new();
        if !repo_with_hook(&harness, "exit 1") {
            return;
        }
        let exec = GitExecutor::new(Arc::new(FakeHubRunner::new()));
        let err = exec
            .execute(&harness.cx(), &sample_task("ws", "task-1"), &commit_step())
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Git { ref operation, .. } if operation == "commit"));

        let wt = harness.worktree();
        assert_eq!(sh(wt, "git diff --cached --name-only").trim(), "");
        assert_eq!(sh(wt, "git status --porcelain").trim(), "?? a.txt");
    }

    #[tokio::test]
    async fn slow_commit_hook_observes_cancellation() {
        let harness = StepHarness::new();
        if !repo_with_hook(&harness, "sleep 30") {
            return;
        }
        let exec = GitExecutor::new(Arc::new(FakeHubRunner::new()));
        let stopper = harness.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stopper.cancel();
        });

        let started = std::time::Instant::now();
        let err = exec
            .execute(&harness.cx(), &sample_task("ws", "task-1"), &commit_step())
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
