#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::StepError;
use crate::runner::command::run_process;

const GH_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrRequest {
    pub workdir: PathBuf,
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: Option<String>,
    pub draft: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckState {
    Pending,
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckRun {
    pub name: String,
    pub state: CheckState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

/// Pull-request hosting operations used by git and ci steps.
#[async_trait]
pub trait HubRunner: Send + Sync {
    async fn create_pr(
        &self,
        cancel: &CancellationToken,
        req: &PrRequest,
    ) -> Result<PullRequest, StepError>;

    async fn checks(
        &self,
        cancel: &CancellationToken,
        workdir: &Path,
        pr: u64,
    ) -> Result<Vec<CheckRun>, StepError>;
}

/// GitHub through the `gh` CLI.
#[derive(Debug, Clone)]
pub struct GhCliRunner {
    executable: String,
}

impl Default for GhCliRunner {
    fn default() -> Self {
        Self::new("gh")
    }
}

impl GhCliRunner {
    #[must_use]
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    fn gh(&self, workdir: &Path) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.current_dir(workdir);
        cmd
    }
}

#[async_trait]
impl HubRunner for GhCliRunner {
    async fn create_pr(
        &self,
        cancel: &CancellationToken,
        req: &PrRequest,
    ) -> Result<PullRequest, StepError> {
        let mut cmd = self.gh(&req.workdir);
        cmd.args(["pr", "create", "--title", &req.title, "--body", &req.body]);
        cmd.args(["--head", &req.head]);
        if let Some(base) = &req.base {
            cmd.args(["--base", base]);
        }
        if req.draft {
            cmd.arg("--draft");
        }
        let out = run_process(cmd, None, GH_TIMEOUT, cancel, None).await?;
        if !out.success() {
            return Err(StepError::Git {
                operation: "create_pr".to_owned(),
                message: out.tail(10),
            });
        }
        let pr = parse_pr_url(&out.stdout).ok_or_else(|| StepError::Git {
            operation: "create_pr".to_owned(),
            message: format!("could not find a pull request URL in: {}", out.stdout.trim()),
        })?;
        info!(number = pr.number, url = %pr.url, "pull request created");
        Ok(pr)
    }

    async fn checks(
        &self,
        cancel: &CancellationToken,
        workdir: &Path,
        pr: u64,
    ) -> Result<Vec<CheckRun>, StepError> {
        let number = pr.to_string();
        let mut cmd = self.gh(workdir);
        cmd.args(["pr", "checks", &number, "--json", "name,bucket,link"]);
        let out = run_process(cmd, None, GH_TIMEOUT, cancel, None).await?;
        // gh exits non-zero while checks are pending or failing but still prints JSON.
        if let Some(checks) = parse_checks(&out.stdout) {
            return Ok(checks);
        }
        if out.stderr.contains("no checks reported") {
            return Ok(Vec::new());
        }
        Err(StepError::Failed(format!(
            "gh pr checks {pr} failed: {}",
            out.tail(10)
        )))
    }
}

fn parse_pr_url(stdout: &str) -> Option<PullRequest> {
    let url = stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| l.starts_with("http") && l.contains("/pull/"))?;
    let number = url.rsplit('/').next()?.parse().ok()?;
    Some(PullRequest {
        number,
        url: url.to_owned(),
    })
}

#[derive(Deserialize)]
struct GhCheck {
    name: String,
    bucket: String,
    #[serde(default)]
    link: Option<String>,
}

fn parse_checks(stdout: &str) -> Option<Vec<CheckRun>> {
    let raw: Vec<GhCheck> = serde_json::from_str(stdout.trim()).ok()?;
    Some(
        raw.into_iter()
            .map(|c| CheckRun {
                state: match c.bucket.as_str() {
                    "pass" => CheckState::Passed,
                    "fail" | "cancel" => CheckState::Failed,
                    "skipping" => CheckState::Skipped,
                    _ => CheckState::Pending,
                },
                name: c.name,
                link: c.link.filter(|l| !l.is_empty()),
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pr_url_from_gh_output() {
        let out = "Creating pull request for feat/x into main\n\nhttps://github.com/o/r/pull/42\n";
        let pr = parse_pr_url(out).unwrap();
        assert_eq!(pr.number, 42);
        assert_eq!(pr.url, "https://github.com/o/r/pull/42");
        assert!(parse_pr_url("nothing here").is_none());
    }

    #[test]
    fn maps_check_buckets() {
        let out = r#"[
            {"name":"build","bucket":"pass","link":"https://ci/1"},
            {"name":"lint","bucket":"fail","link":""},
            {"name":"e2e","bucket":"pending"},
            {"name":"docs","bucket":"skipping"}
        ]"#;
        let checks = parse_checks(out).unwrap();
        let states: Vec<CheckState> = checks.iter().map(|c| c.state).collect();
        assert_eq!(
            states,
            vec![
                CheckState::Passed,
                CheckState::Failed,
                CheckState::Pending,
                CheckState::Skipped
            ]
        );
        assert_eq!(checks[1].link, None);
    }
}
