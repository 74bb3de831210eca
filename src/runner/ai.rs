#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::StepError;
use crate::runner::agent::Agent;
use crate::runner::command::run_process;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiRequest {
    pub agent: Agent,
    pub model: String,
    pub prompt: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// Ask the agent not to modify files (verification passes).
    pub read_only: bool,
    /// JSONL transcript of the agent's output stream.
    pub transcript: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AiResponse {
    pub output: String,
    pub num_turns: Option<u32>,
    pub session_id: Option<String>,
    pub files_changed: Vec<String>,
    pub duration: Duration,
}

#[async_trait]
pub trait AiRunner: Send + Sync {
    async fn run(
        &self,
        cancel: &CancellationToken,
        req: &AiRequest,
    ) -> Result<AiResponse, StepError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentExecutables {
    pub claude: String,
    pub codex: String,
    pub gemini: String,
}

impl Default for AgentExecutables {
    fn default() -> Self {
        Self {
            claude: "claude".to_owned(),
            codex: "codex".to_owned(),
            gemini: "gemini".to_owned(),
        }
    }
}

/// Drives the agents' non-interactive CLIs.
#[derive(Debug, Clone, Default)]
pub struct CliAiRunner {
    executables: AgentExecutables,
}

impl CliAiRunner {
    #[must_use]
    pub fn new(executables: AgentExecutables) -> Self {
        Self { executables }
    }

    fn command(&self, req: &AiRequest) -> (Command, Option<String>) {
        match req.agent {
            Agent::Claude => {
                let mut cmd = Command::new(&self.executables.claude);
                cmd.current_dir(&req.workdir);
                if req.read_only {
                    cmd.args(["--permission-mode", "plan"]);
                } else {
                    cmd.arg("--dangerously-skip-permissions");
                }
                cmd.args(["--output-format", "json"]);
                cmd.args(["--model", &req.model]);
                cmd.args(["-p", &req.prompt]);
                (cmd, None)
            }
            Agent::Codex => {
                let workdir = req.workdir.to_string_lossy().into_owned();
                let mut cmd = Command::new(&self.executables.codex);
                cmd.current_dir(&req.workdir);
                cmd.arg("exec");
                if req.read_only {
                    cmd.args(["--sandbox", "read-only"]);
                } else {
                    cmd.arg("--dangerously-bypass-approvals-and-sandbox");
                }
                cmd.args(["--color", "never"]);
                cmd.arg("--json");
                cmd.args(["-m", &req.model]);
                cmd.args(["-C", &workdir]);
                cmd.arg("-");
                (cmd, Some(req.prompt.clone()))
            }
            Agent::Gemini => {
                let mut cmd = Command::new(&self.executables.gemini);
                cmd.current_dir(&req.workdir);
                if !req.read_only {
                    cmd.arg("--yolo");
                }
                cmd.args(["--output-format", "json"]);
                cmd.args(["-m", &req.model]);
                cmd.args(["-p", &req.prompt]);
                (cmd, None)
            }
        }
    }
}

#[async_trait]
impl AiRunner for CliAiRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        req: &AiRequest,
    ) -> Result<AiResponse, StepError> {
        let before = porcelain(cancel, &req.workdir).await;
        let (cmd, stdin) = self.command(req);
        info!(agent = %req.agent, model = %req.model, "running ai agent");

        let out = run_process(
            cmd,
            stdin.as_deref(),
            req.timeout,
            cancel,
            req.transcript.as_deref(),
        )
        .await?;
        if !out.success() {
            return Err(StepError::Agent(format!(
                "{} exited with code {}: {}",
                req.agent,
                out.exit_code.map_or_else(|| "?".to_owned(), |c| c.to_string()),
                out.tail(20)
            )));
        }

        let parsed = parse_output(req.agent, &out.stdout)?;
        let after = porcelain(cancel, &req.workdir).await;
        let files_changed = changed_files(&before, &after);
        debug!(
            agent = %req.agent,
            turns = ?parsed.num_turns,
            files = files_changed.len(),
            "ai agent finished"
        );
        Ok(AiResponse {
            output: parsed.output,
            num_turns: parsed.num_turns,
            session_id: parsed.session_id,
            files_changed,
            duration: out.duration,
        })
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ParsedOutput {
    pub output: String,
    pub num_turns: Option<u32>,
    pub session_id: Option<String>,
}

/// Pull the final answer and turn count out of an agent's JSON output.
/// Falls back to the raw text when the output is not in the expected shape.
pub(crate) fn parse_output(agent: Agent, stdout: &str) -> Result<ParsedOutput, StepError> {
    let parsed = match agent {
        Agent::Claude => parse_claude(stdout)?,
        Agent::Codex => parse_codex(stdout),
        Agent::Gemini => parse_gemini(stdout),
    };
    Ok(parsed.unwrap_or_else(|| ParsedOutput {
        output: stdout.trim().to_owned(),
        ..ParsedOutput::default()
    }))
}

fn as_u32(v: &serde_json::Value) -> Option<u32> {
    v.as_u64().and_then(|n| u32::try_from(n).ok())
}

fn parse_claude(stdout: &str) -> Result<Option<ParsedOutput>, StepError> {
    for line in stdout.lines().rev() {
        let Ok(v) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
            continue;
        };
        let Some(result) = v.get("result").and_then(|r| r.as_str()) else {
            continue;
        };
        if v.get("is_error").and_then(serde_json::Value::as_bool) == Some(true) {
            return Err(StepError::Agent(result.to_owned()));
        }
        return Ok(Some(ParsedOutput {
            output: result.to_owned(),
            num_turns: v.get("num_turns").and_then(as_u32),
            session_id: v
                .get("session_id")
                .and_then(|s| s.as_str())
                .map(str::to_owned),
        }));
    }
    Ok(None)
}

fn parse_codex(stdout: &str) -> Option<ParsedOutput> {
    let mut parsed = ParsedOutput::default();
    let mut turns = 0u32;
    let mut seen = false;
    for line in stdout.lines() {
        let Ok(v) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
            continue;
        };
        match v.get("type").and_then(|t| t.as_str()) {
            Some("thread.started") => {
                parsed.session_id = v
                    .get("thread_id")
                    .and_then(|s| s.as_str())
                    .map(str::to_owned);
            }
            Some("turn.completed") => turns += 1,
            Some("item.completed") => {
                let item = &v["item"];
                if item.get("type").and_then(|t| t.as_str()) == Some("agent_message")
                    && let Some(text) = item.get("text").and_then(|t| t.as_str())
                {
                    parsed.output = text.to_owned();
                    seen = true;
                }
            }
            _ => {}
        }
    }
    if !seen {
        return None;
    }
    parsed.num_turns = Some(turns);
    Some(parsed)
}

fn parse_gemini(stdout: &str) -> Option<ParsedOutput> {
    let v: serde_json::Value = serde_json::from_str(stdout.trim()).ok()?;
    let response = v.get("response")?.as_str()?;
    Some(ParsedOutput {
        output: response.to_owned(),
        ..ParsedOutput::default()
    })
}

/// `git status --porcelain` lines, or an empty set outside a repository.
async fn porcelain(cancel: &CancellationToken, workdir: &Path) -> BTreeSet<String> {
    let mut cmd = Command::new("git");
    cmd.args(["status", "--porcelain", "--untracked-files=all"])
        .current_dir(workdir);
    match run_process(cmd, None, Duration::from_secs(30), cancel, None).await {
        Ok(out) if out.success() => out.stdout.lines().map(str::to_owned).collect(),
        _ => BTreeSet::new(),
    }
}

/// Paths whose porcelain line appeared or changed between two snapshots.
fn changed_files(before: &BTreeSet<String>, after: &BTreeSet<String>) -> Vec<String> {
    let mut paths: Vec<String> = after
        .difference(before)
        .filter_map(|line| line.get(3..))
        .map(|p| p.rsplit(" -> ").next().unwrap_or(p).to_owned())
        .collect();
    paths.dedup();
    paths
}
