#![forbid(unsafe_code)]

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncWriteExt as _};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::StepError;
use crate::persist::now_rfc3339;

/// Exit status and captured streams of a finished child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    #[must_use]
    pub fn combined(&self) -> String {
        let mut s = self.stdout.trim_end().to_owned();
        let err = self.stderr.trim_end();
        if !err.is_empty() {
            if !s.is_empty() {
                s.push('\n');
            }
            s.push_str(err);
        }
        s
    }

    /// Last `lines` lines of stderr (stdout when stderr is empty).
    #[must_use]
    pub fn tail(&self, lines: usize) -> String {
        let src = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let all: Vec<&str> = src.trim_end().lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

/// Runs shell command lines inside a worktree.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        cancel: &CancellationToken,
        workdir: &Path,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, StepError>;
}

/// Runs each line through `$SHELL -lc` so user aliases and PATH apply.
#[derive(Debug, Clone, Default)]
pub struct ShellCommandRunner;

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        workdir: &Path,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, StepError> {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_owned());
        let mut cmd = Command::new(&shell);
        cmd.args(["-lc", command]).current_dir(workdir);
        run_process(cmd, None, timeout, cancel, None).await
    }
}

#[derive(Debug, Serialize)]
struct TranscriptEntry<'a> {
    timestamp: String,
    stream: &'a str,
    #[serde(flatten)]
    payload: serde_json::Value,
}

fn transcript_line(stream: &str, line: &str) -> String {
    let payload: serde_json::Value = serde_json::from_str(line).unwrap_or_else(|_| {
        serde_json::json!({
            "type": "text",
            "text": line,
        })
    });
    let entry = TranscriptEntry {
        timestamp: now_rfc3339(),
        stream,
        payload,
    };
    let mut s = serde_json::to_string(&entry).unwrap_or_else(|_| "{}".to_owned());
    s.push('\n');
    s
}

async fn collect_lines<R>(
    reader: Option<R>,
    stream: &'static str,
    mut log: Option<tokio::fs::File>,
) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };
    let mut lines = tokio::io::BufReader::new(reader).lines();
    let mut out = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(f) = log.as_mut()
            && !line.trim().is_empty()
        {
            let _ = f.write_all(transcript_line(stream, &line).as_bytes()).await;
        }
        out.push_str(&line);
        out.push('\n');
    }
    if let Some(f) = log.as_mut() {
        let _ = f.flush().await;
    }
    out
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Spawn `cmd`, feed `stdin`, and collect both streams until the child exits,
/// `timeout` elapses or `cancel` fires. The child is killed in the latter two
/// cases. When `transcript` is set, every non-empty line is also appended to
/// that file as a JSONL entry.
pub(crate) async fn run_process(
    mut cmd: Command,
    stdin: Option<&str>,
    timeout: Duration,
    cancel: &CancellationToken,
    transcript: Option<&Path>,
) -> Result<CommandOutput, StepError> {
    if cancel.is_cancelled() {
        return Err(StepError::Cancelled);
    }
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let log = match transcript {
        Some(path) => Some(open_transcript(path).await?),
        None => None,
    };

    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| StepError::Failed(format!("failed to start {program}: {e}")))?;
    debug!(program = %program, pid = ?child.id(), "process spawned");

    if let Some(input) = stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        let mut buf = input.as_bytes().to_vec();
        buf.push(b'\n');
        let _ = pipe.write_all(&buf).await;
    }

    let out_log = match &log {
        Some(f) => f.try_clone().await.ok(),
        None => None,
    };
    let stdout_task = tokio::spawn(collect_lines(child.stdout.take(), "stdout", out_log));
    let stderr_task = tokio::spawn(collect_lines(child.stderr.take(), "stderr", log));

    let waited = tokio::select! {
        res = child.wait() => Waited::Exited(res),
        () = tokio::time::sleep(timeout) => Waited::TimedOut,
        () = cancel.cancelled() => Waited::Cancelled,
    };

    let status = match waited {
        Waited::Exited(res) => {
            res.map_err(|e| StepError::Failed(format!("failed to wait for {program}: {e}")))?
        }
        Waited::TimedOut => {
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(StepError::Timeout(timeout));
        }
        Waited::Cancelled => {
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(StepError::Cancelled);
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    Ok(CommandOutput {
        exit_code: status.code(),
        stdout,
        stderr,
        duration: started.elapsed(),
    })
}

async fn open_transcript(path: &Path) -> Result<tokio::fs::File, StepError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| StepError::IoPath {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|source| StepError::IoPath {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_exit_code_and_streams() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let out = ShellCommandRunner
            .run(
                &cancel,
                dir.path(),
                "echo hello; echo oops >&2; exit 3",
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
        // A login shell may print profile noise ahead of the command's output.
        assert_eq!(out.stdout.lines().last(), Some("hello"));
        assert_eq!(out.tail(1), "oops");
        assert!(out.combined().ends_with("oops"));
    }

    #[tokio::test]
    async fn times_out_and_kills() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let err = ShellCommandRunner
            .run(&cancel, dir.path(), "sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ShellCommandRunner
            .run(&cancel, dir.path(), "true", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Cancelled));
    }

    #[tokio::test]
    async fn writes_jsonl_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs").join("run.jsonl");
        let mut cmd = Command::new("sh");
        cmd.args(["-c", r#"echo '{"type":"turn"}'; echo plain"#]);
        run_process(
            cmd,
            None,
            Duration::from_secs(10),
            &CancellationToken::new(),
            Some(&log),
        )
        .await
        .unwrap();

        let text = std::fs::read_to_string(&log).unwrap();
        let entries: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["type"], "turn");
        assert_eq!(entries[1]["text"], "plain");
        assert_eq!(entries[1]["stream"], "stdout");
    }
}
