#![forbid(unsafe_code)]

use std::io::{BufRead as _, Write as _};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::StepError;
use crate::task::model::Task;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected(String),
    /// Nobody answered; the task waits in `awaiting_approval`.
    Deferred,
}

#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn request(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        prompt: &str,
    ) -> Result<ApprovalDecision, StepError>;
}

/// Never blocks: every human step parks the task until `approve`/`reject`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeferredApprovalGate;

#[async_trait]
impl ApprovalGate for DeferredApprovalGate {
    async fn request(
        &self,
        cancel: &CancellationToken,
        _task: &Task,
        _prompt: &str,
    ) -> Result<ApprovalDecision, StepError> {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        Ok(ApprovalDecision::Deferred)
    }
}

/// Asks on the controlling terminal. `y` approves, `n` rejects, anything
/// else (including EOF) defers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalApprovalGate;

pub(crate) fn parse_answer(answer: &str) -> ApprovalDecision {
    match answer.trim().to_lowercase().as_str() {
        "y" | "yes" => ApprovalDecision::Approved,
        "n" | "no" => ApprovalDecision::Rejected("rejected at terminal".to_owned()),
        _ => ApprovalDecision::Deferred,
    }
}

#[async_trait]
impl ApprovalGate for TerminalApprovalGate {
    async fn request(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        prompt: &str,
    ) -> Result<ApprovalDecision, StepError> {
        let question = format!(
            "\n[{}] {}\n{prompt} [y = approve / n = reject / enter = decide later]: ",
            task.id, task.description
        );
        let read = tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            let _ = stderr.write_all(question.as_bytes());
            let _ = stderr.flush();
            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);
            line
        });
        tokio::select! {
            () = cancel.cancelled() => Err(StepError::Cancelled),
            line = read => Ok(parse_answer(&line.unwrap_or_default())),
        }
    }
}
