#![forbid(unsafe_code)]

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::StepError;
use crate::runner::command::CommandRunner;
use crate::step::definition::{StepConfig, StepDefinition, StepType, ValidationStepConfig};
use crate::step::{ExecutionSettings, StepContext, StepExecutor, StepResult, step_timeout};
use crate::task::model::Task;

/// Commands a validation pass will run, after defaults and detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationPlan {
    pub format_commands: Vec<String>,
    pub commands: Vec<String>,
    pub timeout: Duration,
}

impl ValidationPlan {
    /// Step config first, then configured defaults, then what the worktree
    /// looks like it needs.
    pub fn resolve(
        cfg: &ValidationStepConfig,
        settings: &ExecutionSettings,
        worktree: &Path,
    ) -> Result<Self, StepError> {
        let detected = detect_commands(worktree);
        let pick = |own: &[String], configured: &[String], fallback: Vec<String>| {
            if !own.is_empty() {
                own.to_vec()
            } else if !configured.is_empty() {
                configured.to_vec()
            } else {
                fallback
            }
        };
        Ok(Self {
            format_commands: pick(
                &cfg.format_commands,
                &settings.format_commands,
                detected.0,
            ),
            commands: pick(&cfg.commands, &settings.validation_commands, detected.1),
            timeout: step_timeout(cfg.timeout.as_deref(), settings.command_timeout)?,
        })
    }

    fn all(&self) -> impl Iterator<Item = &String> {
        self.format_commands
            .iter()
            .chain(self.commands.iter())
            .filter(|c| !c.trim().is_empty())
    }
}

/// `(format, check)` commands inferred from well-known project files.
fn detect_commands(worktree: &Path) -> (Vec<String>, Vec<String>) {
    let owned = |v: &[&str]| v.iter().map(|s| (*s).to_owned()).collect::<Vec<_>>();
    if worktree.join("Cargo.toml").is_file() {
        (
            owned(&["cargo fmt --all"]),
            owned(&["cargo clippy --all-targets -- -D warnings", "cargo test"]),
        )
    } else if worktree.join("go.mod").is_file() {
        (owned(&["go fmt ./..."]), owned(&["go vet ./...", "go test ./..."]))
    } else if worktree.join("package.json").is_file() {
        (Vec::new(), owned(&["npm test"]))
    } else {
        (Vec::new(), Vec::new())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandReport {
    pub command: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub commands: Vec<CommandReport>,
    pub output: String,
}

impl ValidationReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.commands.iter().all(|c| c.passed)
    }

    #[must_use]
    pub fn failed_commands(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.command.as_str())
            .collect()
    }

    #[must_use]
    pub fn summary(&self) -> String {
        let failed = self.failed_commands();
        if failed.is_empty() {
            format!("{} command(s) passed", self.commands.len())
        } else {
            format!("{} of {} command(s) failed: {}", failed.len(), self.commands.len(), failed.join(", "))
        }
    }

    #[must_use]
    pub fn into_error(self) -> StepError {
        StepError::ValidationFailed {
            summary: self.summary(),
            output: self.output,
        }
    }

    fn metadata(&self) -> serde_json::Value {
        serde_json::to_value(&self.commands).unwrap_or_default()
    }
}

/// Run every command of `plan` in order and collect the results. Failures do
/// not stop the pass so the report covers all of them; cancellation does.
pub async fn run_validation(
    runner: &dyn CommandRunner,
    cancel: &CancellationToken,
    worktree: &Path,
    plan: &ValidationPlan,
) -> Result<ValidationReport, StepError> {
    let mut report = ValidationReport::default();
    for command in plan.all() {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        let (exit_code, duration, text) =
            match runner.run(cancel, worktree, command, plan.timeout).await {
                Ok(out) => (out.exit_code, out.duration, out.combined()),
                Err(StepError::Timeout(d)) => (None, d, format!("timed out after {d:?}")),
                Err(e) => return Err(e),
            };
        let passed = exit_code == Some(0);
        if !passed {
            warn!(command = %command, exit_code = ?exit_code, "validation command failed");
        }
        let _ = writeln!(report.output, "$ {command}");
        if !text.is_empty() {
            let _ = writeln!(report.output, "{text}");
        }
        let _ = writeln!(
            report.output,
            "({}, {:.1}s)\n",
            exit_code.map_or_else(|| "no exit code".to_owned(), |c| format!("exit {c}")),
            duration.as_secs_f64()
        );
        report.commands.push(CommandReport {
            command: command.clone(),
            exit_code,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            passed,
        });
    }
    Ok(report)
}

pub struct ValidationExecutor {
    runner: Arc<dyn CommandRunner>,
}

impl ValidationExecutor {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl StepExecutor for ValidationExecutor {
    fn step_type(&self) -> StepType {
        StepType::Validation
    }

    async fn execute(
        &self,
        cx: &StepContext<'_>,
        task: &Task,
        step: &StepDefinition,
    ) -> Result<StepResult, StepError> {
        cx.check_cancelled()?;
        let StepConfig::Validation(cfg) = &step.config else {
            return Err(StepError::Failed(format!(
                "step '{}' is not a validation step",
                step.name
            )));
        };
        let plan = ValidationPlan::resolve(cfg, cx.settings, cx.worktree)?;
        if plan.all().next().is_none() {
            warn!(task_id = %task.id, step = %step.name, "no validation commands configured or detected");
            return Ok(StepResult::with_output("no validation commands").meta("commands", serde_json::json!([])));
        }

        let report = run_validation(self.runner.as_ref(), cx.cancel, cx.worktree, &plan).await?;
        info!(task_id = %task.id, step = %step.name, passed = report.passed(), "validation finished");
        if !report.passed() {
            return Err(report.into_error());
        }
        let meta = report.metadata();
        Ok(StepResult::with_output(report.output).meta("commands", meta))
    }
}
