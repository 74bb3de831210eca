#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::StepError;
use crate::runner::approval::{ApprovalDecision, ApprovalGate};
use crate::step::definition::{HumanStepConfig, StepConfig, StepDefinition, StepType};
use crate::step::{StepContext, StepExecutor, StepResult, render_prompt};
use crate::task::model::Task;

/// Pauses for a person to approve or reject the work so far.
pub struct HumanExecutor {
    gate: Arc<dyn ApprovalGate>,
}

impl HumanExecutor {
    #[must_use]
    pub fn new(gate: Arc<dyn ApprovalGate>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl StepExecutor for HumanExecutor {
    fn step_type(&self) -> StepType {
        StepType::Human
    }

    async fn execute(
        &self,
        cx: &StepContext<'_>,
        task: &Task,
        step: &StepDefinition,
    ) -> Result<StepResult, StepError> {
        cx.check_cancelled()?;
        let default_cfg = HumanStepConfig::default();
        let cfg = match &step.config {
            StepConfig::Human(cfg) => cfg,
            _ => &default_cfg,
        };
        let prompt = render_prompt(&cfg.prompt, task);
        match self.gate.request(cx.cancel, task, &prompt).await? {
            ApprovalDecision::Approved => {
                info!(task_id = %task.id, step = %step.name, "approved");
                Ok(StepResult::with_output("approved").meta("decision", "approved"))
            }
            ApprovalDecision::Rejected(reason) => {
                info!(task_id = %task.id, step = %step.name, reason = %reason, "rejected");
                Err(StepError::Rejected(reason))
            }
            ApprovalDecision::Deferred => {
                info!(task_id = %task.id, step = %step.name, "waiting for approval");
                let mut res = StepResult::with_output(prompt).meta("decision", "deferred");
                res.awaiting_approval = true;
                Ok(res)
            }
        }
    }
}
