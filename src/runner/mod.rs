#![forbid(unsafe_code)]

//! External processes the steps drive: AI agents, shell commands, the
//! pull-request host, and the human approval gate.

pub mod agent;
pub mod ai;
pub mod approval;
pub mod command;
pub mod hub;

use std::sync::Arc;

use crate::runner::ai::{AiRunner, CliAiRunner};
use crate::runner::approval::{ApprovalGate, DeferredApprovalGate};
use crate::runner::command::{CommandRunner, ShellCommandRunner};
use crate::runner::hub::{GhCliRunner, HubRunner};

/// The set of runners handed to step executors.
#[derive(Clone)]
pub struct Runners {
    pub ai: Arc<dyn AiRunner>,
    pub commands: Arc<dyn CommandRunner>,
    pub hub: Arc<dyn HubRunner>,
    pub approval: Arc<dyn ApprovalGate>,
}

impl Default for Runners {
    fn default() -> Self {
        Self {
            ai: Arc::new(CliAiRunner::default()),
            commands: Arc::new(ShellCommandRunner),
            hub: Arc::new(GhCliRunner::default()),
            approval: Arc::new(DeferredApprovalGate),
        }
    }
}
