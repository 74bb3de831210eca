#![forbid(unsafe_code)]

//! Stable process exit codes.

use crate::error::{ConfigError, EngineError, ErrorClass, StoreError, TemplateError, WorkspaceError, WorktreeError};

/// Command succeeded.
pub const OK: u8 = 0;
/// Internal failure or an execution error with nothing to resume.
pub const FAILURE: u8 = 1;
/// Bad flags, unknown template, agent or model.
pub const USAGE: u8 = 2;
/// Not in a repository, missing branch or binary.
pub const ENVIRONMENT: u8 = 3;
/// The task stopped in a state `resume` can continue from.
pub const PAUSED: u8 = 4;
/// Operator interrupt.
pub const INTERRUPTED: u8 = 130;

#[must_use]
pub fn for_class(class: ErrorClass) -> u8 {
    match class {
        ErrorClass::UserInput => USAGE,
        ErrorClass::Environment => ENVIRONMENT,
        ErrorClass::ResumableExecution => PAUSED,
        ErrorClass::UnresumableExecution | ErrorClass::Internal => FAILURE,
        ErrorClass::Interrupted => INTERRUPTED,
    }
}

/// Classify an error from the CLI layer by the first typed error in its chain.
#[must_use]
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<EngineError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<WorkspaceError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<WorktreeError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<TemplateError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<ConfigError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<StoreError>() {
            return e.class();
        }
        if cause.is::<clap::Error>() {
            return ErrorClass::UserInput;
        }
    }
    ErrorClass::Internal
}

#[must_use]
pub fn for_error(err: &anyhow::Error) -> u8 {
    for_class(classify(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::TaskStatus;

    #[test]
    fn classifies_through_context() {
        let err = anyhow::Error::from(EngineError::NotResumable {
            task_id: "task-1".into(),
            status: TaskStatus::Completed,
        })
        .context("resume failed");
        assert_eq!(for_error(&err), USAGE);

        let err = anyhow::Error::from(EngineError::from(WorktreeError::BranchNotFound("feat/x".into())));
        assert_eq!(for_error(&err), ENVIRONMENT);

        let err = anyhow::Error::from(EngineError::Interrupted {
            workspace: "ws".into(),
            task_id: "task-1".into(),
        });
        assert_eq!(for_error(&err), INTERRUPTED);

        assert_eq!(for_error(&anyhow::anyhow!("boom")), FAILURE);
    }
}
