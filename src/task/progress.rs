#![forbid(unsafe_code)]

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProgressKind {
    Start,
    Complete,
}

/// Step boundary notification for UI layers.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub step_index: usize,
    pub step_name: String,
    pub total_steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_changed_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ProgressEvent {
    #[must_use]
    pub fn start(step_index: usize, step_name: &str, total_steps: usize) -> Self {
        Self {
            kind: ProgressKind::Start,
            step_index,
            step_name: step_name.to_owned(),
            total_steps,
            agent: None,
            model: None,
            duration_ms: None,
            num_turns: None,
            files_changed_count: None,
            output: None,
        }
    }
}

pub type ProgressFn = dyn Fn(&ProgressEvent) + Send + Sync;

/// Wraps the caller's callback. A panicking callback is logged and ignored;
/// it never becomes a step failure.
#[derive(Clone, Default)]
pub struct ProgressSink {
    callback: Option<Arc<ProgressFn>>,
}

impl ProgressSink {
    #[must_use]
    pub fn new(callback: Arc<ProgressFn>) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: &ProgressEvent) {
        let Some(cb) = &self.callback else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| cb(event))).is_err() {
            warn!(step = %event.step_name, "progress callback panicked; ignoring");
        }
    }
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSink")
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
