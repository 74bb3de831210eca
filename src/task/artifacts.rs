#![forbid(unsafe_code)]

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::persist::{now_rfc3339, write_json_atomic};
use crate::task::model::{StepStatus, Task};
use crate::task::store::TaskStore;

/// Result metadata written next to a step's log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepArtifact {
    pub task_id: String,
    pub step_index: usize,
    pub step_name: String,
    pub status: StepStatus,
    pub written_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Per-step output files: `<task dir>/artifacts/<index>-<step>.{log,json,jsonl}`.
#[derive(Debug, Clone)]
pub struct Artifacts {
    store: TaskStore,
}

impl Artifacts {
    #[must_use]
    pub fn new(store: TaskStore) -> Self {
        Self { store }
    }

    pub fn dir(&self, task: &Task) -> Result<PathBuf, StoreError> {
        Ok(self.store.task_dir(&task.workspace, &task.id)?.join("artifacts"))
    }

    fn stem(index: usize, step_name: &str) -> String {
        let safe: String = step_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("{index:02}-{safe}")
    }

    /// Where an agent's JSONL transcript for this step goes.
    pub fn transcript_path(&self, task: &Task, index: usize) -> Result<PathBuf, StoreError> {
        let name = task.steps.get(index).map_or("step", |s| s.name());
        let dir = self.dir(task)?;
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(dir.join(format!("{}.jsonl", Self::stem(index, name))))
    }

    /// Record the step at `index` as it currently stands on `task`.
    pub fn record(&self, task: &Task, index: usize, output: &str) -> Result<(), StoreError> {
        let Some(step) = task.steps.get(index) else {
            return Ok(());
        };
        let dir = self.dir(task)?;
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let stem = Self::stem(index, step.name());
        let log = dir.join(format!("{stem}.log"));
        std::fs::write(&log, output).map_err(|source| StoreError::Io {
            path: log.clone(),
            source,
        })?;
        let artifact = StepArtifact {
            task_id: task.id.clone(),
            step_index: index,
            step_name: step.name().to_owned(),
            status: step.status,
            written_at: now_rfc3339(),
            duration_ms: step.duration_ms,
            error: step.error.clone(),
            files_changed: step.files_changed.clone(),
            metadata: serde_json::to_value(&step.metadata).unwrap_or_default(),
        };
        write_json_atomic(&dir.join(format!("{stem}.json")), "artifact", &stem, &artifact)?;
        debug!(task_id = %task.id, step = %step.name(), log = %log.display(), "step artifacts written");
        Ok(())
    }

    /// Artifact file names for a task, sorted.
    pub fn list(&self, task: &Task) -> Result<Vec<String>, StoreError> {
        let dir = self.dir(task)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_task;

    #[test]
    fn writes_log_and_metadata_per_step() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path().to_path_buf());
        let mut task = sample_task("ws", "task-1");
        task.steps[0].status = StepStatus::Success;
        store.create(&task).unwrap();

        let artifacts = Artifacts::new(store);
        artifacts.record(&task, 0, "done").unwrap();
        assert_eq!(
            artifacts.list(&task).unwrap(),
            vec!["00-implement.json".to_owned(), "00-implement.log".to_owned()]
        );

        let raw = std::fs::read(artifacts.dir(&task).unwrap().join("00-implement.json")).unwrap();
        let a: StepArtifact = serde_json::from_slice(&raw).unwrap();
        assert_eq!(a.status, StepStatus::Success);
        assert_eq!(a.step_name, "implement");
    }
}
