#![forbid(unsafe_code)]

use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, StoreError};
use crate::persist::now_rfc3339;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    pub pid: u32,
    pub task_id: String,
    pub started_at: String,
}

#[must_use]
pub fn lock_path(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join("run.lock")
}

/// Holder of a workspace's `run.lock` for the length of a live run; the file
/// is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(workspace_dir: &Path, task_id: &str) -> Result<Self, EngineError> {
        let path = lock_path(workspace_dir);
        std::fs::create_dir_all(workspace_dir).map_err(|source| StoreError::Io {
            path: workspace_dir.to_path_buf(),
            source,
        })?;
        if let Some(held) = read_lock(&path)? {
            if process_alive(held.pid) {
                return Err(EngineError::AlreadyRunning {
                    task_id: held.task_id,
                    pid: held.pid,
                    lock: path,
                });
            }
            warn!(pid = held.pid, lock = %path.display(), "removing stale run lock");
            let _ = std::fs::remove_file(&path);
        }

        let info = LockInfo {
            pid: std::process::id(),
            task_id: task_id.to_owned(),
            started_at: now_rfc3339(),
        };
        let data = serde_json::to_vec_pretty(&info).map_err(|source| StoreError::Encode {
            kind: "lock",
            key: task_id.to_owned(),
            source,
        })?;
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Lost a race with another process.
                let pid = read_lock(&path)?.map_or(0, |l| l.pid);
                return Err(EngineError::AlreadyRunning {
                    task_id: task_id.to_owned(),
                    pid,
                    lock: path,
                });
            }
            Err(source) => return Err(StoreError::Io { path, source }.into()),
        };
        file.write_all(&data).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(lock = %path.display(), task_id, "run lock acquired");
        Ok(Self { path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub fn read_lock(path: &Path) -> Result<Option<LockInfo>, StoreError> {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    // An unreadable lock is treated as stale rather than blocking forever.
    Ok(serde_json::from_slice(&data).ok())
}

/// A lock held by a live process other than this one.
pub fn live_holder(workspace_dir: &Path) -> Result<Option<LockInfo>, StoreError> {
    Ok(read_lock(&lock_path(workspace_dir))?.filter(|l| process_alive(l.pid)))
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}
