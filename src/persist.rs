#![forbid(unsafe_code)]

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Write `value` as pretty JSON via a sibling temp file and a rename, so
/// readers never observe a half-written record.
pub(crate) fn write_json_atomic<T: Serialize>(
    path: &Path,
    kind: &'static str,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let data = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
        kind,
        key: key.to_owned(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &data).map_err(|source| StoreError::Io {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

pub(crate) fn read_json<T: DeserializeOwned>(
    path: &Path,
    kind: &'static str,
    key: &str,
) -> Result<T, StoreError> {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound {
                kind,
                key: key.to_owned(),
            });
        }
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&data).map_err(|source| StoreError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Keys become directory names, so they must not escape the store root.
pub(crate) fn validate_key(kind: &'static str, key: &str) -> Result<(), StoreError> {
    let reason = if key.trim().is_empty() {
        Some("must not be empty")
    } else if key.contains('/') || key.contains('\\') {
        Some("must not contain path separators")
    } else if key.contains("..") {
        Some("must not contain '..'")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(StoreError::InvalidKey {
            kind,
            key: key.to_owned(),
            reason,
        }),
        None => Ok(()),
    }
}

#[must_use]
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_owned())
}
