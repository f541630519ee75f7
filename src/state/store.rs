//! Atomic JSON persistence for [`LocalState`]: write via `.tmp` + rename,
//! load with silent schema-fallback-to-empty and per-entry malformed-data
//! discarding.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::{instrument, warn};

use super::model::{LocalState, LruEntry, RetryEntry, Snapshot};

/// Errors writing the state file. Reads never fail: a corrupt or missing
/// file is treated as an empty snapshot, since reconciliation against the
/// filesystem re-establishes ground truth on the next heartbeat.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to rename temp state file into place at {path}: {source}")]
    Rename {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Loads a [`LocalState`] from `path`. Never fails: a missing file, invalid
/// JSON, or a document with the wrong top-level shape all yield an empty
/// state. Individual malformed `lru`/`retry` entries are dropped rather than
/// failing the whole load.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub fn load(path: &Path) -> LocalState {
    let mut state = LocalState::default();

    let Ok(raw) = std::fs::read_to_string(path) else {
        return state;
    };
    let Ok(value) = serde_json::from_str::<Value>(&raw) else {
        warn!("state file contains invalid JSON, starting from empty state");
        return state;
    };
    let Some(object) = value.as_object() else {
        warn!("state file top level is not a JSON object, starting from empty state");
        return state;
    };

    state.installed_static = string_array(object.get("installed_static"));
    state.installed_dynamic = string_array(object.get("installed_dynamic"));
    state.failed = string_array(object.get("failed"));
    state.lru = typed_map::<LruEntry>(object.get("lru"));
    state.retry = typed_map::<RetryEntry>(object.get("retry"));

    state
}

/// Serializes `state` and atomically replaces `path` with the result.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn save(path: &Path, state: &LocalState, now_ms: u64) -> Result<(), StateError> {
    let snapshot = state.to_snapshot(now_ms);
    // Route through a BTreeMap so top-level keys serialize in sorted order
    // (the canonical on-disk form), independent of struct declaration order.
    let value = serde_json::to_value(&snapshot).map_err(StateError::Serialize)?;
    let sorted: BTreeMap<String, Value> = value
        .as_object()
        .map(|object| object.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    let serialized = serde_json::to_vec_pretty(&sorted).map_err(StateError::Serialize)?;

    let tmp_path = tmp_sibling(path);
    tokio::fs::write(&tmp_path, &serialized)
        .await
        .map_err(|source| StateError::Write {
            path: tmp_path.clone(),
            source,
        })?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|source| StateError::Rename {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn string_array(value: Option<&Value>) -> std::collections::BTreeSet<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn typed_map<T: serde::de::DeserializeOwned>(value: Option<&Value>) -> BTreeMap<String, T> {
    let Some(object) = value.and_then(Value::as_object) else {
        return BTreeMap::new();
    };

    object
        .iter()
        .filter_map(|(key, entry)| match serde_json::from_value::<T>(entry.clone()) {
            Ok(parsed) => Some((key.clone(), parsed)),
            Err(err) => {
                warn!(dep_id = %key, error = %err, "discarding malformed state entry");
                None
            }
        })
        .collect()
}
