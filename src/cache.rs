//! LRU cache manager: reconciliation against the filesystem, touch, eviction,
//! and pre-download space reservation.

use std::collections::BTreeSet;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::state::{LocalState, LruEntry};
use crate::util::{disk_stats, safe_join};

/// Merged dynamic-eviction policy: env overrides, falling back to the
/// profile the control plane handed back at registration, falling back to
/// these defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub enabled: bool,
    pub min_free_bytes: u64,
    pub max_dynamic_bytes: u64,
    pub eviction_batch_max: u32,
    pub pin_ttl_ms: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            enabled: false,
            min_free_bytes: 5 * 1024 * 1024 * 1024,
            max_dynamic_bytes: 0,
            eviction_batch_max: 20,
            pin_ttl_ms: 1_800_000,
        }
    }
}

/// Errors from cache-management operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Even after reconciliation and eviction, free space remains below the
    /// required floor. Retryable — eviction candidates or disk state may
    /// change before the next attempt.
    #[error("insufficient disk space: free={free} required={required}")]
    InsufficientSpace { required: u64, free: u64 },

    #[error("failed to query disk stats: {0}")]
    Disk(#[source] std::io::Error),
}

/// Verifies every LRU entry's backing file still exists, recomputing its
/// size in place and dropping entries whose file has disappeared. Returns
/// whether anything changed (callers use this to decide whether to persist).
#[instrument(level = "debug", skip_all)]
pub fn reconcile(state: &mut LocalState, workspace: &Path) -> bool {
    let mut changed = false;
    let dep_ids: Vec<String> = state.lru.keys().cloned().collect();

    for dep_id in dep_ids {
        let Some(entry) = state.lru.get(&dep_id) else {
            continue;
        };
        let metadata = safe_join(workspace, &entry.dest_relative_path)
            .ok()
            .and_then(|path| std::fs::metadata(path).ok());

        match metadata {
            None => {
                debug!(dep_id, "lru entry file missing, dropping from index");
                state.lru.remove(&dep_id);
                state.installed_dynamic.remove(&dep_id);
                changed = true;
            }
            Some(metadata) => {
                let size = metadata.len();
                if let Some(entry) = state.lru.get_mut(&dep_id)
                    && entry.size_bytes != size
                {
                    entry.size_bytes = size;
                    changed = true;
                }
            }
        }
    }

    changed
}

/// Updates `last_touched_at_ms` for a dynamic artifact, adopting a new LRU
/// entry if `dest_relative_path` names a file that already exists on disk
/// but wasn't previously tracked. Never creates an entry for a path that
/// doesn't exist — a touch must not falsely mark an artifact as installed.
#[instrument(level = "debug", skip(state, workspace))]
pub fn touch(
    state: &mut LocalState,
    workspace: &Path,
    dep_id: &str,
    dest_relative_path: Option<&str>,
    now_ms: u64,
) -> bool {
    let had_entry = state.lru.contains_key(dep_id);
    let current_dest = dest_relative_path
        .map(str::to_string)
        .or_else(|| state.lru.get(dep_id).map(|e| e.dest_relative_path.clone()));

    let Some(current_dest) = current_dest else {
        return false;
    };

    let size = safe_join(workspace, &current_dest)
        .ok()
        .and_then(|path| std::fs::metadata(path).ok())
        .map(|metadata| metadata.len());

    match size {
        None => {
            if had_entry {
                if let Some(entry) = state.lru.get_mut(dep_id) {
                    entry.last_touched_at_ms = now_ms;
                }
                return true;
            }
            false
        }
        Some(size_bytes) => {
            state.lru.insert(
                dep_id.to_string(),
                LruEntry {
                    dest_relative_path: current_dest,
                    size_bytes,
                    last_touched_at_ms: now_ms,
                },
            );
            state.installed_dynamic.insert(dep_id.to_string());
            state.installed_static.remove(dep_id);
            true
        }
    }
}

/// Evicts dynamic artifacts, oldest-touched first, until `required_free_bytes`
/// and `policy.max_dynamic_bytes` are both satisfied or the per-call batch
/// cap is reached. Never evicts anything in `protect`, in `state.downloading`,
/// or touched within `policy.pin_ttl_ms`. Returns the number evicted.
#[instrument(level = "debug", skip(state, workspace, protect))]
pub fn evict(
    state: &mut LocalState,
    workspace: &Path,
    policy: &Policy,
    required_free_bytes: u64,
    protect: &BTreeSet<String>,
    now_ms: u64,
) -> usize {
    if !policy.enabled {
        return 0;
    }

    let mut pinned = protect.clone();
    pinned.extend(state.downloading.iter().cloned());
    if policy.pin_ttl_ms > 0 {
        for (dep_id, entry) in &state.lru {
            if now_ms.saturating_sub(entry.last_touched_at_ms) <= policy.pin_ttl_ms {
                pinned.insert(dep_id.clone());
            }
        }
    }

    let mut candidates: Vec<(u64, String)> = state
        .lru
        .iter()
        .filter(|(dep_id, _)| !pinned.contains(*dep_id))
        .map(|(dep_id, entry)| (entry.last_touched_at_ms, dep_id.clone()))
        .collect();
    candidates.sort();

    let mut evicted = 0u32;
    for (_, dep_id) in candidates {
        if evicted >= policy.eviction_batch_max {
            break;
        }

        let constraints_satisfied = match disk_stats(workspace) {
            Ok(stats) => {
                let free_ok = stats.free_bytes >= required_free_bytes;
                let cap_ok = policy.max_dynamic_bytes == 0
                    || state.dynamic_bytes_used() <= policy.max_dynamic_bytes;
                free_ok && cap_ok
            }
            Err(err) => {
                warn!(error = %err, "failed to query disk stats during eviction, continuing");
                false
            }
        };
        if constraints_satisfied {
            break;
        }

        if let Some(entry) = state.lru.remove(&dep_id) {
            if let Ok(full_path) = safe_join(workspace, &entry.dest_relative_path) {
                let _ = std::fs::remove_file(&full_path);
            }
            state.installed_dynamic.remove(&dep_id);
            state.failed.remove(&dep_id);
            evicted += 1;
            info!(dep_id, bytes = entry.size_bytes, "evicted dynamic artifact");
        }
    }

    evicted as usize
}

/// Reserves enough free space for an incoming download of `expected_size`
/// bytes by reconciling and, if eviction is enabled, evicting until
/// `policy.min_free_bytes + expected_size` is free. Fails retryably if the
/// floor still isn't met afterward.
#[instrument(level = "debug", skip(state, workspace, policy))]
pub fn ensure_space(
    state: &mut LocalState,
    workspace: &Path,
    policy: &Policy,
    expected_size: u64,
    dep_id: &str,
    now_ms: u64,
) -> Result<usize, CacheError> {
    if !policy.enabled {
        return Ok(0);
    }

    let required = policy.min_free_bytes.saturating_add(expected_size);

    reconcile(state, workspace);
    let mut protect = BTreeSet::new();
    protect.insert(dep_id.to_string());
    let evicted = evict(state, workspace, policy, required, &protect, now_ms);

    let stats = disk_stats(workspace).map_err(CacheError::Disk)?;
    if stats.free_bytes < required {
        return Err(CacheError::InsufficientSpace {
            required,
            free: stats.free_bytes,
        });
    }

    Ok(evicted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_file(dir: &Path, rel: &str, bytes: usize) {
        let full = dir.join(rel);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn reconcile_drops_entries_with_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = LocalState::default();
        state.installed_dynamic.insert("d1".into());
        state.lru.insert(
            "d1".into(),
            LruEntry {
                dest_relative_path: "models/d1".into(),
                size_bytes: 10,
                last_touched_at_ms: 1,
            },
        );

        let changed = reconcile(&mut state, dir.path());
        assert!(changed);
        assert!(!state.lru.contains_key("d1"));
        assert!(!state.installed_dynamic.contains("d1"));
    }

    #[test]
    fn reconcile_refreshes_size_for_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "models/d1", 42);
        let mut state = LocalState::default();
        state.lru.insert(
            "d1".into(),
            LruEntry {
                dest_relative_path: "models/d1".into(),
                size_bytes: 10,
                last_touched_at_ms: 1,
            },
        );

        let changed = reconcile(&mut state, dir.path());
        assert!(changed);
        assert_eq!(state.lru["d1"].size_bytes, 42);
    }

    #[test]
    fn touch_refuses_to_create_entry_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = LocalState::default();
        let changed = touch(&mut state, dir.path(), "d1", Some("models/missing"), 100);
        assert!(!changed);
        assert!(!state.lru.contains_key("d1"));
        assert!(!state.installed_dynamic.contains("d1"));
    }

    #[test]
    fn touch_adopts_existing_untracked_file() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "models/d1", 10);
        let mut state = LocalState::default();
        let changed = touch(&mut state, dir.path(), "d1", Some("models/d1"), 100);
        assert!(changed);
        assert_eq!(state.lru["d1"].size_bytes, 10);
        assert!(state.installed_dynamic.contains("d1"));
    }

    #[test]
    fn touch_promotes_static_to_dynamic() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "models/d1", 10);
        let mut state = LocalState::default();
        state.installed_static.insert("d1".into());
        touch(&mut state, dir.path(), "d1", Some("models/d1"), 100);
        assert!(!state.installed_static.contains("d1"));
        assert!(state.installed_dynamic.contains("d1"));
    }

    #[test]
    fn touch_on_missing_file_for_preexisting_entry_only_bumps_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = LocalState::default();
        state.lru.insert(
            "d1".into(),
            LruEntry {
                dest_relative_path: "models/gone".into(),
                size_bytes: 99,
                last_touched_at_ms: 1,
            },
        );
        let changed = touch(&mut state, dir.path(), "d1", None, 500);
        assert!(changed);
        assert_eq!(state.lru["d1"].last_touched_at_ms, 500);
        assert_eq!(state.lru["d1"].size_bytes, 99);
    }

    #[test]
    fn touch_twice_is_idempotent_except_for_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "models/d1", 10);
        let mut state = LocalState::default();
        touch(&mut state, dir.path(), "d1", Some("models/d1"), 100);
        let first = state.lru["d1"].clone();
        touch(&mut state, dir.path(), "d1", None, 200);
        let second = state.lru["d1"].clone();
        assert_eq!(first.size_bytes, second.size_bytes);
        assert_eq!(first.dest_relative_path, second.dest_relative_path);
        assert!(second.last_touched_at_ms >= first.last_touched_at_ms);
    }

    fn policy_enabled() -> Policy {
        Policy {
            enabled: true,
            min_free_bytes: 0,
            max_dynamic_bytes: 0,
            eviction_batch_max: 20,
            pin_ttl_ms: 1_800_000,
        }
    }

    #[test]
    fn eviction_picks_oldest_touched_first() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "models/old", 4);
        write_file(dir.path(), "models/mid", 4);
        write_file(dir.path(), "models/new", 4);

        let mut state = LocalState::default();
        for (dep_id, rel, ts) in
            [("old", "models/old", 100), ("mid", "models/mid", 200), ("new", "models/new", 300)]
        {
            state.installed_dynamic.insert(dep_id.into());
            state.lru.insert(
                dep_id.into(),
                LruEntry {
                    dest_relative_path: rel.into(),
                    size_bytes: 4,
                    last_touched_at_ms: ts,
                },
            );
        }

        let policy = Policy {
            eviction_batch_max: 1,
            ..policy_enabled()
        };
        let evicted = evict(&mut state, dir.path(), &policy, u64::MAX, &BTreeSet::new(), 1_000_000);
        assert_eq!(evicted, 1);
        assert!(!state.lru.contains_key("old"));
        assert!(state.lru.contains_key("mid"));
        assert!(state.lru.contains_key("new"));
    }

    #[test]
    fn pin_ttl_protects_recently_touched_artifact() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "models/recent", 4);
        write_file(dir.path(), "models/old", 4);

        let mut state = LocalState::default();
        let now_ms = 2_000_000u64;
        state.lru.insert(
            "recent".into(),
            LruEntry {
                dest_relative_path: "models/recent".into(),
                size_bytes: 4,
                last_touched_at_ms: now_ms - 60_000,
            },
        );
        state.lru.insert(
            "old".into(),
            LruEntry {
                dest_relative_path: "models/old".into(),
                size_bytes: 4,
                last_touched_at_ms: 100,
            },
        );

        let policy = policy_enabled();
        evict(&mut state, dir.path(), &policy, u64::MAX, &BTreeSet::new(), now_ms);
        assert!(state.lru.contains_key("recent"));
        assert!(!state.lru.contains_key("old"));
    }

    #[test]
    fn protected_dep_id_is_never_evicted() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "models/d1", 4);
        let mut state = LocalState::default();
        state.lru.insert(
            "d1".into(),
            LruEntry {
                dest_relative_path: "models/d1".into(),
                size_bytes: 4,
                last_touched_at_ms: 1,
            },
        );
        let mut protect = BTreeSet::new();
        protect.insert("d1".to_string());

        let policy = policy_enabled();
        let evicted = evict(&mut state, dir.path(), &policy, u64::MAX, &protect, 9999);
        assert_eq!(evicted, 0);
        assert!(state.lru.contains_key("d1"));
    }

    #[test]
    fn disabled_policy_never_evicts() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "models/d1", 4);
        let mut state = LocalState::default();
        state.lru.insert(
            "d1".into(),
            LruEntry {
                dest_relative_path: "models/d1".into(),
                size_bytes: 4,
                last_touched_at_ms: 1,
            },
        );
        let policy = Policy::default();
        let evicted = evict(&mut state, dir.path(), &policy, u64::MAX, &BTreeSet::new(), 9999);
        assert_eq!(evicted, 0);
    }
}
