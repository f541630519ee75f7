//! Data model for the agent's persistent inventory: installed artifact sets,
//! the LRU index for dynamic artifacts, and the retry schedule.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Kind tag controlling evictability. Static artifacts are pinned forever;
/// dynamic artifacts participate in the LRU index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Static,
    Dynamic,
}

/// How to authenticate against the artifact's origin server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    None,
    HfToken,
    CivitaiToken,
}

/// Dynamic-index value: where a dynamic artifact lives, how big it is, and
/// when it was last touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LruEntry {
    pub dest_relative_path: String,
    pub size_bytes: u64,
    pub last_touched_at_ms: u64,
}

/// Retry-table record for one dep-id's recoverable failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryEntry {
    pub item_id: String,
    pub resolved: ResolvedInfo,
    pub attempts: u32,
    pub next_attempt_at_ms: u64,
    pub last_error: String,
    pub last_attempt_at_ms: u64,
}

/// The dispatch instruction carried by a queue item, and reused verbatim
/// when a retry-table entry is replayed without revisiting the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedInfo {
    pub url: Option<String>,
    pub auth: Option<AuthKind>,
    pub dest_relative_path: Option<String>,
    pub sha256: Option<String>,
    pub expected_size_bytes: Option<u64>,
    pub kind: Option<ArtifactKind>,
}

/// The operation a queue item asks the executor to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOp {
    Download,
    Touch,
}

/// One unit of work fetched from the control plane, or synthesized from a
/// due retry-table entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub item_id: String,
    pub dep_id: String,
    pub op: QueueOp,
    pub resolved: ResolvedInfo,
}

/// The full set of mutable, mutex-guarded agent state: everything in
/// `dynamicBytesUsed`'s derivation, plus the transient `downloading` set.
///
/// `downloading` is intentionally excluded from [`Snapshot`] — it is
/// in-memory only and always empty immediately after a restart.
#[derive(Debug, Default)]
pub struct LocalState {
    pub installed_static: BTreeSet<String>,
    pub installed_dynamic: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub downloading: BTreeSet<String>,
    pub lru: BTreeMap<String, LruEntry>,
    pub retry: BTreeMap<String, RetryEntry>,
}

impl LocalState {
    /// Sum of `size_bytes` across the LRU index. Recomputed rather than
    /// cached so it can never drift from the index it summarizes.
    #[must_use]
    pub fn dynamic_bytes_used(&self) -> u64 {
        self.lru.values().map(|entry| entry.size_bytes).sum()
    }

    /// Builds the sorted, canonical on-disk snapshot of this state.
    #[must_use]
    pub fn to_snapshot(&self, now_ms: u64) -> Snapshot {
        Snapshot {
            installed_static: self.installed_static.iter().cloned().collect(),
            installed_dynamic: self.installed_dynamic.iter().cloned().collect(),
            failed: self.failed.iter().cloned().collect(),
            lru: self.lru.clone(),
            retry: self.retry.clone(),
            updated_at_ms: now_ms,
        }
    }

    /// Replaces this state's persisted fields with a freshly loaded snapshot.
    /// `downloading` is left untouched since it has no on-disk counterpart.
    pub fn load_snapshot(&mut self, snapshot: Snapshot) {
        self.installed_static = snapshot.installed_static.into_iter().collect();
        self.installed_dynamic = snapshot.installed_dynamic.into_iter().collect();
        self.failed = snapshot.failed.into_iter().collect();
        self.lru = snapshot.lru;
        self.retry = snapshot.retry;
    }
}

/// The on-disk JSON document. Arrays are `Vec` (not `BTreeSet`) purely so
/// serde emits a JSON array rather than an object; callers always populate
/// them pre-sorted for byte-stable round-trips.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub installed_static: Vec<String>,
    pub installed_dynamic: Vec<String>,
    pub failed: Vec<String>,
    pub lru: BTreeMap<String, LruEntry>,
    pub retry: BTreeMap<String, RetryEntry>,
    #[serde(rename = "updatedAtMs")]
    pub updated_at_ms: u64,
}
