//! Task executor: processes a single queue item end to end (download or
//! touch), updating inventory state and reporting status back to the
//! control plane.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::cache::{self, CacheError, Policy};
use crate::config::Config;
use crate::control::{ControlClient, ItemState, StatusReport};
use crate::download::{DownloadError, HttpClient};
use crate::retry::{backoff_delay, truncate_error};
use crate::state::{self, ArtifactKind, LocalState, QueueItem, QueueOp, ResolvedInfo, RetryEntry};
use crate::util::{PathError, disk_stats, safe_join};

/// Errors the executor can raise while processing one item. Every variant's
/// retryability is decided by [`ExecutorError::is_retryable`], not by the
/// variant name alone — it defers to the wrapped error where one exists.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("missing resolved info for {field}")]
    MissingResolvedInfo { field: &'static str },

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sha256 mismatch for {path}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl ExecutorError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutorError::MissingResolvedInfo { .. } | ExecutorError::Path(_) => false,
            ExecutorError::Download(err) => !err.is_non_retryable(),
            ExecutorError::Cache(_) => true,
            ExecutorError::Io { .. } => true,
            ExecutorError::IntegrityMismatch { .. } => true,
        }
    }
}

/// Executes queue items against a shared [`LocalState`], dispatching
/// downloads through [`HttpClient`] and reporting outcomes through
/// [`ControlClient`]. Cheap to clone: every field is an `Arc` or owned
/// string, so the control loop hands one clone to each spawned worker task.
#[derive(Clone)]
pub struct Executor {
    state: Arc<Mutex<LocalState>>,
    config: Arc<Config>,
    http: Arc<HttpClient>,
    control: Arc<ControlClient>,
    instance_id: String,
    agent_token: String,
    last_heartbeat_ms: Arc<AtomicU64>,
}

impl Executor {
    #[must_use]
    pub fn new(
        state: Arc<Mutex<LocalState>>,
        config: Arc<Config>,
        http: Arc<HttpClient>,
        control: Arc<ControlClient>,
        instance_id: String,
        agent_token: String,
        last_heartbeat_ms: Arc<AtomicU64>,
    ) -> Self {
        Self {
            state,
            config,
            http,
            control,
            instance_id,
            agent_token,
            last_heartbeat_ms,
        }
    }

    /// Processes a single queue item to completion, posting every state
    /// transition (`running` -> `succeeded`/`failed`/`retrying`) along the
    /// way. Never returns `Err` for a failure surfaced to the caller — the
    /// queue item's own failure is reported to the control plane, not
    /// propagated, matching the "a worker failure never kills the
    /// controller" contract.
    #[instrument(level = "info", skip(self, item), fields(item_id = %item.item_id, dep_id = %item.dep_id))]
    pub async fn process(&self, item: &QueueItem, policy: &Policy) {
        match item.op {
            QueueOp::Download => self.process_download(item, policy).await,
            QueueOp::Touch => self.process_touch(item).await,
        }
    }

    async fn process_download(&self, item: &QueueItem, policy: &Policy) {
        let dep_id = &item.dep_id;

        if let Some(wait) = self.backoff_remaining(dep_id).await {
            let message = format!(
                "backing off for {}s: {}",
                wait.remaining_secs, wait.last_error
            );
            self.post_status(item, ItemState::Retrying, Some(&message)).await;
            return;
        }

        {
            let mut state = self.state.lock().await;
            state.downloading.insert(dep_id.clone());
        }
        self.post_status(item, ItemState::Running, None).await;

        match self.download_one(item, policy).await {
            Ok(()) => {
                self.post_status(item, ItemState::Succeeded, None).await;
                self.maybe_heartbeat().await;
            }
            Err(err) => {
                let message = truncate_error(&err.to_string());
                if err.is_retryable() {
                    self.schedule_retry(item, &message).await;
                    self.post_status(item, ItemState::Retrying, Some(&message)).await;
                } else {
                    self.mark_failed(dep_id).await;
                    self.post_status(item, ItemState::Failed, Some(&message)).await;
                }
            }
        }
    }

    async fn download_one(&self, item: &QueueItem, policy: &Policy) -> Result<(), ExecutorError> {
        let resolved = &item.resolved;
        let dep_id = &item.dep_id;

        let url = resolved
            .url
            .as_deref()
            .ok_or(ExecutorError::MissingResolvedInfo { field: "url" })?;
        let dest_rel = resolved
            .dest_relative_path
            .as_deref()
            .ok_or(ExecutorError::MissingResolvedInfo { field: "destRelativePath" })?;
        let kind = resolved.kind.unwrap_or(ArtifactKind::Dynamic);
        let auth_header = self.resolve_auth_header(resolved)?;

        let destination = safe_join(Path::new(&self.config.comfyui_dir), dest_rel)?;
        let partial_path = partial_sibling(&destination);

        if tokio::fs::metadata(&destination).await.is_ok() {
            let digest_ok = match &resolved.sha256 {
                Some(expected) => sha256_file(&destination).await? == expected.to_ascii_lowercase(),
                None => true,
            };
            if digest_ok {
                self.record_success(dep_id, dest_rel, kind).await?;
                return Ok(());
            }
            warn!(dep_id, "existing file failed digest check, re-downloading");
        }

        let expected_size = resolved.expected_size_bytes.unwrap_or(0);
        let evicted = {
            let mut state = self.state.lock().await;
            cache::ensure_space(
                &mut state,
                Path::new(&self.config.comfyui_dir),
                policy,
                expected_size,
                dep_id,
                now_ms(),
            )?
        };
        if evicted > 0 {
            self.maybe_heartbeat().await;
        }

        self.http
            .download_to(
                url,
                &partial_path,
                auth_header.as_deref(),
                resolved.expected_size_bytes,
            )
            .await?;

        if let Some(expected) = &resolved.sha256 {
            let actual = sha256_file(&partial_path).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = tokio::fs::remove_file(&partial_path).await;
                return Err(ExecutorError::IntegrityMismatch {
                    path: destination,
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        tokio::fs::rename(&partial_path, &destination)
            .await
            .map_err(|source| ExecutorError::Io {
                path: destination.clone(),
                source,
            })?;

        self.record_success(dep_id, dest_rel, kind).await?;

        {
            let mut state = self.state.lock().await;
            let protect: std::collections::BTreeSet<String> =
                std::iter::once(dep_id.clone()).collect();
            cache::evict(
                &mut state,
                Path::new(&self.config.comfyui_dir),
                policy,
                policy.min_free_bytes,
                &protect,
                now_ms(),
            );
        }

        Ok(())
    }

    async fn record_success(
        &self,
        dep_id: &str,
        dest_rel: &str,
        kind: ArtifactKind,
    ) -> Result<(), ExecutorError> {
        let mut state = self.state.lock().await;
        match kind {
            ArtifactKind::Dynamic => {
                cache::touch(
                    &mut state,
                    Path::new(&self.config.comfyui_dir),
                    dep_id,
                    Some(dest_rel),
                    now_ms(),
                );
            }
            ArtifactKind::Static => {
                state.installed_static.insert(dep_id.to_string());
                state.installed_dynamic.remove(dep_id);
                state.lru.remove(dep_id);
            }
        }
        state.failed.remove(dep_id);
        state.retry.remove(dep_id);
        state.downloading.remove(dep_id);
        let now = now_ms();
        state::save(Path::new(&self.config.state_path), &state, now)
            .await
            .map_err(|source| ExecutorError::Io {
                path: PathBuf::from(&self.config.state_path),
                source: std::io::Error::other(source.to_string()),
            })
    }

    async fn process_touch(&self, item: &QueueItem) {
        self.post_status(item, ItemState::Running, None).await;

        let dest_rel = item.resolved.dest_relative_path.as_deref();
        {
            let mut state = self.state.lock().await;
            cache::touch(
                &mut state,
                Path::new(&self.config.comfyui_dir),
                &item.dep_id,
                dest_rel,
                now_ms(),
            );
            if let Err(err) = state::save(Path::new(&self.config.state_path), &state, now_ms()).await {
                warn!(error = %err, "failed to persist state after touch");
            }
        }

        self.post_status(item, ItemState::Succeeded, None).await;
    }

    fn resolve_auth_header(&self, resolved: &ResolvedInfo) -> Result<Option<String>, ExecutorError> {
        let Some(auth) = resolved.auth else {
            return Ok(None);
        };
        if matches!(auth, state::AuthKind::None) {
            return Ok(None);
        }
        let token = self.config.auth_token(auth).ok_or_else(|| {
            ExecutorError::Download(DownloadError::MissingAuthToken {
                kind: format!("{auth:?}"),
                env_var: match auth {
                    state::AuthKind::HfToken => "HF_TOKEN",
                    state::AuthKind::CivitaiToken => "CIVITAI_TOKEN",
                    state::AuthKind::None => "",
                }
                .to_string(),
            })
        })?;
        Ok(Some(format!("Bearer {token}")))
    }

    async fn backoff_remaining(&self, dep_id: &str) -> Option<BackoffWait> {
        let state = self.state.lock().await;
        let entry = state.retry.get(dep_id)?;
        let now = now_ms();
        if entry.next_attempt_at_ms <= now {
            return None;
        }
        Some(BackoffWait {
            remaining_secs: (entry.next_attempt_at_ms - now) / 1000,
            last_error: entry.last_error.clone(),
        })
    }

    async fn schedule_retry(&self, item: &QueueItem, message: &str) {
        let mut state = self.state.lock().await;
        let attempts = state
            .retry
            .get(&item.dep_id)
            .map_or(1, |entry| entry.attempts + 1);
        let now = now_ms();
        let delay = backoff_delay(attempts, message);
        state.retry.insert(
            item.dep_id.clone(),
            RetryEntry {
                item_id: item.item_id.clone(),
                resolved: item.resolved.clone(),
                attempts,
                next_attempt_at_ms: now + delay.as_millis() as u64,
                last_error: message.to_string(),
                last_attempt_at_ms: now,
            },
        );
        state.failed.insert(item.dep_id.clone());
        state.downloading.remove(&item.dep_id);
        if let Err(err) = state::save(Path::new(&self.config.state_path), &state, now).await {
            warn!(error = %err, "failed to persist state after scheduling retry");
        }
    }

    async fn mark_failed(&self, dep_id: &str) {
        let mut state = self.state.lock().await;
        state.failed.insert(dep_id.to_string());
        state.downloading.remove(dep_id);
        let now = now_ms();
        if let Err(err) = state::save(Path::new(&self.config.state_path), &state, now).await {
            warn!(error = %err, "failed to persist state after marking failed");
        }
    }

    async fn post_status(&self, item: &QueueItem, item_state: ItemState, error: Option<&str>) {
        let (disk, dynamic_bytes_used) = self.snapshot_for_report().await;
        let op = match item.op {
            QueueOp::Download => "download",
            QueueOp::Touch => "touch",
        };
        let report = StatusReport {
            instance_id: &self.instance_id,
            item_id: &item.item_id,
            dep_id: &item.dep_id,
            op,
            state: item_state,
            disk_stats: disk,
            dynamic_bytes_used,
            error,
        };
        if let Err(err) = self.control.post_status(&self.agent_token, &report).await {
            warn!(error = %err, "failed to post item status");
        }
    }

    async fn snapshot_for_report(&self) -> (crate::util::DiskStats, u64) {
        let state = self.state.lock().await;
        let disk = disk_stats(Path::new(&self.config.comfyui_dir)).unwrap_or(crate::util::DiskStats {
            total_bytes: 0,
            free_bytes: 0,
            used_bytes: 0,
        });
        (disk, state.dynamic_bytes_used())
    }

    async fn maybe_heartbeat(&self) {
        let now = now_ms();
        let last = self.last_heartbeat_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < 2_000 {
            return;
        }
        if self
            .last_heartbeat_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let state = self.state.lock().await;
        let installed_static: Vec<String> = state.installed_static.iter().cloned().collect();
        let installed_dynamic: Vec<String> = state.installed_dynamic.iter().cloned().collect();
        let downloading: Vec<String> = state.downloading.iter().cloned().collect();
        let failed: Vec<String> = state.failed.iter().cloned().collect();
        let dynamic_bytes_used = state.dynamic_bytes_used();
        drop(state);

        let disk = disk_stats(Path::new(&self.config.comfyui_dir)).unwrap_or(crate::util::DiskStats {
            total_bytes: 0,
            free_bytes: 0,
            used_bytes: 0,
        });
        let report = crate::control::HeartbeatReport {
            instance_id: &self.instance_id,
            installed_static_dep_ids: &installed_static,
            installed_dynamic_dep_ids: &installed_dynamic,
            downloading_dep_ids: &downloading,
            failed_dep_ids: &failed,
            disk_stats: disk,
            dynamic_bytes_used,
            queue_depth: None,
        };
        if let Err(err) = self.control.post_heartbeat(&self.agent_token, &report).await {
            warn!(error = %err, "opportunistic heartbeat failed");
        }
        info!("opportunistic heartbeat sent");
    }
}

struct BackoffWait {
    remaining_secs: u64,
    last_error: String,
}

fn partial_sibling(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    destination.with_file_name(name)
}

async fn sha256_file(path: &Path) -> Result<String, ExecutorError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|source| ExecutorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await.map_err(|source| ExecutorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_sibling_appends_suffix_to_filename() {
        let dest = PathBuf::from("/workspace/ComfyUI/models/x.safetensors");
        let partial = partial_sibling(&dest);
        assert_eq!(
            partial,
            PathBuf::from("/workspace/ComfyUI/models/x.safetensors.partial")
        );
    }

    #[tokio::test]
    async fn sha256_file_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();
        let digest = sha256_file(&path).await.unwrap();
        // sha256("hello world")
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
