//! Environment-derived configuration. Parsing a malformed optional value
//! never aborts startup — it silently falls back to the documented default;
//! only a genuinely missing required variable fails configuration.

use std::time::Duration;

use thiserror::Error;

use crate::cache::Policy;
use crate::control::DynamicPolicyProfile;
use crate::download::constants::{
    DEFAULT_CHUNK_MIB, DEFAULT_DOWNLOAD_TIMEOUT_SECS, DEFAULT_PARALLEL_DOWNLOADS, MAX_CHUNK_MIB,
    MAX_DOWNLOAD_TIMEOUT_SECS, MAX_PARALLEL_DOWNLOADS, MIN_CHUNK_MIB,
    MIN_DOWNLOAD_TIMEOUT_SECS, MIN_PARALLEL_DOWNLOADS,
};
use crate::util::parse_bytes;

/// A required environment variable was not set.
#[derive(Debug, Error)]
#[error("missing required environment variable: {0}")]
pub struct ConfigError(pub &'static str);

/// Env-driven overrides for the dynamic eviction policy. Kept separate from
/// [`Policy`] because these must be merged against the server-provided
/// profile (env wins) on every policy evaluation, not baked in once.
#[derive(Debug, Clone, Default)]
pub struct PolicyEnvOverrides {
    pub enabled: Option<bool>,
    pub min_free_bytes: Option<u64>,
    pub max_dynamic_bytes: Option<u64>,
    pub eviction_batch_max: Option<u32>,
    pub pin_ttl_ms: Option<u64>,
}

/// Fully resolved agent configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: String,
    pub server_type: String,
    pub shared_secret: Option<String>,
    pub hf_token: Option<String>,
    pub civitai_token: Option<String>,
    pub instance_id: Option<String>,
    pub instance_ip: Option<String>,
    pub workspace: String,
    pub comfyui_dir: String,
    pub state_path: String,
    pub poll_seconds: u64,
    pub heartbeat_seconds: u64,
    pub max_parallel_downloads: u32,
    pub allowed_domains: Vec<String>,
    pub download_timeout: Duration,
    pub download_chunk_bytes: usize,
    pub verbose_progress: bool,
    pub policy_overrides: PolicyEnvOverrides,
}

impl Config {
    /// Reads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `FCS_API_BASE_URL` or `SERVER_TYPE` is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_base_url =
            env_str("FCS_API_BASE_URL").ok_or(ConfigError("FCS_API_BASE_URL"))?;
        let server_type = env_str("SERVER_TYPE").ok_or(ConfigError("SERVER_TYPE"))?;

        let workspace = env_str("WORKSPACE").unwrap_or_else(|| "/workspace".to_string());
        let comfyui_dir = env_str("DM_COMFYUI_DIR")
            .unwrap_or_else(|| format!("{workspace}/ComfyUI"));
        let state_path = env_str("DM_STATE_PATH")
            .unwrap_or_else(|| format!("{workspace}/dependency_agent_state.json"));

        let allowed_domains = env_str("DM_ALLOWED_DOMAINS")
            .map(|raw| split_csv(&raw))
            .filter(|domains| !domains.is_empty())
            .unwrap_or_else(|| {
                vec!["huggingface.co".into(), "hf.co".into(), "civitai.com".into()]
            });

        let download_timeout_secs = env_u64("DM_DOWNLOAD_TIMEOUT_SECONDS")
            .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECS)
            .clamp(MIN_DOWNLOAD_TIMEOUT_SECS, MAX_DOWNLOAD_TIMEOUT_SECS);

        let chunk_mib = env_u64("DM_DOWNLOAD_CHUNK_MIB")
            .unwrap_or(DEFAULT_CHUNK_MIB)
            .clamp(MIN_CHUNK_MIB, MAX_CHUNK_MIB);

        let max_parallel_downloads = env_u32("MAX_PARALLEL_DOWNLOADS")
            .unwrap_or(DEFAULT_PARALLEL_DOWNLOADS)
            .clamp(MIN_PARALLEL_DOWNLOADS, MAX_PARALLEL_DOWNLOADS);

        Ok(Self {
            api_base_url,
            server_type,
            shared_secret: env_str("DEPENDENCY_MANAGER_SHARED_SECRET"),
            hf_token: env_str("HF_TOKEN"),
            civitai_token: env_str("CIVITAI_TOKEN"),
            instance_id: env_str("DM_INSTANCE_ID"),
            instance_ip: env_str("DM_INSTANCE_IP"),
            workspace,
            comfyui_dir,
            state_path,
            poll_seconds: env_u64("DM_POLL_SECONDS").unwrap_or(5),
            heartbeat_seconds: env_u64("DM_HEARTBEAT_SECONDS").unwrap_or(30),
            max_parallel_downloads,
            allowed_domains,
            download_timeout: Duration::from_secs(download_timeout_secs),
            download_chunk_bytes: (chunk_mib * 1024 * 1024) as usize,
            verbose_progress: env_bool("DM_VERBOSE_PROGRESS").unwrap_or(false),
            policy_overrides: PolicyEnvOverrides {
                enabled: env_bool("DM_DYNAMIC_EVICTION_ENABLED"),
                min_free_bytes: env_str("DM_DYNAMIC_MIN_FREE_BYTES").and_then(|v| parse_bytes(&v)),
                max_dynamic_bytes: env_str("DM_DYNAMIC_MAX_BYTES").and_then(|v| parse_bytes(&v)),
                eviction_batch_max: env_u32("DM_EVICTION_BATCH_MAX"),
                pin_ttl_ms: env_u64("DM_PIN_TTL_SECONDS").map(|secs| secs * 1000),
            },
        })
    }

    /// Resolves the bearer token to use for an artifact's `auth` kind.
    #[must_use]
    pub fn auth_token(&self, kind: crate::state::AuthKind) -> Option<&str> {
        match kind {
            crate::state::AuthKind::None => None,
            crate::state::AuthKind::HfToken => self.hf_token.as_deref(),
            crate::state::AuthKind::CivitaiToken => self.civitai_token.as_deref(),
        }
    }
}

/// Merges the env-derived policy overrides on top of the server-supplied
/// profile (env always wins), applying the same defaulting rules as the
/// reference implementation: a conservative 5 GiB floor when eviction is
/// enabled but no floor was ever configured, and a 20-default batch size.
#[must_use]
pub fn merge_policy(
    overrides: &PolicyEnvOverrides,
    profile: Option<&DynamicPolicyProfile>,
) -> Policy {
    let enabled = overrides
        .enabled
        .unwrap_or_else(|| profile.and_then(|p| p.enabled).unwrap_or(false));

    let mut min_free_bytes = overrides
        .min_free_bytes
        .or_else(|| profile.and_then(|p| p.min_free_bytes))
        .unwrap_or(0);
    if enabled && min_free_bytes == 0 {
        min_free_bytes = 5 * 1024 * 1024 * 1024;
    }

    let max_dynamic_bytes = overrides
        .max_dynamic_bytes
        .or_else(|| profile.and_then(|p| p.max_dynamic_bytes))
        .unwrap_or(0);

    let eviction_batch_max = overrides
        .eviction_batch_max
        .or_else(|| profile.and_then(|p| p.eviction_batch_max))
        .unwrap_or(20)
        .max(1);

    let pin_ttl_ms = overrides
        .pin_ttl_ms
        .or_else(|| profile.and_then(|p| p.pin_ttl_ms))
        .unwrap_or(1_800_000);

    Policy {
        enabled,
        min_free_bytes,
        max_dynamic_bytes,
        eviction_batch_max,
        pin_ttl_ms,
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env_str(name).and_then(|v| v.parse().ok())
}

fn env_u32(name: &str) -> Option<u32> {
    env_str(name).and_then(|v| v.parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    env_str(name).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"))
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
