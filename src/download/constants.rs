//! Tunable constants and clamp ranges for the download pipeline.

use std::time::Duration;

/// HTTP connect timeout, independent of the configurable socket read timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum/maximum accepted value for `DM_DOWNLOAD_TIMEOUT_SECONDS`.
pub const MIN_DOWNLOAD_TIMEOUT_SECS: u64 = 30;
pub const MAX_DOWNLOAD_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

/// Minimum/maximum accepted value for `DM_DOWNLOAD_CHUNK_MIB`.
pub const MIN_CHUNK_MIB: u64 = 1;
pub const MAX_CHUNK_MIB: u64 = 32;
pub const DEFAULT_CHUNK_MIB: u64 = 1;

/// Minimum/maximum accepted value for `MAX_PARALLEL_DOWNLOADS`.
pub const MIN_PARALLEL_DOWNLOADS: u32 = 1;
pub const MAX_PARALLEL_DOWNLOADS: u32 = 4;
pub const DEFAULT_PARALLEL_DOWNLOADS: u32 = 1;

/// Agent identity string sent to the control plane at registration.
#[must_use]
pub fn agent_version() -> String {
    format!("dm-agent-rs/{}", env!("CARGO_PKG_VERSION"))
}
