//! Error types for the artifact download pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while downloading a single artifact to disk.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The resolved host is not present in the configured allowlist.
    #[error("host {host} for {url} is not in the allowed domain list")]
    DisallowedDomain { url: String, host: String },

    /// The URL could not be parsed at all.
    #[error("invalid download URL: {url}")]
    InvalidUrl { url: String },

    /// `auth` named a kind the agent does not know how to resolve.
    #[error("unsupported auth kind: {kind}")]
    UnsupportedAuth { kind: String },

    /// `auth` required an environment token that was not set.
    #[error("missing auth token for auth kind {kind} (expected env var {env_var})")]
    MissingAuthToken { kind: String, env_var: String },

    /// Underlying transport failure (DNS, connect, TLS, reset).
    #[error("network error downloading {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The socket read timed out.
    #[error("timed out downloading {url}")]
    Timeout { url: String },

    /// Server responded with a non-success status outside the resume state machine.
    #[error("server returned HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    /// Resume was attempted but the server's `Content-Range` did not match our offset.
    #[error(
        "resume mismatch for {url}: requested offset {requested_offset}, server range starts at {server_start}"
    )]
    RangeMismatch {
        url: String,
        requested_offset: u64,
        server_start: u64,
    },

    /// A 416 (Range Not Satisfiable) arrived and the local partial was not already complete.
    #[error("range not satisfiable for {url}: local size {local_size}, total {total}")]
    RangeNotSatisfiable {
        url: String,
        local_size: u64,
        total: u64,
    },

    /// Final file size did not match the expected/announced total.
    #[error("incomplete download for {path}: expected {expected_bytes} bytes, got {actual_bytes}")]
    Incomplete {
        path: PathBuf,
        expected_bytes: u64,
        actual_bytes: u64,
    },

    /// SHA-256 digest of the completed file did not match the expected value.
    #[error("sha256 mismatch for {path}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Filesystem error while creating directories, opening, or renaming files.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The destination path failed the traversal check.
    #[error("invalid destination path: {0}")]
    Path(#[from] crate::util::PathError),
}

impl DownloadError {
    /// Errors that are the result of fixed configuration/policy, not of transient
    /// network or server conditions. These must never be scheduled for retry.
    #[must_use]
    pub fn is_non_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::DisallowedDomain { .. }
                | DownloadError::InvalidUrl { .. }
                | DownloadError::UnsupportedAuth { .. }
                | DownloadError::MissingAuthToken { .. }
                | DownloadError::Path(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disallowed_domain_is_non_retryable() {
        let err = DownloadError::DisallowedDomain {
            url: "https://evil.example.com/x".into(),
            host: "evil.example.com".into(),
        };
        assert!(err.is_non_retryable());
    }

    #[test]
    fn integrity_mismatch_is_retryable() {
        let err = DownloadError::IntegrityMismatch {
            path: PathBuf::from("/tmp/x"),
            expected: "abc".into(),
            actual: "zzz".into(),
        };
        assert!(!err.is_non_retryable());
    }

    #[test]
    fn display_includes_host_for_disallowed_domain() {
        let err = DownloadError::DisallowedDomain {
            url: "https://evil.example.com/x".into(),
            host: "evil.example.com".into(),
        };
        assert!(err.to_string().contains("evil.example.com"));
    }
}
