//! HTTP client for resumable, integrity-checked artifact downloads.
//!
//! [`HttpClient`] owns a single pooled [`reqwest::Client`] and implements the
//! `Range`/`206`/`416` resume state machine described for [`HttpClient::download_to`].
//! It never renames the finished file into place or checks its digest — that is
//! the caller's job, once it has decided the bytes are trustworthy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, ClientBuilder};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::constants::{CONNECT_TIMEOUT, agent_version};
use super::error::DownloadError;

/// Outcome of a completed (possibly resumed) download.
#[derive(Debug, Clone, Copy)]
pub struct DownloadOutcome {
    /// Total size of the `.partial` file after this call returns.
    pub bytes_total: u64,
    /// Whether this call resumed a pre-existing partial file.
    pub resumed: bool,
}

/// Resumable artifact download client, shared across the worker pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    allowed_domains: Vec<String>,
    chunk_bytes: usize,
}

impl HttpClient {
    /// Builds a client with the given socket timeout, chunk size, and domain
    /// allowlist. `chunk_bytes` only bounds how much we buffer per write; the
    /// underlying stream already arrives in whatever chunks the server sends.
    pub fn new(
        allowed_domains: Vec<String>,
        read_timeout: Duration,
        chunk_bytes: usize,
    ) -> Result<Self, reqwest::Error> {
        let client = build_client(read_timeout)?;
        Ok(Self {
            client,
            allowed_domains,
            chunk_bytes,
        })
    }

    /// Downloads `url` into `partial_path`, resuming from an existing partial
    /// file when possible, and verifying the final size against `expected_size`
    /// when it is known up front.
    ///
    /// Does not rename `partial_path` into its final destination and does not
    /// verify a digest — the executor does both once this returns `Ok`.
    #[instrument(level = "debug", skip(self, auth_header), fields(url = %url))]
    pub async fn download_to(
        &self,
        url: &str,
        partial_path: &Path,
        auth_header: Option<&str>,
        expected_size: Option<u64>,
    ) -> Result<DownloadOutcome, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::InvalidUrl { url: url.into() })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| DownloadError::InvalidUrl { url: url.into() })?;
        if !host_allowed(host, &self.allowed_domains) {
            return Err(DownloadError::DisallowedDomain {
                url: url.into(),
                host: host.to_string(),
            });
        }

        if let Some(parent) = partial_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| DownloadError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let result = self
            .download_to_inner(url, partial_path, auth_header, expected_size)
            .await;

        if let Err(err) = &result
            && err.is_non_retryable()
        {
            debug!(path = %partial_path.display(), "removing partial after non-retryable error");
            let _ = tokio::fs::remove_file(partial_path).await;
        }

        result
    }

    async fn download_to_inner(
        &self,
        url: &str,
        partial_path: &Path,
        auth_header: Option<&str>,
        expected_size: Option<u64>,
    ) -> Result<DownloadOutcome, DownloadError> {
        let existing_bytes = tokio::fs::metadata(partial_path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);

        if let Some(expected) = expected_size.filter(|&e| e > 0) {
            if existing_bytes == expected {
                debug!(bytes = existing_bytes, "partial already matches expected size");
                return Ok(DownloadOutcome {
                    bytes_total: existing_bytes,
                    resumed: true,
                });
            }
            if existing_bytes > expected {
                warn!(bytes = existing_bytes, expected, "partial exceeds expected size, restarting");
                tokio::fs::remove_file(partial_path)
                    .await
                    .map_err(|source| DownloadError::Io {
                        path: partial_path.to_path_buf(),
                        source,
                    })?;
                return self.fresh_download(url, partial_path, auth_header, expected_size).await;
            }
        }

        if existing_bytes == 0 {
            return self.fresh_download(url, partial_path, auth_header, expected_size).await;
        }

        self.resume_download(url, partial_path, auth_header, existing_bytes, expected_size)
            .await
    }

    async fn fresh_download(
        &self,
        url: &str,
        partial_path: &Path,
        auth_header: Option<&str>,
        expected_size: Option<u64>,
    ) -> Result<DownloadOutcome, DownloadError> {
        let response = self.send_get(url, auth_header, None).await?;

        let total = response
            .content_length()
            .or(expected_size.filter(|&e| e > 0));

        let mut file = File::create(partial_path)
            .await
            .map_err(|source| DownloadError::Io {
                path: partial_path.to_path_buf(),
                source,
            })?;

        let written = stream_into(&mut file, response, url, partial_path, self.chunk_bytes).await?;

        verify_total(partial_path, written, total)?;
        info!(bytes = written, "download complete");
        Ok(DownloadOutcome {
            bytes_total: written,
            resumed: false,
        })
    }

    async fn resume_download(
        &self,
        url: &str,
        partial_path: &Path,
        auth_header: Option<&str>,
        existing_bytes: u64,
        expected_size: Option<u64>,
    ) -> Result<DownloadOutcome, DownloadError> {
        let range = format!("bytes={existing_bytes}-");
        let response = self.send_get(url, auth_header, Some(&range)).await?;
        let status = response.status().as_u16();

        match status {
            206 => {
                let (range_start, total) = parse_content_range(&response)
                    .ok_or(DownloadError::RangeMismatch {
                        url: url.into(),
                        requested_offset: existing_bytes,
                        server_start: 0,
                    })?;
                if range_start != existing_bytes {
                    return Err(DownloadError::RangeMismatch {
                        url: url.into(),
                        requested_offset: existing_bytes,
                        server_start: range_start,
                    });
                }

                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(partial_path)
                    .await
                    .map_err(|source| DownloadError::Io {
                        path: partial_path.to_path_buf(),
                        source,
                    })?;
                file.seek(std::io::SeekFrom::End(0))
                    .await
                    .map_err(|source| DownloadError::Io {
                        path: partial_path.to_path_buf(),
                        source,
                    })?;

                let expected_total = total.or(expected_size.filter(|&e| e > 0));
                let appended =
                    stream_into(&mut file, response, url, partial_path, self.chunk_bytes).await?;
                let written = existing_bytes.saturating_add(appended);

                verify_total(partial_path, written, expected_total)?;
                info!(bytes = written, resumed = true, "resumed download complete");
                Ok(DownloadOutcome {
                    bytes_total: written,
                    resumed: true,
                })
            }
            200 => {
                debug!("server ignored Range header, restarting from scratch");
                let mut file = File::create(partial_path)
                    .await
                    .map_err(|source| DownloadError::Io {
                        path: partial_path.to_path_buf(),
                        source,
                    })?;
                let total = response
                    .content_length()
                    .or(expected_size.filter(|&e| e > 0));
                let written =
                    stream_into(&mut file, response, url, partial_path, self.chunk_bytes).await?;
                verify_total(partial_path, written, total)?;
                Ok(DownloadOutcome {
                    bytes_total: written,
                    resumed: false,
                })
            }
            416 => {
                let total = parse_content_range(&response).and_then(|(_, total)| total);
                match total {
                    Some(total) if existing_bytes >= total => Ok(DownloadOutcome {
                        bytes_total: existing_bytes,
                        resumed: true,
                    }),
                    Some(total) => Err(DownloadError::RangeNotSatisfiable {
                        url: url.into(),
                        local_size: existing_bytes,
                        total,
                    }),
                    None => Err(DownloadError::RangeNotSatisfiable {
                        url: url.into(),
                        local_size: existing_bytes,
                        total: 0,
                    }),
                }
            }
            other => Err(DownloadError::HttpStatus {
                url: url.into(),
                status: other,
            }),
        }
    }

    async fn send_get(
        &self,
        url: &str,
        auth_header: Option<&str>,
        range: Option<&str>,
    ) -> Result<reqwest::Response, DownloadError> {
        let mut request = self.client.get(url);
        if let Some(auth) = auth_header {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }

        let response = request.send().await.map_err(|source| {
            if source.is_timeout() {
                DownloadError::Timeout { url: url.into() }
            } else {
                DownloadError::Network {
                    url: url.into(),
                    source,
                }
            }
        })?;

        let status = response.status();
        if status.is_success() || status.as_u16() == 416 {
            return Ok(response);
        }

        Err(DownloadError::HttpStatus {
            url: url.into(),
            status: status.as_u16(),
        })
    }
}

fn host_allowed(host: &str, allowed_domains: &[String]) -> bool {
    allowed_domains.iter().any(|domain| {
        host.eq_ignore_ascii_case(domain) || host.to_ascii_lowercase().ends_with(&format!(".{}", domain.to_ascii_lowercase()))
    })
}

fn parse_content_range(response: &reqwest::Response) -> Option<(u64, Option<u64>)> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    let rest = value.strip_prefix("bytes ")?;
    let (range_part, total_part) = rest.split_once('/')?;

    let total = if total_part == "*" {
        None
    } else {
        Some(total_part.trim().parse().ok()?)
    };

    if range_part == "*" {
        return Some((0, total));
    }
    let (start, _end) = range_part.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    Some((start, total))
}

async fn stream_into(
    file: &mut File,
    response: reqwest::Response,
    url: &str,
    path: &Path,
    chunk_bytes: usize,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::with_capacity(chunk_bytes, file);
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| {
            if source.is_timeout() {
                DownloadError::Timeout { url: url.into() }
            } else {
                DownloadError::Network {
                    url: url.into(),
                    source,
                }
            }
        })?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|source| DownloadError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        written += chunk.len() as u64;
    }

    writer.flush().await.map_err(|source| DownloadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(written)
}

fn verify_total(path: &Path, actual: u64, expected: Option<u64>) -> Result<(), DownloadError> {
    match expected {
        Some(expected) if expected != actual => Err(DownloadError::Incomplete {
            path: path.to_path_buf(),
            expected_bytes: expected,
            actual_bytes: actual,
        }),
        _ => Ok(()),
    }
}

fn build_client(read_timeout: Duration) -> Result<Client, reqwest::Error> {
    ClientBuilder::new()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(read_timeout)
        .gzip(true)
        .user_agent(agent_version())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_domain_matches() {
        assert!(host_allowed("huggingface.co", &["huggingface.co".into()]));
    }

    #[test]
    fn subdomain_matches_suffix() {
        assert!(host_allowed(
            "cdn.huggingface.co",
            &["huggingface.co".into()]
        ));
    }

    #[test]
    fn unrelated_host_is_rejected() {
        assert!(!host_allowed(
            "evil.example.com",
            &["huggingface.co".into(), "civitai.com".into()]
        ));
    }

    #[test]
    fn sibling_domain_sharing_a_suffix_string_is_not_a_subdomain() {
        // "huggingface.co.evil.com" ends with "huggingface.co" as a raw string
        // but is not a subdomain of it; the check must require a `.` boundary.
        assert!(!host_allowed(
            "huggingface.co.evil.com",
            &["huggingface.co".into()]
        ));
    }

    #[test]
    fn verify_total_accepts_matching_size() {
        verify_total(Path::new("/tmp/x"), 100, Some(100)).unwrap();
    }

    #[test]
    fn verify_total_accepts_unknown_expected_size() {
        verify_total(Path::new("/tmp/x"), 100, None).unwrap();
    }

    #[test]
    fn verify_total_rejects_short_transfer() {
        let err = verify_total(Path::new("/tmp/x"), 40, Some(100)).unwrap_err();
        assert!(matches!(
            err,
            DownloadError::Incomplete { expected_bytes: 100, actual_bytes: 40, .. }
        ));
    }

    #[test]
    fn parses_standard_content_range_header() {
        // Can't easily build a reqwest::Response without a live connection,
        // so this exercises the header-string logic in isolation.
        let value = "bytes 512-1023/1024";
        let rest = value.strip_prefix("bytes ").unwrap();
        let (range_part, total_part) = rest.split_once('/').unwrap();
        assert_eq!(total_part, "1024");
        let (start, _) = range_part.split_once('-').unwrap();
        assert_eq!(start, "512");
    }
}
