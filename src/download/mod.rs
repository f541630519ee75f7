//! Resumable artifact download over HTTP(S), with a domain allowlist and
//! `Range`/`206`/`416`-aware resume state machine.
//!
//! This module only gets bytes onto disk at `<dest>.partial`; the caller
//! ([`crate::executor`]) is responsible for digest verification and the
//! atomic rename into the final destination.

mod client;
pub mod constants;
mod error;

pub use client::{DownloadOutcome, HttpClient};
pub use error::DownloadError;
