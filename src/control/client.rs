//! JSON RPC client for the control plane: registration, queue polling,
//! status reporting, and heartbeats.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::error::ApiError;
use crate::state::{QueueItem, ResolvedInfo};
use crate::util::DiskStats;

/// Dynamic-policy overrides as returned in a registration `profile`. Every
/// field is optional; unset fields fall back to the environment-derived
/// default or to an explicit environment override (env takes precedence).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicPolicyProfile {
    pub enabled: Option<bool>,
    pub min_free_bytes: Option<u64>,
    pub max_dynamic_bytes: Option<u64>,
    pub eviction_batch_max: Option<u32>,
    pub pin_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationProfile {
    #[serde(default)]
    pub dynamic_policy: Option<DynamicPolicyProfile>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    server_type: &'a str,
    agent_version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_ip: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub instance_id: String,
    pub agent_token: String,
    #[serde(default)]
    pub profile: Option<RegistrationProfile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueResponse {
    items: Vec<QueueItem>,
}

/// Outcome of one queue item's execution, as reported to `/dependencies/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Running,
    Succeeded,
    Failed,
    Retrying,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport<'a> {
    pub instance_id: &'a str,
    pub item_id: &'a str,
    pub dep_id: &'a str,
    pub op: &'a str,
    pub state: ItemState,
    pub disk_stats: DiskStats,
    pub dynamic_bytes_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReport<'a> {
    pub instance_id: &'a str,
    pub installed_static_dep_ids: &'a [String],
    pub installed_dynamic_dep_ids: &'a [String],
    pub downloading_dep_ids: &'a [String],
    pub failed_dep_ids: &'a [String],
    pub disk_stats: DiskStats,
    pub dynamic_bytes_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<u32>,
}

/// Thin JSON RPC wrapper around the control plane's REST surface. Holds the
/// bearer token once registration succeeds; callers are expected to
/// re-register on [`ApiError::requires_reregistration`].
#[derive(Debug, Clone)]
pub struct ControlClient {
    client: Client,
    base_url: String,
}

impl ControlClient {
    #[must_use]
    pub fn new(base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client, base_url }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    #[instrument(level = "debug", skip(self, shared_secret))]
    pub async fn register(
        &self,
        server_type: &str,
        agent_version: &str,
        instance_id: Option<&str>,
        instance_ip: Option<&str>,
        shared_secret: Option<&str>,
    ) -> Result<RegisterResponse, ApiError> {
        let endpoint = self.endpoint("/dependencies/register");
        let body = RegisterRequest {
            server_type,
            agent_version,
            instance_id,
            instance_ip,
        };

        let mut request = self.client.post(&endpoint).json(&body);
        if let Some(secret) = shared_secret {
            request = request.header("X-DM-Secret", secret);
        }

        send_json(&endpoint, request).await
    }

    #[instrument(level = "debug", skip(self, agent_token))]
    pub async fn fetch_queue(
        &self,
        instance_id: &str,
        agent_token: &str,
        limit: u32,
    ) -> Result<Vec<QueueItem>, ApiError> {
        let endpoint = self.endpoint("/dependencies/queue");
        let request = self
            .client
            .get(&endpoint)
            .bearer_auth(agent_token)
            .query(&[("instanceId", instance_id), ("limit", &limit.to_string())]);

        let response: QueueResponse = send_json(&endpoint, request).await?;
        Ok(response.items)
    }

    #[instrument(level = "debug", skip(self, agent_token, report))]
    pub async fn post_status(
        &self,
        agent_token: &str,
        report: &StatusReport<'_>,
    ) -> Result<(), ApiError> {
        let endpoint = self.endpoint("/dependencies/status");
        let request = self
            .client
            .post(&endpoint)
            .bearer_auth(agent_token)
            .json(report);
        send_empty(&endpoint, request).await
    }

    #[instrument(level = "debug", skip(self, agent_token, report))]
    pub async fn post_heartbeat(
        &self,
        agent_token: &str,
        report: &HeartbeatReport<'_>,
    ) -> Result<(), ApiError> {
        let endpoint = self.endpoint("/dependencies/heartbeat");
        let request = self
            .client
            .post(&endpoint)
            .bearer_auth(agent_token)
            .json(report);
        send_empty(&endpoint, request).await
    }
}

async fn send_json<T: serde::de::DeserializeOwned>(
    endpoint: &str,
    request: reqwest::RequestBuilder,
) -> Result<T, ApiError> {
    let response = request
        .send()
        .await
        .map_err(|source| ApiError::Transport {
            endpoint: endpoint.to_string(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Http {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    let bytes = response.bytes().await.map_err(|source| ApiError::Transport {
        endpoint: endpoint.to_string(),
        source,
    })?;

    serde_json::from_slice(&bytes).map_err(|source| ApiError::MalformedResponse {
        endpoint: endpoint.to_string(),
        source,
    })
}

async fn send_empty(endpoint: &str, request: reqwest::RequestBuilder) -> Result<(), ApiError> {
    let response = request
        .send()
        .await
        .map_err(|source| ApiError::Transport {
            endpoint: endpoint.to_string(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Http {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    Ok(())
}
