//! Agent control loop: registration, steady-state polling/dispatch, and
//! cooperative shutdown.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::cache::{self, Policy};
use crate::config::{Config, merge_policy};
use crate::control::{ApiError, ControlClient, HeartbeatReport};
use crate::download::HttpClient;
use crate::download::constants::agent_version;
use crate::executor::Executor;
use crate::state::{self, LocalState, QueueItem, QueueOp};

const PUBLIC_IP_PROBES: &[&str] = &[
    "https://api.ipify.org",
    "https://checkip.amazonaws.com",
    "https://ipv4.icanhazip.com",
];

const REGISTER_BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const REGISTER_BACKOFF_MAX: Duration = Duration::from_secs(60);
const API_ERROR_SLEEP: Duration = Duration::from_secs(5);

/// Top-level agent: owns the shared mutable state and drives the control
/// loop described for the steady-state dispatcher.
pub struct Agent {
    config: Arc<Config>,
    control: Arc<ControlClient>,
    http: Arc<HttpClient>,
    state: Arc<Mutex<LocalState>>,
}

struct Session {
    instance_id: String,
    agent_token: String,
    policy: Policy,
}

impl Agent {
    /// Builds the agent, loading any persisted state from
    /// `config.state_path` (a missing or corrupt file yields empty state).
    pub fn new(config: Config) -> Result<Self, reqwest::Error> {
        let state = state::load(Path::new(&config.state_path));
        let http = HttpClient::new(
            config.allowed_domains.clone(),
            config.download_timeout,
            config.download_chunk_bytes,
        )?;
        let control = ControlClient::new(config.api_base_url.clone());
        Ok(Self {
            config: Arc::new(config),
            control: Arc::new(control),
            http: Arc::new(http),
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Runs the agent until `shutdown` is cancelled. Registration retries
    /// indefinitely with capped exponential backoff; shutdown during
    /// registration returns without entering the steady-state loop.
    pub async fn run(&self, shutdown: CancellationToken) {
        let Some(mut session) = self.register_until_success(&shutdown).await else {
            return;
        };

        info!(
            comfyui_dir = %self.config.comfyui_dir,
            state_path = %self.config.state_path,
            poll_seconds = self.config.poll_seconds,
            heartbeat_seconds = self.config.heartbeat_seconds,
            max_parallel = self.config.max_parallel_downloads,
            "agent registered, entering steady state"
        );
        if session.policy.enabled {
            info!(
                min_free_bytes = session.policy.min_free_bytes,
                max_dynamic_bytes = session.policy.max_dynamic_bytes,
                eviction_batch_max = session.policy.eviction_batch_max,
                pin_ttl_ms = session.policy.pin_ttl_ms,
                "dynamic eviction enabled"
            );
        } else {
            info!("dynamic eviction disabled");
        }

        let last_heartbeat_ms = Arc::new(AtomicU64::new(0));
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_downloads as usize));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut executor = self.build_executor(&session, last_heartbeat_ms.clone());
        let mut last_heartbeat_at = 0u64;

        while !shutdown.is_cancelled() {
            match self.poll_once(&session, &executor, &semaphore, &mut tasks, &mut last_heartbeat_at).await {
                Ok(()) => {
                    self.sleep_with_jitter(self.config.poll_seconds, &shutdown).await;
                }
                Err(err) => {
                    if err.requires_reregistration() {
                        warn!(status = ?err, "unauthorized, re-registering");
                        match self.register_once().await {
                            Ok(new_session) => {
                                session = new_session;
                                executor = self.build_executor(&session, last_heartbeat_ms.clone());
                            }
                            Err(re_err) => error!(error = %re_err, "re-register failed"),
                        }
                    } else {
                        error!(error = %err, "api error polling control plane");
                    }
                    self.sleep_with_jitter_secs(API_ERROR_SLEEP, &shutdown).await;
                }
            }
        }

        // Cancelled without waiting for in-flight downloads: partials are
        // left on disk and resume on the next start.
        tasks.abort_all();
    }

    fn build_executor(&self, session: &Session, last_heartbeat_ms: Arc<AtomicU64>) -> Executor {
        Executor::new(
            self.state.clone(),
            self.config.clone(),
            self.http.clone(),
            self.control.clone(),
            session.instance_id.clone(),
            session.agent_token.clone(),
            last_heartbeat_ms,
        )
    }

    #[instrument(level = "debug", skip_all)]
    async fn poll_once(
        &self,
        session: &Session,
        executor: &Executor,
        semaphore: &Arc<Semaphore>,
        tasks: &mut JoinSet<()>,
        last_heartbeat_at: &mut u64,
    ) -> Result<(), ApiError> {
        let now = now_ms();
        if now.saturating_sub(*last_heartbeat_at) >= self.config.heartbeat_seconds * 1000 {
            self.heartbeat(session, None).await?;
            *last_heartbeat_at = now_ms();
        }

        let items = self
            .control
            .fetch_queue(&session.instance_id, &session.agent_token, 25)
            .await?;

        let now = now_ms();
        if !items.is_empty() && now.saturating_sub(*last_heartbeat_at) >= 5_000 {
            let queue_depth = items.len() as u32 + tasks.len() as u32;
            self.heartbeat(session, Some(queue_depth)).await?;
            *last_heartbeat_at = now_ms();
        }

        while let Some(result) = tasks.try_join_next() {
            if let Err(err) = result {
                error!(error = %err, "unhandled worker task error");
            }
        }

        let fetched_dep_ids: std::collections::BTreeSet<String> =
            items.iter().map(|item| item.dep_id.clone()).collect();

        for item in items {
            if !try_dispatch(item, session.policy, executor, semaphore, tasks) {
                break;
            }
        }

        let due_retries = self.collect_due_retries(&fetched_dep_ids).await;
        for item in due_retries {
            if !try_dispatch(item, session.policy, executor, semaphore, tasks) {
                break;
            }
        }

        Ok(())
    }

    async fn collect_due_retries(&self, exclude: &std::collections::BTreeSet<String>) -> Vec<QueueItem> {
        let state = self.state.lock().await;
        let now = now_ms();
        state
            .retry
            .iter()
            .filter(|(dep_id, entry)| {
                entry.next_attempt_at_ms <= now
                    && !exclude.contains(*dep_id)
                    && !state.downloading.contains(*dep_id)
            })
            .map(|(dep_id, entry)| QueueItem {
                item_id: entry.item_id.clone(),
                dep_id: dep_id.clone(),
                op: QueueOp::Download,
                resolved: entry.resolved.clone(),
            })
            .collect()
    }


    async fn heartbeat(&self, session: &Session, queue_depth: Option<u32>) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        cache::reconcile(&mut state, Path::new(&self.config.comfyui_dir));
        let installed_static: Vec<String> = state.installed_static.iter().cloned().collect();
        let installed_dynamic: Vec<String> = state.installed_dynamic.iter().cloned().collect();
        let downloading: Vec<String> = state.downloading.iter().cloned().collect();
        let failed: Vec<String> = state.failed.iter().cloned().collect();
        let dynamic_bytes_used = state.dynamic_bytes_used();
        drop(state);

        let disk = crate::util::disk_stats(Path::new(&self.config.comfyui_dir)).unwrap_or(
            crate::util::DiskStats {
                total_bytes: 0,
                free_bytes: 0,
                used_bytes: 0,
            },
        );

        let report = HeartbeatReport {
            instance_id: &session.instance_id,
            installed_static_dep_ids: &installed_static,
            installed_dynamic_dep_ids: &installed_dynamic,
            downloading_dep_ids: &downloading,
            failed_dep_ids: &failed,
            disk_stats: disk,
            dynamic_bytes_used,
            queue_depth,
        };
        self.control.post_heartbeat(&session.agent_token, &report).await
    }

    async fn register_until_success(&self, shutdown: &CancellationToken) -> Option<Session> {
        let mut backoff = REGISTER_BACKOFF_INITIAL;
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            match self.register_once().await {
                Ok(session) => return Some(session),
                Err(err) => {
                    error!(error = %err, "registration failed");
                    self.sleep_with_jitter_secs(backoff, shutdown).await;
                    backoff = (backoff.mul_f64(1.5)).min(REGISTER_BACKOFF_MAX);
                }
            }
            if shutdown.is_cancelled() {
                return None;
            }
        }
    }

    async fn register_once(&self) -> Result<Session, ApiError> {
        let mut instance_ip = self.config.instance_ip.clone();
        if self.config.instance_id.is_none() && instance_ip.is_none() {
            instance_ip = detect_public_ip().await;
            match &instance_ip {
                Some(ip) => info!(ip, "detected public IP for registration"),
                None => warn!(
                    "could not detect public IP; set DM_INSTANCE_ID or DM_INSTANCE_IP for reliable registration"
                ),
            }
        }

        let version = agent_version();
        let response = self
            .control
            .register(
                &self.config.server_type,
                &version,
                self.config.instance_id.as_deref(),
                instance_ip.as_deref(),
                self.config.shared_secret.as_deref(),
            )
            .await?;

        let profile = response
            .profile
            .as_ref()
            .and_then(|p| p.dynamic_policy.as_ref());
        let policy = merge_policy(&self.config.policy_overrides, profile);

        info!(instance_id = %response.instance_id, "registered with control plane");

        Ok(Session {
            instance_id: response.instance_id,
            agent_token: response.agent_token,
            policy,
        })
    }

    async fn sleep_with_jitter(&self, seconds: u64, shutdown: &CancellationToken) {
        self.sleep_with_jitter_secs(Duration::from_secs(seconds), shutdown).await;
    }

    async fn sleep_with_jitter_secs(&self, base: Duration, shutdown: &CancellationToken) {
        let jitter_span = base.as_secs_f64() * 0.20;
        let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
        let jittered = (base.as_secs_f64() + jitter).max(0.0);
        let duration = Duration::from_secs_f64(jittered);

        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = shutdown.cancelled() => {}
        }
    }
}

/// Best-effort public IPv4 detection against a fixed probe list. Returns the
/// first probe's response that parses as an IPv4 address.
fn try_dispatch(
    item: QueueItem,
    policy: Policy,
    executor: &Executor,
    semaphore: &Arc<Semaphore>,
    tasks: &mut JoinSet<()>,
) -> bool {
    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
        return false;
    };
    let executor = executor.clone();
    tasks.spawn(async move {
        executor.process(&item, &policy).await;
        drop(permit);
    });
    true
}

async fn detect_public_ip() -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .ok()?;

    for probe in PUBLIC_IP_PROBES {
        let Ok(response) = client.get(*probe).send().await else {
            continue;
        };
        let Ok(body) = response.text().await else {
            continue;
        };
        let candidate = body.trim();
        if candidate.parse::<std::net::Ipv4Addr>().is_ok() {
            return Some(candidate.to_string());
        }
    }
    None
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
