//! End-to-end tests driving [`Executor::process`] against a mock artifact
//! host and a mock control plane: the literal clean-install, resume,
//! integrity-mismatch, and disallowed-domain scenarios.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use dm_agent_core::cache::Policy;
use dm_agent_core::config::{Config, PolicyEnvOverrides};
use dm_agent_core::control::ControlClient;
use dm_agent_core::download::HttpClient;
use dm_agent_core::state::{ArtifactKind, AuthKind, LocalState, QueueItem, QueueOp, ResolvedInfo};
use dm_agent_core::Executor;
use tempfile::TempDir;
use tokio::sync::Mutex;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// sha256("artifact payload")
const ARTIFACT_SHA256: &str = "a11a4045c89f727fadb9aeddb0f29637ce5b505846afebd82ae2c01b6733a6b5";

fn test_config(comfyui_dir: &str, state_path: &str, artifact_host: &str, api_base_url: String) -> Config {
    Config {
        api_base_url,
        server_type: "comfyui".into(),
        shared_secret: None,
        hf_token: None,
        civitai_token: None,
        instance_id: Some("test-instance".into()),
        instance_ip: None,
        workspace: comfyui_dir.to_string(),
        comfyui_dir: comfyui_dir.to_string(),
        state_path: state_path.to_string(),
        poll_seconds: 5,
        heartbeat_seconds: 30,
        max_parallel_downloads: 2,
        allowed_domains: vec![artifact_host.to_string()],
        download_timeout: Duration::from_secs(30),
        download_chunk_bytes: 64 * 1024,
        verbose_progress: false,
        policy_overrides: PolicyEnvOverrides::default(),
    }
}

async fn mount_control_plane(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/dependencies/status"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/dependencies/heartbeat"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

fn build_executor(config: Config) -> (Executor, Arc<Mutex<LocalState>>) {
    let state = Arc::new(Mutex::new(LocalState::default()));
    let config = Arc::new(config);
    let http = Arc::new(
        HttpClient::new(
            config.allowed_domains.clone(),
            config.download_timeout,
            config.download_chunk_bytes,
        )
        .unwrap(),
    );
    let control = Arc::new(ControlClient::new(config.api_base_url.clone()));
    let executor = Executor::new(
        state.clone(),
        config,
        http,
        control,
        "test-instance".into(),
        "test-token".into(),
        Arc::new(AtomicU64::new(0)),
    );
    (executor, state)
}

fn download_item(dep_id: &str, url: String, sha256: Option<String>, kind: ArtifactKind) -> QueueItem {
    QueueItem {
        item_id: format!("item-{dep_id}"),
        dep_id: dep_id.to_string(),
        op: QueueOp::Download,
        resolved: ResolvedInfo {
            url: Some(url),
            auth: Some(AuthKind::None),
            dest_relative_path: Some(format!("models/{dep_id}.bin")),
            sha256,
            expected_size_bytes: Some(16),
            kind: Some(kind),
        },
    }
}

#[tokio::test]
async fn clean_install_of_static_artifact_writes_file_and_marks_installed() {
    let artifact_server = MockServer::start().await;
    let control_server = MockServer::start().await;
    mount_control_plane(&control_server).await;

    Mock::given(method("GET"))
        .and(path("/x.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"artifact payload".to_vec()))
        .mount(&artifact_server)
        .await;

    let workspace = TempDir::new().unwrap();
    let state_path = workspace.path().join("state.json");
    let config = test_config(
        workspace.path().to_str().unwrap(),
        state_path.to_str().unwrap(),
        "127.0.0.1",
        control_server.uri(),
    );
    let (executor, state) = build_executor(config);

    let url = format!("{}/x.bin", artifact_server.uri());
    let item = download_item("dep-static", url, Some(ARTIFACT_SHA256.to_string()), ArtifactKind::Static);

    executor.process(&item, &Policy::default()).await;

    let dest = workspace.path().join("models/dep-static.bin");
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"artifact payload");

    let state = state.lock().await;
    assert!(state.installed_static.contains("dep-static"));
    assert!(!state.lru.contains_key("dep-static"));
    assert!(!state.failed.contains("dep-static"));
}

#[tokio::test]
async fn resume_after_interruption_appends_and_installs_dynamic_artifact() {
    let artifact_server = MockServer::start().await;
    let control_server = MockServer::start().await;
    mount_control_plane(&control_server).await;

    Mock::given(method("GET"))
        .and(path("/x.bin"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 8-15/16")
                .set_body_bytes(b" payload".to_vec()),
        )
        .mount(&artifact_server)
        .await;

    let workspace = TempDir::new().unwrap();
    let state_path = workspace.path().join("state.json");
    tokio::fs::create_dir_all(workspace.path().join("models")).await.unwrap();
    tokio::fs::write(
        workspace.path().join("models/dep-dyn.bin.partial"),
        b"artifact",
    )
    .await
    .unwrap();

    let config = test_config(
        workspace.path().to_str().unwrap(),
        state_path.to_str().unwrap(),
        "127.0.0.1",
        control_server.uri(),
    );
    let (executor, state) = build_executor(config);

    let url = format!("{}/x.bin", artifact_server.uri());
    let item = download_item("dep-dyn", url, Some(ARTIFACT_SHA256.to_string()), ArtifactKind::Dynamic);

    executor.process(&item, &Policy::default()).await;

    let dest = workspace.path().join("models/dep-dyn.bin");
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"artifact payload");
    assert!(!workspace.path().join("models/dep-dyn.bin.partial").exists());

    let state = state.lock().await;
    assert!(state.installed_dynamic.contains("dep-dyn"));
    assert!(state.lru.contains_key("dep-dyn"));
}

#[tokio::test]
async fn sha256_mismatch_discards_partial_and_schedules_retry() {
    let artifact_server = MockServer::start().await;
    let control_server = MockServer::start().await;
    mount_control_plane(&control_server).await;

    Mock::given(method("GET"))
        .and(path("/x.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"artifact payload".to_vec()))
        .mount(&artifact_server)
        .await;

    let workspace = TempDir::new().unwrap();
    let state_path = workspace.path().join("state.json");
    let config = test_config(
        workspace.path().to_str().unwrap(),
        state_path.to_str().unwrap(),
        "127.0.0.1",
        control_server.uri(),
    );
    let (executor, state) = build_executor(config);

    let url = format!("{}/x.bin", artifact_server.uri());
    let item = download_item(
        "dep-bad-sha",
        url,
        Some("0000000000000000000000000000000000000000000000000000000000000000".to_string()),
        ArtifactKind::Dynamic,
    );

    executor.process(&item, &Policy::default()).await;

    assert!(!workspace.path().join("models/dep-bad-sha.bin").exists());
    assert!(!workspace.path().join("models/dep-bad-sha.bin.partial").exists());

    let state = state.lock().await;
    assert!(state.failed.contains("dep-bad-sha"));
    let retry = state.retry.get("dep-bad-sha").expect("should be scheduled for retry");
    assert_eq!(retry.attempts, 1);
    assert!(!state.downloading.contains("dep-bad-sha"));
}

#[tokio::test]
async fn disallowed_domain_fails_without_retry_and_without_any_download_attempt() {
    let control_server = MockServer::start().await;
    mount_control_plane(&control_server).await;

    let workspace = TempDir::new().unwrap();
    let state_path = workspace.path().join("state.json");
    // Allowlist names huggingface.co; the artifact URL below is some other
    // unreachable host, so the executor must reject it purely by hostname
    // without ever attempting a connection.
    let config = test_config(
        workspace.path().to_str().unwrap(),
        state_path.to_str().unwrap(),
        "huggingface.co",
        control_server.uri(),
    );
    let (executor, state) = build_executor(config);

    let item = download_item(
        "dep-disallowed",
        "https://evil.example.com/x.bin".to_string(),
        None,
        ArtifactKind::Dynamic,
    );

    executor.process(&item, &Policy::default()).await;

    let state = state.lock().await;
    assert!(state.failed.contains("dep-disallowed"));
    assert!(!state.retry.contains_key("dep-disallowed"));
    assert!(!state.lru.contains_key("dep-disallowed"));
}

#[tokio::test]
async fn touch_op_updates_lru_without_downloading() {
    let control_server = MockServer::start().await;
    mount_control_plane(&control_server).await;

    let workspace = TempDir::new().unwrap();
    tokio::fs::create_dir_all(workspace.path().join("models")).await.unwrap();
    tokio::fs::write(workspace.path().join("models/dep-touch.bin"), b"already here")
        .await
        .unwrap();

    let state_path = workspace.path().join("state.json");
    let config = test_config(
        workspace.path().to_str().unwrap(),
        state_path.to_str().unwrap(),
        "127.0.0.1",
        control_server.uri(),
    );
    let (executor, state) = build_executor(config);

    let item = QueueItem {
        item_id: "item-touch".into(),
        dep_id: "dep-touch".into(),
        op: QueueOp::Touch,
        resolved: ResolvedInfo {
            url: None,
            auth: None,
            dest_relative_path: Some("models/dep-touch.bin".into()),
            sha256: None,
            expected_size_bytes: None,
            kind: None,
        },
    };

    executor.process(&item, &Policy::default()).await;

    let state = state.lock().await;
    assert!(state.installed_dynamic.contains("dep-touch"));
    assert!(state.lru.contains_key("dep-touch"));
}

