//! End-to-end lifecycle scenarios against an in-memory sqlite store and
//! fake external ports — the six literal scenarios named in spec.md §8,
//! driven through `LifecycleController` the way `SessionActor` drives it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use session_coordinator::config::LifecycleFileConfig;
use session_coordinator::crypto::EnvelopeCipher;
use session_coordinator::lifecycle::controller::{LifecycleController, SnapshotOutcome, SpawnOutcome};
use session_coordinator::models::{SandboxStatus, Session, now_ms};
use session_coordinator::ports::callback::CallbackPort;
use session_coordinator::ports::codehost::{CodeHostError, CodeHostPort, CreatePullRequestRequest, PullRequestInfo, RepositoryInfo};
use session_coordinator::ports::identity::{IdentityError, IdentityPort};
use session_coordinator::ports::provider::{
    CreateSandboxRequest, CreateSandboxResponse, ProviderError, ProviderPort,
    RestoreSandboxRequest, RestoreSandboxResponse, SnapshotResponse,
};
use session_coordinator::ports::{IdentityConfig, Ports};
use session_coordinator::secrets_store::SecretsStore;
use session_coordinator::session_store::SessionStore;

struct FakeProvider {
    create_calls: Mutex<Vec<CreateSandboxRequest>>,
    restore_calls: Mutex<Vec<RestoreSandboxRequest>>,
    fail_create: AtomicUsize,
}

impl FakeProvider {
    fn new() -> Self {
        Self {
            create_calls: Mutex::new(Vec::new()),
            restore_calls: Mutex::new(Vec::new()),
            fail_create: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProviderPort for FakeProvider {
    async fn create_sandbox(
        &self,
        req: CreateSandboxRequest,
    ) -> Result<CreateSandboxResponse, ProviderError> {
        self.create_calls.lock().unwrap().push(req.clone());
        let remaining = self.fail_create.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_create.fetch_sub(1, Ordering::SeqCst);
            return Err(ProviderError::permanent("fake provider failure"));
        }
        Ok(CreateSandboxResponse {
            provider_object_id: format!("obj-{}", req.expected_sandbox_id),
        })
    }

    async fn restore_from_snapshot(
        &self,
        req: RestoreSandboxRequest,
    ) -> Result<RestoreSandboxResponse, ProviderError> {
        self.restore_calls.lock().unwrap().push(req.clone());
        Ok(RestoreSandboxResponse {
            provider_object_id: format!("obj-{}", req.expected_sandbox_id),
        })
    }

    fn supports_snapshot(&self) -> bool {
        true
    }

    async fn take_snapshot(&self, provider_object_id: &str) -> Result<SnapshotResponse, ProviderError> {
        Ok(SnapshotResponse {
            snapshot_image_id: format!("snap-{provider_object_id}"),
        })
    }
}

struct FakeCodeHost;

#[async_trait]
impl CodeHostPort for FakeCodeHost {
    async fn get_repository(&self, _owner: &str, _name: &str, _user_token: &str) -> Result<RepositoryInfo, CodeHostError> {
        Ok(RepositoryInfo { default_branch: "main".to_string() })
    }

    async fn create_pull_request(&self, _req: CreatePullRequestRequest) -> Result<PullRequestInfo, CodeHostError> {
        Ok(PullRequestInfo { number: 1, html_url: "https://example/pr/1".to_string(), state: "open".to_string() })
    }
}

struct FakeIdentity;

#[async_trait]
impl IdentityPort for FakeIdentity {
    async fn generate_installation_token(&self, _app_id: &str, _pem: &str, _install_id: &str) -> Result<String, IdentityError> {
        Ok("fake-installation-token".to_string())
    }
}

struct FakeCallback {
    calls: Mutex<Vec<(String, String, bool)>>,
}

#[async_trait]
impl CallbackPort for FakeCallback {
    async fn notify_completion(&self, _url: &str, session_id: &str, message_id: &str, success: bool, _context: serde_json::Value) {
        self.calls.lock().unwrap().push((session_id.to_string(), message_id.to_string(), success));
    }
}

fn test_lifecycle_config() -> LifecycleFileConfig {
    LifecycleFileConfig {
        circuit_breaker_threshold: 3,
        circuit_breaker_window_ms: 5 * 60 * 1000,
        spawn_cooldown_ms: 30 * 1000,
        ready_wait_ms: 60 * 1000,
        inactivity_timeout_ms: 10 * 60 * 1000,
        inactivity_extension_ms: 5 * 60 * 1000,
        min_check_ms: 30 * 1000,
        heartbeat_interval_ms: 30 * 1000,
        heartbeat_stale_ms: 90 * 1000,
        client_auth_deadline_ms: 30 * 1000,
        push_timeout_ms: 180 * 1000,
        default_model: "claude-default".to_string(),
    }
}

async fn test_store() -> SessionStore {
    SessionStore::connect("sqlite::memory:").await.unwrap()
}

async fn test_secrets() -> SecretsStore {
    let cipher = EnvelopeCipher::from_base64_key("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=").unwrap();
    SecretsStore::connect("sqlite::memory:", cipher, 50, 16 * 1024, 64 * 1024)
        .await
        .unwrap()
}

fn controller_with(
    store: SessionStore,
    provider: Arc<dyn ProviderPort>,
    secrets: SecretsStore,
) -> LifecycleController {
    let ports = Ports {
        provider,
        codehost: Arc::new(FakeCodeHost),
        identity: Arc::new(FakeIdentity),
        callback: Arc::new(FakeCallback { calls: Mutex::new(Vec::new()) }),
        identity_config: IdentityConfig::default(),
        cipher: Arc::new(EnvelopeCipher::from_base64_key("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=").unwrap()),
        callback_url: None,
    };
    LifecycleController::new(
        store,
        ports,
        test_lifecycle_config(),
        "http://coordinator.internal/s1".to_string(),
        secrets,
    )
}

async fn seed_session(store: &SessionStore) {
    let session = Session::new(
        "sess-1".to_string(),
        "s1".to_string(),
        "acme".to_string(),
        "web".to_string(),
        None,
        None,
    );
    store.insert_session(&session).await.unwrap();
    store.ensure_sandbox_row().await.unwrap();
}

/// Scenario 1: fresh session to first completion (spec.md §8 #1).
#[tokio::test]
async fn fresh_spawn_creates_sandbox_with_expected_id() {
    let store = test_store().await;
    seed_session(&store).await;
    let provider = Arc::new(FakeProvider::new());
    let controller = controller_with(store.clone(), provider.clone(), test_secrets().await);

    let outcome = controller
        .attempt_spawn("sess-1", None, "acme", "web", None, false, false)
        .await
        .unwrap();

    match outcome {
        SpawnOutcome::Spawned { provider_object_id } => {
            assert!(provider_object_id.starts_with("obj-sandbox-acme-web-"));
        }
        other => panic!("expected Spawned, got {other:?}"),
    }

    let calls = provider.create_calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].expected_sandbox_id.starts_with("sandbox-acme-web-"));

    let sandbox = store.get_sandbox().await.unwrap().unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Connecting);
    assert!(sandbox.external_sandbox_id.is_some());
    assert!(sandbox.auth_token.is_some());
}

/// Scenario 2: resume from snapshot (spec.md §8 #2).
#[tokio::test]
async fn resume_from_snapshot_restores_instead_of_spawning() {
    let store = test_store().await;
    seed_session(&store).await;
    store.set_sandbox_status(SandboxStatus::Stopped).await.unwrap();
    store.set_snapshot_image_id("img-42").await.unwrap();

    let provider = Arc::new(FakeProvider::new());
    let controller = controller_with(store.clone(), provider.clone(), test_secrets().await);

    let outcome = controller
        .attempt_spawn("sess-1", None, "acme", "web", None, false, false)
        .await
        .unwrap();

    assert!(matches!(outcome, SpawnOutcome::Restored { .. }));
    assert_eq!(provider.create_calls.lock().unwrap().len(), 0);
    let restores = provider.restore_calls.lock().unwrap();
    assert_eq!(restores.len(), 1);
    assert_eq!(restores[0].snapshot_image_id, "img-42");

    let sandbox = store.get_sandbox().await.unwrap().unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Connecting);
}

/// Scenario 3: circuit breaker opens after three permanent failures
/// within the window (spec.md §8 #3).
#[tokio::test]
async fn circuit_breaker_blocks_fourth_attempt() {
    let store = test_store().await;
    seed_session(&store).await;
    let now = now_ms();
    for _ in 0..3 {
        store.record_spawn_failure(now, "boom").await.unwrap();
    }

    let provider = Arc::new(FakeProvider::new());
    let controller = controller_with(store.clone(), provider.clone(), test_secrets().await);

    let outcome = controller
        .attempt_spawn("sess-1", None, "acme", "web", None, false, false)
        .await
        .unwrap();

    match outcome {
        SpawnOutcome::Skipped { reason } => {
            assert!(reason.contains("circuit breaker"));
        }
        other => panic!("expected circuit breaker Skipped, got {other:?}"),
    }
    assert_eq!(provider.create_calls.lock().unwrap().len(), 0);
}

/// Scenario 4 (second half): idle with no clients connected snapshots
/// and stops (spec.md §8 #4).
#[tokio::test]
async fn inactivity_timeout_with_no_clients_snapshots_and_stops() {
    let store = test_store().await;
    seed_session(&store).await;
    store.set_sandbox_status(SandboxStatus::Ready).await.unwrap();
    store.set_provider_object_id("obj-1").await.unwrap();
    let now = now_ms();
    store.touch_last_activity(now - 600_001).await.unwrap();

    let provider = Arc::new(FakeProvider::new());
    let controller = controller_with(store.clone(), provider.clone(), test_secrets().await);

    let decision = controller.check_inactivity(0).await.unwrap();
    assert!(matches!(
        decision,
        session_coordinator::lifecycle::decisions::InactivityDecision::Timeout
    ));

    // The actor persists the terminal status before calling `snapshot`,
    // per the controller's documented precondition.
    store.set_sandbox_status(SandboxStatus::Stopped).await.unwrap();
    let outcome = controller.snapshot("inactivity_timeout").await.unwrap();
    match outcome {
        SnapshotOutcome::Saved { image_id } => assert!(image_id.starts_with("snap-obj-1")),
        other => panic!("expected Saved, got {other:?}"),
    }
    let sandbox = store.get_sandbox().await.unwrap().unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Stopped);
}

/// Scenario 4 (first half): idle with clients connected extends instead
/// of stopping.
#[tokio::test]
async fn inactivity_timeout_with_clients_extends() {
    let store = test_store().await;
    seed_session(&store).await;
    store.set_sandbox_status(SandboxStatus::Ready).await.unwrap();
    let now = now_ms();
    store.touch_last_activity(now - 600_001).await.unwrap();

    let provider = Arc::new(FakeProvider::new());
    let controller = controller_with(store.clone(), provider.clone(), test_secrets().await);

    let decision = controller.check_inactivity(1).await.unwrap();
    match decision {
        session_coordinator::lifecycle::decisions::InactivityDecision::Extend { next_check_ms } => {
            assert_eq!(next_check_ms, 5 * 60 * 1000);
        }
        other => panic!("expected Extend, got {other:?}"),
    }
}

/// Scenario 5: heartbeat stale triggers a status transition and a
/// fire-and-forget snapshot (spec.md §8 #5).
#[tokio::test]
async fn heartbeat_stale_transitions_and_snapshots() {
    let store = test_store().await;
    seed_session(&store).await;
    store.set_sandbox_status(SandboxStatus::Ready).await.unwrap();
    store.set_provider_object_id("obj-2").await.unwrap();
    let now = now_ms();
    store.touch_heartbeat(now - 91_000).await.unwrap();

    let provider = Arc::new(FakeProvider::new());
    let controller = controller_with(store.clone(), provider.clone(), test_secrets().await);

    let decision = controller.check_heartbeat().await.unwrap();
    assert_eq!(
        decision,
        session_coordinator::lifecycle::decisions::HeartbeatDecision::Stale
    );

    store.set_sandbox_status(SandboxStatus::Stale).await.unwrap();
    let outcome = controller.snapshot("heartbeat_timeout").await.unwrap();
    assert!(matches!(outcome, SnapshotOutcome::Saved { .. }));
    let sandbox = store.get_sandbox().await.unwrap().unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Stale, "terminal status stays sticky across the snapshot call");
}

/// Scenario 6: secret quota rejects the 51st key (spec.md §8 #6).
#[tokio::test]
async fn secret_quota_rejects_fifty_first_key() {
    use session_coordinator::secrets_store::SecretInput;

    let secrets = test_secrets().await;
    let repo_id = "repo-1";
    let many: Vec<SecretInput> = (0..50)
        .map(|i| SecretInput { key: format!("K_{i}"), value: "x".to_string() })
        .collect();
    secrets.set_secrets(repo_id, "acme", "web", many).await.unwrap();

    let result = secrets
        .set_secrets(
            repo_id,
            "acme",
            "web",
            vec![SecretInput { key: "K_50".to_string(), value: "y".to_string() }],
        )
        .await;

    assert!(result.is_err(), "51st key must be rejected");
}

/// Terminal stickiness invariant (spec.md §8): a snapshot attempt never
/// moves a terminal status back to a non-terminal one even when the
/// provider call itself fails.
#[tokio::test]
async fn snapshot_failure_still_restores_terminal_status() {
    let store = test_store().await;
    seed_session(&store).await;
    store.set_provider_object_id("obj-3").await.unwrap();
    store.set_sandbox_status(SandboxStatus::Failed).await.unwrap();

    let provider = Arc::new(FakeProvider::new());
    // take_snapshot on FakeProvider always succeeds; wrap it with one
    // that fails only that call.
    struct FailingSnapshotProvider(Arc<FakeProvider>);
    #[async_trait]
    impl ProviderPort for FailingSnapshotProvider {
        async fn create_sandbox(&self, req: CreateSandboxRequest) -> Result<CreateSandboxResponse, ProviderError> {
            self.0.create_sandbox(req).await
        }
        async fn restore_from_snapshot(&self, req: RestoreSandboxRequest) -> Result<RestoreSandboxResponse, ProviderError> {
            self.0.restore_from_snapshot(req).await
        }
        fn supports_snapshot(&self) -> bool {
            true
        }
        async fn take_snapshot(&self, _provider_object_id: &str) -> Result<SnapshotResponse, ProviderError> {
            Err(ProviderError::transient("provider unavailable"))
        }
    }

    let controller = controller_with(store.clone(), Arc::new(FailingSnapshotProvider(provider)), test_secrets().await);
    let outcome = controller.snapshot("execution_complete").await.unwrap();
    assert!(matches!(outcome, SnapshotOutcome::Failed));

    let sandbox = store.get_sandbox().await.unwrap().unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Failed);
}
