//! Effect layer: wires the pure decisions in `super::decisions` to the
//! session's store and external ports. `SessionActor` is the only
//! caller — this module never touches a socket or a channel directly.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::LifecycleFileConfig;
use crate::crypto::generate_token;
use crate::models::{GitSyncStatus, SandboxStatus, now_ms};
use crate::ports::Ports;
use crate::ports::provider::{CreateSandboxRequest, ProviderErrorType, RestoreSandboxRequest};
use crate::secrets_store::SecretsStore;
use crate::session_store::SessionStore;

use super::decisions::{
    CircuitBreakerConfig, CircuitBreakerDecision, HeartbeatDecision, InactivityConfig,
    InactivityDecision, InactivityInput, SpawnConfig, SpawnDecision, SpawnDecisionInput,
    WarmDecision, circuit_breaker_decision, heartbeat_decision, inactivity_decision, snapshot_eligible,
    spawn_decision, warm_decision,
};

#[derive(Debug, Clone)]
pub enum SpawnOutcome {
    Skipped { reason: String },
    Waiting,
    Spawned { provider_object_id: String },
    Restored { provider_object_id: String },
    Failed { transient: bool, message: String },
}

/// Outcome of `LifecycleController::snapshot` (spec.md §4.4.8).
#[derive(Debug, Clone)]
pub enum SnapshotOutcome {
    /// Preconditions weren't met (no provider object id, provider
    /// doesn't support snapshotting, or already snapshotting).
    Ineligible,
    Saved { image_id: String },
    Failed,
}

#[derive(Clone)]
pub struct LifecycleController {
    store: SessionStore,
    ports: Ports,
    config: LifecycleFileConfig,
    control_plane_url: String,
    /// Process-wide repository secrets store (spec.md §4.7), consulted
    /// on every spawn/restore attempt so the provider call is the one
    /// place secrets get materialized into a sandbox.
    secrets: SecretsStore,
}

impl LifecycleController {
    pub fn new(
        store: SessionStore,
        ports: Ports,
        config: LifecycleFileConfig,
        control_plane_url: String,
        secrets: SecretsStore,
    ) -> Self {
        Self {
            store,
            ports,
            config,
            control_plane_url,
            secrets,
        }
    }

    fn cb_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            threshold: self.config.circuit_breaker_threshold,
            window_ms: self.config.circuit_breaker_window_ms,
        }
    }

    fn spawn_config(&self) -> SpawnConfig {
        SpawnConfig {
            cooldown_ms: self.config.spawn_cooldown_ms,
            ready_wait_ms: self.config.ready_wait_ms,
        }
    }

    fn inactivity_config(&self) -> InactivityConfig {
        InactivityConfig {
            timeout_ms: self.config.inactivity_timeout_ms,
            extension_ms: self.config.inactivity_extension_ms,
            min_check_ms: self.config.min_check_ms,
        }
    }

    /// The floor the actor re-arms its alarm to after an error or a
    /// terminal transition — config-driven rather than a literal so a
    /// deployment can tune it alongside the rest of `[lifecycle]`.
    pub fn min_check_ms(&self) -> i64 {
        self.config.min_check_ms
    }

    /// Evaluates and, if warranted, executes a spawn or restore attempt.
    /// `in_memory_spawning` and `has_active_socket` come from the actor's
    /// own state — they never persist, by design (SPEC_FULL.md §4.4a).
    #[allow(clippy::too_many_arguments)]
    pub async fn attempt_spawn(
        &self,
        session_id: &str,
        repo_id: Option<&str>,
        repo_owner: &str,
        repo_name: &str,
        model: Option<&str>,
        in_memory_spawning: bool,
        has_active_socket: bool,
    ) -> Result<SpawnOutcome> {
        let sandbox = self.store.ensure_sandbox_row().await?;
        let now = now_ms();

        // Decrypted once up front: a decryption failure is terminal
        // (spec.md §4.7) and should block the provider call rather than
        // materialize a half-populated secret set.
        let secrets = match repo_id {
            Some(id) => match self.secrets.decrypt_all(id).await {
                Ok(values) => values,
                Err(e) => {
                    return self.record_failure(now, &format!("repository secrets: {e}"), ProviderErrorType::Permanent).await;
                }
            },
            None => Vec::new(),
        };

        let cb = circuit_breaker_decision(
            sandbox.failure_count.max(0) as u32,
            sandbox.last_failure_at,
            self.cb_config(),
            now,
        );
        match cb {
            CircuitBreakerDecision::Block { wait_ms } => {
                return Ok(SpawnOutcome::Skipped {
                    reason: format!("circuit breaker open for {wait_ms}ms more"),
                });
            }
            CircuitBreakerDecision::Proceed { reset: true } => {
                self.store.reset_failure_count().await?;
            }
            CircuitBreakerDecision::Proceed { reset: false } => {}
        }

        let decision = spawn_decision(
            SpawnDecisionInput {
                status: sandbox.status,
                created_at: sandbox.created_at,
                has_snapshot_image: sandbox.snapshot_image_id.is_some(),
                has_active_socket,
                in_memory_spawning,
                now,
            },
            self.spawn_config(),
        );

        match decision {
            SpawnDecision::Skip { reason } => Ok(SpawnOutcome::Skipped {
                reason: reason.to_string(),
            }),
            SpawnDecision::Wait => Ok(SpawnOutcome::Waiting),
            SpawnDecision::Restore => {
                let snapshot_image_id = sandbox
                    .snapshot_image_id
                    .clone()
                    .context("restore decision without a snapshot image id")?;
                self.begin_attempt(repo_owner, repo_name, SandboxStatus::Spawning, now).await?;
                let external_sandbox_id = self.store.get_sandbox().await?.context("sandbox row vanished")?.external_sandbox_id.context("missing external id after begin_attempt")?;
                let auth_token = self.store.get_sandbox().await?.context("sandbox row vanished")?.auth_token.context("missing auth token after begin_attempt")?;
                match self
                    .ports
                    .provider
                    .restore_from_snapshot(RestoreSandboxRequest {
                        session_id: session_id.to_string(),
                        expected_sandbox_id: external_sandbox_id.clone(),
                        snapshot_image_id,
                        control_plane_url: self.control_plane_url.clone(),
                        auth_token,
                        secrets: secrets.clone(),
                    })
                    .await
                {
                    Ok(resp) => {
                        self.store.set_provider_object_id(&resp.provider_object_id).await?;
                        self.store.set_sandbox_status(SandboxStatus::Connecting).await?;
                        info!(session_id, "restored sandbox from snapshot");
                        Ok(SpawnOutcome::Restored {
                            provider_object_id: resp.provider_object_id,
                        })
                    }
                    Err(e) => self.record_failure(now, &e.message, e.kind).await,
                }
            }
            SpawnDecision::Spawn => {
                self.begin_attempt(repo_owner, repo_name, SandboxStatus::Spawning, now).await?;
                let sandbox = self.store.get_sandbox().await?.context("sandbox row vanished")?;
                let external_sandbox_id = sandbox.external_sandbox_id.context("missing external id")?;
                let auth_token = sandbox.auth_token.context("missing auth token")?;
                match self
                    .ports
                    .provider
                    .create_sandbox(CreateSandboxRequest {
                        session_id: session_id.to_string(),
                        expected_sandbox_id: external_sandbox_id.clone(),
                        repo_owner: repo_owner.to_string(),
                        repo_name: repo_name.to_string(),
                        control_plane_url: self.control_plane_url.clone(),
                        auth_token,
                        model: model.map(str::to_string),
                        secrets,
                    })
                    .await
                {
                    Ok(resp) => {
                        self.store.set_provider_object_id(&resp.provider_object_id).await?;
                        self.store.set_sandbox_status(SandboxStatus::Connecting).await?;
                        info!(session_id, "spawned new sandbox");
                        Ok(SpawnOutcome::Spawned {
                            provider_object_id: resp.provider_object_id,
                        })
                    }
                    Err(e) => self.record_failure(now, &e.message, e.kind).await,
                }
            }
        }
    }

    async fn begin_attempt(&self, repo_owner: &str, repo_name: &str, status: SandboxStatus, now: i64) -> Result<()> {
        let external_sandbox_id = format!("sandbox-{repo_owner}-{repo_name}-{now}");
        let auth_token = generate_token();
        self.store
            .begin_spawn(&external_sandbox_id, &auth_token, status, now)
            .await
            .context("failed to pre-allocate sandbox id/token before provider call")
    }

    async fn record_failure(
        &self,
        now: i64,
        message: &str,
        kind: ProviderErrorType,
    ) -> Result<SpawnOutcome> {
        self.store.record_spawn_failure(now, message).await?;
        self.store.set_sandbox_status(SandboxStatus::Failed).await?;
        warn!(message, ?kind, "sandbox spawn attempt failed");
        Ok(SpawnOutcome::Failed {
            transient: matches!(kind, ProviderErrorType::Transient),
            message: message.to_string(),
        })
    }

    /// SPEC_FULL.md §4.4.5. Pure decision; the actor owns the side
    /// effects that follow (status transition, broadcast, snapshot) so
    /// that every call site can sequence them per spec.md §4.4.5/§4.4.8.
    pub async fn check_inactivity(&self, connected_client_count: usize) -> Result<InactivityDecision> {
        let sandbox = self.store.ensure_sandbox_row().await?;
        let now = now_ms();
        Ok(inactivity_decision(
            InactivityInput {
                last_activity: sandbox.last_activity,
                status: sandbox.status,
                connected_client_count,
                now,
            },
            self.inactivity_config(),
        ))
    }

    /// SPEC_FULL.md §4.4.8. Callers (`execution_complete`,
    /// `inactivity_timeout`, `heartbeat_timeout`) are expected to have
    /// already persisted whatever terminal status the snapshot should
    /// restore to — `snapshot` only transitions to `snapshotting` when
    /// the current status isn't already terminal, and always restores
    /// the status observed at entry, matching the sticky-terminal
    /// invariant without needing to special-case the reason here.
    pub async fn snapshot(&self, reason: &str) -> Result<SnapshotOutcome> {
        let sandbox = self.store.ensure_sandbox_row().await?;
        if !snapshot_eligible(
            self.ports.provider.supports_snapshot(),
            sandbox.provider_object_id.is_some(),
            true,
            sandbox.status,
        ) {
            return Ok(SnapshotOutcome::Ineligible);
        }
        let previous_status = sandbox.status;
        if !previous_status.is_terminal() {
            self.store.set_sandbox_status(SandboxStatus::Snapshotting).await?;
        }
        let provider_object_id = sandbox.provider_object_id.clone().unwrap();
        match self.ports.provider.take_snapshot(&provider_object_id).await {
            Ok(resp) => {
                self.store.set_snapshot_image_id(&resp.snapshot_image_id).await?;
                self.store.set_sandbox_status(previous_status).await?;
                info!(reason, image_id = %resp.snapshot_image_id, "snapshot saved");
                Ok(SnapshotOutcome::Saved {
                    image_id: resp.snapshot_image_id,
                })
            }
            Err(e) => {
                warn!(error = %e, reason, "snapshot attempt failed; status restoration proceeds anyway");
                self.store.set_sandbox_status(previous_status).await?;
                Ok(SnapshotOutcome::Failed)
            }
        }
    }

    /// SPEC_FULL.md §4.4.6.
    pub async fn check_heartbeat(&self) -> Result<HeartbeatDecision> {
        let sandbox = self.store.ensure_sandbox_row().await?;
        Ok(heartbeat_decision(
            sandbox.last_heartbeat,
            self.config.heartbeat_stale_ms,
            now_ms(),
        ))
    }

    /// SPEC_FULL.md §4.4.7 — called on an idle tick to keep a recently
    /// active session warm without waiting for a new client message.
    pub async fn maybe_warm(&self, in_memory_spawning: bool, has_active_socket: bool) -> Result<WarmDecision> {
        let sandbox = self.store.ensure_sandbox_row().await?;
        Ok(warm_decision(has_active_socket, in_memory_spawning, sandbox.status))
    }

    pub async fn record_git_sync(&self, status: GitSyncStatus) -> Result<()> {
        self.store.set_git_sync_status(status).await
    }
}
