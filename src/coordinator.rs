//! Session registry (SPEC_FULL.md §4.1a). Maps a session name to a
//! running `SessionActor`, spawning one lazily on first touch. Holds
//! the handful of structures that must be reachable from more than one
//! task — the broadcast sender, the store handle, and the pending-push
//! map — each individually concurrency-safe per spec.md §5, so no
//! session-wide mutex is needed here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::info;

use crate::config::FileConfig;
use crate::lifecycle::LifecycleController;
use crate::ports::Ports;
use crate::sandbox_event_router::PushOutcome;
use crate::secrets_store::SecretsStore;
use crate::session_actor::{Command, SessionActor};
use crate::session_store::SessionStore;
use crate::ws::protocol::ServerMessage;

pub type PendingPushMap = Arc<Mutex<HashMap<String, oneshot::Sender<PushOutcome>>>>;

/// Everything another task needs to talk to a running session without
/// going through the actor's exclusive command queue for the concerns
/// that are safe to share directly (broadcast fan-out, event
/// persistence, pending-push resolution — see DESIGN.md "pending push
/// concurrency").
#[derive(Clone)]
pub struct SessionHandle {
    pub cmd_tx: mpsc::Sender<Command>,
    pub broadcast_tx: tokio::sync::broadcast::Sender<ServerMessage>,
    pub store: SessionStore,
    pub pending_push: PendingPushMap,
}

impl SessionHandle {
    pub async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .context("session actor is no longer running")?;
        rx.await.context("session actor dropped the reply channel")
    }
}

pub struct Coordinator {
    config: FileConfig,
    ports: Ports,
    secrets: SecretsStore,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl Coordinator {
    /// `secrets` is shared across every session actor this coordinator
    /// spawns — the store is process-wide, keyed by repository, not by
    /// session (spec.md §5).
    pub fn new(config: FileConfig, ports: Ports, secrets: SecretsStore) -> Self {
        Self {
            config,
            ports,
            secrets,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn db_path(&self, session_name: &str) -> PathBuf {
        self.config.server.data_dir.join(format!("{session_name}.sqlite"))
    }

    /// Returns the running session's handle, spawning its actor on first
    /// touch. Per SPEC_FULL.md §4.1a, idle sessions are never evicted —
    /// only the sandbox inside one is reaped.
    pub async fn get_or_spawn(&self, session_name: &str) -> Result<SessionHandle> {
        if let Some(h) = self.sessions.read().await.get(session_name) {
            return Ok(h.clone());
        }
        let mut sessions = self.sessions.write().await;
        if let Some(h) = sessions.get(session_name) {
            return Ok(h.clone());
        }

        let db_path = self.db_path(session_name);
        tokio::fs::create_dir_all(&self.config.server.data_dir)
            .await
            .ok();
        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let store = SessionStore::connect(&db_url).await?;

        let (broadcast_tx, _) = tokio::sync::broadcast::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let pending_push: PendingPushMap = Arc::new(Mutex::new(HashMap::new()));

        let control_plane_url = format!("http://coordinator.internal/{session_name}");
        let lifecycle = LifecycleController::new(
            store.clone(),
            self.ports.clone(),
            self.config.lifecycle.clone(),
            control_plane_url,
            self.secrets.clone(),
        );

        let handle = SessionHandle {
            cmd_tx: cmd_tx.clone(),
            broadcast_tx: broadcast_tx.clone(),
            store: store.clone(),
            pending_push: pending_push.clone(),
        };

        let actor = SessionActor::new(
            session_name.to_string(),
            store,
            self.ports.clone(),
            lifecycle,
            broadcast_tx,
            pending_push,
            cmd_tx,
            cmd_rx,
        );
        tokio::spawn(actor.run());

        info!(session_name, "spawned session actor");
        sessions.insert(session_name.to_string(), handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, session_name: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(session_name).cloned()
    }

    /// Broadcasts a stop command to every live session actor (graceful
    /// shutdown, SPEC_FULL.md §5 "ADDED").
    pub async fn shutdown_all(&self) {
        let sessions = self.sessions.read().await;
        for (name, handle) in sessions.iter() {
            let (tx, rx) = oneshot::channel();
            if handle.cmd_tx.send(Command::Shutdown(tx)).await.is_ok() {
                let _ = rx.await;
            }
            info!(session_name = %name, "session actor shut down");
        }
    }
}
