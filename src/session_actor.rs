//! The centerpiece: one `SessionActor` per session, reached only via its
//! `mpsc::Sender<Command>` (SPEC_FULL.md §4.1a). Owns everything that
//! must observe "at most one active callback at a time" — the
//! in-memory spawning flag, the sandbox socket handle, and the single
//! re-armable alarm. The pending-push map and the broadcast sender are
//! the two exceptions, shared with socket tasks directly (DESIGN.md
//! "pending push concurrency").

use std::collections::HashSet;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use crate::coordinator::PendingPushMap;
use crate::crypto::{generate_token, sha256_hex};
use crate::error::CoordinatorError;
use crate::lifecycle::controller::{SnapshotOutcome, SpawnOutcome};
use crate::lifecycle::decisions::{HeartbeatDecision, InactivityDecision, WarmDecision};
use crate::lifecycle::{Alarm, LifecycleController};
use crate::models::{
    Artifact, ArtifactType, EventType, Message, MessageSource, MessageStatus, Participant,
    ParticipantRole, Session, SessionStatus, WsClientMapping, now_ms,
};
use crate::pr_flow;
use crate::ports::Ports;
use crate::session_store::SessionStore;
use crate::ws::protocol::{SandboxCommand, ServerMessage};
use crate::ws::{CloseReason, SandboxSocketHandle};

pub struct InitRequest {
    pub session_name: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub title: Option<String>,
    pub model: Option<String>,
    pub user_id: String,
    pub github_login: Option<String>,
    pub github_name: Option<String>,
    pub github_email: Option<String>,
    /// Plaintext host access token — encrypted at rest before storage.
    /// Mutually exclusive with `github_token_encrypted`; plaintext wins
    /// if both are somehow supplied.
    pub github_token: Option<String>,
    /// Already-encrypted host access token, for callers that encrypt
    /// up front instead of handing the coordinator a plaintext secret.
    pub github_token_encrypted: Option<String>,
}

pub struct PromptRequest {
    pub content: String,
    pub author_id: String,
    pub source: MessageSource,
    /// Per-message model override (spec.md §4.3 "message.model >
    /// session.model > default"). `None` over the WS route falls
    /// through to the session's own model, then the configured default.
    pub model: Option<String>,
    pub attachments: Option<Value>,
    pub callback_context: Option<Value>,
}

pub struct EventsQuery {
    pub cursor: Option<i64>,
    pub event_type: Option<EventType>,
    pub message_id: Option<String>,
    pub limit: i64,
}

pub struct MessagesQuery {
    pub cursor: Option<i64>,
    pub status: Option<MessageStatus>,
    pub limit: i64,
}

pub struct EventsPage {
    pub events: Vec<crate::models::Event>,
    pub next_cursor: Option<i64>,
}

pub struct MessagesPage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<i64>,
}

pub struct CreatePrRequest {
    pub user_id: String,
    pub title: String,
    pub body: String,
}

pub struct SandboxAcceptRequest {
    pub declared_sandbox_id: String,
    pub auth_token: String,
    pub socket_id: String,
    pub cmd_tx: mpsc::Sender<SandboxCommand>,
    pub close_tx: oneshot::Sender<CloseReason>,
}

pub enum SandboxAcceptOutcome {
    Accepted,
    Rejected { status: u16, reason: &'static str },
}

pub struct ClientSubscribeRequest {
    pub socket_id: String,
    pub token: String,
    pub client_id: String,
}

pub struct SubscribeAccept {
    pub participant: Participant,
    pub state: Value,
    pub history: Value,
}

/// Everything that can be asked of a session. Processed one at a time
/// by `SessionActor::run` — the "single active callback" invariant
/// from spec.md §5.
pub enum Command {
    Init(InitRequest, oneshot::Sender<Result<(), CoordinatorError>>),
    GetState(oneshot::Sender<Result<Value, CoordinatorError>>),
    EnqueuePrompt(
        PromptRequest,
        oneshot::Sender<Result<(String, i64), CoordinatorError>>,
    ),
    Stop(oneshot::Sender<Result<(), CoordinatorError>>),
    ListParticipants(oneshot::Sender<Result<Vec<Participant>, CoordinatorError>>),
    AddParticipant(
        String,
        ParticipantRole,
        oneshot::Sender<Result<Participant, CoordinatorError>>,
    ),
    ListEvents(
        EventsQuery,
        oneshot::Sender<Result<EventsPage, CoordinatorError>>,
    ),
    ListArtifacts(oneshot::Sender<Result<Vec<Artifact>, CoordinatorError>>),
    ListMessages(
        MessagesQuery,
        oneshot::Sender<Result<MessagesPage, CoordinatorError>>,
    ),
    CreatePr(
        CreatePrRequest,
        oneshot::Sender<Result<Artifact, CoordinatorError>>,
    ),
    MintWsToken(
        String,
        oneshot::Sender<Result<String, CoordinatorError>>,
    ),
    Archive(String, oneshot::Sender<Result<(), CoordinatorError>>),
    Unarchive(String, oneshot::Sender<Result<(), CoordinatorError>>),
    VerifySandboxToken(String, oneshot::Sender<bool>),
    ClientSubscribe(
        ClientSubscribeRequest,
        oneshot::Sender<Result<SubscribeAccept, CoordinatorError>>,
    ),
    ClientDisconnected(String),
    SandboxAccept(
        SandboxAcceptRequest,
        oneshot::Sender<SandboxAcceptOutcome>,
    ),
    SandboxDisconnected(String),
    Typing,
    AlarmFired,
    UpdateCurrentSha(String),
    /// An `execution_complete` sandbox event landed (spec.md §4.5). Sent
    /// from `sandbox_event_router::ingest`, outside the actor's
    /// exclusive state but safe to route through the command queue
    /// since, unlike a push event, nothing inside the actor blocks
    /// waiting for this one to resolve.
    CompleteMessage {
        message_id: Option<String>,
        success: bool,
    },
    Shutdown(oneshot::Sender<()>),
}

pub struct SessionActor {
    session_name: String,
    store: SessionStore,
    ports: Ports,
    lifecycle: LifecycleController,
    broadcast_tx: broadcast::Sender<ServerMessage>,
    pending_push: PendingPushMap,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,

    // actor-exclusive in-memory state (never persisted; cache of the
    // durable store, rebuilt on hibernation recovery per spec.md §5/§9).
    is_spawning: bool,
    sandbox_socket: Option<SandboxSocketHandle>,
    connected_clients: HashSet<String>,
    alarm: Alarm<Command>,
}

impl SessionActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_name: String,
        store: SessionStore,
        ports: Ports,
        lifecycle: LifecycleController,
        broadcast_tx: broadcast::Sender<ServerMessage>,
        pending_push: PendingPushMap,
        cmd_tx: mpsc::Sender<Command>,
        cmd_rx: mpsc::Receiver<Command>,
    ) -> Self {
        let alarm = Alarm::new(cmd_tx.clone());
        Self {
            session_name,
            store,
            ports,
            lifecycle,
            broadcast_tx,
            pending_push,
            cmd_tx,
            cmd_rx,
            is_spawning: false,
            sandbox_socket: None,
            connected_clients: HashSet::new(),
            alarm,
        }
    }

    pub async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            if self.handle(cmd).await {
                break;
            }
        }
        info!(session_name = %self.session_name, "session actor stopped");
    }

    fn broadcast(&self, msg: ServerMessage) {
        let _ = self.broadcast_tx.send(msg);
    }

    /// Returns `true` if the actor should stop its loop.
    async fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Init(req, reply) => {
                let _ = reply.send(self.handle_init(req).await);
            }
            Command::GetState(reply) => {
                let _ = reply.send(self.handle_get_state().await);
            }
            Command::EnqueuePrompt(req, reply) => {
                let result = self.handle_enqueue(req).await;
                let _ = reply.send(result);
                self.drive_queue().await.ok();
            }
            Command::Stop(reply) => {
                let _ = reply.send(self.handle_stop().await);
            }
            Command::ListParticipants(reply) => {
                let _ = reply.send(
                    self.store
                        .list_participants()
                        .await
                        .map_err(CoordinatorError::from),
                );
            }
            Command::AddParticipant(user_id, role, reply) => {
                let _ = reply.send(self.handle_add_participant(user_id, role).await);
            }
            Command::ListEvents(q, reply) => {
                let _ = reply.send(self.handle_list_events(q).await);
            }
            Command::ListArtifacts(reply) => {
                let _ = reply.send(
                    self.store
                        .list_artifacts()
                        .await
                        .map_err(CoordinatorError::from),
                );
            }
            Command::ListMessages(q, reply) => {
                let _ = reply.send(self.handle_list_messages(q).await);
            }
            Command::CreatePr(req, reply) => {
                let result = pr_flow::run(self, req).await;
                let _ = reply.send(result);
            }
            Command::MintWsToken(participant_id, reply) => {
                let _ = reply.send(self.handle_mint_ws_token(&participant_id).await);
            }
            Command::Archive(user_id, reply) => {
                let _ = reply.send(self.handle_archive(&user_id, SessionStatus::Archived).await);
            }
            Command::Unarchive(user_id, reply) => {
                let _ = reply.send(self.handle_archive(&user_id, SessionStatus::Active).await);
            }
            Command::VerifySandboxToken(token, reply) => {
                let _ = reply.send(self.handle_verify_sandbox_token(&token).await);
            }
            Command::ClientSubscribe(req, reply) => {
                let result = self.handle_client_subscribe(req).await;
                if let Ok(accept) = &result {
                    self.connected_clients.insert(accept.participant.id.clone());
                }
                let _ = reply.send(result);
            }
            Command::ClientDisconnected(socket_id) => {
                self.connected_clients.remove(&socket_id);
            }
            Command::SandboxAccept(req, reply) => {
                let outcome = self.handle_sandbox_accept(req).await;
                let _ = reply.send(outcome);
                self.drive_queue().await.ok();
            }
            Command::SandboxDisconnected(socket_id) => {
                if self
                    .sandbox_socket
                    .as_ref()
                    .map(|_| true)
                    .unwrap_or(false)
                {
                    // Only the current owner clears the slot; a stale
                    // disconnect from a superseded socket is a no-op.
                    let _ = socket_id;
                    self.sandbox_socket = None;
                }
            }
            Command::Typing => {
                self.handle_typing().await;
            }
            Command::AlarmFired => {
                self.handle_alarm().await;
            }
            Command::UpdateCurrentSha(sha) => {
                let _ = self.store.update_session_shas(None, Some(&sha)).await;
            }
            Command::CompleteMessage { message_id, success } => {
                self.handle_complete_message(message_id, success).await;
                self.drive_queue().await.ok();
            }
            Command::Shutdown(reply) => {
                self.alarm.cancel();
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    // ---- init / state --------------------------------------------------

    async fn handle_init(&mut self, req: InitRequest) -> Result<(), CoordinatorError> {
        if self.store.get_session().await.map_err(CoordinatorError::from)?.is_some() {
            return Err(CoordinatorError::Validation(
                "session already initialized".into(),
            ));
        }
        let session = Session::new(
            Uuid::new_v4().to_string(),
            req.session_name,
            req.repo_owner,
            req.repo_name,
            req.title,
            req.model,
        );
        self.store.insert_session(&session).await.map_err(CoordinatorError::from)?;
        self.store.ensure_sandbox_row().await.map_err(CoordinatorError::from)?;

        let mut owner = Participant::new(Uuid::new_v4().to_string(), req.user_id, ParticipantRole::Owner);
        owner.github_login = req.github_login;
        owner.github_name = req.github_name;
        owner.github_email = req.github_email;
        self.store.insert_participant(&owner).await.map_err(CoordinatorError::from)?;

        let encrypted = if let Some(plain) = req.github_token {
            Some(
                self.ports
                    .cipher
                    .encrypt(&plain)
                    .map_err(CoordinatorError::Internal)?,
            )
        } else {
            req.github_token_encrypted
        };
        if let Some(encrypted) = encrypted {
            self.store
                .set_host_tokens(&owner.id, &encrypted, None, 0)
                .await
                .map_err(CoordinatorError::from)?;
        }
        Ok(())
    }

    async fn handle_get_state(&self) -> Result<Value, CoordinatorError> {
        let session = self
            .store
            .get_session()
            .await
            .map_err(CoordinatorError::from)?
            .ok_or_else(|| CoordinatorError::NotFound("no session".into()))?;
        let sandbox = self.store.ensure_sandbox_row().await.map_err(CoordinatorError::from)?;
        Ok(json!({ "session": session, "sandbox": sandbox }))
    }

    // ---- prompt queue (spec.md §4.3) -----------------------------------

    async fn handle_enqueue(&mut self, req: PromptRequest) -> Result<(String, i64), CoordinatorError> {
        let attachments_json = req
            .attachments
            .map(|v| serde_json::to_string(&v))
            .transpose()
            .map_err(anyhow::Error::from)?;
        let callback_context_json = req
            .callback_context
            .map(|v| serde_json::to_string(&v))
            .transpose()
            .map_err(anyhow::Error::from)?;
        let msg = Message::new(
            Uuid::new_v4().to_string(),
            req.author_id,
            req.content,
            req.source,
            req.model,
            attachments_json,
            callback_context_json,
        );
        let position = self.store.enqueue_message(&msg).await.map_err(CoordinatorError::from)?;
        self.broadcast(ServerMessage::PromptQueued {
            message_id: msg.id.clone(),
            position,
        });
        Ok((msg.id, position))
    }

    /// SPEC_FULL.md §4.3 driver, steps 1-4.
    async fn drive_queue(&mut self) -> Result<()> {
        if self.store.get_processing_message().await?.is_some() {
            return Ok(());
        }
        let Some(msg) = self.store.get_oldest_pending_message().await? else {
            return Ok(());
        };

        if self.sandbox_socket.is_none() {
            self.attempt_spawn().await?;
            return Ok(());
        }

        let session = self.store.get_session().await?.context("no session")?;
        let now = now_ms();
        self.store.mark_message_processing(&msg.id).await?;
        self.store.touch_last_activity(now).await?;

        let model = msg
            .model
            .clone()
            .or(session.model.clone())
            .unwrap_or_else(|| "claude-default".to_string());
        let author = self.store.get_participant_by_id(&msg.author_participant_id).await?;
        let command = SandboxCommand::Prompt {
            message_id: msg.id.clone(),
            content: msg.content.clone(),
            model,
            author: serde_json::to_value(&author).unwrap_or(Value::Null),
            attachments: msg
                .attachments_json
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok()),
        };
        if let Some(socket) = &self.sandbox_socket {
            if socket.cmd_tx.send(command).await.is_err() {
                warn!(session_name = %self.session_name, "sandbox socket gone while dispatching prompt");
                self.sandbox_socket = None;
            }
        }
        Ok(())
    }

    async fn attempt_spawn(&mut self) -> Result<()> {
        let session = self.store.get_session().await?.context("no session")?;
        self.is_spawning = true;
        self.broadcast(ServerMessage::SandboxSpawning);
        let outcome = self
            .lifecycle
            .attempt_spawn(
                &session.id,
                session.repo_id.as_deref(),
                &session.repo_owner,
                &session.repo_name,
                session.model.as_deref(),
                self.is_spawning,
                self.sandbox_socket.is_some(),
            )
            .await;
        self.is_spawning = false;

        match outcome {
            Ok(SpawnOutcome::Spawned { .. }) => {}
            Ok(SpawnOutcome::Restored { .. }) => {
                self.broadcast(ServerMessage::SandboxRestored {
                    message: "sandbox restored from snapshot".into(),
                });
            }
            Ok(SpawnOutcome::Skipped { reason }) => {
                info!(session_name = %self.session_name, reason, "spawn skipped");
            }
            Ok(SpawnOutcome::Waiting) => {}
            Ok(SpawnOutcome::Failed { message, .. }) => {
                self.broadcast(ServerMessage::SandboxError { error: message });
            }
            Err(e) => {
                warn!(error = %e, "spawn attempt errored");
                self.broadcast(ServerMessage::SandboxError {
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// SPEC_FULL.md §4.3/§4.5 "the hard part": resolves a processing
    /// message to completed/failed, fires the `execution_complete`
    /// snapshot, notifies the outbound callback if one was requested,
    /// and stamps activity so the queue driver and alarm both see a
    /// session that just did something.
    async fn handle_complete_message(&mut self, message_id: Option<String>, success: bool) {
        let resolved_id = match message_id {
            Some(id) => Some(id),
            None => match self.store.get_processing_message().await {
                Ok(Some(msg)) => Some(msg.id),
                Ok(None) => None,
                Err(e) => {
                    warn!(error = %e, "failed to look up processing message for execution_complete");
                    None
                }
            },
        };
        let Some(id) = resolved_id else {
            warn!(session_name = %self.session_name, "execution_complete with no resolvable message");
            return;
        };
        match self.store.mark_message_completed(&id, success).await {
            Ok(0) => {
                warn!(
                    message_id = %id,
                    "execution_complete for a message that was not processing; ignoring duplicate/late event"
                );
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, message_id = %id, "failed to mark message completed");
                return;
            }
        }

        let now = now_ms();
        let _ = self.store.touch_last_activity(now).await;

        match self.lifecycle.snapshot("execution_complete").await {
            Ok(SnapshotOutcome::Saved { image_id }) => {
                self.broadcast(ServerMessage::SnapshotSaved {
                    image_id,
                    reason: "execution_complete".to_string(),
                });
            }
            Ok(SnapshotOutcome::Ineligible) => {}
            Ok(SnapshotOutcome::Failed) => {}
            Err(e) => warn!(error = %e, "execution_complete snapshot failed"),
        }

        self.fire_completion_callback(&id, success).await;
        self.rearm_alarm(self.lifecycle.min_check_ms());
    }

    /// Posts the outbound completion notification (spec.md §6 "Outbound
    /// callbacks") when the message carries a `callback_context` and a
    /// process-wide callback URL is configured. Runs detached so a slow
    /// or unreachable third party never holds up the actor's loop.
    async fn fire_completion_callback(&self, message_id: &str, success: bool) {
        let Some(url) = self.ports.callback_url.clone() else {
            return;
        };
        let Ok(Some(msg)) = self.store.get_message(message_id).await else {
            return;
        };
        let Some(ctx_json) = msg.callback_context_json else {
            return;
        };
        let context: Value = match serde_json::from_str(&ctx_json) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "callback_context is not valid JSON, skipping callback");
                return;
            }
        };
        let Ok(Some(session)) = self.store.get_session().await else {
            return;
        };
        let callback = self.ports.callback.clone();
        let session_id = session.id;
        let message_id = message_id.to_string();
        tokio::spawn(async move {
            callback
                .notify_completion(&url, &session_id, &message_id, success, context)
                .await;
        });
    }

    async fn handle_stop(&mut self) -> Result<(), CoordinatorError> {
        if let Some(socket) = &self.sandbox_socket {
            let _ = socket.cmd_tx.send(SandboxCommand::Stop).await;
        }
        Ok(())
    }

    // ---- participants ----------------------------------------------------

    async fn handle_add_participant(
        &mut self,
        user_id: String,
        role: ParticipantRole,
    ) -> Result<Participant, CoordinatorError> {
        if let Some(existing) = self
            .store
            .get_participant_by_user_id(&user_id)
            .await
            .map_err(CoordinatorError::from)?
        {
            return Ok(existing);
        }
        let p = Participant::new(Uuid::new_v4().to_string(), user_id, role);
        self.store.insert_participant(&p).await.map_err(CoordinatorError::from)?;
        Ok(p)
    }

    async fn handle_mint_ws_token(&mut self, participant_id: &str) -> Result<String, CoordinatorError> {
        self.store
            .get_participant_by_id(participant_id)
            .await
            .map_err(CoordinatorError::from)?
            .ok_or_else(|| CoordinatorError::NotFound("no such participant".into()))?;
        let token = generate_token();
        let hash = sha256_hex(&token);
        self.store
            .set_ws_auth_token_hash(participant_id, &hash)
            .await
            .map_err(CoordinatorError::from)?;
        Ok(token)
    }

    async fn handle_archive(
        &mut self,
        user_id: &str,
        status: SessionStatus,
    ) -> Result<(), CoordinatorError> {
        self.store
            .get_participant_by_user_id(user_id)
            .await
            .map_err(CoordinatorError::from)?
            .ok_or_else(|| CoordinatorError::Auth("unknown participant".into()))?;
        self.store.set_session_status(status).await.map_err(CoordinatorError::from)?;
        self.broadcast(ServerMessage::SessionStatus {
            status: status.as_str().to_string(),
        });
        Ok(())
    }

    // ---- events / messages / artifacts listing ---------------------------

    async fn handle_list_events(&self, q: EventsQuery) -> Result<EventsPage, CoordinatorError> {
        let events = self
            .store
            .list_events(q.cursor, q.event_type, q.message_id.as_deref(), q.limit)
            .await
            .map_err(CoordinatorError::from)?;
        let next_cursor = events.last().map(|e| e.created_at);
        Ok(EventsPage { events, next_cursor })
    }

    async fn handle_list_messages(&self, q: MessagesQuery) -> Result<MessagesPage, CoordinatorError> {
        let messages = self
            .store
            .list_messages(q.cursor, q.status, q.limit)
            .await
            .map_err(CoordinatorError::from)?;
        let next_cursor = messages.last().map(|m| m.created_at);
        Ok(MessagesPage { messages, next_cursor })
    }

    // ---- sandbox token / connection hub (spec.md §4.2) --------------------

    async fn handle_verify_sandbox_token(&self, token: &str) -> bool {
        let Ok(Some(sandbox)) = self.store.get_sandbox().await else {
            return false;
        };
        sandbox.auth_token.as_deref() == Some(token) && !sandbox.status.is_terminal()
    }

    async fn handle_sandbox_accept(&mut self, req: SandboxAcceptRequest) -> SandboxAcceptOutcome {
        let Ok(Some(sandbox)) = self.store.get_sandbox().await else {
            return SandboxAcceptOutcome::Rejected {
                status: 404,
                reason: "no sandbox row",
            };
        };
        if sandbox.status.is_terminal() {
            return SandboxAcceptOutcome::Rejected {
                status: 410,
                reason: "sandbox is terminal",
            };
        }
        let expected_id = sandbox.external_sandbox_id.as_deref();
        let expected_token = sandbox.auth_token.as_deref();
        if expected_id != Some(req.declared_sandbox_id.as_str())
            || expected_token != Some(req.auth_token.as_str())
        {
            return SandboxAcceptOutcome::Rejected {
                status: 401,
                reason: "sandbox id/token mismatch",
            };
        }

        if let Some(prev) = self.sandbox_socket.take() {
            let _ = prev.close_tx.send(CloseReason::Superseded);
        }
        self.sandbox_socket = Some(SandboxSocketHandle {
            cmd_tx: req.cmd_tx,
            close_tx: req.close_tx,
        });

        let now = now_ms();
        if self.store.set_sandbox_status(crate::models::SandboxStatus::Ready).await.is_err() {
            return SandboxAcceptOutcome::Rejected {
                status: 500,
                reason: "failed to persist ready status",
            };
        }
        let _ = self.store.touch_last_activity(now).await;
        self.broadcast(ServerMessage::SandboxStatus {
            status: crate::models::SandboxStatus::Ready,
        });
        self.rearm_alarm(self.lifecycle_min_check_ms());
        SandboxAcceptOutcome::Accepted
    }

    fn lifecycle_min_check_ms(&self) -> i64 {
        self.lifecycle.min_check_ms()
    }

    fn rearm_alarm(&mut self, delay_ms: i64) {
        self.alarm.rearm(delay_ms, Command::AlarmFired);
    }

    // ---- client subscribe (connection hub, spec.md §4.2) ------------------

    async fn handle_client_subscribe(
        &mut self,
        req: ClientSubscribeRequest,
    ) -> Result<SubscribeAccept, CoordinatorError> {
        let hash = sha256_hex(&req.token);
        let participant = self
            .store
            .get_participant_by_ws_token_hash(&hash)
            .await
            .map_err(CoordinatorError::from)?
            .ok_or_else(|| CoordinatorError::Auth("invalid WebSocket token".into()))?;

        self.store
            .insert_ws_client_mapping(&WsClientMapping {
                socket_id: req.socket_id,
                participant_id: participant.id.clone(),
                client_id: req.client_id,
                created_at: now_ms(),
            })
            .await
            .map_err(CoordinatorError::from)?;

        let state = self.handle_get_state().await.unwrap_or(Value::Null);
        let messages = self.store.recent_messages(100).await.map_err(CoordinatorError::from)?;
        let events = self.store.recent_events(500).await.map_err(CoordinatorError::from)?;
        let history = json!({ "messages": messages, "events": events });

        Ok(SubscribeAccept {
            participant,
            state,
            history,
        })
    }

    // ---- warm decision (spec.md §4.4.7) ------------------------------------

    async fn handle_typing(&mut self) {
        let Ok(decision) = self
            .lifecycle
            .maybe_warm(self.is_spawning, self.sandbox_socket.is_some())
            .await
        else {
            return;
        };
        if decision == WarmDecision::Spawn {
            self.broadcast(ServerMessage::SandboxWarming);
            let _ = self.attempt_spawn().await;
        }
    }

    // ---- alarm (spec.md §4.4.5 / §4.4.6, combined per §4.4a) ---------------

    async fn handle_alarm(&mut self) {
        let connected = self.connected_clients.len();
        match self.lifecycle.check_inactivity(connected).await {
            Ok(InactivityDecision::Extend { next_check_ms }) => {
                self.broadcast(ServerMessage::SandboxWarning {
                    message: "session will be snapshotted soon due to inactivity".into(),
                });
                self.rearm_alarm(next_check_ms);
                return;
            }
            Ok(InactivityDecision::Timeout) => {
                // spec.md §4.4.5: first set status=stopped and broadcast
                // (blocks reconnection), then issue the snapshot, then
                // shut the sandbox down.
                let _ = self
                    .store
                    .set_sandbox_status(crate::models::SandboxStatus::Stopped)
                    .await;
                self.broadcast(ServerMessage::SandboxStatus {
                    status: crate::models::SandboxStatus::Stopped,
                });
                match self.lifecycle.snapshot("inactivity_timeout").await {
                    Ok(SnapshotOutcome::Saved { image_id }) => {
                        self.broadcast(ServerMessage::SnapshotSaved {
                            image_id,
                            reason: "inactivity_timeout".to_string(),
                        });
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "inactivity_timeout snapshot failed"),
                }
                if let Some(socket) = self.sandbox_socket.take() {
                    let _ = socket.cmd_tx.send(SandboxCommand::Shutdown).await;
                    let _ = socket.close_tx.send(CloseReason::Shutdown);
                }
                self.rearm_alarm(self.lifecycle_min_check_ms());
                return;
            }
            Ok(InactivityDecision::Schedule { next_check_ms }) => {
                match self.lifecycle.check_heartbeat().await {
                    Ok(HeartbeatDecision::Stale) => {
                        let _ = self
                            .store
                            .set_sandbox_status(crate::models::SandboxStatus::Stale)
                            .await;
                        self.broadcast(ServerMessage::SandboxStatus {
                            status: crate::models::SandboxStatus::Stale,
                        });
                        // fire-and-forget per spec.md §4.4.6 — the alarm
                        // still reschedules on the normal cadence below
                        // rather than waiting on the snapshot call.
                        let lifecycle = self.lifecycle.clone();
                        let broadcast_tx = self.broadcast_tx.clone();
                        tokio::spawn(async move {
                            match lifecycle.snapshot("heartbeat_timeout").await {
                                Ok(SnapshotOutcome::Saved { image_id }) => {
                                    let _ = broadcast_tx.send(ServerMessage::SnapshotSaved {
                                        image_id,
                                        reason: "heartbeat_timeout".to_string(),
                                    });
                                }
                                Ok(_) => {}
                                Err(e) => warn!(error = %e, "heartbeat_timeout snapshot failed"),
                            }
                        });
                    }
                    _ => {}
                }
                self.rearm_alarm(next_check_ms);
            }
            Err(e) => {
                warn!(error = %e, "inactivity check failed");
                self.rearm_alarm(self.lifecycle_min_check_ms());
            }
        }
    }

    // ---- accessors used by pr_flow (module-private to the crate) ----------

    pub(crate) fn session_name(&self) -> &str {
        &self.session_name
    }

    pub(crate) fn store(&self) -> &SessionStore {
        &self.store
    }

    pub(crate) fn ports(&self) -> &Ports {
        &self.ports
    }

    pub(crate) fn pending_push(&self) -> &PendingPushMap {
        &self.pending_push
    }

    pub(crate) fn sandbox_cmd_tx(&self) -> Option<mpsc::Sender<SandboxCommand>> {
        self.sandbox_socket.as_ref().map(|s| s.cmd_tx.clone())
    }

    pub(crate) fn broadcast_pub(&self, msg: ServerMessage) {
        self.broadcast(msg);
    }
}
