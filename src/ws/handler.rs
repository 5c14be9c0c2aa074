//! WebSocket upgrade + per-socket task shape (SPEC_FULL.md §4.2a /
//! spec.md §4.2). One task per accepted socket, classified as either
//! *sandbox* (by `?type=sandbox`) or *client* — the actor never holds
//! a `WebSocket` across an await shared with other callers.

use std::time::Duration;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::models::EventType;
use crate::session_actor::{ClientSubscribeRequest, Command, SandboxAcceptOutcome, SandboxAcceptRequest};
use crate::ws::protocol::{ClientMessage, SandboxCommand, SandboxEventPayload, ServerMessage, close_codes};
use crate::ws::CloseReason;

const CLIENT_AUTH_DEADLINE: Duration = Duration::from_secs(30);

pub fn router() -> Router<AppState> {
    Router::new().route("/internal/{session}/ws", get(upgrade))
}

#[derive(Deserialize)]
struct UpgradeQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
}

async fn upgrade(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Query(q): Query<UpgradeQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let handle = match state.coordinator.get_or_spawn(&session).await {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, session = %session, "failed to resolve session for ws upgrade");
            return axum::response::IntoResponse::into_response(axum::http::StatusCode::NOT_FOUND);
        }
    };

    if q.kind.as_deref() == Some("sandbox") {
        let declared_sandbox_id = headers
            .get("x-sandbox-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let auth_token = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or_default()
            .to_string();

        // Validated before upgrading (spec.md §4.2/§7): a rejected
        // sandbox connection gets a real HTTP status, not a WS close
        // code, so `410` actually blocks reconnection at the transport
        // level instead of tying up a socket first.
        let socket_id = Uuid::new_v4().to_string();
        let (cmd_tx, cmd_rx) = mpsc::channel::<SandboxCommand>(32);
        let (close_tx, close_rx) = oneshot::channel::<CloseReason>();
        let outcome = handle
            .call(|reply| {
                Command::SandboxAccept(
                    SandboxAcceptRequest {
                        declared_sandbox_id,
                        auth_token,
                        socket_id: socket_id.clone(),
                        cmd_tx,
                        close_tx,
                    },
                    reply,
                )
            })
            .await;

        match outcome {
            Ok(SandboxAcceptOutcome::Accepted) => ws.on_upgrade(move |socket| {
                handle_sandbox_socket(socket, handle, socket_id, cmd_rx, close_rx)
            }),
            Ok(SandboxAcceptOutcome::Rejected { status, reason }) => {
                warn!(status, reason, "sandbox upgrade rejected");
                let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST);
                (code, reason).into_response()
            }
            Err(e) => {
                warn!(error = %e, "sandbox accept command failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    } else {
        ws.on_upgrade(move |socket| handle_client_socket(socket, handle))
    }
}

// ---- client sockets (spec.md §4.2 "Client upgrades") -----------------------

async fn handle_client_socket(socket: WebSocket, handle: crate::coordinator::SessionHandle) {
    let socket_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let subscribed = timeout(CLIENT_AUTH_DEADLINE, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(ClientMessage::Subscribe { token, client_id }) =
                    serde_json::from_str::<ClientMessage>(&text)
                {
                    return Some((token, client_id));
                }
            }
        }
        None
    })
    .await;

    let (token, client_id) = match subscribed {
        Ok(Some(pair)) => pair,
        _ => {
            let _ = close_with(&mut sender, close_codes::AUTH_TIMEOUT, "authentication timeout").await;
            return;
        }
    };

    let accept = handle
        .call(|reply| {
            Command::ClientSubscribe(
                ClientSubscribeRequest {
                    socket_id: socket_id.clone(),
                    token,
                    client_id,
                },
                reply,
            )
        })
        .await;

    let accept = match accept {
        Ok(Ok(accept)) => accept,
        _ => {
            let _ = close_with(&mut sender, close_codes::INVALID_AUTH, "invalid WebSocket token").await;
            return;
        }
    };

    let session_id = handle
        .store
        .get_session()
        .await
        .ok()
        .flatten()
        .map(|s| s.id)
        .unwrap_or_default();
    let participant_id = accept.participant.id.clone();
    let welcome = ServerMessage::Subscribed {
        session_id,
        state: accept.state,
        participant_id: participant_id.clone(),
        participant: accept.participant,
    };
    if send_json(&mut sender, &welcome).await.is_err() {
        return;
    }
    let _ = send_json(&mut sender, &ServerMessage::History { history: accept.history }).await;

    let mut broadcast_rx = handle.broadcast_tx.subscribe();
    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !dispatch_client_message(&handle, &participant_id, &text).await {
                            break;
                        }
                        if let Ok(ClientMessage::Ping) = serde_json::from_str::<ClientMessage>(&text) {
                            if send_json(&mut sender, &ServerMessage::Pong { timestamp: crate::models::now_ms() }).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "client websocket error");
                        break;
                    }
                    _ => {}
                }
            }
            event = broadcast_rx.recv() => {
                match event {
                    Ok(msg) => {
                        if send_json(&mut sender, &msg).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(n, "client socket lagged on broadcast channel");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    let _ = handle.cmd_tx.send(Command::ClientDisconnected(socket_id)).await;
    info!(client_id = %client_id, "client socket closed");
}

/// Handles one inbound client frame. Returns `false` if the socket
/// should close (client sent `Message::Close` is handled by the
/// caller; this only covers protocol-level stop conditions).
async fn dispatch_client_message(
    handle: &crate::coordinator::SessionHandle,
    participant_id: &str,
    text: &str,
) -> bool {
    let Ok(msg) = serde_json::from_str::<ClientMessage>(text) else {
        return true;
    };
    match msg {
        ClientMessage::Ping | ClientMessage::Subscribe { .. } => {}
        ClientMessage::Prompt { content, model, attachments } => {
            let _ = handle
                .call(|reply| {
                    Command::EnqueuePrompt(
                        crate::session_actor::PromptRequest {
                            content,
                            author_id: participant_id.to_string(),
                            source: crate::models::MessageSource::Web,
                            model,
                            attachments,
                            callback_context: None,
                        },
                        reply,
                    )
                })
                .await;
        }
        ClientMessage::Stop => {
            let _ = handle.call(Command::Stop).await;
        }
        ClientMessage::Typing => {
            let _ = handle.cmd_tx.send(Command::Typing).await;
        }
        ClientMessage::Presence { .. } => {}
    }
    true
}

// ---- sandbox sockets (spec.md §4.2 "Accepting connections") ---------------

async fn handle_sandbox_socket(
    socket: WebSocket,
    handle: crate::coordinator::SessionHandle,
    socket_id: String,
    mut cmd_rx: mpsc::Receiver<SandboxCommand>,
    mut close_rx: oneshot::Receiver<CloseReason>,
) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        route_sandbox_event(&handle, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "sandbox websocket error");
                        break;
                    }
                    _ => {}
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => {
                        if send_json(&mut sender, &cmd).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            reason = &mut close_rx => {
                let (code, text) = match reason {
                    Ok(CloseReason::Superseded) => (1000, "New sandbox connecting"),
                    Ok(CloseReason::Shutdown) => (1000, "session shutting down"),
                    Err(_) => (1000, "closed"),
                };
                let _ = close_with(&mut sender, code, text).await;
                return;
            }
        }
    }

    let _ = handle.cmd_tx.send(Command::SandboxDisconnected(socket_id)).await;
}

async fn route_sandbox_event(handle: &crate::coordinator::SessionHandle, text: &str) {
    let Ok(payload) = serde_json::from_str::<SandboxEventPayload>(text) else {
        warn!("unparseable sandbox event frame");
        return;
    };
    let Ok(raw) = serde_json::from_str::<serde_json::Value>(text) else {
        return;
    };
    let event_type = match &payload {
        SandboxEventPayload::ToolCall { .. } => EventType::ToolCall,
        SandboxEventPayload::ToolResult { .. } => EventType::ToolResult,
        SandboxEventPayload::Token { .. } => EventType::Token,
        SandboxEventPayload::Error { .. } => EventType::Error,
        SandboxEventPayload::GitSync { .. } => EventType::GitSync,
        SandboxEventPayload::ExecutionComplete { .. } => EventType::ExecutionComplete,
        SandboxEventPayload::Heartbeat => EventType::Heartbeat,
        SandboxEventPayload::PushComplete { .. } => EventType::PushComplete,
        SandboxEventPayload::PushError { .. } => EventType::PushError,
    };
    if let Err(e) = crate::sandbox_event_router::ingest(handle, event_type, raw).await {
        warn!(error = %e, "failed to route sandbox event");
    }
}

// ---- shared socket helpers --------------------------------------------------

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &impl serde::Serialize,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).unwrap_or_default();
    sender.send(Message::Text(text.into())).await
}

async fn close_with(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await
}
