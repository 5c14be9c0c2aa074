//! Sandbox Event Router (spec.md §4.5): persists every inbound sandbox
//! event, then dispatches type-specific side effects and broadcasts it
//! to clients.

use std::collections::HashMap;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::warn;
use uuid::Uuid;

use crate::models::{Event, EventType, GitSyncStatus, now_ms};
use crate::session_store::SessionStore;
use crate::ws::protocol::ServerMessage;

/// Outcome of completing a push, delivered to whoever is waiting on the
/// pending-push map (spec.md §9 "Pending-push map").
#[derive(Debug, Clone)]
pub enum PushOutcome {
    Completed,
    Errored { message: Option<String> },
}

/// An `execution_complete` event, carrying what the actor needs to
/// resolve the right message (spec.md §4.5: prefer the event's own
/// `messageId`, falling back to whatever is currently processing only
/// when the event omits it, to avoid cross-message attribution races).
#[derive(Debug, Clone)]
pub struct ExecutionCompleteOutcome {
    pub message_id: Option<String>,
    pub success: bool,
}

/// Signals the caller (the `SessionActor`'s command loop) what follow-up
/// work is required after dispatching one event.
#[derive(Debug, Clone, Default)]
pub struct RouteOutcome {
    /// `execution_complete` landed — the actor must resolve the message.
    pub execution_complete: Option<ExecutionCompleteOutcome>,
    /// A `git_sync` carried a `sha` — `session.current_sha` must update.
    pub new_current_sha: Option<String>,
}

fn normalize_branch(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Persists the event, dispatches side effects, and broadcasts
/// `sandbox_event` to clients. Returns what the caller still owes:
/// resolving the processing message (left to the prompt queue driver,
/// which the caller re-invokes when `requeue` is set).
pub async fn route(
    store: &SessionStore,
    broadcast_tx: &broadcast::Sender<ServerMessage>,
    pending_push: &mut HashMap<String, oneshot::Sender<PushOutcome>>,
    event_type: EventType,
    data: Value,
) -> Result<RouteOutcome> {
    let message_id = data
        .get("messageId")
        .and_then(Value::as_str)
        .map(str::to_string);

    let event = Event {
        id: Uuid::new_v4().to_string(),
        event_type,
        data_json: serde_json::to_string(&data)?,
        message_id: message_id.clone(),
        created_at: now_ms(),
    };
    store.insert_event(&event).await?;

    let mut outcome = RouteOutcome::default();

    match event_type {
        EventType::ExecutionComplete => {
            let success = data.get("success").and_then(Value::as_bool).unwrap_or(false);
            outcome.execution_complete = Some(ExecutionCompleteOutcome { message_id, success });
        }
        EventType::GitSync => {
            if let Some(status_str) = data.get("status").and_then(Value::as_str) {
                if let Ok(status) = status_str.parse::<GitSyncStatus>() {
                    store.set_git_sync_status(status).await?;
                }
            }
            if let Some(sha) = data.get("sha").and_then(Value::as_str) {
                outcome.new_current_sha = Some(sha.to_string());
            }
        }
        EventType::Heartbeat => {
            store.touch_heartbeat(now_ms()).await?;
        }
        EventType::PushComplete => {
            if let Some(branch) = data.get("branchName").and_then(Value::as_str) {
                let key = normalize_branch(branch);
                if let Some(tx) = pending_push.remove(&key) {
                    let _ = tx.send(PushOutcome::Completed);
                } else {
                    warn!(branch = %branch, "push_complete for unknown/already-resolved branch");
                }
            }
        }
        EventType::PushError => {
            if let Some(branch) = data.get("branchName").and_then(Value::as_str) {
                let key = normalize_branch(branch);
                let message = data
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if let Some(tx) = pending_push.remove(&key) {
                    let _ = tx.send(PushOutcome::Errored { message });
                } else {
                    warn!(branch = %branch, "push_error for unknown/already-resolved branch");
                }
            }
        }
        EventType::ToolCall | EventType::ToolResult | EventType::Token | EventType::Error => {}
    }

    let _ = broadcast_tx.send(ServerMessage::SandboxEvent {
        event: serde_json::to_value(&event)?,
    });

    Ok(outcome)
}

/// Entry point used by the sandbox socket task and the
/// `/internal/sandbox-event` HTTP handler. Deliberately bypasses the
/// actor's command queue (see DESIGN.md "pending push concurrency"):
/// routing persistence/dispatch through the actor would deadlock a
/// `create-pr` handler that is itself blocked for up to 180s waiting on
/// this same event to resolve a pending push.
pub async fn ingest(
    handle: &crate::coordinator::SessionHandle,
    event_type: EventType,
    data: Value,
) -> Result<()> {
    let outcome = {
        let mut guard = handle.pending_push.lock().await;
        route(&handle.store, &handle.broadcast_tx, &mut guard, event_type, data).await?
    };
    if let Some(sha) = outcome.new_current_sha {
        let _ = handle
            .cmd_tx
            .send(crate::session_actor::Command::UpdateCurrentSha(sha))
            .await;
    }
    if let Some(ec) = outcome.execution_complete {
        let _ = handle
            .cmd_tx
            .send(crate::session_actor::Command::CompleteMessage {
                message_id: ec.message_id,
                success: ec.success,
            })
            .await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_branch_case_and_whitespace() {
        assert_eq!(normalize_branch("  Feature/Foo  "), "feature/foo");
    }
}
