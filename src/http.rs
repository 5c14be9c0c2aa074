//! `/internal/*` HTTP surface (spec.md §6). Each handler resolves a
//! session through the `Coordinator` registry, translates its request
//! into a `Command`, and round-trips it via `SessionHandle::call` —
//! the same path a WebSocket-originated action takes, so both
//! transports share one implementation of every invariant.

use std::str::FromStr;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::AppState;
use crate::error::{CoordinatorError, Result};
use crate::models::{EventType, MessageSource, MessageStatus, ParticipantRole};
use crate::session_actor::{
    Command, CreatePrRequest, EventsQuery, InitRequest, MessagesQuery, PromptRequest,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/internal/{session}/init", post(init))
        .route("/internal/{session}/state", get(state))
        .route("/internal/{session}/prompt", post(prompt))
        .route("/internal/{session}/stop", post(stop))
        .route("/internal/{session}/sandbox-event", post(sandbox_event))
        .route(
            "/internal/{session}/participants",
            get(list_participants).post(add_participant),
        )
        .route("/internal/{session}/events", get(list_events))
        .route("/internal/{session}/artifacts", get(list_artifacts))
        .route("/internal/{session}/messages", get(list_messages))
        .route("/internal/{session}/create-pr", post(create_pr))
        .route("/internal/{session}/ws-token", post(ws_token))
        .route("/internal/{session}/archive", post(archive))
        .route("/internal/{session}/unarchive", post(unarchive))
        .route(
            "/internal/{session}/verify-sandbox-token",
            post(verify_sandbox_token),
        )
}

async fn session_handle(
    state: &AppState,
    session: &str,
) -> Result<crate::coordinator::SessionHandle> {
    state
        .coordinator
        .get_or_spawn(session)
        .await
        .map_err(CoordinatorError::Internal)
}

// ---- init / state -----------------------------------------------------

#[derive(Deserialize)]
struct InitBody {
    #[serde(rename = "sessionName")]
    session_name: String,
    #[serde(rename = "repoOwner")]
    repo_owner: String,
    #[serde(rename = "repoName")]
    repo_name: String,
    title: Option<String>,
    model: Option<String>,
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "githubLogin")]
    github_login: Option<String>,
    #[serde(rename = "githubName")]
    github_name: Option<String>,
    #[serde(rename = "githubEmail")]
    github_email: Option<String>,
    #[serde(rename = "githubToken")]
    github_token: Option<String>,
    #[serde(rename = "githubTokenEncrypted")]
    github_token_encrypted: Option<String>,
}

#[derive(Serialize)]
struct InitResponse {
    #[serde(rename = "sessionId")]
    session_id: String,
    status: &'static str,
}

async fn init(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Json(body): Json<InitBody>,
) -> Result<Json<InitResponse>> {
    let handle = session_handle(&state, &session).await?;
    handle
        .call(|reply| {
            Command::Init(
                InitRequest {
                    session_name: body.session_name,
                    repo_owner: body.repo_owner,
                    repo_name: body.repo_name,
                    title: body.title,
                    model: body.model,
                    user_id: body.user_id,
                    github_login: body.github_login,
                    github_name: body.github_name,
                    github_email: body.github_email,
                    github_token: body.github_token,
                    github_token_encrypted: body.github_token_encrypted,
                },
                reply,
            )
        })
        .await
        .map_err(CoordinatorError::Internal)??;
    let session_row = handle
        .store
        .get_session()
        .await
        .map_err(CoordinatorError::Internal)?
        .ok_or_else(|| CoordinatorError::NotFound("no session".into()))?;
    Ok(Json(InitResponse {
        session_id: session_row.id,
        status: "created",
    }))
}

async fn state(State(state): State<AppState>, Path(session): Path<String>) -> Result<Json<Value>> {
    let handle = session_handle(&state, &session).await?;
    let value = handle
        .call(Command::GetState)
        .await
        .map_err(CoordinatorError::Internal)??;
    Ok(Json(value))
}

// ---- prompt / stop ------------------------------------------------------

#[derive(Deserialize)]
struct PromptBody {
    content: String,
    #[serde(rename = "authorId")]
    author_id: String,
    source: String,
    attachments: Option<Value>,
    #[serde(rename = "callbackContext")]
    callback_context: Option<Value>,
}

#[derive(Serialize)]
struct PromptResponse {
    #[serde(rename = "messageId")]
    message_id: String,
    status: &'static str,
}

async fn prompt(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Json(body): Json<PromptBody>,
) -> Result<Json<PromptResponse>> {
    let handle = session_handle(&state, &session).await?;
    let source = MessageSource::from_str(&body.source)
        .map_err(|_| CoordinatorError::Validation(format!("unknown message source {:?}", body.source)))?;
    let (message_id, _position) = handle
        .call(|reply| {
            Command::EnqueuePrompt(
                PromptRequest {
                    content: body.content,
                    author_id: body.author_id,
                    source,
                    model: None,
                    attachments: body.attachments,
                    callback_context: body.callback_context,
                },
                reply,
            )
        })
        .await
        .map_err(CoordinatorError::Internal)??;
    Ok(Json(PromptResponse {
        message_id,
        status: "queued",
    }))
}

async fn stop(State(state): State<AppState>, Path(session): Path<String>) -> Result<Json<Value>> {
    let handle = session_handle(&state, &session).await?;
    handle
        .call(Command::Stop)
        .await
        .map_err(CoordinatorError::Internal)??;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

// ---- sandbox-event (HTTP fallback to the socket path) --------------------

#[derive(Deserialize)]
struct SandboxEventBody {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(flatten)]
    data: Value,
}

async fn sandbox_event(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Json(body): Json<SandboxEventBody>,
) -> Result<Json<Value>> {
    let handle = session_handle(&state, &session).await?;
    let event_type = EventType::from_str(&body.event_type)
        .map_err(|_| CoordinatorError::Validation(format!("unknown event type {:?}", body.event_type)))?;
    crate::sandbox_event_router::ingest(&handle, event_type, body.data)
        .await
        .map_err(CoordinatorError::Internal)?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

// ---- participants ---------------------------------------------------------

async fn list_participants(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<Json<Value>> {
    let handle = session_handle(&state, &session).await?;
    let participants = handle
        .call(Command::ListParticipants)
        .await
        .map_err(CoordinatorError::Internal)??;
    Ok(Json(serde_json::to_value(participants).map_err(|e| CoordinatorError::Internal(e.into()))?))
}

#[derive(Deserialize)]
struct AddParticipantBody {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(default)]
    role: Option<String>,
}

async fn add_participant(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Json(body): Json<AddParticipantBody>,
) -> Result<Json<Value>> {
    let handle = session_handle(&state, &session).await?;
    let role = match body.role.as_deref() {
        Some(r) => ParticipantRole::from_str(r)
            .map_err(|_| CoordinatorError::Validation(format!("unknown role {r:?}")))?,
        None => ParticipantRole::Member,
    };
    let participant = handle
        .call(|reply| Command::AddParticipant(body.user_id, role, reply))
        .await
        .map_err(CoordinatorError::Internal)??;
    Ok(Json(serde_json::to_value(participant).map_err(|e| CoordinatorError::Internal(e.into()))?))
}

// ---- events / artifacts / messages listing --------------------------------

#[derive(Deserialize)]
struct EventsQueryParams {
    cursor: Option<i64>,
    limit: Option<i64>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    message_id: Option<String>,
}

const MAX_EVENTS_LIMIT: i64 = 200;
const MAX_MESSAGES_LIMIT: i64 = 100;

async fn list_events(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Query(q): Query<EventsQueryParams>,
) -> Result<Json<Value>> {
    let handle = session_handle(&state, &session).await?;
    let event_type = q
        .event_type
        .as_deref()
        .map(EventType::from_str)
        .transpose()
        .map_err(|_| CoordinatorError::Validation("unknown event type filter".into()))?;
    let limit = q.limit.unwrap_or(MAX_EVENTS_LIMIT).clamp(1, MAX_EVENTS_LIMIT);
    let page = handle
        .call(|reply| {
            Command::ListEvents(
                EventsQuery {
                    cursor: q.cursor,
                    event_type,
                    message_id: q.message_id,
                    limit,
                },
                reply,
            )
        })
        .await
        .map_err(CoordinatorError::Internal)??;
    Ok(Json(serde_json::json!({
        "events": page.events,
        "nextCursor": page.next_cursor,
    })))
}

async fn list_artifacts(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<Json<Value>> {
    let handle = session_handle(&state, &session).await?;
    let artifacts = handle
        .call(Command::ListArtifacts)
        .await
        .map_err(CoordinatorError::Internal)??;
    Ok(Json(serde_json::to_value(artifacts).map_err(|e| CoordinatorError::Internal(e.into()))?))
}

#[derive(Deserialize)]
struct MessagesQueryParams {
    cursor: Option<i64>,
    limit: Option<i64>,
    status: Option<String>,
}

async fn list_messages(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Query(q): Query<MessagesQueryParams>,
) -> Result<Json<Value>> {
    let handle = session_handle(&state, &session).await?;
    let status = q
        .status
        .as_deref()
        .map(MessageStatus::from_str)
        .transpose()
        .map_err(|_| CoordinatorError::Validation("unknown message status filter".into()))?;
    let limit = q.limit.unwrap_or(MAX_MESSAGES_LIMIT).clamp(1, MAX_MESSAGES_LIMIT);
    let page = handle
        .call(|reply| {
            Command::ListMessages(
                MessagesQuery {
                    cursor: q.cursor,
                    status,
                    limit,
                },
                reply,
            )
        })
        .await
        .map_err(CoordinatorError::Internal)??;
    Ok(Json(serde_json::json!({
        "messages": page.messages,
        "nextCursor": page.next_cursor,
    })))
}

// ---- PR / ws-token / archive / verify -------------------------------------

#[derive(Deserialize)]
struct CreatePrBody {
    #[serde(rename = "userId")]
    user_id: String,
    title: String,
    body: String,
}

async fn create_pr(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Json(body): Json<CreatePrBody>,
) -> Result<Json<Value>> {
    let handle = session_handle(&state, &session).await?;
    let artifact = handle
        .call(|reply| {
            Command::CreatePr(
                CreatePrRequest {
                    user_id: body.user_id,
                    title: body.title,
                    body: body.body,
                },
                reply,
            )
        })
        .await
        .map_err(CoordinatorError::Internal)??;
    Ok(Json(serde_json::to_value(artifact).map_err(|e| CoordinatorError::Internal(e.into()))?))
}

#[derive(Deserialize)]
struct WsTokenBody {
    #[serde(rename = "participantId")]
    participant_id: String,
}

async fn ws_token(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Json(body): Json<WsTokenBody>,
) -> Result<Json<Value>> {
    let handle = session_handle(&state, &session).await?;
    let token = handle
        .call(|reply| Command::MintWsToken(body.participant_id, reply))
        .await
        .map_err(CoordinatorError::Internal)??;
    Ok(Json(serde_json::json!({ "token": token })))
}

#[derive(Deserialize)]
struct UserIdBody {
    #[serde(rename = "userId")]
    user_id: String,
}

async fn archive(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Json(body): Json<UserIdBody>,
) -> Result<Json<Value>> {
    let handle = session_handle(&state, &session).await?;
    handle
        .call(|reply| Command::Archive(body.user_id, reply))
        .await
        .map_err(CoordinatorError::Internal)??;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn unarchive(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Json(body): Json<UserIdBody>,
) -> Result<Json<Value>> {
    let handle = session_handle(&state, &session).await?;
    handle
        .call(|reply| Command::Unarchive(body.user_id, reply))
        .await
        .map_err(CoordinatorError::Internal)??;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Deserialize)]
struct VerifySandboxTokenBody {
    token: String,
}

async fn verify_sandbox_token(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Json(body): Json<VerifySandboxTokenBody>,
) -> Result<Json<Value>> {
    let handle = session_handle(&state, &session).await?;
    let valid = handle
        .call(|reply| Command::VerifySandboxToken(body.token, reply))
        .await
        .map_err(CoordinatorError::Internal)?;
    Ok(Json(serde_json::json!({ "valid": valid })))
}
