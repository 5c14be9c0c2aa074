//! Wire protocol types (spec.md §6 "WebSocket"). Plain `type`-tagged
//! JSON, matching the teacher's `ws::protocol` serde style.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Artifact, GitSyncStatus, Participant, SandboxStatus};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Subscribe {
        token: String,
        #[serde(rename = "clientId")]
        client_id: String,
    },
    Prompt {
        content: String,
        model: Option<String>,
        attachments: Option<Value>,
    },
    Stop,
    Typing,
    Presence {
        status: String,
        cursor: Option<Value>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Pong {
        timestamp: i64,
    },
    Subscribed {
        #[serde(rename = "sessionId")]
        session_id: String,
        state: Value,
        #[serde(rename = "participantId")]
        participant_id: String,
        participant: Participant,
    },
    History {
        history: Value,
    },
    PromptQueued {
        #[serde(rename = "messageId")]
        message_id: String,
        position: i64,
    },
    SandboxStatus {
        status: SandboxStatus,
    },
    SandboxSpawning,
    SandboxWarming,
    SandboxWarning {
        message: String,
    },
    SandboxError {
        error: String,
    },
    SandboxRestored {
        message: String,
    },
    SnapshotSaved {
        #[serde(rename = "imageId")]
        image_id: String,
        reason: String,
    },
    SandboxEvent {
        event: Value,
    },
    PresenceSync {
        participants: Vec<Value>,
    },
    PresenceUpdate {
        participants: Vec<Value>,
    },
    ArtifactCreated {
        artifact: Artifact,
    },
    SessionStatus {
        status: String,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Sandbox→coordinator events (spec.md §6). Kept as a tagged enum for
/// the fields the router actually interprets; the raw JSON body is
/// preserved separately for opaque persistence/broadcast.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxEventPayload {
    ToolCall {
        #[serde(flatten)]
        raw: Value,
    },
    ToolResult {
        #[serde(flatten)]
        raw: Value,
    },
    Token {
        #[serde(flatten)]
        raw: Value,
    },
    Error {
        #[serde(flatten)]
        raw: Value,
    },
    GitSync {
        status: GitSyncStatus,
        sha: Option<String>,
    },
    ExecutionComplete {
        success: bool,
        #[serde(rename = "messageId")]
        message_id: Option<String>,
    },
    Heartbeat,
    PushComplete {
        #[serde(rename = "branchName")]
        branch_name: String,
    },
    PushError {
        #[serde(rename = "branchName")]
        branch_name: String,
        error: Option<String>,
    },
}

/// Coordinator→sandbox commands (spec.md §6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxCommand {
    Prompt {
        #[serde(rename = "messageId")]
        message_id: String,
        content: String,
        model: String,
        author: Value,
        attachments: Option<Value>,
    },
    Stop,
    Shutdown,
    Push {
        #[serde(rename = "branchName")]
        branch_name: String,
        #[serde(rename = "repoOwner")]
        repo_owner: String,
        #[serde(rename = "repoName")]
        repo_name: String,
        #[serde(rename = "githubToken")]
        github_token: Option<String>,
    },
}

/// WS close codes (spec.md §6).
pub mod close_codes {
    pub const INVALID_AUTH: u16 = 4001;
    pub const SESSION_EXPIRED: u16 = 4002;
    pub const AUTH_TIMEOUT: u16 = 4008;
    pub const TERMINAL_STATUS: u16 = 4010;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_subscribe_round_trips() {
        let raw = r#"{"type":"subscribe","token":"t","clientId":"c1"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { token, client_id } if token == "t" && client_id == "c1"));
    }

    #[test]
    fn server_message_pong_serializes_tagged() {
        let msg = ServerMessage::Pong { timestamp: 42 };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "pong");
        assert_eq!(v["timestamp"], 42);
    }

    #[test]
    fn sandbox_event_execution_complete_parses() {
        let raw = r#"{"type":"execution_complete","success":true,"messageId":"m1"}"#;
        let ev: SandboxEventPayload = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            ev,
            SandboxEventPayload::ExecutionComplete { success: true, message_id: Some(ref m) } if m == "m1"
        ));
    }

    #[test]
    fn sandbox_command_push_serializes() {
        let cmd = SandboxCommand::Push {
            branch_name: "feature".into(),
            repo_owner: "acme".into(),
            repo_name: "web".into(),
            github_token: Some("tok".into()),
        };
        let v = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["type"], "push");
        assert_eq!(v["branchName"], "feature");
    }
}
