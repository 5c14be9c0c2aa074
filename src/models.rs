//! Data model for a single session's store.
//!
//! Every row here is scoped to one session and lives only as long as the
//! session does (see SPEC_FULL.md §3). Timestamps are unix-epoch
//! milliseconds, stored as `i64`. Enums are persisted as `TEXT` columns
//! and mapped by hand in `session_store.rs` — the teacher's repository
//! layer does the same (plain `sqlx::query` + manual `Row::get`, no
//! `sqlx::Type` derives) rather than lean on backend-specific enum
//! encoding.

use serde::{Deserialize, Serialize};

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $str:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $str),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = anyhow::Error;
            fn from_str(s: &str) -> anyhow::Result<Self> {
                match s {
                    $($str => Ok(Self::$variant),)+
                    other => anyhow::bail!(concat!(stringify!($name), ": unknown value {:?}"), other),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(
    SessionStatus {
        Created => "created",
        Active => "active",
        Completed => "completed",
        Archived => "archived",
    }
);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub title: Option<String>,
    pub repo_owner: String,
    pub repo_name: String,
    pub repo_default_branch: Option<String>,
    pub repo_id: Option<String>,
    pub branch_name: Option<String>,
    pub base_sha: Option<String>,
    pub current_sha: Option<String>,
    pub model: Option<String>,
    pub status: SessionStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Session {
    pub fn new(
        id: String,
        name: String,
        repo_owner: String,
        repo_name: String,
        title: Option<String>,
        model: Option<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id,
            name,
            title,
            repo_owner,
            repo_name,
            repo_default_branch: None,
            repo_id: None,
            branch_name: None,
            base_sha: None,
            current_sha: None,
            model,
            status: SessionStatus::Created,
            created_at: now,
            updated_at: now,
        }
    }
}

string_enum!(
    ParticipantRole {
        Owner => "owner",
        Member => "member",
    }
);

/// A participant's code-host identity and credentials.
///
/// `host_access_token_encrypted` / `host_refresh_token_encrypted` are
/// envelope-encrypted ciphertexts (base64); `ws_auth_token_hash` is the
/// SHA-256 hex digest of the plaintext token, which exists only in the
/// response to `/internal/ws-token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub user_id: String,
    pub github_login: Option<String>,
    pub github_name: Option<String>,
    pub github_email: Option<String>,
    pub github_id: Option<i64>,
    pub role: ParticipantRole,
    pub host_access_token_encrypted: Option<String>,
    pub host_refresh_token_encrypted: Option<String>,
    pub host_token_expires_at: Option<i64>,
    pub ws_auth_token_hash: Option<String>,
    pub ws_auth_token_issued_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Participant {
    pub fn new(id: String, user_id: String, role: ParticipantRole) -> Self {
        let now = now_ms();
        Self {
            id,
            user_id,
            github_login: None,
            github_name: None,
            github_email: None,
            github_id: None,
            role,
            host_access_token_encrypted: None,
            host_refresh_token_encrypted: None,
            host_token_expires_at: None,
            ws_auth_token_hash: None,
            ws_auth_token_issued_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

string_enum!(
    MessageSource {
        Web => "web",
        Slack => "slack",
        Extension => "extension",
        Github => "github",
    }
);

string_enum!(
    MessageStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub author_participant_id: String,
    pub content: String,
    pub source: MessageSource,
    pub model: Option<String>,
    /// JSON-encoded attachment list, opaque to the coordinator.
    pub attachments_json: Option<String>,
    pub status: MessageStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    /// Opaque context echoed back in the outbound completion callback.
    pub callback_context_json: Option<String>,
    pub error_message: Option<String>,
}

impl Message {
    pub fn new(
        id: String,
        author_participant_id: String,
        content: String,
        source: MessageSource,
        model: Option<String>,
        attachments_json: Option<String>,
        callback_context_json: Option<String>,
    ) -> Self {
        Self {
            id,
            author_participant_id,
            content,
            source,
            model,
            attachments_json,
            status: MessageStatus::Pending,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            callback_context_json,
            error_message: None,
        }
    }
}

string_enum!(
    EventType {
        ToolCall => "tool_call",
        ToolResult => "tool_result",
        Token => "token",
        Error => "error",
        GitSync => "git_sync",
        ExecutionComplete => "execution_complete",
        Heartbeat => "heartbeat",
        PushComplete => "push_complete",
        PushError => "push_error",
    }
);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub event_type: EventType,
    pub data_json: String,
    pub message_id: Option<String>,
    pub created_at: i64,
}

string_enum!(
    ArtifactType {
        Pr => "pr",
        Screenshot => "screenshot",
        Preview => "preview",
        Branch => "branch",
    }
);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub artifact_type: ArtifactType,
    pub url: Option<String>,
    pub metadata_json: Option<String>,
    pub created_at: i64,
}

string_enum!(
    SandboxStatus {
        Pending => "pending",
        Spawning => "spawning",
        Connecting => "connecting",
        Warming => "warming",
        Syncing => "syncing",
        Ready => "ready",
        Running => "running",
        Stale => "stale",
        Snapshotting => "snapshotting",
        Stopped => "stopped",
        Failed => "failed",
    }
);

impl SandboxStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SandboxStatus::Stopped | SandboxStatus::Stale | SandboxStatus::Failed
        )
    }
}

string_enum!(
    GitSyncStatus {
        Unknown => "unknown",
        Syncing => "syncing",
        Synced => "synced",
        Error => "error",
    }
);

/// The lone sandbox record for a session. Spec invariant: at most one
/// active sandbox row per session — enforced by always updating this
/// single row rather than inserting new ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub external_sandbox_id: Option<String>,
    pub provider_object_id: Option<String>,
    pub snapshot_image_id: Option<String>,
    pub auth_token: Option<String>,
    pub status: SandboxStatus,
    pub git_sync_status: GitSyncStatus,
    pub last_heartbeat: Option<i64>,
    pub last_activity: Option<i64>,
    pub last_spawn_error: Option<String>,
    pub last_spawn_error_at: Option<i64>,
    pub failure_count: i64,
    pub last_failure_at: Option<i64>,
    pub created_at: i64,
}

impl Sandbox {
    /// Freshly created alongside session init: `created_at = 0` so the
    /// first spawn is never gated by the cooldown window.
    pub fn new(id: String) -> Self {
        Self {
            id,
            external_sandbox_id: None,
            provider_object_id: None,
            snapshot_image_id: None,
            auth_token: None,
            status: SandboxStatus::Pending,
            git_sync_status: GitSyncStatus::Unknown,
            last_heartbeat: None,
            last_activity: None,
            last_spawn_error: None,
            last_spawn_error_at: None,
            failure_count: 0,
            last_failure_at: None,
            created_at: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsClientMapping {
    pub socket_id: String,
    pub participant_id: String,
    pub client_id: String,
    pub created_at: i64,
}

/// Per-repository secret row (process-wide store, not per-session).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySecret {
    pub repo_id: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub key: String,
    pub encrypted_value: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySecretMeta {
    pub key: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn enum_round_trips_through_string() {
        assert_eq!(SandboxStatus::from_str("ready").unwrap(), SandboxStatus::Ready);
        assert_eq!(SandboxStatus::Ready.as_str(), "ready");
        assert!(SandboxStatus::from_str("bogus").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(SandboxStatus::Stopped.is_terminal());
        assert!(SandboxStatus::Stale.is_terminal());
        assert!(SandboxStatus::Failed.is_terminal());
        assert!(!SandboxStatus::Ready.is_terminal());
        assert!(!SandboxStatus::Pending.is_terminal());
    }
}
