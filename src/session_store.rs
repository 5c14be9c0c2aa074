//! Per-session durable store (SPEC_FULL.md §4.1 "Session Store").
//!
//! One SQLite file per session, owned exclusively by that session's
//! `SessionActor` — there are no cross-instance concurrent writers, so
//! every method here assumes serialized access. Schema init and
//! migrations follow the teacher's `db.rs` rule verbatim: "already-exists
//! errors are swallowed; any other error is fatal".

use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::info;

use crate::models::{
    Artifact, ArtifactType, Event, EventType, Message, MessageSource, MessageStatus, Participant,
    ParticipantRole, Sandbox, SandboxStatus, Session, SessionStatus, WsClientMapping,
};

const SCHEMA_VERSION: i64 = 1;
/// The sandbox table holds exactly one row, always under this id.
pub const SANDBOX_SINGLETON_ID: &str = "sandbox";

#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub async fn connect(db_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(db_url)
            .await
            .with_context(|| format!("failed to connect to session store: {db_url}"))?;

        run_migrations(&pool).await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    // ---- session -------------------------------------------------------

    pub async fn insert_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session (id, name, title, repo_owner, repo_name, repo_default_branch,
                                  repo_id, branch_name, base_sha, current_sha, model, status,
                                  created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.name)
        .bind(&session.title)
        .bind(&session.repo_owner)
        .bind(&session.repo_name)
        .bind(&session.repo_default_branch)
        .bind(&session.repo_id)
        .bind(&session.branch_name)
        .bind(&session.base_sha)
        .bind(&session.current_sha)
        .bind(&session.model)
        .bind(session.status.as_str())
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to insert session")?;
        Ok(())
    }

    pub async fn get_session(&self) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM session LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(session_from_row).transpose()
    }

    pub async fn update_session_shas(
        &self,
        base_sha: Option<&str>,
        current_sha: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE session SET base_sha = COALESCE(?, base_sha), current_sha = COALESCE(?, current_sha), updated_at = ?",
        )
        .bind(base_sha)
        .bind(current_sha)
        .bind(crate::models::now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_session_branch(&self, branch_name: &str) -> Result<()> {
        sqlx::query("UPDATE session SET branch_name = ?, updated_at = ?")
            .bind(branch_name)
            .bind(crate::models::now_ms())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_session_status(&self, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE session SET status = ?, updated_at = ?")
            .bind(status.as_str())
            .bind(crate::models::now_ms())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- participants ---------------------------------------------------

    pub async fn insert_participant(&self, p: &Participant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO participants (id, user_id, github_login, github_name, github_email,
                                       github_id, role, host_access_token_encrypted,
                                       host_refresh_token_encrypted, host_token_expires_at,
                                       ws_auth_token_hash, ws_auth_token_issued_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&p.id)
        .bind(&p.user_id)
        .bind(&p.github_login)
        .bind(&p.github_name)
        .bind(&p.github_email)
        .bind(p.github_id)
        .bind(p.role.as_str())
        .bind(&p.host_access_token_encrypted)
        .bind(&p.host_refresh_token_encrypted)
        .bind(p.host_token_expires_at)
        .bind(&p.ws_auth_token_hash)
        .bind(p.ws_auth_token_issued_at)
        .bind(p.created_at)
        .bind(p.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to insert participant")?;
        Ok(())
    }

    pub async fn get_participant_by_user_id(&self, user_id: &str) -> Result<Option<Participant>> {
        let row = sqlx::query("SELECT * FROM participants WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(participant_from_row).transpose()
    }

    pub async fn get_participant_by_id(&self, id: &str) -> Result<Option<Participant>> {
        let row = sqlx::query("SELECT * FROM participants WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(participant_from_row).transpose()
    }

    pub async fn list_participants(&self) -> Result<Vec<Participant>> {
        let rows = sqlx::query("SELECT * FROM participants ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(participant_from_row).collect()
    }

    pub async fn get_participant_by_ws_token_hash(
        &self,
        hash: &str,
    ) -> Result<Option<Participant>> {
        let row = sqlx::query("SELECT * FROM participants WHERE ws_auth_token_hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(participant_from_row).transpose()
    }

    pub async fn set_ws_auth_token_hash(&self, participant_id: &str, hash: &str) -> Result<()> {
        let now = crate::models::now_ms();
        sqlx::query(
            "UPDATE participants SET ws_auth_token_hash = ?, ws_auth_token_issued_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(hash)
        .bind(now)
        .bind(now)
        .bind(participant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_host_tokens(
        &self,
        participant_id: &str,
        access_encrypted: &str,
        refresh_encrypted: Option<&str>,
        expires_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE participants SET host_access_token_encrypted = ?, host_refresh_token_encrypted = ?, host_token_expires_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(access_encrypted)
        .bind(refresh_encrypted)
        .bind(expires_at)
        .bind(crate::models::now_ms())
        .bind(participant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- messages --------------------------------------------------------

    /// Inserts a pending message and returns its queue position (count of
    /// pending+processing messages, including itself).
    pub async fn enqueue_message(&self, msg: &Message) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, author_participant_id, content, source, model,
                                   attachments_json, status, created_at, started_at,
                                   completed_at, callback_context_json, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&msg.id)
        .bind(&msg.author_participant_id)
        .bind(&msg.content)
        .bind(msg.source.as_str())
        .bind(&msg.model)
        .bind(&msg.attachments_json)
        .bind(msg.status.as_str())
        .bind(msg.created_at)
        .bind(msg.started_at)
        .bind(msg.completed_at)
        .bind(&msg.callback_context_json)
        .bind(&msg.error_message)
        .execute(&self.pool)
        .await
        .context("failed to enqueue message")?;

        let position: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE status IN ('pending', 'processing')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(position)
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(message_from_row).transpose()
    }

    pub async fn get_processing_message(&self) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE status = 'processing' LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(message_from_row).transpose()
    }

    /// Oldest pending message, tie-broken by creation timestamp then id
    /// (SPEC_FULL.md §4.3 step 2).
    pub async fn get_oldest_pending_message(&self) -> Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT * FROM messages WHERE status = 'pending' ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(message_from_row).transpose()
    }

    pub async fn mark_message_processing(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE messages SET status = 'processing', started_at = ? WHERE id = ?")
            .bind(crate::models::now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Only transitions a row out of `processing` (spec.md §8 "monotone
    /// message status") — returns how many rows actually flipped so
    /// callers can tell a genuine completion from a no-op on an id
    /// that already resolved (duplicate/late `execution_complete`).
    pub async fn mark_message_completed(&self, id: &str, success: bool) -> Result<u64> {
        let status = if success { "completed" } else { "failed" };
        let result = sqlx::query(
            "UPDATE messages SET status = ?, completed_at = ? WHERE id = ? AND status = 'processing'",
        )
        .bind(status)
        .bind(crate::models::now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn set_message_error(&self, id: &str, error_message: &str) -> Result<()> {
        sqlx::query("UPDATE messages SET error_message = ? WHERE id = ?")
            .bind(error_message)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_messages(
        &self,
        cursor: Option<i64>,
        status: Option<MessageStatus>,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let limit = limit.clamp(1, 100);
        let rows = match (cursor, status) {
            (Some(c), Some(s)) => {
                sqlx::query("SELECT * FROM messages WHERE created_at > ? AND status = ? ORDER BY created_at ASC LIMIT ?")
                    .bind(c)
                    .bind(s.as_str())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (Some(c), None) => {
                sqlx::query("SELECT * FROM messages WHERE created_at > ? ORDER BY created_at ASC LIMIT ?")
                    .bind(c)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, Some(s)) => {
                sqlx::query("SELECT * FROM messages WHERE status = ? ORDER BY created_at ASC LIMIT ?")
                    .bind(s.as_str())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, None) => {
                sqlx::query("SELECT * FROM messages ORDER BY created_at ASC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(message_from_row).collect()
    }

    pub async fn recent_messages(&self, limit: i64) -> Result<Vec<Message>> {
        let rows = sqlx::query("SELECT * FROM messages ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        let mut out: Vec<Message> = rows.into_iter().map(message_from_row).collect::<Result<_>>()?;
        out.reverse();
        Ok(out)
    }

    // ---- events ------------------------------------------------------------

    pub async fn insert_event(&self, event: &Event) -> Result<()> {
        sqlx::query(
            "INSERT INTO events (id, event_type, data_json, message_id, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(event.event_type.as_str())
        .bind(&event.data_json)
        .bind(&event.message_id)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert event")?;
        Ok(())
    }

    pub async fn list_events(
        &self,
        cursor: Option<i64>,
        event_type: Option<EventType>,
        message_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Event>> {
        let limit = limit.clamp(1, 200);
        let mut sql = String::from("SELECT * FROM events WHERE 1=1");
        if cursor.is_some() {
            sql.push_str(" AND created_at > ?");
        }
        if event_type.is_some() {
            sql.push_str(" AND event_type = ?");
        }
        if message_id.is_some() {
            sql.push_str(" AND message_id = ?");
        }
        sql.push_str(" ORDER BY created_at ASC LIMIT ?");

        let mut q = sqlx::query(&sql);
        if let Some(c) = cursor {
            q = q.bind(c);
        }
        if let Some(t) = event_type {
            q = q.bind(t.as_str());
        }
        if let Some(m) = message_id {
            q = q.bind(m);
        }
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(event_from_row).collect()
    }

    pub async fn recent_events(&self, limit: i64) -> Result<Vec<Event>> {
        let rows = sqlx::query("SELECT * FROM events ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        let mut out: Vec<Event> = rows.into_iter().map(event_from_row).collect::<Result<_>>()?;
        out.reverse();
        Ok(out)
    }

    // ---- artifacts -----------------------------------------------------------

    pub async fn insert_artifact(&self, artifact: &Artifact) -> Result<()> {
        sqlx::query(
            "INSERT INTO artifacts (id, artifact_type, url, metadata_json, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&artifact.id)
        .bind(artifact.artifact_type.as_str())
        .bind(&artifact.url)
        .bind(&artifact.metadata_json)
        .bind(artifact.created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert artifact")?;
        Ok(())
    }

    pub async fn list_artifacts(&self) -> Result<Vec<Artifact>> {
        let rows = sqlx::query("SELECT * FROM artifacts ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(artifact_from_row).collect()
    }

    // ---- sandbox -------------------------------------------------------------

    pub async fn ensure_sandbox_row(&self) -> Result<Sandbox> {
        if let Some(s) = self.get_sandbox().await? {
            return Ok(s);
        }
        let sandbox = Sandbox::new(SANDBOX_SINGLETON_ID.to_string());
        self.insert_sandbox(&sandbox).await?;
        Ok(sandbox)
    }

    async fn insert_sandbox(&self, s: &Sandbox) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sandbox (id, external_sandbox_id, provider_object_id, snapshot_image_id,
                                  auth_token, status, git_sync_status, last_heartbeat, last_activity,
                                  last_spawn_error, last_spawn_error_at, failure_count, last_failure_at,
                                  created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&s.id)
        .bind(&s.external_sandbox_id)
        .bind(&s.provider_object_id)
        .bind(&s.snapshot_image_id)
        .bind(&s.auth_token)
        .bind(s.status.as_str())
        .bind(s.git_sync_status.as_str())
        .bind(s.last_heartbeat)
        .bind(s.last_activity)
        .bind(&s.last_spawn_error)
        .bind(s.last_spawn_error_at)
        .bind(s.failure_count)
        .bind(s.last_failure_at)
        .bind(s.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_sandbox(&self) -> Result<Option<Sandbox>> {
        let row = sqlx::query("SELECT * FROM sandbox WHERE id = ?")
            .bind(SANDBOX_SINGLETON_ID)
            .fetch_optional(&self.pool)
            .await?;
        row.map(sandbox_from_row).transpose()
    }

    /// Persists the pre-allocated id/token/status before any provider call,
    /// per the "Pre-allocation of sandbox id/token" invariant (SPEC_FULL.md §8).
    pub async fn begin_spawn(
        &self,
        external_sandbox_id: &str,
        auth_token: &str,
        status: SandboxStatus,
        created_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sandbox SET external_sandbox_id = ?, auth_token = ?, status = ?, created_at = ?, last_spawn_error = NULL, last_spawn_error_at = NULL WHERE id = ?",
        )
        .bind(external_sandbox_id)
        .bind(auth_token)
        .bind(status.as_str())
        .bind(created_at)
        .bind(SANDBOX_SINGLETON_ID)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_sandbox_status(&self, status: SandboxStatus) -> Result<()> {
        sqlx::query("UPDATE sandbox SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(SANDBOX_SINGLETON_ID)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_provider_object_id(&self, provider_object_id: &str) -> Result<()> {
        sqlx::query("UPDATE sandbox SET provider_object_id = ? WHERE id = ?")
            .bind(provider_object_id)
            .bind(SANDBOX_SINGLETON_ID)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_snapshot_image_id(&self, snapshot_image_id: &str) -> Result<()> {
        sqlx::query("UPDATE sandbox SET snapshot_image_id = ? WHERE id = ?")
            .bind(snapshot_image_id)
            .bind(SANDBOX_SINGLETON_ID)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_spawn_failure(&self, now: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sandbox SET failure_count = failure_count + 1, last_failure_at = ?, last_spawn_error = ?, last_spawn_error_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(error)
        .bind(now)
        .bind(SANDBOX_SINGLETON_ID)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn reset_failure_count(&self) -> Result<()> {
        sqlx::query("UPDATE sandbox SET failure_count = 0, last_failure_at = NULL WHERE id = ?")
            .bind(SANDBOX_SINGLETON_ID)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_last_activity(&self, now: i64) -> Result<()> {
        sqlx::query("UPDATE sandbox SET last_activity = ? WHERE id = ?")
            .bind(now)
            .bind(SANDBOX_SINGLETON_ID)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_heartbeat(&self, now: i64) -> Result<()> {
        sqlx::query("UPDATE sandbox SET last_heartbeat = ? WHERE id = ?")
            .bind(now)
            .bind(SANDBOX_SINGLETON_ID)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_git_sync_status(&self, status: crate::models::GitSyncStatus) -> Result<()> {
        sqlx::query("UPDATE sandbox SET git_sync_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(SANDBOX_SINGLETON_ID)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- ws_client_mapping -----------------------------------------------------

    pub async fn insert_ws_client_mapping(&self, m: &WsClientMapping) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO ws_client_mapping (socket_id, participant_id, client_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&m.socket_id)
        .bind(&m.participant_id)
        .bind(&m.client_id)
        .bind(m.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // No `get_ws_client_mapping` / `delete_ws_client_mapping` lookups: this
    // process never recovers a socket's identity from the mapping table
    // (see DESIGN.md "Hibernation recovery" — a `SessionActor` task's
    // in-memory state and its sockets share the same process lifetime, so
    // there is no point at which a socket outlives the state needed to
    // identify it). The row inserted above exists purely as the durable
    // record spec.md §3 names, not as a read path.
}

fn session_from_row(row: SqliteRow) -> Result<Session> {
    Ok(Session {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        title: row.try_get("title")?,
        repo_owner: row.try_get("repo_owner")?,
        repo_name: row.try_get("repo_name")?,
        repo_default_branch: row.try_get("repo_default_branch")?,
        repo_id: row.try_get("repo_id")?,
        branch_name: row.try_get("branch_name")?,
        base_sha: row.try_get("base_sha")?,
        current_sha: row.try_get("current_sha")?,
        model: row.try_get("model")?,
        status: SessionStatus::from_str(row.try_get::<String, _>("status")?.as_str())?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn participant_from_row(row: SqliteRow) -> Result<Participant> {
    Ok(Participant {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        github_login: row.try_get("github_login")?,
        github_name: row.try_get("github_name")?,
        github_email: row.try_get("github_email")?,
        github_id: row.try_get("github_id")?,
        role: ParticipantRole::from_str(row.try_get::<String, _>("role")?.as_str())?,
        host_access_token_encrypted: row.try_get("host_access_token_encrypted")?,
        host_refresh_token_encrypted: row.try_get("host_refresh_token_encrypted")?,
        host_token_expires_at: row.try_get("host_token_expires_at")?,
        ws_auth_token_hash: row.try_get("ws_auth_token_hash")?,
        ws_auth_token_issued_at: row.try_get("ws_auth_token_issued_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn message_from_row(row: SqliteRow) -> Result<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        author_participant_id: row.try_get("author_participant_id")?,
        content: row.try_get("content")?,
        source: MessageSource::from_str(row.try_get::<String, _>("source")?.as_str())?,
        model: row.try_get("model")?,
        attachments_json: row.try_get("attachments_json")?,
        status: MessageStatus::from_str(row.try_get::<String, _>("status")?.as_str())?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        callback_context_json: row.try_get("callback_context_json")?,
        error_message: row.try_get("error_message")?,
    })
}

fn event_from_row(row: SqliteRow) -> Result<Event> {
    Ok(Event {
        id: row.try_get("id")?,
        event_type: EventType::from_str(row.try_get::<String, _>("event_type")?.as_str())?,
        data_json: row.try_get("data_json")?,
        message_id: row.try_get("message_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn artifact_from_row(row: SqliteRow) -> Result<Artifact> {
    Ok(Artifact {
        id: row.try_get("id")?,
        artifact_type: ArtifactType::from_str(row.try_get::<String, _>("artifact_type")?.as_str())?,
        url: row.try_get("url")?,
        metadata_json: row.try_get("metadata_json")?,
        created_at: row.try_get("created_at")?,
    })
}

fn sandbox_from_row(row: SqliteRow) -> Result<Sandbox> {
    Ok(Sandbox {
        id: row.try_get("id")?,
        external_sandbox_id: row.try_get("external_sandbox_id")?,
        provider_object_id: row.try_get("provider_object_id")?,
        snapshot_image_id: row.try_get("snapshot_image_id")?,
        auth_token: row.try_get("auth_token")?,
        status: SandboxStatus::from_str(row.try_get::<String, _>("status")?.as_str())?,
        git_sync_status: crate::models::GitSyncStatus::from_str(
            row.try_get::<String, _>("git_sync_status")?.as_str(),
        )?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        last_activity: row.try_get("last_activity")?,
        last_spawn_error: row.try_get("last_spawn_error")?,
        last_spawn_error_at: row.try_get("last_spawn_error_at")?,
        failure_count: row.try_get("failure_count")?,
        last_failure_at: row.try_get("last_failure_at")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Creates the schema on first touch and applies additive migrations.
/// "Already-exists" errors are swallowed; any other error is fatal.
async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (unixepoch())
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await
            .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        anyhow::bail!(
            "session store schema version {} is newer than supported version {}",
            current_version,
            SCHEMA_VERSION
        );
    }

    if current_version < 1 {
        info!("applying session store migration v1 (initial schema)");
        create_initial_schema(pool).await?;
        sqlx::query("INSERT INTO schema_version (version) VALUES (1)")
            .execute(pool)
            .await?;
    }

    // Additive migrations land here as `current_version < N` blocks, each
    // followed by `ALTER TABLE ... .ok()` to swallow duplicate-column
    // errors on re-run, exactly as the teacher's `db.rs` does.

    Ok(())
}

async fn create_initial_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            title TEXT,
            repo_owner TEXT NOT NULL,
            repo_name TEXT NOT NULL,
            repo_default_branch TEXT,
            repo_id TEXT,
            branch_name TEXT,
            base_sha TEXT,
            current_sha TEXT,
            model TEXT,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS participants (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE,
            github_login TEXT,
            github_name TEXT,
            github_email TEXT,
            github_id INTEGER,
            role TEXT NOT NULL,
            host_access_token_encrypted TEXT,
            host_refresh_token_encrypted TEXT,
            host_token_expires_at INTEGER,
            ws_auth_token_hash TEXT,
            ws_auth_token_issued_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            author_participant_id TEXT NOT NULL,
            content TEXT NOT NULL,
            source TEXT NOT NULL,
            model TEXT,
            attachments_json TEXT,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            callback_context_json TEXT,
            error_message TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_status ON messages (status)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            data_json TEXT NOT NULL,
            message_id TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_created_at ON events (created_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_message_id ON events (message_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artifacts (
            id TEXT PRIMARY KEY,
            artifact_type TEXT NOT NULL,
            url TEXT,
            metadata_json TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sandbox (
            id TEXT PRIMARY KEY,
            external_sandbox_id TEXT,
            provider_object_id TEXT,
            snapshot_image_id TEXT,
            auth_token TEXT,
            status TEXT NOT NULL,
            git_sync_status TEXT NOT NULL,
            last_heartbeat INTEGER,
            last_activity INTEGER,
            last_spawn_error TEXT,
            last_spawn_error_at INTEGER,
            failure_count INTEGER NOT NULL DEFAULT 0,
            last_failure_at INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ws_client_mapping (
            socket_id TEXT PRIMARY KEY,
            participant_id TEXT NOT NULL,
            client_id TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, MessageSource, Sandbox};

    async fn test_store() -> SessionStore {
        SessionStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn enqueue_and_single_in_flight() {
        let store = test_store().await;
        let m1 = Message::new(
            "m1".into(),
            "p1".into(),
            "hi".into(),
            MessageSource::Web,
            None,
            None,
            None,
        );
        let pos = store.enqueue_message(&m1).await.unwrap();
        assert_eq!(pos, 1);

        assert!(store.get_processing_message().await.unwrap().is_none());
        store.mark_message_processing("m1").await.unwrap();
        let processing = store.get_processing_message().await.unwrap().unwrap();
        assert_eq!(processing.id, "m1");

        let rows = store.mark_message_completed("m1", true).await.unwrap();
        assert_eq!(rows, 1);
        assert!(store.get_processing_message().await.unwrap().is_none());
        let m = store.get_message("m1").await.unwrap().unwrap();
        assert_eq!(m.status, crate::models::MessageStatus::Completed);

        // A duplicate/late completion for the same id is a no-op: the row
        // is no longer `processing`, so the guarded UPDATE matches nothing.
        let rows = store.mark_message_completed("m1", false).await.unwrap();
        assert_eq!(rows, 0);
        let m = store.get_message("m1").await.unwrap().unwrap();
        assert_eq!(m.status, crate::models::MessageStatus::Completed);
    }

    #[tokio::test]
    async fn sandbox_singleton_row() {
        let store = test_store().await;
        let s1 = store.ensure_sandbox_row().await.unwrap();
        assert_eq!(s1.created_at, 0);
        let s2 = store.ensure_sandbox_row().await.unwrap();
        assert_eq!(s1.id, s2.id);
    }

    #[tokio::test]
    async fn spawn_preallocates_before_provider_call() {
        let store = test_store().await;
        store.ensure_sandbox_row().await.unwrap();
        store
            .begin_spawn("sandbox-acme-web-1000", "tok123", SandboxStatus::Spawning, 1000)
            .await
            .unwrap();
        let s = store.get_sandbox().await.unwrap().unwrap();
        assert_eq!(s.external_sandbox_id.as_deref(), Some("sandbox-acme-web-1000"));
        assert_eq!(s.auth_token.as_deref(), Some("tok123"));
        assert_eq!(s.status, SandboxStatus::Spawning);
    }

    #[tokio::test]
    async fn oldest_pending_tie_break() {
        let store = test_store().await;
        let m1 = Message::new("a".into(), "p".into(), "1".into(), MessageSource::Web, None, None, None);
        let mut m2 = Message::new("b".into(), "p".into(), "2".into(), MessageSource::Web, None, None, None);
        m2.created_at = m1.created_at; // same timestamp, tie-break on id
        store.enqueue_message(&m1).await.unwrap();
        store.enqueue_message(&m2).await.unwrap();
        let oldest = store.get_oldest_pending_message().await.unwrap().unwrap();
        assert_eq!(oldest.id, "a");
    }

    #[test]
    fn unused_import_guard() {
        let _ = Sandbox::new("x".into());
    }
}
