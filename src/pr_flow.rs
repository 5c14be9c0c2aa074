//! Pull-Request path (spec.md §4.6). Runs inline inside the
//! `SessionActor`'s command loop — the 180s push wait is the one case
//! where that loop can be legitimately blocked for a long time,
//! relying on the pending-push map being resolved from outside the
//! actor (see `sandbox_event_router::ingest`).

use std::time::Duration;

use serde_json::json;
use tokio::sync::oneshot;
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::models::{Artifact, ArtifactType, MessageStatus, now_ms};
use crate::ports::codehost::CreatePullRequestRequest;
use crate::sandbox_event_router::PushOutcome;
use crate::session_actor::{CreatePrRequest, SessionActor};
use crate::ws::protocol::{SandboxCommand, ServerMessage};

const PUSH_TIMEOUT: Duration = Duration::from_secs(180);

fn derive_head_branch(session_id: &str) -> String {
    format!("coordinator/{session_id}")
}

pub async fn run(
    actor: &mut SessionActor,
    req: CreatePrRequest,
) -> Result<Artifact, CoordinatorError> {
    let processing = actor
        .store()
        .get_processing_message()
        .await
        .map_err(CoordinatorError::from)?
        .ok_or_else(|| CoordinatorError::Validation("no message is currently processing".into()))?;
    if processing.status != MessageStatus::Processing {
        return Err(CoordinatorError::Validation(
            "no message is currently processing".into(),
        ));
    }

    let author = actor
        .store()
        .get_participant_by_user_id(&req.user_id)
        .await
        .map_err(CoordinatorError::from)?
        .ok_or_else(|| CoordinatorError::Auth("unknown participant".into()))?;
    if author.id != processing.author_participant_id {
        return Err(CoordinatorError::Validation(
            "acting identity is not the author of the processing message".into(),
        ));
    }

    let encrypted_token = author
        .host_access_token_encrypted
        .as_deref()
        .ok_or_else(|| CoordinatorError::Auth("participant has no host credentials".into()))?;
    let expires_at = author.host_token_expires_at.unwrap_or(0);
    if expires_at > 0 && now_ms() > expires_at + 60_000 {
        return Err(CoordinatorError::Auth(
            "host token expired — please re-authenticate".into(),
        ));
    }
    let user_token = actor
        .ports()
        .cipher
        .decrypt(encrypted_token)
        .map_err(CoordinatorError::Internal)?;

    let session = actor
        .store()
        .get_session()
        .await
        .map_err(CoordinatorError::from)?
        .ok_or_else(|| CoordinatorError::NotFound("no session".into()))?;

    // 1. resolve default branch
    let repo = actor
        .ports()
        .codehost
        .get_repository(&session.repo_owner, &session.repo_name, &user_token)
        .await
        .map_err(|e| CoordinatorError::UpstreamTransient(e.to_string()))?;

    // 2. derive head branch
    let head_branch = derive_head_branch(&session.id);

    // 3. mint installation token
    let id_cfg = &actor.ports().identity_config;
    let installation_token = actor
        .ports()
        .identity
        .generate_installation_token(
            &id_cfg.app_id,
            &id_cfg.private_key_pem,
            &id_cfg.installation_id,
        )
        .await
        .map_err(|e| CoordinatorError::UpstreamTransient(e.to_string()))?;

    // 4. push, with 180s timeout; skip entirely if no sandbox connected
    if let Some(cmd_tx) = actor.sandbox_cmd_tx() {
        let (tx, rx) = oneshot::channel::<PushOutcome>();
        {
            let mut guard = actor.pending_push().lock().await;
            guard.insert(head_branch.trim().to_lowercase(), tx);
        }
        let push_cmd = SandboxCommand::Push {
            branch_name: head_branch.clone(),
            repo_owner: session.repo_owner.clone(),
            repo_name: session.repo_name.clone(),
            github_token: Some(installation_token.clone()),
        };
        if cmd_tx.send(push_cmd).await.is_err() {
            let mut guard = actor.pending_push().lock().await;
            guard.remove(&head_branch.trim().to_lowercase());
        } else {
            match timeout(PUSH_TIMEOUT, rx).await {
                Ok(Ok(PushOutcome::Completed)) => {}
                Ok(Ok(PushOutcome::Errored { message })) => {
                    return Err(CoordinatorError::UpstreamTransient(
                        message.unwrap_or_else(|| "push failed".into()),
                    ));
                }
                Ok(Err(_)) => {
                    return Err(CoordinatorError::Internal(anyhow::anyhow!(
                        "push resolution channel dropped"
                    )));
                }
                Err(_) => {
                    // Timer clearance on the timeout path (spec.md §5).
                    let mut guard = actor.pending_push().lock().await;
                    guard.remove(&head_branch.trim().to_lowercase());
                    return Err(CoordinatorError::UpstreamTransient(
                        "push did not complete within 180s".into(),
                    ));
                }
            }
        }
    }

    // 5. create PR with a session-link footer
    let body = format!(
        "{}\n\n---\nOpened by session `{}`.",
        req.body, session.name
    );
    let pr = actor
        .ports()
        .codehost
        .create_pull_request(CreatePullRequestRequest {
            owner: session.repo_owner.clone(),
            name: session.repo_name.clone(),
            title: req.title,
            body,
            head: head_branch.clone(),
            base: repo.default_branch,
            user_token,
        })
        .await
        .map_err(|e| CoordinatorError::UpstreamPermanent(e.to_string()))?;

    // 6. persist artifact, update branch, broadcast
    let artifact = Artifact {
        id: Uuid::new_v4().to_string(),
        artifact_type: ArtifactType::Pr,
        url: Some(pr.html_url.clone()),
        metadata_json: Some(json!({ "number": pr.number, "state": pr.state }).to_string()),
        created_at: now_ms(),
    };
    actor
        .store()
        .insert_artifact(&artifact)
        .await
        .map_err(CoordinatorError::from)?;
    actor
        .store()
        .update_session_branch(&head_branch)
        .await
        .map_err(CoordinatorError::from)?;
    actor.broadcast_pub(ServerMessage::ArtifactCreated {
        artifact: artifact.clone(),
    });

    Ok(artifact)
}
