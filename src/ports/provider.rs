//! Compute provider port — the thing that actually materializes and
//! snapshots sandboxes. Only the interface is specified (spec.md §1,
//! out-of-scope collaborators); this is a thin `reqwest`-backed client
//! plus the trait the lifecycle controller depends on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors carry an explicit class for circuit-breaker input
/// (SPEC_FULL.md §6 "Provider port").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorType {
    Permanent,
    Transient,
}

#[derive(Debug, thiserror::Error)]
#[error("provider error ({kind:?}): {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorType,
    pub message: String,
}

impl ProviderError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorType::Permanent,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorType::Transient,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSandboxRequest {
    pub session_id: String,
    pub expected_sandbox_id: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub control_plane_url: String,
    pub auth_token: String,
    pub model: Option<String>,
    /// Decrypted repository secrets (spec.md §4.7), materialized into
    /// the sandbox's environment at create time.
    pub secrets: Vec<(String, String)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSandboxResponse {
    pub provider_object_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreSandboxRequest {
    pub session_id: String,
    pub expected_sandbox_id: String,
    pub snapshot_image_id: String,
    pub control_plane_url: String,
    pub auth_token: String,
    pub secrets: Vec<(String, String)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestoreSandboxResponse {
    pub provider_object_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotResponse {
    pub snapshot_image_id: String,
}

#[async_trait]
pub trait ProviderPort: Send + Sync {
    async fn create_sandbox(
        &self,
        req: CreateSandboxRequest,
    ) -> Result<CreateSandboxResponse, ProviderError>;

    /// `None` if this provider never supports restore.
    async fn restore_from_snapshot(
        &self,
        req: RestoreSandboxRequest,
    ) -> Result<RestoreSandboxResponse, ProviderError>;

    fn supports_snapshot(&self) -> bool;

    async fn take_snapshot(&self, provider_object_id: &str) -> Result<SnapshotResponse, ProviderError>;
}

/// Real HTTP-backed implementation. 60s per-request timeout (spec.md §5).
pub struct HttpProviderPort {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProviderPort {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .expect("reqwest client builds");
        Self { client, base_url }
    }

    fn classify(status: reqwest::StatusCode) -> ProviderErrorType {
        if status.is_server_error() {
            ProviderErrorType::Transient
        } else {
            ProviderErrorType::Permanent
        }
    }
}

#[async_trait]
impl ProviderPort for HttpProviderPort {
    async fn create_sandbox(
        &self,
        req: CreateSandboxRequest,
    ) -> Result<CreateSandboxResponse, ProviderError> {
        let resp = self
            .client
            .post(format!("{}/sandboxes", self.base_url))
            .json(&req)
            .send()
            .await
            .map_err(|e| ProviderError::transient(e.to_string()))?;
        if !resp.status().is_success() {
            let kind = Self::classify(resp.status());
            return Err(ProviderError {
                kind,
                message: format!("create_sandbox failed: {}", resp.status()),
            });
        }
        resp.json()
            .await
            .map_err(|e| ProviderError::permanent(format!("bad response body: {e}")))
    }

    async fn restore_from_snapshot(
        &self,
        req: RestoreSandboxRequest,
    ) -> Result<RestoreSandboxResponse, ProviderError> {
        let resp = self
            .client
            .post(format!("{}/sandboxes/restore", self.base_url))
            .json(&req)
            .send()
            .await
            .map_err(|e| ProviderError::transient(e.to_string()))?;
        if !resp.status().is_success() {
            let kind = Self::classify(resp.status());
            return Err(ProviderError {
                kind,
                message: format!("restore_from_snapshot failed: {}", resp.status()),
            });
        }
        resp.json()
            .await
            .map_err(|e| ProviderError::permanent(format!("bad response body: {e}")))
    }

    fn supports_snapshot(&self) -> bool {
        true
    }

    async fn take_snapshot(
        &self,
        provider_object_id: &str,
    ) -> Result<SnapshotResponse, ProviderError> {
        let resp = self
            .client
            .post(format!(
                "{}/sandboxes/{}/snapshot",
                self.base_url, provider_object_id
            ))
            .send()
            .await
            .map_err(|e| ProviderError::transient(e.to_string()))?;
        if !resp.status().is_success() {
            let kind = Self::classify(resp.status());
            return Err(ProviderError {
                kind,
                message: format!("take_snapshot failed: {}", resp.status()),
            });
        }
        resp.json()
            .await
            .map_err(|e| ProviderError::permanent(format!("bad response body: {e}")))
    }
}
