//! Code-hosting port (PR creation, branch push) — spec.md §6.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CodeHostError {
    #[error("code host auth failed: {0}")]
    Auth(String),
    #[error("code host transient error: {0}")]
    Transient(String),
    #[error("code host permanent error: {0}")]
    Permanent(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryInfo {
    pub default_branch: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatePullRequestRequest {
    pub owner: String,
    pub name: String,
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    #[serde(skip)]
    pub user_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestInfo {
    pub number: u64,
    pub html_url: String,
    pub state: String,
}

#[async_trait]
pub trait CodeHostPort: Send + Sync {
    async fn get_repository(
        &self,
        owner: &str,
        name: &str,
        user_token: &str,
    ) -> Result<RepositoryInfo, CodeHostError>;

    async fn create_pull_request(
        &self,
        req: CreatePullRequestRequest,
    ) -> Result<PullRequestInfo, CodeHostError>;
}

pub struct HttpCodeHostPort {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCodeHostPort {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .expect("reqwest client builds");
        Self { client, base_url }
    }
}

#[async_trait]
impl CodeHostPort for HttpCodeHostPort {
    async fn get_repository(
        &self,
        owner: &str,
        name: &str,
        user_token: &str,
    ) -> Result<RepositoryInfo, CodeHostError> {
        let resp = self
            .client
            .get(format!("{}/repos/{owner}/{name}", self.base_url))
            .bearer_auth(user_token)
            .send()
            .await
            .map_err(|e| CodeHostError::Transient(e.to_string()))?;
        match resp.status() {
            s if s.as_u16() == 401 || s.as_u16() == 403 => {
                Err(CodeHostError::Auth(format!("status {s}")))
            }
            s if s.is_server_error() => Err(CodeHostError::Transient(format!("status {s}"))),
            s if !s.is_success() => Err(CodeHostError::Permanent(format!("status {s}"))),
            _ => resp
                .json()
                .await
                .map_err(|e| CodeHostError::Permanent(format!("bad response body: {e}"))),
        }
    }

    async fn create_pull_request(
        &self,
        req: CreatePullRequestRequest,
    ) -> Result<PullRequestInfo, CodeHostError> {
        let token = req.user_token.clone();
        let resp = self
            .client
            .post(format!(
                "{}/repos/{}/{}/pulls",
                self.base_url, req.owner, req.name
            ))
            .bearer_auth(token)
            .json(&req)
            .send()
            .await
            .map_err(|e| CodeHostError::Transient(e.to_string()))?;
        match resp.status() {
            s if s.as_u16() == 401 || s.as_u16() == 403 => {
                Err(CodeHostError::Auth(format!("status {s}")))
            }
            s if s.is_server_error() => Err(CodeHostError::Transient(format!("status {s}"))),
            s if !s.is_success() => Err(CodeHostError::Permanent(format!("status {s}"))),
            _ => resp
                .json()
                .await
                .map_err(|e| CodeHostError::Permanent(format!("bad response body: {e}"))),
        }
    }
}
