//! Identity port — installation-token minting (spec.md §6 "Identity
//! port"). Signs a short-lived RS256 JWT as the GitHub App, then
//! exchanges it for an installation access token valid ~1 hour. The
//! user's own OAuth token is never sent to the sandbox; only this
//! installation token is.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to sign installation JWT: {0}")]
    Signing(String),
    #[error("identity provider error: {0}")]
    Provider(String),
}

#[derive(Debug, Serialize)]
struct AppJwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[async_trait]
pub trait IdentityPort: Send + Sync {
    async fn generate_installation_token(
        &self,
        app_id: &str,
        private_key_pem: &str,
        installation_id: &str,
    ) -> Result<String, IdentityError>;
}

pub struct HttpIdentityPort {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIdentityPort {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .expect("reqwest client builds");
        Self { client, base_url }
    }

    fn sign_app_jwt(app_id: &str, private_key_pem: &str) -> Result<String, IdentityError> {
        let now = chrono::Utc::now().timestamp();
        let claims = AppJwtClaims {
            iat: now - 60,
            exp: now + 600,
            iss: app_id.to_string(),
        };
        let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| IdentityError::Signing(e.to_string()))?;
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| IdentityError::Signing(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
}

#[async_trait]
impl IdentityPort for HttpIdentityPort {
    async fn generate_installation_token(
        &self,
        app_id: &str,
        private_key_pem: &str,
        installation_id: &str,
    ) -> Result<String, IdentityError> {
        let jwt = Self::sign_app_jwt(app_id, private_key_pem)?;
        let resp = self
            .client
            .post(format!(
                "{}/app/installations/{installation_id}/access_tokens",
                self.base_url
            ))
            .bearer_auth(jwt)
            .send()
            .await
            .map_err(|e| IdentityError::Provider(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(IdentityError::Provider(format!(
                "installation token request failed: {}",
                resp.status()
            )));
        }
        let body: InstallationTokenResponse = resp
            .json()
            .await
            .map_err(|e| IdentityError::Provider(format!("bad response body: {e}")))?;
        Ok(body.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_window_matches_spec() {
        let now = chrono::Utc::now().timestamp();
        let claims = AppJwtClaims {
            iat: now - 60,
            exp: now + 600,
            iss: "app-1".to_string(),
        };
        assert_eq!(claims.exp - claims.iat, 660);
    }
}
