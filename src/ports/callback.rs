//! Outbound callback port — notifies a third-party endpoint of prompt
//! completion with an HMAC-signed body (spec.md §6 "Outbound callbacks").
//! Retries at most twice, 1s apart; failure is logged, never fatal.

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::crypto::hmac_sha256_hex;

#[derive(Debug, Serialize)]
struct UnsignedCallbackBody {
    session_id: String,
    message_id: String,
    success: bool,
    timestamp: i64,
    context: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct SignedCallbackBody {
    #[serde(flatten)]
    unsigned: UnsignedCallbackBody,
    signature: String,
}

#[async_trait]
pub trait CallbackPort: Send + Sync {
    async fn notify_completion(
        &self,
        url: &str,
        session_id: &str,
        message_id: &str,
        success: bool,
        context: serde_json::Value,
    );
}

pub struct HttpCallbackPort {
    client: reqwest::Client,
    secret: String,
}

impl HttpCallbackPort {
    pub fn new(secret: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .expect("reqwest client builds");
        Self { client, secret }
    }
}

#[async_trait]
impl CallbackPort for HttpCallbackPort {
    async fn notify_completion(
        &self,
        url: &str,
        session_id: &str,
        message_id: &str,
        success: bool,
        context: serde_json::Value,
    ) {
        let unsigned = UnsignedCallbackBody {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            success,
            timestamp: crate::models::now_ms(),
            context,
        };
        let canonical = match serde_json::to_string(&unsigned) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to serialize callback body: {e}");
                return;
            }
        };
        let signature = hmac_sha256_hex(&self.secret, &canonical);
        let body = SignedCallbackBody { unsigned, signature };

        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
            match self.client.post(url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => {
                    warn!("callback to {url} returned {}", resp.status());
                }
                Err(e) => {
                    warn!("callback to {url} failed: {e}");
                }
            }
        }
        warn!("callback to {url} failed after retries, giving up (not fatal)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_covers_canonical_body() {
        let unsigned = UnsignedCallbackBody {
            session_id: "s1".into(),
            message_id: "m1".into(),
            success: true,
            timestamp: 1000,
            context: serde_json::json!({"k": "v"}),
        };
        let canonical = serde_json::to_string(&unsigned).unwrap();
        let sig_a = hmac_sha256_hex("secret", &canonical);
        let sig_b = hmac_sha256_hex("secret", &canonical);
        assert_eq!(sig_a, sig_b);
    }
}
