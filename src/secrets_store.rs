//! Repository Secrets Store (SPEC_FULL.md §4.7) — process-wide, keyed by
//! repository, not by session. Shares a SQL database with no other
//! coordinator state (spec.md §5: "share a process-wide SQL database").

use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::crypto::EnvelopeCipher;
use crate::error::CoordinatorError;
use crate::models::{RepositorySecretMeta, now_ms};

const MAX_KEY_LEN: usize = 256;

/// Operational variables and provider API-key names a caller may never
/// set as a repo secret — reserved regardless of case.
const RESERVED_KEYS: &[&str] = &[
    "PATH",
    "HOME",
    "SHELL",
    "USER",
    "LANG",
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "NODE_ENV",
    "CI",
];

#[derive(Clone)]
pub struct SecretsStore {
    pool: SqlitePool,
    cipher: EnvelopeCipher,
    max_secrets_per_repo: usize,
    max_value_bytes: usize,
    max_aggregate_bytes: usize,
}

pub struct SecretInput {
    pub key: String,
    pub value: String,
}

impl SecretsStore {
    pub async fn connect(
        db_url: &str,
        cipher: EnvelopeCipher,
        max_secrets_per_repo: usize,
        max_value_bytes: usize,
        max_aggregate_bytes: usize,
    ) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .with_context(|| format!("failed to connect to secrets store: {db_url}"))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS repo_secrets (
                repo_id TEXT NOT NULL,
                repo_owner TEXT NOT NULL,
                repo_name TEXT NOT NULL,
                key TEXT NOT NULL,
                encrypted_value TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (repo_id, key)
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_repo_secrets_owner_name ON repo_secrets (repo_owner, repo_name)",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            cipher,
            max_secrets_per_repo,
            max_value_bytes,
            max_aggregate_bytes,
        })
    }

    fn validate_key(key: &str) -> Result<(), CoordinatorError> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(CoordinatorError::Validation(format!(
                "key length must be 1-{MAX_KEY_LEN} characters"
            )));
        }
        let mut chars = key.chars();
        let first_ok = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !first_ok || !rest_ok {
            return Err(CoordinatorError::Validation(format!(
                "key {key:?} must match [A-Za-z_][A-Za-z0-9_]*"
            )));
        }
        if RESERVED_KEYS
            .iter()
            .any(|r| r.eq_ignore_ascii_case(key))
        {
            return Err(CoordinatorError::Validation(format!(
                "key {key:?} is reserved"
            )));
        }
        Ok(())
    }

    /// Batch-upserts secrets for a repo. Keys are normalized to upper-case;
    /// quota is checked against the state the batch would produce.
    pub async fn set_secrets(
        &self,
        repo_id: &str,
        repo_owner: &str,
        repo_name: &str,
        inputs: Vec<SecretInput>,
    ) -> Result<(), CoordinatorError> {
        let mut normalized = Vec::with_capacity(inputs.len());
        for input in inputs {
            let key = input.key.to_ascii_uppercase();
            Self::validate_key(&key)?;
            if input.value.len() > self.max_value_bytes {
                return Err(CoordinatorError::Validation(format!(
                    "value for {key:?} exceeds {} byte limit",
                    self.max_value_bytes
                )));
            }
            normalized.push((key, input.value));
        }

        let existing = self
            .list_meta(repo_id)
            .await
            .map_err(CoordinatorError::Internal)?;
        let existing_keys: std::collections::HashSet<String> =
            existing.iter().map(|m| m.key.clone()).collect();
        let new_key_count = normalized
            .iter()
            .filter(|(k, _)| !existing_keys.contains(k))
            .count();
        let total_after = existing.len() + new_key_count;
        if total_after > self.max_secrets_per_repo {
            return Err(CoordinatorError::Validation(format!(
                "exceeds {} secrets limit",
                self.max_secrets_per_repo
            )));
        }

        let existing_aggregate_for_untouched: usize = {
            let touched: std::collections::HashSet<&str> =
                normalized.iter().map(|(k, _)| k.as_str()).collect();
            let mut sum = 0usize;
            for m in &existing {
                if !touched.contains(m.key.as_str()) {
                    sum += self.get_value_len(repo_id, &m.key).await.unwrap_or(0);
                }
            }
            sum
        };
        let new_aggregate: usize = normalized.iter().map(|(_, v)| v.len()).sum();
        if existing_aggregate_for_untouched + new_aggregate > self.max_aggregate_bytes {
            return Err(CoordinatorError::Validation(format!(
                "exceeds {} byte aggregate limit",
                self.max_aggregate_bytes
            )));
        }

        let now = now_ms();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoordinatorError::Internal(e.into()))?;
        for (key, value) in normalized {
            let encrypted = self
                .cipher
                .encrypt(&value)
                .map_err(CoordinatorError::Internal)?;
            sqlx::query(
                r#"
                INSERT INTO repo_secrets (repo_id, repo_owner, repo_name, key, encrypted_value, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (repo_id, key) DO UPDATE SET
                    encrypted_value = excluded.encrypted_value,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(repo_id)
            .bind(repo_owner)
            .bind(repo_name)
            .bind(&key)
            .bind(&encrypted)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| CoordinatorError::Internal(e.into()))?;
        }
        tx.commit()
            .await
            .map_err(|e| CoordinatorError::Internal(e.into()))?;
        Ok(())
    }

    async fn get_value_len(&self, repo_id: &str, key: &str) -> Result<usize> {
        let row = sqlx::query(
            "SELECT encrypted_value FROM repo_secrets WHERE repo_id = ? AND key = ?",
        )
        .bind(repo_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let encrypted: String = row.try_get("encrypted_value")?;
                let plain = self.cipher.decrypt(&encrypted)?;
                Ok(plain.len())
            }
            None => Ok(0),
        }
    }

    pub async fn list_meta(&self, repo_id: &str) -> Result<Vec<RepositorySecretMeta>> {
        let rows = sqlx::query(
            "SELECT key, created_at, updated_at FROM repo_secrets WHERE repo_id = ? ORDER BY key ASC",
        )
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(RepositorySecretMeta {
                    key: row.try_get("key")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    /// Decrypts all values for a repo — used when materializing secrets
    /// into a sandbox session. A decryption failure names the offending
    /// key and is treated as terminal (spec.md §4.7).
    pub async fn decrypt_all(
        &self,
        repo_id: &str,
    ) -> Result<Vec<(String, String)>, CoordinatorError> {
        let rows = sqlx::query("SELECT key, encrypted_value FROM repo_secrets WHERE repo_id = ?")
            .bind(repo_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CoordinatorError::Internal(e.into()))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row
                .try_get("key")
                .map_err(|e| CoordinatorError::Internal(e.into()))?;
            let encrypted: String = row
                .try_get("encrypted_value")
                .map_err(|e| CoordinatorError::Internal(e.into()))?;
            let value = self.cipher.decrypt(&encrypted).map_err(|e| {
                CoordinatorError::Internal(anyhow::anyhow!(
                    "failed to decrypt secret {key:?}: {e}"
                ))
            })?;
            out.push((key, value));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SecretsStore {
        let cipher =
            EnvelopeCipher::from_base64_key("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
                .unwrap();
        SecretsStore::connect("sqlite::memory:", cipher, 50, 16 * 1024, 64 * 1024)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reserved_keys_rejected_any_case() {
        let store = test_store().await;
        for variant in ["GITHUB_TOKEN", "github_token", "Github_Token"] {
            let err = store
                .set_secrets(
                    "r1",
                    "acme",
                    "web",
                    vec![SecretInput {
                        key: variant.into(),
                        value: "x".into(),
                    }],
                )
                .await
                .unwrap_err();
            assert!(matches!(err, CoordinatorError::Validation(_)));
        }
    }

    #[tokio::test]
    async fn quota_enforced_at_fifty_one() {
        let store = test_store().await;
        let inputs: Vec<SecretInput> = (0..50)
            .map(|i| SecretInput {
                key: format!("K_{i}"),
                value: "y".into(),
            })
            .collect();
        store.set_secrets("r1", "acme", "web", inputs).await.unwrap();
        let meta = store.list_meta("r1").await.unwrap();
        assert_eq!(meta.len(), 50);

        let err = store
            .set_secrets(
                "r1",
                "acme",
                "web",
                vec![SecretInput {
                    key: "K_50".into(),
                    value: "y".into(),
                }],
            )
            .await
            .unwrap_err();
        match err {
            CoordinatorError::Validation(msg) => assert!(msg.contains("50 secrets limit")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn round_trip_decrypt() {
        let store = test_store().await;
        store
            .set_secrets(
                "r1",
                "acme",
                "web",
                vec![SecretInput {
                    key: "api_key".into(),
                    value: "sekret".into(),
                }],
            )
            .await
            .unwrap();
        let values = store.decrypt_all("r1").await.unwrap();
        assert_eq!(values, vec![("API_KEY".to_string(), "sekret".to_string())]);
    }

    #[tokio::test]
    async fn value_size_limit_enforced() {
        let store = test_store().await;
        let err = store
            .set_secrets(
                "r1",
                "acme",
                "web",
                vec![SecretInput {
                    key: "BIG".into(),
                    value: "x".repeat(16 * 1024 + 1),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(_)));
    }
}
