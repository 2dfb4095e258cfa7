pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use self::memory::MemoryCredentialStore;
pub use self::redis::RedisCredentialStore;

/// Persisted side of a refresh token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRecord {
    pub subject_id: String,
    pub expires_at: DateTime<Utc>,
}

impl RefreshRecord {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Abstraction over the subject/refresh-token store.
/// Implementations: RedisCredentialStore (production), MemoryCredentialStore (tests).
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Check a subject's primary secret. Unknown subjects return `false`.
    async fn verify_subject(&self, subject_id: &str, secret: &str) -> anyhow::Result<bool>;

    /// Create or replace a subject's secret (stored as an argon2id hash).
    async fn put_subject(&self, subject_id: &str, secret: &str) -> anyhow::Result<()>;

    /// Persist a refresh token. The record expires with the token.
    async fn put_refresh(&self, token: &str, record: &RefreshRecord) -> anyhow::Result<()>;

    /// Look up a refresh token. Expired records are treated as absent.
    async fn get_refresh(&self, token: &str) -> anyhow::Result<Option<RefreshRecord>>;

    /// Revoke a refresh token. Returns whether a record was removed.
    async fn delete_refresh(&self, token: &str) -> anyhow::Result<bool>;
}

/// Refresh tokens are stored under their SHA-256 digest, never raw.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_hash_is_deterministic() {
        assert_eq!(hash_token("same-token"), hash_token("same-token"));
        assert_ne!(hash_token("same-token"), hash_token("different-token"));
        assert_eq!(hash_token("x").len(), 64);
    }

    #[test]
    fn refresh_record_serializes_camel_case() {
        let record = RefreshRecord {
            subject_id: "u1".into(),
            expires_at: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["subjectId"], "u1");
        assert!(json.get("expiresAt").is_some());
    }
}
