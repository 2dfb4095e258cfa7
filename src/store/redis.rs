use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{hash_token, CredentialStore, RefreshRecord};
use crate::auth::password;

/// Redis-backed credential store.
///
/// Keys:
/// - `<prefix>:subject:<id>` → argon2id hash of the subject's secret
/// - `<prefix>:refresh:<sha256(token)>` → JSON `RefreshRecord`, TTL = token lifetime
#[derive(Clone)]
pub struct RedisCredentialStore {
    redis: ConnectionManager,
    prefix: String,
}

impl RedisCredentialStore {
    pub fn new(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
        }
    }

    fn subject_key(&self, subject_id: &str) -> String {
        format!("{}:subject:{}", self.prefix, subject_id)
    }

    fn refresh_key(&self, token: &str) -> String {
        format!("{}:refresh:{}", self.prefix, hash_token(token))
    }
}

#[async_trait]
impl CredentialStore for RedisCredentialStore {
    async fn verify_subject(&self, subject_id: &str, secret: &str) -> anyhow::Result<bool> {
        let mut conn = self.redis.clone();
        let stored: Option<String> = conn.get(self.subject_key(subject_id)).await?;
        let Some(hash) = stored else {
            return Ok(false);
        };

        // argon2 runs on the blocking pool.
        let secret = secret.to_string();
        let ok = tokio::task::spawn_blocking(move || password::verify_secret(&secret, &hash))
            .await
            .context("secret verification task panicked")?
            .map_err(|e| anyhow::anyhow!("stored secret hash is unreadable: {}", e))?;
        Ok(ok)
    }

    async fn put_subject(&self, subject_id: &str, secret: &str) -> anyhow::Result<()> {
        let secret = secret.to_string();
        let hash = tokio::task::spawn_blocking(move || password::hash_secret(&secret))
            .await
            .context("secret hashing task panicked")?
            .map_err(|e| anyhow::anyhow!("failed to hash secret: {}", e))?;

        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(self.subject_key(subject_id), hash)
            .await?;
        Ok(())
    }

    async fn put_refresh(&self, token: &str, record: &RefreshRecord) -> anyhow::Result<()> {
        let ttl_secs = (record.expires_at - Utc::now()).num_seconds();
        if ttl_secs <= 0 {
            anyhow::bail!("refusing to store an already-expired refresh token");
        }
        let json = serde_json::to_string(record)?;
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(self.refresh_key(token), json, ttl_secs as u64)
            .await?;
        Ok(())
    }

    async fn get_refresh(&self, token: &str) -> anyhow::Result<Option<RefreshRecord>> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(self.refresh_key(token)).await?;
        let record = match raw {
            Some(v) => serde_json::from_str::<RefreshRecord>(&v)?,
            None => return Ok(None),
        };
        if record.is_expired() {
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn delete_refresh(&self, token: &str) -> anyhow::Result<bool> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.del(self.refresh_key(token)).await?;
        Ok(removed > 0)
    }
}
