use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;

use super::{hash_token, CredentialStore, RefreshRecord};
use crate::auth::password;

/// In-process credential store for tests and `--features test-store` builds.
///
/// There is no bypass: subjects must be seeded explicitly and their secrets
/// are checked exactly like the Redis store does. State is lost on restart.
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    subjects: Arc<DashMap<String, String>>,
    refresh: Arc<DashMap<String, RefreshRecord>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a subject (builder style, for tests).
    pub fn with_subject(self, subject_id: &str, secret: &str) -> anyhow::Result<Self> {
        let hash = password::hash_secret(secret)
            .map_err(|e| anyhow::anyhow!("failed to hash secret: {}", e))?;
        self.subjects.insert(subject_id.to_string(), hash);
        Ok(self)
    }

    /// Number of live refresh records (for tests).
    pub fn refresh_len(&self) -> usize {
        self.refresh.len()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn verify_subject(&self, subject_id: &str, secret: &str) -> anyhow::Result<bool> {
        let Some(hash) = self.subjects.get(subject_id).map(|h| h.value().clone()) else {
            return Ok(false);
        };
        let secret = secret.to_string();
        tokio::task::spawn_blocking(move || password::verify_secret(&secret, &hash))
            .await
            .context("secret verification task panicked")?
            .map_err(|e| anyhow::anyhow!("stored secret hash is unreadable: {}", e))
    }

    async fn put_subject(&self, subject_id: &str, secret: &str) -> anyhow::Result<()> {
        let secret = secret.to_string();
        let hash = tokio::task::spawn_blocking(move || password::hash_secret(&secret))
            .await
            .context("secret hashing task panicked")?
            .map_err(|e| anyhow::anyhow!("failed to hash secret: {}", e))?;
        self.subjects.insert(subject_id.to_string(), hash);
        Ok(())
    }

    async fn put_refresh(&self, token: &str, record: &RefreshRecord) -> anyhow::Result<()> {
        self.refresh.insert(hash_token(token), record.clone());
        Ok(())
    }

    async fn get_refresh(&self, token: &str) -> anyhow::Result<Option<RefreshRecord>> {
        let key = hash_token(token);
        let record = self.refresh.get(&key).map(|r| r.value().clone());
        match record {
            Some(r) if r.is_expired() => {
                self.refresh.remove(&key);
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn delete_refresh(&self, token: &str) -> anyhow::Result<bool> {
        Ok(self.refresh.remove(&hash_token(token)).is_some())
    }
}
