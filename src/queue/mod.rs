//! Durable relay job queue.
//!
//! Delivery is at-least-once. A claim is exclusive until its visibility
//! deadline passes; after that the job returns to the ready list and another
//! worker may claim it. Every claim increments `attempts`, and that count is
//! the claim token: settling (`complete`/`retry`/`fail`) with a job whose
//! `attempts` no longer matches the stored record, or that is no longer in
//! flight, returns [`QueueError::ClaimLost`] and changes nothing.
//!
//! FIFO order within the ready list is best-effort only.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use self::memory::MemoryJobQueue;
pub use self::redis::RedisJobQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("claim on job {0} is no longer held")]
    ClaimLost(Uuid),

    #[error("corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Succeeded => "succeeded",
            JobStatus::FailedRetryable => "failed_retryable",
            JobStatus::FailedTerminal => "failed_terminal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "in_progress" => Some(JobStatus::InProgress),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed_retryable" => Some(JobStatus::FailedRetryable),
            "failed_terminal" => Some(JobStatus::FailedTerminal),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work: decrypt `encrypted_payload` and POST it to `target_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayJob {
    pub id: Uuid,
    pub encrypted_payload: String,
    /// Subject authenticated when the job was submitted.
    pub subject_id: String,
    pub target_url: String,
    pub enqueued_at: DateTime<Utc>,
    /// Number of times the job has been claimed.
    pub attempts: u32,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RelayJob {
    pub fn new(encrypted_payload: String, subject_id: String, target_url: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            encrypted_payload,
            subject_id,
            target_url,
            enqueued_at: now,
            attempts: 0,
            status: JobStatus::Queued,
            last_error: None,
            updated_at: now,
        }
    }

    /// Flatten into hash fields for the broker.
    pub(crate) fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("id", self.id.to_string()),
            ("encrypted_payload", self.encrypted_payload.clone()),
            ("subject_id", self.subject_id.clone()),
            ("target_url", self.target_url.clone()),
            ("enqueued_at", self.enqueued_at.to_rfc3339()),
            ("attempts", self.attempts.to_string()),
            ("status", self.status.as_str().to_string()),
            ("updated_at", self.updated_at.to_rfc3339()),
        ];
        if let Some(ref err) = self.last_error {
            fields.push(("last_error", err.clone()));
        }
        fields
    }

    pub(crate) fn from_fields(mut fields: HashMap<String, String>) -> Result<Self, QueueError> {
        let raw_id = fields.get("id").cloned().unwrap_or_default();
        let corrupt = |reason: &str| QueueError::Corrupt {
            id: raw_id.clone(),
            reason: reason.to_string(),
        };

        let mut take = |name: &str| fields.remove(name).ok_or_else(|| corrupt(name));

        let id = Uuid::parse_str(&take("id")?).map_err(|_| corrupt("id"))?;
        let encrypted_payload = take("encrypted_payload")?;
        let subject_id = take("subject_id")?;
        let target_url = take("target_url")?;
        let enqueued_at = parse_time(&take("enqueued_at")?).ok_or_else(|| corrupt("enqueued_at"))?;
        let attempts = take("attempts")?.parse().map_err(|_| corrupt("attempts"))?;
        let status = JobStatus::parse(&take("status")?).ok_or_else(|| corrupt("status"))?;
        let updated_at = parse_time(&take("updated_at")?).ok_or_else(|| corrupt("updated_at"))?;
        let last_error = fields.remove("last_error").filter(|e| !e.is_empty());

        Ok(Self {
            id,
            encrypted_payload,
            subject_id,
            target_url,
            enqueued_at,
            attempts,
            status,
            last_error,
            updated_at,
        })
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Snapshot of queue sizes for readiness checks and operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: u64,
    pub delayed: u64,
    pub in_flight: u64,
}

/// Abstraction over the persistent job broker.
/// Implementations: RedisJobQueue (production), MemoryJobQueue (tests).
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist a new job and make it claimable.
    async fn enqueue(&self, job: &RelayJob) -> Result<(), QueueError>;

    /// Atomically claim the next ready job, holding it for `visibility`.
    ///
    /// Due retries and expired claims are made ready first. The returned job
    /// has `attempts` already incremented and status `InProgress`.
    async fn claim(&self, visibility: Duration) -> Result<Option<RelayJob>, QueueError>;

    /// Mark a claimed job delivered. `job` is the record returned by `claim`.
    async fn complete(&self, job: &RelayJob) -> Result<(), QueueError>;

    /// Release a claimed job for another attempt after `delay`.
    async fn retry(&self, job: &RelayJob, delay: Duration, error: &str) -> Result<(), QueueError>;

    /// Mark a claimed job as permanently failed.
    async fn fail(&self, job: &RelayJob, error: &str) -> Result<(), QueueError>;

    /// Fetch a job record, including terminal ones still in the archive window.
    async fn get(&self, id: Uuid) -> Result<Option<RelayJob>, QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}
