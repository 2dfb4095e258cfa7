use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{JobQueue, JobStatus, QueueDepth, QueueError, RelayJob};

#[derive(Default)]
struct Inner {
    records: HashMap<Uuid, RelayJob>,
    ready: VecDeque<Uuid>,
    /// id → retry due time
    delayed: HashMap<Uuid, DateTime<Utc>>,
    /// id → visibility deadline
    inflight: HashMap<Uuid, DateTime<Utc>>,
}

impl Inner {
    fn promote(&mut self, now: DateTime<Utc>) {
        let due: Vec<Uuid> = self
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            self.delayed.remove(&id);
            self.ready.push_back(id);
        }

        let expired: Vec<Uuid> = self
            .inflight
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.inflight.remove(&id);
            // Redelivered ahead of fresh work, like the Redis RPUSH.
            self.ready.push_front(id);
            if let Some(job) = self.records.get_mut(&id) {
                job.status = JobStatus::Queued;
                job.updated_at = now;
            }
        }
    }

    fn settle(
        &mut self,
        claimed: &RelayJob,
        status: JobStatus,
        error: Option<&str>,
        retry_after: Option<Duration>,
    ) -> Result<(), QueueError> {
        let id = claimed.id;
        let held = self.inflight.contains_key(&id)
            && self
                .records
                .get(&id)
                .is_some_and(|job| job.attempts == claimed.attempts);
        if !held {
            return Err(QueueError::ClaimLost(id));
        }

        self.inflight.remove(&id);
        let now = Utc::now();
        if let Some(job) = self.records.get_mut(&id) {
            job.status = status;
            job.updated_at = now;
            if let Some(err) = error {
                job.last_error = Some(err.to_string());
            }
        }
        if let Some(delay) = retry_after {
            self.delayed.insert(id, now + to_chrono(delay));
        }
        Ok(())
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// In-process job broker with the same claim/visibility semantics as
/// [`RedisJobQueue`](super::RedisJobQueue). Jobs are lost on restart, and
/// terminal records are kept until the process exits.
#[derive(Clone, Default)]
pub struct MemoryJobQueue {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, in no particular order.
    pub async fn jobs(&self) -> Vec<RelayJob> {
        self.inner.lock().await.records.values().cloned().collect()
    }

    /// Number of records held, terminal ones included.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &RelayJob) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner.records.insert(job.id, job.clone());
        inner.ready.push_back(job.id);
        Ok(())
    }

    async fn claim(&self, visibility: Duration) -> Result<Option<RelayJob>, QueueError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.promote(now);

        while let Some(id) = inner.ready.pop_front() {
            let Some(job) = inner.records.get_mut(&id) else {
                continue;
            };
            job.attempts += 1;
            job.status = JobStatus::InProgress;
            job.updated_at = now;
            let claimed = job.clone();
            inner.inflight.insert(id, now + to_chrono(visibility));
            return Ok(Some(claimed));
        }
        Ok(None)
    }

    async fn complete(&self, job: &RelayJob) -> Result<(), QueueError> {
        self.inner
            .lock()
            .await
            .settle(job, JobStatus::Succeeded, None, None)
    }

    async fn retry(&self, job: &RelayJob, delay: Duration, error: &str) -> Result<(), QueueError> {
        self.inner
            .lock()
            .await
            .settle(job, JobStatus::FailedRetryable, Some(error), Some(delay))
    }

    async fn fail(&self, job: &RelayJob, error: &str) -> Result<(), QueueError> {
        self.inner
            .lock()
            .await
            .settle(job, JobStatus::FailedTerminal, Some(error), None)
    }

    async fn get(&self, id: Uuid) -> Result<Option<RelayJob>, QueueError> {
        Ok(self.inner.lock().await.records.get(&id).cloned())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let inner = self.inner.lock().await;
        Ok(QueueDepth {
            ready: inner.ready.len() as u64,
            delayed: inner.delayed.len() as u64,
            in_flight: inner.inflight.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> RelayJob {
        RelayJob::new("k1.payload".into(), "u1".into(), "https://example.test/hook".into())
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let q = MemoryJobQueue::new();
        let j = job();
        q.enqueue(&j).await.unwrap();

        let claimed = q.claim(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(claimed.id, j.id);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.status, JobStatus::InProgress);
        assert!(q.claim(Duration::from_secs(30)).await.unwrap().is_none());
        assert_eq!(q.depth().await.unwrap().in_flight, 1);
    }

    #[tokio::test]
    async fn test_complete_settles_claim() {
        let q = MemoryJobQueue::new();
        let j = job();
        q.enqueue(&j).await.unwrap();
        let claimed = q.claim(Duration::from_secs(30)).await.unwrap().unwrap();

        q.complete(&claimed).await.unwrap();
        let stored = q.get(j.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(q.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn test_expired_claim_is_redelivered() {
        let q = MemoryJobQueue::new();
        let j = job();
        q.enqueue(&j).await.unwrap();
        q.claim(Duration::from_millis(0)).await.unwrap().unwrap();

        let again = q.claim(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(again.id, j.id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_settle_twice_is_claim_lost() {
        let q = MemoryJobQueue::new();
        let j = job();
        q.enqueue(&j).await.unwrap();
        let claimed = q.claim(Duration::from_secs(30)).await.unwrap().unwrap();

        q.complete(&claimed).await.unwrap();
        assert!(matches!(
            q.complete(&claimed).await,
            Err(QueueError::ClaimLost(id)) if id == j.id
        ));
        assert!(matches!(q.fail(&job(), "x").await, Err(QueueError::ClaimLost(_))));
    }

    #[tokio::test]
    async fn test_expired_owner_cannot_settle_over_new_owner() {
        let q = MemoryJobQueue::new();
        let j = job();
        q.enqueue(&j).await.unwrap();
        let first = q.claim(Duration::from_millis(0)).await.unwrap().unwrap();
        let second = q.claim(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);

        for result in [
            q.retry(&first, Duration::from_millis(0), "timeout").await,
            q.fail(&first, "timeout").await,
            q.complete(&first).await,
        ] {
            assert!(matches!(result, Err(QueueError::ClaimLost(id)) if id == j.id));
        }

        // The second claim is untouched: still exclusive, still settleable.
        assert!(q.claim(Duration::from_secs(30)).await.unwrap().is_none());
        let stored = q.get(j.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::InProgress);
        assert_eq!(stored.last_error, None);
        assert_eq!(q.depth().await.unwrap().in_flight, 1);

        q.complete(&second).await.unwrap();
        assert_eq!(q.get(j.id).await.unwrap().unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_stale_owner_cannot_settle_after_retry() {
        let q = MemoryJobQueue::new();
        let j = job();
        q.enqueue(&j).await.unwrap();
        let first = q.claim(Duration::from_millis(0)).await.unwrap().unwrap();
        // Promotion back to ready happens on the next claim attempt.
        let second = q.claim(Duration::from_secs(30)).await.unwrap().unwrap();
        q.retry(&second, Duration::from_secs(60), "timeout").await.unwrap();

        assert!(matches!(q.complete(&first).await, Err(QueueError::ClaimLost(_))));
        assert_eq!(q.depth().await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_retry_waits_for_delay() {
        let q = MemoryJobQueue::new();
        let j = job();
        q.enqueue(&j).await.unwrap();
        let claimed = q.claim(Duration::from_secs(30)).await.unwrap().unwrap();

        q.retry(&claimed, Duration::from_millis(40), "timeout").await.unwrap();
        let stored = q.get(j.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::FailedRetryable);
        assert!(q.claim(Duration::from_secs(30)).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let again = q.claim(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);
        assert_eq!(again.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_fail_is_terminal() {
        let q = MemoryJobQueue::new();
        let j = job();
        q.enqueue(&j).await.unwrap();
        let claimed = q.claim(Duration::from_secs(30)).await.unwrap().unwrap();
        q.fail(&claimed, "undecryptable").await.unwrap();

        let stored = q.get(j.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::FailedTerminal);
        assert!(q.claim(Duration::from_secs(30)).await.unwrap().is_none());
        assert_eq!(q.len().await, 1);
    }
}
