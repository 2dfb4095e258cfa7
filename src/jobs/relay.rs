//! Relay workers: claim a job, decrypt it, forward it, record the outcome.
//!
//! Decryption failures are terminal on the first attempt. Delivery failures
//! are retried with exponential backoff until `max_attempts` claims have been
//! spent. Payload contents are never logged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::delivery::DeliveryClient;
use crate::middleware::metrics::METRICS;
use crate::queue::{JobQueue, QueueError, RelayJob};
use crate::vault::Keyring;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_VISIBILITY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Claims allowed per job, the first delivery included.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 2_000,
            max_backoff_ms: 300_000,
            jitter_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped, plus up to `jitter_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff_ms as f64;
        let max = self.max_backoff_ms as f64;

        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let capped = (base * 2_f64.powi(exponent)).min(max);

        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(capped as u64 + jitter)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered,
    Retrying { attempt: u32, delay: Duration },
    Failed { reason: String },
    /// Our claim expired and another worker owns the job now.
    ClaimLost,
}

#[derive(Clone)]
pub struct RelayWorker {
    queue: Arc<dyn JobQueue>,
    keyring: Arc<Keyring>,
    delivery: DeliveryClient,
    policy: RetryPolicy,
    visibility: Duration,
    poll_interval: Duration,
}

impl RelayWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        keyring: Arc<Keyring>,
        delivery: DeliveryClient,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            keyring,
            delivery,
            policy,
            visibility: DEFAULT_VISIBILITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// How long a claim stays exclusive. Must exceed the delivery timeout.
    pub fn with_visibility(mut self, visibility: Duration) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Claim and process at most one job. `Ok(None)` means nothing was ready.
    pub async fn process_one(&self) -> Result<Option<JobOutcome>, QueueError> {
        let Some(job) = self.queue.claim(self.visibility).await? else {
            return Ok(None);
        };

        debug!(job_id = %job.id, attempt = job.attempts, "claimed relay job");

        if job.attempts > self.policy.max_attempts {
            warn!(job_id = %job.id, attempts = job.attempts, "attempts exhausted before delivery");
            return self.fail(&job, "attempts exhausted").await.map(Some);
        }

        let plaintext = match self.keyring.decrypt(&job.encrypted_payload) {
            Ok(bytes) => Zeroizing::new(bytes),
            Err(_) => {
                error!(job_id = %job.id, "payload could not be decrypted, failing job");
                return self.fail(&job, "payload could not be decrypted").await.map(Some);
            }
        };

        let started = Instant::now();
        let result = self.delivery.deliver(&job, &plaintext).await;
        let elapsed = started.elapsed().as_secs_f64();

        let outcome = match result {
            Ok(()) => {
                METRICS.delivery_attempt("ok", elapsed);
                match self.queue.complete(&job).await {
                    Ok(()) => {
                        METRICS.job_completed("succeeded");
                        info!(job_id = %job.id, attempt = job.attempts, "relay job delivered");
                        JobOutcome::Delivered
                    }
                    Err(e) => lost_or(e, &job)?,
                }
            }
            Err(e) => {
                METRICS.delivery_attempt(e.label(), elapsed);
                let reason = e.to_string();

                if !e.is_retryable() || self.policy.exhausted(job.attempts) {
                    warn!(job_id = %job.id, attempt = job.attempts, error = %reason, "delivery failed permanently");
                    return self.fail(&job, &reason).await.map(Some);
                }

                let delay = self.policy.backoff(job.attempts);
                match self.queue.retry(&job, delay, &reason).await {
                    Ok(()) => {
                        warn!(
                            job_id = %job.id,
                            attempt = job.attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %reason,
                            "delivery failed, will retry"
                        );
                        JobOutcome::Retrying {
                            attempt: job.attempts,
                            delay,
                        }
                    }
                    Err(e) => lost_or(e, &job)?,
                }
            }
        };

        Ok(Some(outcome))
    }

    async fn fail(&self, job: &RelayJob, reason: &str) -> Result<JobOutcome, QueueError> {
        match self.queue.fail(job, reason).await {
            Ok(()) => {
                METRICS.job_completed("failed_terminal");
                Ok(JobOutcome::Failed {
                    reason: reason.to_string(),
                })
            }
            Err(e) => lost_or(e, job),
        }
    }

    /// Run until `shutdown` fires. A job in hand is finished before exiting.
    pub async fn run(self, worker_id: usize, shutdown: CancellationToken) {
        info!(worker_id, "relay worker starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.process_one().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(worker_id, error = %e, "relay worker queue error"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {},
                _ = shutdown.cancelled() => break,
            }
        }

        info!(worker_id, "relay worker stopped");
    }
}

/// A settle that lost its claim is not an error for the worker.
fn lost_or(e: QueueError, job: &RelayJob) -> Result<JobOutcome, QueueError> {
    match e {
        QueueError::ClaimLost(_) => {
            warn!(job_id = %job.id, "claim expired before settling, leaving job to its new owner");
            Ok(JobOutcome::ClaimLost)
        }
        other => Err(other),
    }
}

/// Spawn `size` independent workers sharing one configuration.
pub fn spawn_pool(
    worker: RelayWorker,
    size: usize,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..size)
        .map(|id| tokio::spawn(worker.clone().run(id, shutdown.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobStatus, MemoryJobQueue};
    use crate::vault::DataKey;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn keyring() -> Arc<Keyring> {
        Arc::new(Keyring::new(DataKey::new("k1", [7u8; 32]).unwrap()))
    }

    fn no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff_ms: 10,
            max_backoff_ms: 1_000,
            jitter_ms: 0,
        }
    }

    fn worker(queue: &MemoryJobQueue, keys: Arc<Keyring>, policy: RetryPolicy) -> RelayWorker {
        let delivery = DeliveryClient::new(Duration::from_millis(200), None).unwrap();
        RelayWorker::new(Arc::new(queue.clone()), keys, delivery, policy)
            .with_visibility(Duration::from_secs(30))
            .with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        let p = RetryPolicy { jitter_ms: 0, ..policy };
        assert_eq!(p.backoff(1), Duration::from_secs(2));
        assert_eq!(p.backoff(2), Duration::from_secs(4));
        assert_eq!(p.backoff(3), Duration::from_secs(8));
        assert_eq!(p.backoff(20), Duration::from_secs(300));
        assert_eq!(p.backoff(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_jitter_is_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.backoff(1);
            assert!(d >= Duration::from_millis(2_000));
            assert!(d <= Duration::from_millis(2_500));
        }
    }

    #[tokio::test]
    async fn test_empty_queue_is_none() {
        let queue = MemoryJobQueue::new();
        let w = worker(&queue, keyring(), no_jitter(5));
        assert_eq!(w.process_one().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delivers_decrypted_payload_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(serde_json::json!({"data": "hello", "subjectId": "u1"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let keys = keyring();
        let queue = MemoryJobQueue::new();
        let job = RelayJob::new(
            keys.encrypt(b"hello").unwrap(),
            "u1".into(),
            format!("{}/hook", server.uri()),
        );
        queue.enqueue(&job).await.unwrap();

        let w = worker(&queue, keys, no_jitter(5));
        assert_eq!(w.process_one().await.unwrap(), Some(JobOutcome::Delivered));

        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_undecryptable_payload_fails_without_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let foreign = Keyring::new(DataKey::new("k1", [9u8; 32]).unwrap());
        let queue = MemoryJobQueue::new();
        let job = RelayJob::new(foreign.encrypt(b"secret").unwrap(), "u1".into(), server.uri());
        queue.enqueue(&job).await.unwrap();

        let w = worker(&queue, keyring(), no_jitter(5));
        assert!(matches!(
            w.process_one().await.unwrap(),
            Some(JobOutcome::Failed { .. })
        ));

        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::FailedTerminal);
        assert_eq!(stored.attempts, 1);
        assert!(w.process_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejected_delivery_is_retried_then_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let keys = keyring();
        let queue = MemoryJobQueue::new();
        let job = RelayJob::new(keys.encrypt(b"hello").unwrap(), "u1".into(), server.uri());
        queue.enqueue(&job).await.unwrap();

        let w = worker(&queue, keys, no_jitter(2));
        assert_eq!(
            w.process_one().await.unwrap(),
            Some(JobOutcome::Retrying {
                attempt: 1,
                delay: Duration::from_millis(10)
            })
        );
        assert_eq!(
            queue.get(job.id).await.unwrap().unwrap().status,
            JobStatus::FailedRetryable
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(
            w.process_one().await.unwrap(),
            Some(JobOutcome::Failed { .. })
        ));
        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::FailedTerminal);
        assert_eq!(stored.attempts, 2);
        assert!(stored.last_error.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let keys = keyring();
        let queue = MemoryJobQueue::new();
        let job = RelayJob::new(keys.encrypt(b"hello").unwrap(), "u1".into(), server.uri());
        queue.enqueue(&job).await.unwrap();

        let w = worker(&queue, keys, no_jitter(5));
        assert!(matches!(
            w.process_one().await.unwrap(),
            Some(JobOutcome::Retrying { attempt: 1, .. })
        ));
        assert_eq!(
            queue.get(job.id).await.unwrap().unwrap().last_error.as_deref(),
            Some("delivery timed out")
        );
    }

    #[tokio::test]
    async fn test_redelivered_job_over_budget_is_terminal() {
        let keys = keyring();
        let queue = MemoryJobQueue::new();
        let job = RelayJob::new(keys.encrypt(b"hello").unwrap(), "u1".into(), "http://127.0.0.1:9".into());
        queue.enqueue(&job).await.unwrap();

        // Simulate a worker crashing mid-delivery: claims that expire unsettled.
        for _ in 0..2 {
            queue.claim(Duration::from_millis(0)).await.unwrap().unwrap();
        }

        let w = worker(&queue, keys, no_jitter(2));
        assert_eq!(
            w.process_one().await.unwrap(),
            Some(JobOutcome::Failed {
                reason: "attempts exhausted".into()
            })
        );
    }

    #[tokio::test]
    async fn test_slow_delivery_does_not_settle_over_new_claim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(120)))
            .mount(&server)
            .await;

        let keys = keyring();
        let queue = MemoryJobQueue::new();
        let job = RelayJob::new(keys.encrypt(b"hello").unwrap(), "u1".into(), server.uri());
        queue.enqueue(&job).await.unwrap();

        let w = worker(&queue, keys, no_jitter(5)).with_visibility(Duration::from_millis(40));
        let takeover = async {
            tokio::time::sleep(Duration::from_millis(70)).await;
            queue.claim(Duration::from_secs(30)).await.unwrap()
        };
        let (outcome, other) = tokio::join!(w.process_one(), takeover);

        assert_eq!(outcome.unwrap(), Some(JobOutcome::ClaimLost));
        assert_eq!(other.unwrap().attempts, 2);
        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::InProgress);
        assert_eq!(queue.depth().await.unwrap().in_flight, 1);
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops_on_cancel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(3)
            .mount(&server)
            .await;

        let keys = keyring();
        let queue = MemoryJobQueue::new();
        for i in 0..3 {
            let payload = keys.encrypt(format!("job-{i}").as_bytes()).unwrap();
            queue
                .enqueue(&RelayJob::new(payload, "u1".into(), server.uri()))
                .await
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let handles = spawn_pool(worker(&queue, keys, no_jitter(5)), 2, shutdown.clone());

        for _ in 0..100 {
            let done = queue
                .jobs()
                .await
                .iter()
                .all(|j| j.status == JobStatus::Succeeded);
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(queue
            .jobs()
            .await
            .iter()
            .all(|j| j.status == JobStatus::Succeeded));
    }
}
