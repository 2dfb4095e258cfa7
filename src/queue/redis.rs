use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use super::{JobQueue, JobStatus, QueueDepth, QueueError, RelayJob};

/// Promote due retries and expired claims, then claim one ready job.
///
/// KEYS: ready, delayed, inflight
/// ARGV: now_ms, visibility_deadline_ms, job_key_prefix, now_rfc3339
static CLAIM_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local due = redis.call("ZRANGEBYSCORE", KEYS[2], "-inf", ARGV[1], "LIMIT", 0, 100)
        for _, id in ipairs(due) do
            redis.call("ZREM", KEYS[2], id)
            redis.call("LPUSH", KEYS[1], id)
        end

        local expired = redis.call("ZRANGEBYSCORE", KEYS[3], "-inf", ARGV[1], "LIMIT", 0, 100)
        for _, id in ipairs(expired) do
            redis.call("ZREM", KEYS[3], id)
            redis.call("RPUSH", KEYS[1], id)
            redis.call("HSET", ARGV[3] .. id, "status", "queued", "updated_at", ARGV[4])
        end

        while true do
            local id = redis.call("RPOP", KEYS[1])
            if not id then
                return false
            end
            local key = ARGV[3] .. id
            if redis.call("EXISTS", key) == 1 then
                redis.call("ZADD", KEYS[3], ARGV[2], id)
                redis.call("HINCRBY", key, "attempts", 1)
                redis.call("HSET", key, "status", "in_progress", "updated_at", ARGV[4])
                return id
            end
        end
    "#,
    )
});

/// Settle a claim. No-op (returns 0) unless the job is still in flight under
/// the same attempt count it was claimed with.
///
/// KEYS: inflight, delayed, job_key
/// ARGV: id, status, now_rfc3339, last_error ("" = none), archive_ttl_secs,
///       retry_due_ms ("" = terminal), claimed_attempts
static SETTLE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if not redis.call("ZSCORE", KEYS[1], ARGV[1]) then
            return 0
        end
        if redis.call("HGET", KEYS[3], "attempts") ~= ARGV[7] then
            return 0
        end
        redis.call("ZREM", KEYS[1], ARGV[1])
        redis.call("HSET", KEYS[3], "status", ARGV[2], "updated_at", ARGV[3])
        if ARGV[4] ~= "" then
            redis.call("HSET", KEYS[3], "last_error", ARGV[4])
        end
        if ARGV[6] ~= "" then
            redis.call("ZADD", KEYS[2], ARGV[6], ARGV[1])
        else
            redis.call("EXPIRE", KEYS[3], ARGV[5])
        end
        return 1
    "#,
    )
});

/// Redis-backed job broker.
///
/// Keys:
/// - `<prefix>:queue:ready`    LIST of job ids (LPUSH / RPOP)
/// - `<prefix>:queue:delayed`  ZSET id → retry due time (ms)
/// - `<prefix>:queue:inflight` ZSET id → visibility deadline (ms)
/// - `<prefix>:queue:dead`     LIST of ids whose records could not be parsed
/// - `<prefix>:job:<id>`       HASH job record; expires `archive_ttl` after settling
///
/// Durability follows the Redis persistence configuration (AOF recommended).
#[derive(Clone)]
pub struct RedisJobQueue {
    redis: ConnectionManager,
    prefix: String,
    archive_ttl: Duration,
}

impl RedisJobQueue {
    pub fn new(redis: ConnectionManager, prefix: &str, archive_ttl: Duration) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
            archive_ttl,
        }
    }

    fn ready_key(&self) -> String {
        format!("{}:queue:ready", self.prefix)
    }

    fn delayed_key(&self) -> String {
        format!("{}:queue:delayed", self.prefix)
    }

    fn inflight_key(&self) -> String {
        format!("{}:queue:inflight", self.prefix)
    }

    fn dead_key(&self) -> String {
        format!("{}:queue:dead", self.prefix)
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn job_key(&self, id: Uuid) -> String {
        format!("{}{}", self.job_prefix(), id)
    }

    async fn settle(
        &self,
        claimed: &RelayJob,
        status: JobStatus,
        error: Option<&str>,
        retry_after: Option<Duration>,
    ) -> Result<(), QueueError> {
        let id = claimed.id;
        let now = Utc::now();
        let retry_due = retry_after
            .map(|d| (now.timestamp_millis() + d.as_millis() as i64).to_string())
            .unwrap_or_default();

        let mut conn = self.redis.clone();
        let settled: i64 = SETTLE_SCRIPT
            .key(self.inflight_key())
            .key(self.delayed_key())
            .key(self.job_key(id))
            .arg(id.to_string())
            .arg(status.as_str())
            .arg(now.to_rfc3339())
            .arg(error.unwrap_or(""))
            .arg(self.archive_ttl.as_secs().max(1))
            .arg(retry_due)
            .arg(claimed.attempts)
            .invoke_async(&mut conn)
            .await?;

        if settled == 0 {
            return Err(QueueError::ClaimLost(id));
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &RelayJob) -> Result<(), QueueError> {
        let fields = job.to_fields();
        let mut conn = self.redis.clone();
        redis::pipe()
            .atomic()
            .hset_multiple(self.job_key(job.id), fields.as_slice())
            .ignore()
            .lpush(self.ready_key(), job.id.to_string())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim(&self, visibility: Duration) -> Result<Option<RelayJob>, QueueError> {
        let now = Utc::now();
        let deadline = now.timestamp_millis() + visibility.as_millis() as i64;

        let mut conn = self.redis.clone();
        let claimed: Option<String> = CLAIM_SCRIPT
            .key(self.ready_key())
            .key(self.delayed_key())
            .key(self.inflight_key())
            .arg(now.timestamp_millis())
            .arg(deadline)
            .arg(self.job_prefix())
            .arg(now.to_rfc3339())
            .invoke_async(&mut conn)
            .await?;

        let Some(id) = claimed else {
            return Ok(None);
        };

        let fields: HashMap<String, String> =
            conn.hgetall(format!("{}{}", self.job_prefix(), id)).await?;
        match RelayJob::from_fields(fields) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                // Out of flight, or the visibility timeout redelivers it forever.
                tracing::error!(job_id = %id, error = %e, "unparseable job record, moved to dead letter");
                redis::pipe()
                    .atomic()
                    .zrem(self.inflight_key(), &id)
                    .ignore()
                    .lpush(self.dead_key(), &id)
                    .ignore()
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                Err(e)
            }
        }
    }

    async fn complete(&self, job: &RelayJob) -> Result<(), QueueError> {
        self.settle(job, JobStatus::Succeeded, None, None).await
    }

    async fn retry(&self, job: &RelayJob, delay: Duration, error: &str) -> Result<(), QueueError> {
        self.settle(job, JobStatus::FailedRetryable, Some(error), Some(delay))
            .await
    }

    async fn fail(&self, job: &RelayJob, error: &str) -> Result<(), QueueError> {
        self.settle(job, JobStatus::FailedTerminal, Some(error), None)
            .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<RelayJob>, QueueError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        RelayJob::from_fields(fields).map(Some)
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut conn = self.redis.clone();
        let (ready, delayed, in_flight): (u64, u64, u64) = redis::pipe()
            .llen(self.ready_key())
            .zcard(self.delayed_key())
            .zcard(self.inflight_key())
            .query_async(&mut conn)
            .await?;
        Ok(QueueDepth {
            ready,
            delayed,
            in_flight,
        })
    }
}
