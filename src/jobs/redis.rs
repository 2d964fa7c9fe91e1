use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, Script};

use super::broker::{Broker, MAX_PRIORITY};
use super::QueueError;
use crate::config::RedisConfig;
use crate::models::job::{Job, JobId, JobState, QueueCounts};

/// Redis-backed broker. Every key for a queue lives under `<prefix><queue>:`.
///
/// | key | type | contents |
/// |---|---|---|
/// | `id` | string | job id counter |
/// | `seq` | string | eligibility counter (FIFO tiebreak) |
/// | `job:<id>` | string | JSON job record |
/// | `state` / `prio` | hash | id → state / priority |
/// | `wait` | zset | score `priority * 2^32 + seq` |
/// | `delayed` | zset | score `process_at` |
/// | `active` | zset | score lock expiry |
/// | `completed` / `failed` | list | newest first |
/// | `paused` | string | present while paused |
/// | `repeat` | hash | registration key → cron pattern |
#[derive(Clone)]
pub struct RedisBroker {
    redis: ConnectionManager,
    prefix: String,
    scripts: Arc<Scripts>,
    closed: Arc<AtomicBool>,
}

struct Scripts {
    enqueue: Script,
    promote: Script,
    claim: Script,
    finish: Script,
    retry: Script,
    recover: Script,
    remove: Script,
    empty: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            enqueue: Script::new(
                r#"
                redis.call("SET", KEYS[1], ARGV[2])
                redis.call("HSET", KEYS[2], ARGV[1], ARGV[3])
                redis.call("HSET", KEYS[3], ARGV[1], ARGV[4])
                if ARGV[3] == "delayed" then
                    redis.call("ZADD", KEYS[5], ARGV[5], ARGV[1])
                else
                    local seq = redis.call("INCR", KEYS[6])
                    local score = tonumber(ARGV[4]) * 4294967296 + seq
                    redis.call("ZADD", KEYS[4], string.format("%.0f", score), ARGV[1])
                end
                return 1
            "#,
            ),
            promote: Script::new(
                r#"
                local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
                for _, id in ipairs(ids) do
                    redis.call("ZREM", KEYS[1], id)
                    local prio = tonumber(redis.call("HGET", KEYS[4], id) or "0")
                    local seq = redis.call("INCR", KEYS[5])
                    redis.call("ZADD", KEYS[2], string.format("%.0f", prio * 4294967296 + seq), id)
                    redis.call("HSET", KEYS[3], id, "waiting")
                end
                return ids
            "#,
            ),
            claim: Script::new(
                r#"
                if redis.call("EXISTS", KEYS[1]) == 1 then
                    return false
                end
                local popped = redis.call("ZPOPMIN", KEYS[2])
                if #popped == 0 then
                    return false
                end
                local id = popped[1]
                local body = redis.call("GET", ARGV[2] .. id)
                if not body then
                    redis.call("HDEL", KEYS[4], id)
                    return false
                end
                redis.call("ZADD", KEYS[3], ARGV[1], id)
                redis.call("HSET", KEYS[4], id, "active")
                return body
            "#,
            ),
            finish: Script::new(
                r#"
                redis.call("ZREM", KEYS[1], ARGV[1])
                redis.call("SET", KEYS[4], ARGV[2])
                redis.call("HSET", KEYS[3], ARGV[1], ARGV[3])
                redis.call("LPUSH", KEYS[2], ARGV[1])
                local keep = tonumber(ARGV[4])
                if keep >= 0 then
                    local evicted = redis.call("LRANGE", KEYS[2], keep, -1)
                    for _, old in ipairs(evicted) do
                        redis.call("DEL", ARGV[5] .. old)
                        redis.call("HDEL", KEYS[3], old)
                        redis.call("HDEL", KEYS[5], old)
                    end
                    if keep == 0 then
                        redis.call("DEL", KEYS[2])
                    else
                        redis.call("LTRIM", KEYS[2], 0, keep - 1)
                    end
                end
                return 1
            "#,
            ),
            retry: Script::new(
                r#"
                redis.call("ZREM", KEYS[1], ARGV[1])
                redis.call("SET", KEYS[4], ARGV[2])
                redis.call("HSET", KEYS[3], ARGV[1], "delayed")
                redis.call("ZADD", KEYS[2], ARGV[3], ARGV[1])
                return 1
            "#,
            ),
            recover: Script::new(
                r#"
                local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", "(" .. ARGV[1])
                for _, id in ipairs(ids) do
                    redis.call("ZREM", KEYS[1], id)
                    local prio = tonumber(redis.call("HGET", KEYS[4], id) or "0")
                    local seq = redis.call("INCR", KEYS[5])
                    redis.call("ZADD", KEYS[2], string.format("%.0f", prio * 4294967296 + seq), id)
                    redis.call("HSET", KEYS[3], id, "waiting")
                end
                return ids
            "#,
            ),
            remove: Script::new(
                r#"
                if redis.call("ZSCORE", KEYS[1], ARGV[1]) then
                    return -1
                end
                if redis.call("EXISTS", KEYS[8]) == 0 then
                    return 0
                end
                redis.call("ZREM", KEYS[2], ARGV[1])
                redis.call("ZREM", KEYS[3], ARGV[1])
                redis.call("LREM", KEYS[4], 0, ARGV[1])
                redis.call("LREM", KEYS[5], 0, ARGV[1])
                redis.call("HDEL", KEYS[6], ARGV[1])
                redis.call("HDEL", KEYS[7], ARGV[1])
                redis.call("DEL", KEYS[8])
                return 1
            "#,
            ),
            empty: Script::new(
                r#"
                for i = 1, 2 do
                    local ids = redis.call("ZRANGE", KEYS[i], 0, -1)
                    for _, id in ipairs(ids) do
                        redis.call("DEL", ARGV[1] .. id)
                        redis.call("HDEL", KEYS[3], id)
                        redis.call("HDEL", KEYS[4], id)
                    end
                end
                redis.call("DEL", KEYS[1], KEYS[2])
                return 1
            "#,
            ),
        }
    }
}

/// Key builder for one queue's namespace.
struct Keys {
    base: String,
}

impl Keys {
    fn new(prefix: &str, queue: &str) -> Self {
        Self {
            base: format!("{}{}:", prefix, queue),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.base, suffix)
    }

    fn job_prefix(&self) -> String {
        self.key("job:")
    }

    fn job(&self, id: JobId) -> String {
        format!("{}job:{}", self.base, id)
    }

    fn terminal(&self, state: JobState) -> String {
        match state {
            JobState::Failed => self.key("failed"),
            _ => self.key("completed"),
        }
    }
}

/// `start..=end` as Redis range arguments; an end past `isize::MAX` means "to the last".
fn redis_range(start: usize, end: usize) -> (isize, isize) {
    (
        isize::try_from(start).unwrap_or(isize::MAX),
        isize::try_from(end).unwrap_or(-1),
    )
}

impl RedisBroker {
    pub async fn connect(cfg: &RedisConfig) -> Result<Self, QueueError> {
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(cfg.host.clone(), cfg.port),
            redis: RedisConnectionInfo {
                db: cfg.db,
                password: cfg.password.clone(),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info)?;
        let redis = ConnectionManager::new(client).await?;
        tracing::info!(host = %cfg.host, port = cfg.port, db = cfg.db, "connected to queue broker");
        Ok(Self::new(redis, cfg.key_prefix.clone()))
    }

    pub fn new(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            scripts: Arc::new(Scripts::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn conn(&self) -> Result<ConnectionManager, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Broker("broker connection closed".into()));
        }
        Ok(self.redis.clone())
    }

    fn keys(&self, queue: &str) -> Keys {
        Keys::new(&self.prefix, queue)
    }

    async fn load(&self, keys: &Keys, id: JobId) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn()?;
        let (body, state): (Option<String>, Option<String>) = redis::pipe()
            .get(keys.job(id))
            .hget(keys.key("state"), id)
            .query_async(&mut conn)
            .await?;
        let Some(body) = body else {
            return Ok(None);
        };
        let mut job: Job = serde_json::from_str(&body)?;
        // the state hash is authoritative; scripts move jobs without rewriting the record
        if let Some(state) = state.and_then(|s| s.parse().ok()) {
            job.state = state;
        }
        Ok(Some(job))
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn next_id(&self, queue: &str) -> Result<JobId, QueueError> {
        let mut conn = self.conn()?;
        let id: JobId = conn.incr(self.keys(queue).key("id"), 1).await?;
        Ok(id)
    }

    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let keys = self.keys(job.queue());
        let body = serde_json::to_string(job)?;
        let _: i64 = self
            .scripts
            .enqueue
            .key(keys.job(job.id))
            .key(keys.key("state"))
            .key(keys.key("prio"))
            .key(keys.key("wait"))
            .key(keys.key("delayed"))
            .key(keys.key("seq"))
            .arg(job.id)
            .arg(body)
            .arg(job.state.as_str())
            .arg(job.options.priority().min(MAX_PRIORITY))
            .arg(job.process_at)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn promote_delayed(&self, queue: &str, now_ms: i64) -> Result<Vec<JobId>, QueueError> {
        let mut conn = self.conn()?;
        let keys = self.keys(queue);
        let ids: Vec<JobId> = self
            .scripts
            .promote
            .key(keys.key("delayed"))
            .key(keys.key("wait"))
            .key(keys.key("state"))
            .key(keys.key("prio"))
            .key(keys.key("seq"))
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn claim_next(
        &self,
        queue: &str,
        now_ms: i64,
        lock_ms: i64,
    ) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn()?;
        let keys = self.keys(queue);
        let body: Option<String> = self
            .scripts
            .claim
            .key(keys.key("paused"))
            .key(keys.key("wait"))
            .key(keys.key("active"))
            .key(keys.key("state"))
            .arg(now_ms + lock_ms)
            .arg(keys.job_prefix())
            .invoke_async(&mut conn)
            .await?;
        let Some(body) = body else {
            return Ok(None);
        };

        let mut job: Job = serde_json::from_str(&body)?;
        job.state = JobState::Active;
        job.processed_at = Some(now_ms);
        let _: () = conn.set(keys.job(job.id), serde_json::to_string(&job)?).await?;
        Ok(Some(job))
    }

    async fn extend_lock(
        &self,
        queue: &str,
        id: JobId,
        now_ms: i64,
        lock_ms: i64,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let _: i64 = redis::cmd("ZADD")
            .arg(self.keys(queue).key("active"))
            .arg("XX")
            .arg(now_ms + lock_ms)
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn finish(&self, job: &Job, keep: Option<usize>) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let keys = self.keys(job.queue());
        let keep = keep.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        let _: i64 = self
            .scripts
            .finish
            .key(keys.key("active"))
            .key(keys.terminal(job.state))
            .key(keys.key("state"))
            .key(keys.job(job.id))
            .key(keys.key("prio"))
            .arg(job.id)
            .arg(serde_json::to_string(job)?)
            .arg(job.state.as_str())
            .arg(keep)
            .arg(keys.job_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn retry_later(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let keys = self.keys(job.queue());
        let _: i64 = self
            .scripts
            .retry
            .key(keys.key("active"))
            .key(keys.key("delayed"))
            .key(keys.key("state"))
            .key(keys.job(job.id))
            .arg(job.id)
            .arg(serde_json::to_string(job)?)
            .arg(job.process_at)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn recover_stalled(&self, queue: &str, now_ms: i64) -> Result<Vec<JobId>, QueueError> {
        let mut conn = self.conn()?;
        let keys = self.keys(queue);
        let ids: Vec<JobId> = self
            .scripts
            .recover
            .key(keys.key("active"))
            .key(keys.key("wait"))
            .key(keys.key("state"))
            .key(keys.key("prio"))
            .key(keys.key("seq"))
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn get_job(&self, queue: &str, id: JobId) -> Result<Option<Job>, QueueError> {
        self.load(&self.keys(queue), id).await
    }

    async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let mut conn = self.conn()?;
        let keys = self.keys(queue);
        let (start, stop) = redis_range(start, end);
        let ids: Vec<JobId> = match state {
            JobState::Waiting => conn.zrange(keys.key("wait"), start, stop).await?,
            JobState::Delayed => conn.zrange(keys.key("delayed"), start, stop).await?,
            JobState::Active => conn.zrange(keys.key("active"), start, stop).await?,
            JobState::Completed | JobState::Failed => {
                conn.lrange(keys.terminal(state), start, stop).await?
            }
        };

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load(&keys, id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn remove_job(&self, queue: &str, id: JobId) -> Result<bool, QueueError> {
        let mut conn = self.conn()?;
        let keys = self.keys(queue);
        let outcome: i64 = self
            .scripts
            .remove
            .key(keys.key("active"))
            .key(keys.key("wait"))
            .key(keys.key("delayed"))
            .key(keys.key("completed"))
            .key(keys.key("failed"))
            .key(keys.key("state"))
            .key(keys.key("prio"))
            .key(keys.job(id))
            .arg(id)
            .invoke_async(&mut conn)
            .await?;
        match outcome {
            -1 => Err(QueueError::JobActive {
                queue: queue.to_string(),
                id,
            }),
            0 => Ok(false),
            _ => Ok(true),
        }
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let key = self.keys(queue).key("paused");
        if paused {
            let _: () = conn.set(key, 1).await?;
        } else {
            let _: i64 = conn.del(key).await?;
        }
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn()?;
        let paused: bool = conn.exists(self.keys(queue).key("paused")).await?;
        Ok(paused)
    }

    async fn empty(&self, queue: &str) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let keys = self.keys(queue);
        let _: i64 = self
            .scripts
            .empty
            .key(keys.key("wait"))
            .key(keys.key("delayed"))
            .key(keys.key("state"))
            .key(keys.key("prio"))
            .arg(keys.job_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError> {
        let mut conn = self.conn()?;
        let keys = self.keys(queue);
        let (waiting, active, completed, failed, delayed): (usize, usize, usize, usize, usize) =
            redis::pipe()
                .zcard(keys.key("wait"))
                .zcard(keys.key("active"))
                .llen(keys.key("completed"))
                .llen(keys.key("failed"))
                .zcard(keys.key("delayed"))
                .query_async(&mut conn)
                .await?;
        Ok(QueueCounts {
            waiting,
            active,
            completed,
            failed,
            delayed,
        })
    }

    async fn save_repeat(&self, queue: &str, key: &str, cron: &str) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let _: i64 = conn.hset(self.keys(queue).key("repeat"), key, cron).await?;
        Ok(())
    }

    async fn has_repeat(&self, queue: &str, key: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn()?;
        let exists: bool = conn.hexists(self.keys(queue).key("repeat"), key).await?;
        Ok(exists)
    }

    async fn remove_repeat(&self, queue: &str, key: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn()?;
        let removed: i64 = conn.hdel(self.keys(queue).key("repeat"), key).await?;
        Ok(removed > 0)
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        tracing::info!("queue broker connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_namespaced_per_queue() {
        let keys = Keys::new("enterprise:queue:", "email");
        assert_eq!(keys.key("wait"), "enterprise:queue:email:wait");
        assert_eq!(keys.job(42), "enterprise:queue:email:job:42");
        assert_eq!(keys.job_prefix(), "enterprise:queue:email:job:");
        assert_eq!(keys.terminal(JobState::Failed), "enterprise:queue:email:failed");
        assert_eq!(
            keys.terminal(JobState::Completed),
            "enterprise:queue:email:completed"
        );
    }

    #[test]
    fn test_redis_range_open_end() {
        assert_eq!(redis_range(0, 9), (0, 9));
        assert_eq!(redis_range(5, usize::MAX), (5, -1));
    }

    #[test]
    fn test_wait_scores_stay_exact() {
        // highest priority plus a large sequence must still fit a double exactly
        let score = (MAX_PRIORITY as f64) * 4294967296.0 + (u32::MAX as f64);
        assert!(score < 2f64.powi(53));
    }
}
