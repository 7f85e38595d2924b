/// Queue & Scheduler
///
/// Generalizes a Redis `BLPOP`-based job queue (ready `LIST` + JSON
/// payload) into the fuller contract the worker needs: claim/heartbeat
/// locks, delayed retries, a stall sweep, and lifecycle events mirrored
/// into the Job Store.
///
/// Redis key layout per queue `name`:
/// - `queue:{name}:ready` — `LIST` of job ids available to claim now.
/// - `queue:{name}:delayed` — `ZSET` of job ids scored by `available_at`
///   (epoch millis), for retry-delayed entries.
/// - `queue:{name}:inflight` — `ZSET` of job ids scored by
///   `lock_expires_at`, for the stall sweep.
/// - `queue:{name}:entry:{job_id}` — `HASH` holding the `QueueEntry`
///   fields.
use crate::error::{AppError, Result};
use crate::models::QueuePayload;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

pub const MAX_ATTEMPTS: i32 = 3;
pub const BACKOFF_BASE_SECS: u64 = 2;
pub const MAX_STALL_COUNT: i32 = 2;
/// At most this many jobs may be started per queue in a `CLAIM_WINDOW_SECS`
/// window, a coarse admission throttle independent of worker count.
pub const MAX_CLAIMS_PER_WINDOW: i64 = 10;
pub const CLAIM_WINDOW_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    Fast,
    Background,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Background => "background",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "fast" => Some(Self::Fast),
            "background" => Some(Self::Background),
            _ => None,
        }
    }
}

/// The ephemeral entry a claimed job's worker operates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: String,
    pub payload: QueuePayload,
    pub attempts_made: i32,
    pub stall_count: i32,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<i64>,
}

/// Lifecycle events the Scheduler emits, mirrored into the Job Store by
/// the caller's registered handler — a tagged variant, not a class
/// hierarchy.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Added { job_id: String },
    Active { job_id: String },
    Progress { job_id: String, percent: i32 },
    Completed { job_id: String, hls_master_url: String },
    Failed { job_id: String, reason: String },
    Stalled { job_id: String },
}

/// Exponential backoff with base 2s: attempt 1 => 2s, attempt 2 => 4s,
/// attempt 3 => 8s.
pub fn backoff_delay(attempts_made: i32) -> std::time::Duration {
    let secs = BACKOFF_BASE_SECS.saturating_pow(attempts_made.max(1) as u32);
    std::time::Duration::from_secs(secs)
}

/// `true` once a stalled entry has been returned to `waiting`
/// `MAX_STALL_COUNT` times and should instead be failed.
pub fn should_fail_after_stall(stall_count: i32) -> bool {
    stall_count >= MAX_STALL_COUNT
}

pub struct Scheduler {
    conn: ConnectionManager,
}

impl Scheduler {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::QueueError(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    fn ready_key(queue: QueueName) -> String {
        format!("queue:{}:ready", queue.as_str())
    }

    fn delayed_key(queue: QueueName) -> String {
        format!("queue:{}:delayed", queue.as_str())
    }

    fn inflight_key(queue: QueueName) -> String {
        format!("queue:{}:inflight", queue.as_str())
    }

    fn entry_key(queue: QueueName, job_id: &str) -> String {
        format!("queue:{}:entry:{job_id}", queue.as_str())
    }

    fn claims_key(queue: QueueName) -> String {
        format!("queue:{}:claims", queue.as_str())
    }

    /// `true` once `MAX_CLAIMS_PER_WINDOW` jobs have already started this
    /// window on `queue`.
    async fn claims_exhausted(&mut self, queue: QueueName) -> Result<bool> {
        let count: Option<i64> = self.conn.get(Self::claims_key(queue)).await?;
        Ok(count.unwrap_or(0) >= MAX_CLAIMS_PER_WINDOW)
    }

    /// Record a claim against the current window, starting a fresh
    /// `CLAIM_WINDOW_SECS` window on the first claim of a new one.
    async fn record_claim(&mut self, queue: QueueName) -> Result<()> {
        let key = Self::claims_key(queue);
        let count: i64 = self.conn.incr(&key, 1).await?;
        if count == 1 {
            self.conn.expire::<_, ()>(&key, CLAIM_WINDOW_SECS as i64).await?;
        }
        Ok(())
    }

    /// Enqueue a new entry. Idempotent: a terminal (completed/failed)
    /// entry for the same `job_id` is replaced; an active one is
    /// rejected with `Conflict`.
    pub async fn enqueue(&mut self, queue: QueueName, payload: QueuePayload) -> Result<()> {
        let job_id = payload.job_id.clone();

        if let Some(existing) = self.read_entry(queue, &job_id).await? {
            if existing.lock_owner.is_some() {
                return Err(AppError::Conflict(format!(
                    "job {job_id} already active in queue {}",
                    queue.as_str()
                )));
            }
        }

        let entry = QueueEntry {
            job_id: job_id.clone(),
            payload,
            attempts_made: 0,
            stall_count: 0,
            lock_owner: None,
            lock_expires_at: None,
        };
        self.write_entry(queue, &entry).await?;
        self.conn.rpush::<_, _, ()>(Self::ready_key(queue), &job_id).await?;

        tracing::info!(job_id = %job_id, queue = queue.as_str(), "enqueued job");
        Ok(())
    }

    /// Move any delayed entries whose `available_at` has passed into the
    /// ready list. Called on a scheduler tick alongside the stall sweep.
    pub async fn promote_delayed(&mut self, queue: QueueName, now_millis: i64) -> Result<usize> {
        let due: Vec<String> = self
            .conn
            .zrangebyscore(Self::delayed_key(queue), 0, now_millis)
            .await?;
        for job_id in &due {
            self.conn
                .zrem::<_, _, ()>(Self::delayed_key(queue), job_id)
                .await?;
            self.conn
                .rpush::<_, _, ()>(Self::ready_key(queue), job_id)
                .await?;
        }
        Ok(due.len())
    }

    /// Block up to `timeout_secs` for a ready entry and claim it,
    /// assigning a lock of `lock_duration_secs` to `worker_id`.
    pub async fn claim(
        &mut self,
        queue: QueueName,
        worker_id: &str,
        timeout_secs: u64,
        lock_duration_secs: u64,
    ) -> Result<Option<QueueEntry>> {
        if self.claims_exhausted(queue).await? {
            tracing::debug!(queue = queue.as_str(), "claim window exhausted, not claiming yet");
            return Ok(None);
        }

        let popped: Option<(String, String)> = self
            .conn
            .blpop(Self::ready_key(queue), timeout_secs as f64)
            .await?;

        let Some((_, job_id)) = popped else {
            return Ok(None);
        };

        let mut entry = self.read_entry(queue, &job_id).await?.ok_or_else(|| {
            AppError::Internal(format!("claimed job {job_id} has no entry hash"))
        })?;

        let lock_expires_at = now_millis() + (lock_duration_secs as i64 * 1000);
        entry.lock_owner = Some(worker_id.to_string());
        entry.lock_expires_at = Some(lock_expires_at);
        self.write_entry(queue, &entry).await?;
        self.conn
            .zadd::<_, _, _, ()>(Self::inflight_key(queue), &job_id, lock_expires_at)
            .await?;
        self.record_claim(queue).await?;

        tracing::info!(job_id = %job_id, worker_id, queue = queue.as_str(), "claimed job");
        Ok(Some(entry))
    }

    /// Extend a claimed entry's lock, called periodically while the
    /// worker is actively encoding.
    pub async fn heartbeat(
        &mut self,
        queue: QueueName,
        job_id: &str,
        lock_duration_secs: u64,
    ) -> Result<()> {
        let lock_expires_at = now_millis() + (lock_duration_secs as i64 * 1000);
        self.conn
            .hset::<_, _, _, ()>(Self::entry_key(queue, job_id), "lock_expires_at", lock_expires_at)
            .await?;
        self.conn
            .zadd::<_, _, _, ()>(Self::inflight_key(queue), job_id, lock_expires_at)
            .await?;
        Ok(())
    }

    /// Release the lock and report progress without completing the job.
    pub async fn report_progress(&mut self, queue: QueueName, job_id: &str, percent: i32) -> Result<QueueEvent> {
        self.conn
            .hset::<_, _, _, ()>(Self::entry_key(queue, job_id), "progress", percent)
            .await?;
        Ok(QueueEvent::Progress {
            job_id: job_id.to_string(),
            percent,
        })
    }

    /// Mark an entry complete, releasing its lock.
    pub async fn complete(&mut self, queue: QueueName, job_id: &str, hls_master_url: String) -> Result<QueueEvent> {
        self.release_lock(queue, job_id).await?;
        tracing::info!(job_id, queue = queue.as_str(), "job completed");
        Ok(QueueEvent::Completed {
            job_id: job_id.to_string(),
            hls_master_url,
        })
    }

    /// Mark an entry failed outright (no further retries), releasing its
    /// lock.
    pub async fn fail(&mut self, queue: QueueName, job_id: &str, reason: String) -> Result<QueueEvent> {
        self.release_lock(queue, job_id).await?;
        tracing::warn!(job_id, queue = queue.as_str(), reason = %reason, "job failed");
        Ok(QueueEvent::Failed {
            job_id: job_id.to_string(),
            reason,
        })
    }

    /// Re-queue after a recoverable failure: increments `attempts_made`
    /// and schedules `available_at = now + delay`. If this would exceed
    /// `max_attempts`, fails the job instead.
    pub async fn retry(
        &mut self,
        queue: QueueName,
        job_id: &str,
        reason: String,
        max_attempts: i32,
    ) -> Result<QueueEvent> {
        let mut entry = self.read_entry(queue, job_id).await?.ok_or_else(|| {
            AppError::Internal(format!("retry of unknown job {job_id}"))
        })?;

        entry.attempts_made += 1;
        if entry.attempts_made >= max_attempts {
            self.release_lock(queue, job_id).await?;
            tracing::warn!(job_id, queue = queue.as_str(), attempts = entry.attempts_made, "job exceeded max attempts");
            return Ok(QueueEvent::Failed {
                job_id: job_id.to_string(),
                reason,
            });
        }

        let delay = backoff_delay(entry.attempts_made);
        let available_at = now_millis() + delay.as_millis() as i64;
        entry.lock_owner = None;
        entry.lock_expires_at = None;
        self.write_entry(queue, &entry).await?;
        self.conn
            .zrem::<_, _, ()>(Self::inflight_key(queue), job_id)
            .await?;
        self.conn
            .zadd::<_, _, _, ()>(Self::delayed_key(queue), job_id, available_at)
            .await?;

        tracing::info!(job_id, queue = queue.as_str(), attempt = entry.attempts_made, delay_secs = delay.as_secs(), "job scheduled for retry");
        Ok(QueueEvent::Added {
            job_id: job_id.to_string(),
        })
    }

    /// Scan the in-flight set for entries whose lock has expired without
    /// a heartbeat. The first expiry returns the entry to `waiting`; the
    /// second fails it with `stalled`.
    pub async fn sweep_stalled(&mut self, queue: QueueName) -> Result<Vec<QueueEvent>> {
        let now = now_millis();
        let expired: Vec<String> = self
            .conn
            .zrangebyscore(Self::inflight_key(queue), 0, now)
            .await?;

        let mut events = Vec::new();
        for job_id in expired {
            self.conn
                .zrem::<_, _, ()>(Self::inflight_key(queue), &job_id)
                .await?;

            let Some(mut entry) = self.read_entry(queue, &job_id).await? else {
                continue;
            };
            entry.stall_count += 1;
            entry.lock_owner = None;
            entry.lock_expires_at = None;

            if should_fail_after_stall(entry.stall_count) {
                self.write_entry(queue, &entry).await?;
                tracing::error!(job_id = %job_id, queue = queue.as_str(), "job stalled twice, failing");
                events.push(QueueEvent::Failed {
                    job_id: job_id.clone(),
                    reason: "stalled".to_string(),
                });
            } else {
                self.write_entry(queue, &entry).await?;
                self.conn
                    .rpush::<_, _, ()>(Self::ready_key(queue), &job_id)
                    .await?;
                tracing::warn!(job_id = %job_id, queue = queue.as_str(), stall_count = entry.stall_count, "job stalled, returned to waiting");
                events.push(QueueEvent::Stalled { job_id: job_id.clone() });
            }
        }

        Ok(events)
    }

    pub async fn stats(&mut self, queue: QueueName) -> Result<(i64, i64, i64)> {
        let waiting: i64 = self.conn.llen(Self::ready_key(queue)).await?;
        let delayed: i64 = self.conn.zcard(Self::delayed_key(queue)).await?;
        let in_flight: i64 = self.conn.zcard(Self::inflight_key(queue)).await?;
        Ok((waiting, delayed, in_flight))
    }

    async fn release_lock(&mut self, queue: QueueName, job_id: &str) -> Result<()> {
        self.conn
            .zrem::<_, _, ()>(Self::inflight_key(queue), job_id)
            .await?;
        self.conn
            .hdel::<_, _, ()>(Self::entry_key(queue, job_id), &["lock_owner", "lock_expires_at"])
            .await?;
        Ok(())
    }

    async fn read_entry(&mut self, queue: QueueName, job_id: &str) -> Result<Option<QueueEntry>> {
        let raw: Option<String> = self
            .conn
            .hget(Self::entry_key(queue, job_id), "payload_json")
            .await?;
        let Some(raw) = raw else { return Ok(None) };
        let entry: QueueEntry = serde_json::from_str(&raw)?;
        Ok(Some(entry))
    }

    async fn write_entry(&mut self, queue: QueueName, entry: &QueueEntry) -> Result<()> {
        let raw = serde_json::to_string(entry)?;
        self.conn
            .hset::<_, _, _, ()>(Self::entry_key(queue, &entry.job_id), "payload_json", raw)
            .await?;
        Ok(())
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_matches_exp_base_2s() {
        assert_eq!(backoff_delay(1).as_secs(), 2);
        assert_eq!(backoff_delay(2).as_secs(), 4);
        assert_eq!(backoff_delay(3).as_secs(), 8);
    }

    #[test]
    fn stall_fails_after_two_occurrences() {
        assert!(!should_fail_after_stall(0));
        assert!(!should_fail_after_stall(1));
        assert!(should_fail_after_stall(2));
        assert!(should_fail_after_stall(3));
    }

    #[test]
    fn queue_name_round_trips() {
        assert_eq!(QueueName::from_str("fast"), Some(QueueName::Fast));
        assert_eq!(QueueName::from_str("background"), Some(QueueName::Background));
        assert_eq!(QueueName::from_str("bogus"), None);
        assert_eq!(QueueName::Fast.as_str(), "fast");
    }
}
