use async_trait::async_trait;

use super::QueueError;
use crate::models::job::{Job, JobId, JobState, QueueCounts};

/// How long a claimed job stays owned by its worker without a renewal.
pub const LOCK_DURATION_MS: i64 = 30_000;

/// Highest priority value accepted; larger values are clamped.
pub const MAX_PRIORITY: u32 = (1 << 20) - 1;

/// Storage primitives for queue state. One broker instance is shared by
/// every queue in a [`super::QueueManager`]; each method is scoped to a
/// queue name and must leave that queue's state consistent on its own.
///
/// Waiting jobs are ordered by `(priority, eligibility sequence)`, so a job
/// promoted out of `delayed` lines up behind jobs that became eligible first.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), QueueError>;

    async fn next_id(&self, queue: &str) -> Result<JobId, QueueError>;

    /// Persist a new job into `waiting` or `delayed` according to `job.state`.
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError>;

    /// Move every delayed job with `process_at <= now_ms` into `waiting`.
    async fn promote_delayed(&self, queue: &str, now_ms: i64) -> Result<Vec<JobId>, QueueError>;

    /// Move the next waiting job into `active` and lock it until
    /// `now_ms + lock_ms`. Returns `None` when nothing is waiting or the
    /// queue is paused.
    async fn claim_next(
        &self,
        queue: &str,
        now_ms: i64,
        lock_ms: i64,
    ) -> Result<Option<Job>, QueueError>;

    async fn extend_lock(
        &self,
        queue: &str,
        id: JobId,
        now_ms: i64,
        lock_ms: i64,
    ) -> Result<(), QueueError>;

    /// Move an active job into its terminal state (`job.state`), keeping at
    /// most `keep` records of that state; older ones are deleted.
    async fn finish(&self, job: &Job, keep: Option<usize>) -> Result<(), QueueError>;

    /// Move an active job back into `delayed` until `job.process_at`.
    async fn retry_later(&self, job: &Job) -> Result<(), QueueError>;

    /// Return active jobs whose lock has lapsed to `waiting`.
    async fn recover_stalled(&self, queue: &str, now_ms: i64) -> Result<Vec<JobId>, QueueError>;

    async fn get_job(&self, queue: &str, id: JobId) -> Result<Option<Job>, QueueError>;

    /// Jobs in `state`, positions `start..=end` in dispatch order (newest
    /// first for terminal states).
    async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, QueueError>;

    /// `Ok(false)` if the job does not exist; `JobActive` if it is running.
    async fn remove_job(&self, queue: &str, id: JobId) -> Result<bool, QueueError>;

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<(), QueueError>;

    async fn is_paused(&self, queue: &str) -> Result<bool, QueueError>;

    /// Drop every waiting and delayed job.
    async fn empty(&self, queue: &str) -> Result<(), QueueError>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError>;

    async fn save_repeat(&self, queue: &str, key: &str, cron: &str) -> Result<(), QueueError>;

    async fn has_repeat(&self, queue: &str, key: &str) -> Result<bool, QueueError>;

    async fn remove_repeat(&self, queue: &str, key: &str) -> Result<bool, QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}

/// Range helper shared by backends: inclusive `start..=end`, clamped.
pub(crate) fn slice_range<T: Clone>(items: &[T], start: usize, end: usize) -> Vec<T> {
    if start >= items.len() || end < start {
        return Vec::new();
    }
    let end = end.min(items.len() - 1);
    items[start..=end].to_vec()
}
