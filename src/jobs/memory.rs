use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::broker::{slice_range, Broker, MAX_PRIORITY};
use super::QueueError;
use crate::models::job::{Job, JobId, JobState, QueueCounts};

/// In-process broker. State lives for as long as the broker does and is
/// shared by every clone.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<DashMap<String, MemQueue>>,
    offline: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct MemQueue {
    jobs: HashMap<JobId, Job>,
    waiting: BTreeMap<(u32, u64), JobId>,
    delayed: BTreeSet<(i64, JobId)>,
    active: BTreeSet<JobId>,
    locks: HashMap<JobId, i64>,
    // newest first
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    paused: bool,
    seq: u64,
    last_id: JobId,
    repeats: HashMap<String, String>,
}

impl MemQueue {
    fn push_waiting(&mut self, job: &mut Job) {
        self.seq += 1;
        job.state = JobState::Waiting;
        let prio = job.options.priority().min(MAX_PRIORITY);
        self.waiting.insert((prio, self.seq), job.id);
    }

    fn unlink(&mut self, id: JobId) {
        self.waiting.retain(|_, v| *v != id);
        self.delayed.retain(|(_, v)| *v != id);
        self.completed.retain(|v| *v != id);
        self.failed.retain(|v| *v != id);
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing the connection: every call fails until reset.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.offline.store(unreachable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Broker("broker connection closed".into()));
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(QueueError::Broker("broker unreachable".into()));
        }
        Ok(())
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut MemQueue) -> T) -> Result<T, QueueError> {
        self.check()?;
        let mut entry = self.queues.entry(queue.to_string()).or_default();
        Ok(f(entry.value_mut()))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> Result<(), QueueError> {
        self.check()
    }

    async fn next_id(&self, queue: &str) -> Result<JobId, QueueError> {
        self.with_queue(queue, |q| {
            q.last_id += 1;
            q.last_id
        })
    }

    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        self.with_queue(job.queue(), |q| {
            let mut job = job.clone();
            if job.state == JobState::Delayed {
                q.delayed.insert((job.process_at, job.id));
            } else {
                q.push_waiting(&mut job);
            }
            q.jobs.insert(job.id, job);
        })
    }

    async fn promote_delayed(&self, queue: &str, now_ms: i64) -> Result<Vec<JobId>, QueueError> {
        self.with_queue(queue, |q| {
            let due: Vec<(i64, JobId)> = q
                .delayed
                .iter()
                .take_while(|(at, _)| *at <= now_ms)
                .copied()
                .collect();
            let mut promoted = Vec::with_capacity(due.len());
            for entry in due {
                q.delayed.remove(&entry);
                if let Some(mut job) = q.jobs.remove(&entry.1) {
                    q.push_waiting(&mut job);
                    q.jobs.insert(job.id, job);
                    promoted.push(entry.1);
                }
            }
            promoted
        })
    }

    async fn claim_next(
        &self,
        queue: &str,
        now_ms: i64,
        lock_ms: i64,
    ) -> Result<Option<Job>, QueueError> {
        self.with_queue(queue, |q| {
            if q.paused {
                return None;
            }
            let (_, id) = q.waiting.pop_first()?;
            let job = q.jobs.get_mut(&id)?;
            job.state = JobState::Active;
            job.processed_at = Some(now_ms);
            let claimed = job.clone();
            q.active.insert(id);
            q.locks.insert(id, now_ms + lock_ms);
            Some(claimed)
        })
    }

    async fn extend_lock(
        &self,
        queue: &str,
        id: JobId,
        now_ms: i64,
        lock_ms: i64,
    ) -> Result<(), QueueError> {
        self.with_queue(queue, |q| {
            if q.active.contains(&id) {
                q.locks.insert(id, now_ms + lock_ms);
            }
        })
    }

    async fn finish(&self, job: &Job, keep: Option<usize>) -> Result<(), QueueError> {
        self.with_queue(job.queue(), |q| {
            q.active.remove(&job.id);
            q.locks.remove(&job.id);
            q.jobs.insert(job.id, job.clone());
            let list = match job.state {
                JobState::Failed => &mut q.failed,
                _ => &mut q.completed,
            };
            list.push_front(job.id);
            let mut evicted = Vec::new();
            if let Some(keep) = keep {
                while list.len() > keep {
                    if let Some(old) = list.pop_back() {
                        evicted.push(old);
                    }
                }
            }
            for id in evicted {
                q.jobs.remove(&id);
            }
        })
    }

    async fn retry_later(&self, job: &Job) -> Result<(), QueueError> {
        self.with_queue(job.queue(), |q| {
            q.active.remove(&job.id);
            q.locks.remove(&job.id);
            q.delayed.insert((job.process_at, job.id));
            q.jobs.insert(job.id, job.clone());
        })
    }

    async fn recover_stalled(&self, queue: &str, now_ms: i64) -> Result<Vec<JobId>, QueueError> {
        self.with_queue(queue, |q| {
            let stalled: Vec<JobId> = q
                .active
                .iter()
                .filter(|id| q.locks.get(id).map_or(true, |until| *until < now_ms))
                .copied()
                .collect();
            for id in &stalled {
                q.active.remove(id);
                q.locks.remove(id);
                if let Some(mut job) = q.jobs.remove(id) {
                    q.push_waiting(&mut job);
                    q.jobs.insert(job.id, job);
                }
            }
            stalled
        })
    }

    async fn get_job(&self, queue: &str, id: JobId) -> Result<Option<Job>, QueueError> {
        self.with_queue(queue, |q| q.jobs.get(&id).cloned())
    }

    async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, QueueError> {
        self.with_queue(queue, |q| {
            let ids: Vec<JobId> = match state {
                JobState::Waiting => q.waiting.values().copied().collect(),
                JobState::Delayed => q.delayed.iter().map(|(_, id)| *id).collect(),
                JobState::Active => q.active.iter().copied().collect(),
                JobState::Completed => q.completed.iter().copied().collect(),
                JobState::Failed => q.failed.iter().copied().collect(),
            };
            slice_range(&ids, start, end)
                .into_iter()
                .filter_map(|id| q.jobs.get(&id).cloned())
                .collect()
        })
    }

    async fn remove_job(&self, queue: &str, id: JobId) -> Result<bool, QueueError> {
        self.with_queue(queue, |q| {
            if q.active.contains(&id) {
                return Err(QueueError::JobActive {
                    queue: queue.to_string(),
                    id,
                });
            }
            if q.jobs.remove(&id).is_none() {
                return Ok(false);
            }
            q.unlink(id);
            Ok(true)
        })?
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<(), QueueError> {
        self.with_queue(queue, |q| q.paused = paused)
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        self.with_queue(queue, |q| q.paused)
    }

    async fn empty(&self, queue: &str) -> Result<(), QueueError> {
        self.with_queue(queue, |q| {
            let ids: Vec<JobId> = q
                .waiting
                .values()
                .copied()
                .chain(q.delayed.iter().map(|(_, id)| *id))
                .collect();
            for id in ids {
                q.jobs.remove(&id);
            }
            q.waiting.clear();
            q.delayed.clear();
        })
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError> {
        self.with_queue(queue, |q| QueueCounts {
            waiting: q.waiting.len(),
            active: q.active.len(),
            completed: q.completed.len(),
            failed: q.failed.len(),
            delayed: q.delayed.len(),
        })
    }

    async fn save_repeat(&self, queue: &str, key: &str, cron: &str) -> Result<(), QueueError> {
        self.with_queue(queue, |q| {
            q.repeats.insert(key.to_string(), cron.to_string());
        })
    }

    async fn has_repeat(&self, queue: &str, key: &str) -> Result<bool, QueueError> {
        self.with_queue(queue, |q| q.repeats.contains_key(key))
    }

    async fn remove_repeat(&self, queue: &str, key: &str) -> Result<bool, QueueError> {
        self.with_queue(queue, |q| q.repeats.remove(key).is_some())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::JobOptions;
    use serde_json::json;

    fn job(broker_id: JobId, opts: JobOptions, now: i64) -> Job {
        Job::new(broker_id, "q", json!({"n": broker_id}), opts, now)
    }

    #[tokio::test]
    async fn test_claim_respects_priority_then_fifo() {
        let b = MemoryBroker::new();
        for (id, prio) in [(1, 5), (2, 1), (3, 5)] {
            let opts = JobOptions {
                priority: Some(prio),
                ..Default::default()
            };
            b.enqueue(&job(id, opts, 0)).await.unwrap();
        }
        let order: Vec<JobId> = [
            b.claim_next("q", 0, 1000).await.unwrap().unwrap().id,
            b.claim_next("q", 0, 1000).await.unwrap().unwrap().id,
            b.claim_next("q", 0, 1000).await.unwrap().unwrap().id,
        ]
        .to_vec();
        assert_eq!(order, vec![2, 1, 3]);
        assert!(b.claim_next("q", 0, 1000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_promoted_only_when_due() {
        let b = MemoryBroker::new();
        let opts = JobOptions {
            delay: Some(5000),
            ..Default::default()
        };
        b.enqueue(&job(1, opts, 10_000)).await.unwrap();

        assert!(b.promote_delayed("q", 14_999).await.unwrap().is_empty());
        assert_eq!(b.counts("q").await.unwrap().delayed, 1);
        assert_eq!(b.promote_delayed("q", 15_000).await.unwrap(), vec![1]);
        let counts = b.counts("q").await.unwrap();
        assert_eq!((counts.waiting, counts.delayed), (1, 0));
    }

    #[tokio::test]
    async fn test_paused_queue_yields_nothing() {
        let b = MemoryBroker::new();
        b.enqueue(&job(1, JobOptions::default(), 0)).await.unwrap();
        b.set_paused("q", true).await.unwrap();
        assert!(b.claim_next("q", 0, 1000).await.unwrap().is_none());
        b.set_paused("q", false).await.unwrap();
        assert!(b.claim_next("q", 0, 1000).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_finish_trims_oldest_records() {
        let b = MemoryBroker::new();
        for id in 1..=4 {
            b.enqueue(&job(id, JobOptions::default(), 0)).await.unwrap();
            let mut claimed = b.claim_next("q", 0, 1000).await.unwrap().unwrap();
            claimed.state = JobState::Completed;
            b.finish(&claimed, Some(2)).await.unwrap();
        }
        let kept: Vec<JobId> = b
            .list_jobs("q", JobState::Completed, 0, 10)
            .await
            .unwrap()
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(kept, vec![4, 3]);
        assert!(b.get_job("q", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_active_job_rejected() {
        let b = MemoryBroker::new();
        b.enqueue(&job(1, JobOptions::default(), 0)).await.unwrap();
        b.claim_next("q", 0, 1000).await.unwrap();
        assert!(matches!(
            b.remove_job("q", 1).await,
            Err(QueueError::JobActive { id: 1, .. })
        ));
        assert!(!b.remove_job("q", 99).await.unwrap());
    }

    #[tokio::test]
    async fn test_stalled_jobs_return_to_waiting() {
        let b = MemoryBroker::new();
        b.enqueue(&job(1, JobOptions::default(), 0)).await.unwrap();
        b.claim_next("q", 0, 1000).await.unwrap();
        assert!(b.recover_stalled("q", 500).await.unwrap().is_empty());
        assert_eq!(b.recover_stalled("q", 1001).await.unwrap(), vec![1]);
        assert_eq!(
            b.get_job("q", 1).await.unwrap().unwrap().state,
            JobState::Waiting
        );
    }

    #[tokio::test]
    async fn test_empty_keeps_active_and_finished() {
        let b = MemoryBroker::new();
        b.enqueue(&job(1, JobOptions::default(), 0)).await.unwrap();
        b.claim_next("q", 0, 1000).await.unwrap();
        b.enqueue(&job(2, JobOptions::default(), 0)).await.unwrap();
        let delayed = JobOptions {
            delay: Some(100),
            ..Default::default()
        };
        b.enqueue(&job(3, delayed, 0)).await.unwrap();

        b.empty("q").await.unwrap();
        let counts = b.counts("q").await.unwrap();
        assert_eq!((counts.waiting, counts.delayed, counts.active), (0, 0, 1));
    }

    #[tokio::test]
    async fn test_unreachable_fails_every_call() {
        let b = MemoryBroker::new();
        b.set_unreachable(true);
        assert!(matches!(b.ping().await, Err(QueueError::Broker(_))));
        assert!(b.counts("q").await.is_err());
        b.set_unreachable(false);
        assert!(b.ping().await.is_ok());
    }
}
