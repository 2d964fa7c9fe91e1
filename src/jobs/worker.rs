use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::broker::LOCK_DURATION_MS;
use super::queue::Queue;
use super::{now_ms, QueueEvent};
use crate::models::job::{Job, JobState};

const STALL_CHECK_INTERVAL: Duration = Duration::from_millis(LOCK_DURATION_MS as u64);

/// Business logic run for each job. An `Err` (or a panic) counts as a failed
/// attempt; retry bookkeeping stays with the worker.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    async fn process(&self, job: Job) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> JobProcessor for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn process(&self, job: Job) -> anyhow::Result<Value> {
        (self)(job).await
    }
}

pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the loop and wait for it; the job in flight is allowed to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "worker task ended abnormally");
        }
    }
}

/// Spawn the processing loop for `queue`. Jobs run one at a time.
pub fn spawn(queue: Arc<Queue>, processor: Arc<dyn JobProcessor>) -> WorkerHandle {
    let (shutdown, mut rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        recover_stalled(&queue).await;

        let notify = queue.notifier();
        let mut ticker = tokio::time::interval(queue.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_stall_check = Instant::now();

        loop {
            tokio::select! {
                _ = rx.changed() => break,
                _ = ticker.tick() => {}
                _ = notify.notified() => {}
            }

            if last_stall_check.elapsed() >= STALL_CHECK_INTERVAL {
                recover_stalled(&queue).await;
                last_stall_check = Instant::now();
            }

            drain(&queue, processor.as_ref(), &rx).await;
        }

        tracing::debug!(queue = %queue.name(), "worker stopped");
    });

    WorkerHandle { shutdown, task }
}

/// Run eligible jobs until none are left, the queue is paused, or shutdown
/// is requested.
async fn drain(queue: &Queue, processor: &dyn JobProcessor, shutdown: &watch::Receiver<bool>) {
    let broker = queue.broker();
    loop {
        if *shutdown.borrow() {
            return;
        }

        match broker.promote_delayed(queue.name(), now_ms()).await {
            Ok(ids) => {
                for job_id in ids {
                    queue.emit(QueueEvent::Waiting {
                        queue: queue.name().to_string(),
                        job_id,
                    });
                }
            }
            Err(e) => {
                queue.emit_error(format!("promote failed: {}", e));
                return;
            }
        }

        match broker.claim_next(queue.name(), now_ms(), LOCK_DURATION_MS).await {
            Ok(Some(job)) => run_one(queue, processor, job).await,
            Ok(None) => return,
            Err(e) => {
                queue.emit_error(format!("claim failed: {}", e));
                return;
            }
        }
    }
}

async fn recover_stalled(queue: &Queue) {
    match queue.broker().recover_stalled(queue.name(), now_ms()).await {
        Ok(ids) => {
            for job_id in ids {
                queue.emit(QueueEvent::Stalled {
                    queue: queue.name().to_string(),
                    job_id,
                });
            }
        }
        Err(e) => queue.emit_error(format!("stall check failed: {}", e)),
    }
}

async fn run_one(queue: &Queue, processor: &dyn JobProcessor, mut job: Job) {
    queue.emit(QueueEvent::Active {
        queue: queue.name().to_string(),
        job_id: job.id,
        attempt: job.attempts_made + 1,
    });

    // only the first attempt of an instance schedules its successor
    if job.options.repeat.is_some() && job.attempts_made == 0 {
        if let Err(e) = queue.schedule_next_repeat(&job).await {
            queue.emit_error(format!("failed to schedule next repeat of job {}: {}", job.id, e));
        }
    }

    let outcome = execute(queue, processor, job.clone()).await;
    job.attempts_made += 1;
    let now = now_ms();
    let broker = queue.broker();

    match outcome {
        Ok(value) => {
            job.state = JobState::Completed;
            job.finished_at = Some(now);
            job.failed_reason = None;
            job.return_value = Some(value.clone());
            if let Err(e) = broker.finish(&job, job.options.remove_on_complete).await {
                queue.emit_error(format!("failed to complete job {}: {}", job.id, e));
                return;
            }
            queue.emit(QueueEvent::Completed {
                queue: queue.name().to_string(),
                job_id: job.id,
                result: value,
            });
        }
        Err(reason) => {
            job.failed_reason = Some(reason.clone());
            if job.attempts_exhausted() {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
                if let Err(e) = broker.finish(&job, job.options.remove_on_fail).await {
                    queue.emit_error(format!("failed to fail job {}: {}", job.id, e));
                    return;
                }
                queue.emit(QueueEvent::Failed {
                    queue: queue.name().to_string(),
                    job_id: job.id,
                    attempts_made: job.attempts_made,
                    error: reason,
                });
            } else {
                let backoff = job
                    .options
                    .backoff
                    .map(|b| b.delay_for(job.attempts_made))
                    .unwrap_or_default();
                job.state = JobState::Delayed;
                job.process_at = now.saturating_add(backoff.as_millis() as i64);
                tracing::warn!(
                    queue = %queue.name(),
                    job_id = job.id,
                    attempts_made = job.attempts_made,
                    max_attempts = job.options.max_attempts(),
                    error = %reason,
                    "job attempt failed, retrying"
                );
                if let Err(e) = broker.retry_later(&job).await {
                    queue.emit_error(format!("failed to reschedule job {}: {}", job.id, e));
                    return;
                }
                queue.emit(QueueEvent::Delayed {
                    queue: queue.name().to_string(),
                    job_id: job.id,
                    process_at: job.process_at,
                });
            }
        }
    }
}

/// Run the processor while renewing the job lock. Panics become failures.
async fn execute(queue: &Queue, processor: &dyn JobProcessor, job: Job) -> Result<Value, String> {
    let id = job.id;
    let fut = AssertUnwindSafe(processor.process(job)).catch_unwind();
    tokio::pin!(fut);

    let mut renew = tokio::time::interval(Duration::from_millis((LOCK_DURATION_MS / 2) as u64));
    // first tick completes immediately
    renew.tick().await;

    loop {
        tokio::select! {
            res = &mut fut => {
                return match res {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(format!("{:#}", e)),
                    Err(panic) => Err(panic_message(panic)),
                };
            }
            _ = renew.tick() => {
                if let Err(e) = queue
                    .broker()
                    .extend_lock(queue.name(), id, now_ms(), LOCK_DURATION_MS)
                    .await
                {
                    queue.emit_error(format!("failed to renew lock for job {}: {}", id, e));
                }
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("processor panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("processor panicked: {}", s)
    } else {
        "processor panicked".to_string()
    }
}
