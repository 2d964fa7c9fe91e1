use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, Notify};

use super::broker::Broker;
use super::schedule;
use super::worker::{self, JobProcessor, WorkerHandle};
use super::{now_ms, QueueError, QueueEvent};
use crate::models::job::{Job, JobId, JobOptions, JobState, QueueCounts, QueueStats, RepeatOptions};

/// A named channel of jobs over the shared broker. Call-site options are
/// layered over `default_job_options` on every submission.
pub struct Queue {
    name: String,
    default_job_options: JobOptions,
    broker: Arc<dyn Broker>,
    events: broadcast::Sender<QueueEvent>,
    notify: Arc<Notify>,
    poll_interval: Duration,
    worker: Mutex<Option<WorkerHandle>>,
}

impl Queue {
    pub fn new(
        name: impl Into<String>,
        default_job_options: JobOptions,
        broker: Arc<dyn Broker>,
        events: broadcast::Sender<QueueEvent>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            default_job_options,
            broker,
            events,
            notify: Arc::new(Notify::new()),
            poll_interval,
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_job_options(&self) -> &JobOptions {
        &self.default_job_options
    }

    pub(crate) fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub(crate) fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub async fn add(&self, payload: Value, options: JobOptions) -> Result<Job, QueueError> {
        let options = options.merged_over(&self.default_job_options);
        let result = self.enqueue(payload, options).await;
        if let Err(ref e) = result {
            self.emit_error(format!("enqueue failed: {}", e));
        }
        result
    }

    async fn enqueue(&self, payload: Value, options: JobOptions) -> Result<Job, QueueError> {
        let id = self.broker.next_id(&self.name).await?;
        let job = Job::new(id, self.name.as_str(), payload, options, now_ms());
        self.broker.enqueue(&job).await?;

        match job.state {
            JobState::Delayed => self.emit(QueueEvent::Delayed {
                queue: self.name.clone(),
                job_id: job.id,
                process_at: job.process_at,
            }),
            _ => {
                self.emit(QueueEvent::Waiting {
                    queue: self.name.clone(),
                    job_id: job.id,
                });
                self.notify.notify_one();
            }
        }
        Ok(job)
    }

    /// Register a recurring job and schedule its first instance at the next
    /// fire time of `pattern`.
    pub async fn add_recurring(
        &self,
        payload: Value,
        pattern: &str,
        options: JobOptions,
    ) -> Result<Job, QueueError> {
        let cron = schedule::parse(pattern)?;
        let key = schedule::repeat_key(&self.name);
        self.broker.save_repeat(&self.name, &key, pattern).await?;

        let options = JobOptions {
            repeat: Some(RepeatOptions {
                cron: pattern.to_string(),
                key,
            }),
            ..options
        }
        .merged_over(&self.default_job_options);
        self.add_instance(payload, options, &cron, now_ms()).await
    }

    /// Schedule the instance that follows `job` if its registration is still live.
    pub(crate) async fn schedule_next_repeat(&self, job: &Job) -> Result<Option<Job>, QueueError> {
        let Some(repeat) = job.options.repeat.as_ref() else {
            return Ok(None);
        };
        if !self.broker.has_repeat(&self.name, &repeat.key).await? {
            return Ok(None);
        }
        // a stalled instance that is claimed again already has a successor
        if self.has_pending_instance(&repeat.key, job.id).await? {
            return Ok(None);
        }
        let cron = schedule::parse(&repeat.cron)?;
        let after = job.process_at.max(now_ms());
        self.add_instance(job.payload.clone(), job.options.clone(), &cron, after)
            .await
            .map(Some)
    }

    /// Whether a not-yet-attempted instance of `key`, other than `except`,
    /// is waiting or delayed.
    async fn has_pending_instance(&self, key: &str, except: JobId) -> Result<bool, QueueError> {
        for state in [JobState::Delayed, JobState::Waiting] {
            let jobs = self.broker.list_jobs(&self.name, state, 0, usize::MAX).await?;
            let found = jobs.iter().any(|j| {
                j.id != except
                    && j.attempts_made == 0
                    && j.options.repeat.as_ref().is_some_and(|r| r.key == key)
            });
            if found {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn add_instance(
        &self,
        payload: Value,
        options: JobOptions,
        cron: &cron::Schedule,
        after_ms: i64,
    ) -> Result<Job, QueueError> {
        let fire_at = schedule::next_fire(cron, after_ms).ok_or_else(|| QueueError::InvalidCron {
            pattern: options
                .repeat
                .as_ref()
                .map(|r| r.cron.clone())
                .unwrap_or_default(),
            reason: "schedule has no future fire time".into(),
        })?;
        let delay = (fire_at - now_ms()).max(1) as u64;
        self.enqueue(
            payload,
            JobOptions {
                delay: Some(delay),
                ..options
            },
        )
        .await
    }

    /// Stop re-materializing a recurring job and drop its pending instance.
    pub async fn remove_recurring(&self, key: &str) -> Result<bool, QueueError> {
        let existed = self.broker.remove_repeat(&self.name, key).await?;
        for state in [JobState::Delayed, JobState::Waiting] {
            for job in self.broker.list_jobs(&self.name, state, 0, usize::MAX).await? {
                let matches = job.options.repeat.as_ref().is_some_and(|r| r.key == key);
                if matches {
                    self.broker.remove_job(&self.name, job.id).await?;
                }
            }
        }
        Ok(existed)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.broker.get_job(&self.name, id).await
    }

    pub async fn get_jobs(
        &self,
        state: JobState,
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, QueueError> {
        self.broker.list_jobs(&self.name, state, start, end).await
    }

    pub async fn remove_job(&self, id: JobId) -> Result<bool, QueueError> {
        self.broker.remove_job(&self.name, id).await
    }

    pub async fn pause(&self) -> Result<(), QueueError> {
        self.broker.set_paused(&self.name, true).await?;
        tracing::info!(queue = %self.name, "queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), QueueError> {
        self.broker.set_paused(&self.name, false).await?;
        tracing::info!(queue = %self.name, "queue resumed");
        self.notify.notify_one();
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool, QueueError> {
        self.broker.is_paused(&self.name).await
    }

    pub async fn empty(&self) -> Result<(), QueueError> {
        self.broker.empty(&self.name).await?;
        tracing::info!(queue = %self.name, "queue emptied");
        Ok(())
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.broker.counts(&self.name).await
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let counts = self.counts().await?;
        let paused = self.is_paused().await?;
        Ok(QueueStats {
            name: self.name.clone(),
            counts,
            paused,
            timestamp: Utc::now(),
        })
    }

    /// Start the worker for this queue. A queue has at most one processor.
    pub fn process(self: &Arc<Self>, processor: Arc<dyn JobProcessor>) -> Result<(), QueueError> {
        let mut slot = self
            .worker
            .lock()
            .map_err(|_| QueueError::Broker("worker slot poisoned".into()))?;
        if slot.is_some() {
            return Err(QueueError::ProcessorExists(self.name.clone()));
        }
        *slot = Some(worker::spawn(Arc::clone(self), processor));
        tracing::info!(queue = %self.name, "processor registered");
        Ok(())
    }

    /// Stop the worker, letting an in-flight job finish first.
    pub async fn close(&self) {
        let handle = match self.worker.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            handle.stop().await;
        }
        tracing::debug!(queue = %self.name, "queue closed");
    }

    pub(crate) fn emit_error(&self, message: String) {
        self.emit(QueueEvent::Error {
            queue: self.name.clone(),
            message,
        });
    }

    /// Log a lifecycle transition and fan it out to subscribers.
    pub(crate) fn emit(&self, event: QueueEvent) {
        match &event {
            QueueEvent::Error { queue, message } => {
                tracing::error!(queue = %queue, error = %message, "queue error")
            }
            QueueEvent::Waiting { queue, job_id } => {
                tracing::debug!(queue = %queue, job_id, "job waiting")
            }
            QueueEvent::Delayed {
                queue,
                job_id,
                process_at,
            } => tracing::debug!(queue = %queue, job_id, process_at, "job delayed"),
            QueueEvent::Active {
                queue,
                job_id,
                attempt,
            } => tracing::debug!(queue = %queue, job_id, attempt, "job active"),
            QueueEvent::Completed { queue, job_id, .. } => {
                tracing::info!(queue = %queue, job_id, "job completed")
            }
            QueueEvent::Failed {
                queue,
                job_id,
                attempts_made,
                error,
            } => tracing::error!(queue = %queue, job_id, attempts_made, error = %error, "job failed"),
            QueueEvent::Stalled { queue, job_id } => {
                tracing::warn!(queue = %queue, job_id, "job stalled")
            }
        }
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}
