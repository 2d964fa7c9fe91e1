use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::broker::Broker;
use super::monitor::{self, Registry};
use super::queue::Queue;
use super::worker::JobProcessor;
use super::{QueueError, QueueEvent};
use crate::config::QueueConfig;
use crate::models::job::{Backoff, Job, JobId, JobOptions, JobState, QueueStats};

const EVENT_CAPACITY: usize = 1024;

/// Failed-job counts above these mark a queue as degraded.
const FAILED_WARNING: usize = 10;
const FAILED_CRITICAL: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn for_failed(failed: usize) -> Self {
        if failed > FAILED_CRITICAL {
            HealthStatus::Critical
        } else if failed > FAILED_WARNING {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealthEntry {
    #[serde(flatten)]
    pub stats: QueueStats,
    pub status: HealthStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    /// Worst status across all queues.
    pub status: HealthStatus,
    pub queues: Vec<QueueHealthEntry>,
    pub timestamp: DateTime<Utc>,
}

/// The queues registered by [`QueueManager::start`], with their default job options.
pub fn default_queues() -> Vec<(&'static str, JobOptions)> {
    vec![
        (
            "email",
            JobOptions {
                attempts: Some(3),
                backoff: Some(Backoff::Exponential { delay: 2000 }),
                remove_on_complete: Some(100),
                remove_on_fail: Some(50),
                ..Default::default()
            },
        ),
        (
            "file-processing",
            JobOptions {
                attempts: Some(2),
                backoff: Some(Backoff::Fixed { delay: 5000 }),
                remove_on_complete: Some(50),
                remove_on_fail: Some(25),
                ..Default::default()
            },
        ),
        (
            "data-sync",
            JobOptions {
                attempts: Some(5),
                backoff: Some(Backoff::Exponential { delay: 10000 }),
                remove_on_complete: Some(200),
                remove_on_fail: Some(100),
                ..Default::default()
            },
        ),
        (
            "notifications",
            JobOptions {
                attempts: Some(3),
                backoff: Some(Backoff::Fixed { delay: 3000 }),
                remove_on_complete: Some(100),
                remove_on_fail: Some(50),
                ..Default::default()
            },
        ),
        (
            "cleanup",
            JobOptions {
                attempts: Some(1),
                remove_on_complete: Some(1000),
                remove_on_fail: Some(1000),
                ..Default::default()
            },
        ),
    ]
}

/// Registry of named queues over one shared broker. Cheap to clone; every
/// clone sees the same registry.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

struct Inner {
    broker: Arc<dyn Broker>,
    config: QueueConfig,
    queues: Registry,
    events: broadcast::Sender<QueueEvent>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl QueueManager {
    pub fn new(broker: Arc<dyn Broker>, config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                broker,
                config,
                queues: Arc::new(DashMap::new()),
                events,
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Check the broker, register the default queues and start the backlog
    /// monitor. An unreachable broker is fatal.
    pub async fn start(&self) -> Result<(), QueueError> {
        self.inner.broker.ping().await.map_err(|e| {
            tracing::error!(error = %e, "queue broker unreachable");
            e
        })?;

        for (name, options) in default_queues() {
            self.create_queue(name, options);
        }

        let handle = monitor::spawn(
            Arc::clone(&self.inner.queues),
            Duration::from_secs(self.inner.config.monitor_interval_secs),
            self.inner.config.backlog_threshold,
        );
        if let Ok(mut slot) = self.inner.monitor.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }

        tracing::info!(
            queues = self.inner.queues.len(),
            monitor_interval_secs = self.inner.config.monitor_interval_secs,
            "queue manager started"
        );
        Ok(())
    }

    /// Register `name`, or return the queue already registered under it.
    pub fn create_queue(&self, name: &str, default_job_options: JobOptions) -> Arc<Queue> {
        let entry = self.inner.queues.entry(name.to_string()).or_insert_with(|| {
            tracing::info!(queue = name, "queue created");
            Arc::new(Queue::new(
                name,
                default_job_options,
                Arc::clone(&self.inner.broker),
                self.inner.events.clone(),
                Duration::from_millis(self.inner.config.poll_interval_ms),
            ))
        });
        Arc::clone(entry.value())
    }

    pub fn get_queue(&self, name: &str) -> Result<Arc<Queue>, QueueError> {
        self.inner
            .queues
            .get(name)
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub async fn add_job(
        &self,
        queue: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<Job, QueueError> {
        self.get_queue(queue)?.add(payload, options).await
    }

    pub async fn add_job_with_delay(
        &self,
        queue: &str,
        payload: Value,
        delay_ms: u64,
        options: JobOptions,
    ) -> Result<Job, QueueError> {
        let options = JobOptions {
            delay: Some(delay_ms),
            ..options
        };
        self.add_job(queue, payload, options).await
    }

    /// Register a cron-driven job. The returned job is the first scheduled
    /// instance; its `options.repeat.key` identifies the registration.
    pub async fn add_recurring_job(
        &self,
        queue: &str,
        payload: Value,
        cron: &str,
        options: JobOptions,
    ) -> Result<Job, QueueError> {
        let job = self
            .get_queue(queue)?
            .add_recurring(payload, cron, options)
            .await?;
        tracing::info!(queue, cron, job_id = job.id, "recurring job registered");
        Ok(job)
    }

    pub async fn remove_recurring_job(&self, queue: &str, key: &str) -> Result<bool, QueueError> {
        self.get_queue(queue)?.remove_recurring(key).await
    }

    pub fn process_job<P>(&self, queue: &str, processor: P) -> Result<(), QueueError>
    where
        P: JobProcessor,
    {
        self.get_queue(queue)?.process(Arc::new(processor))
    }

    pub async fn get_job(&self, queue: &str, id: JobId) -> Result<Option<Job>, QueueError> {
        self.get_queue(queue)?.get_job(id).await
    }

    pub async fn get_jobs(
        &self,
        queue: &str,
        state: JobState,
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, QueueError> {
        self.get_queue(queue)?.get_jobs(state, start, end).await
    }

    pub async fn remove_job(&self, queue: &str, id: JobId) -> Result<bool, QueueError> {
        self.get_queue(queue)?.remove_job(id).await
    }

    pub async fn pause_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.get_queue(queue)?.pause().await
    }

    pub async fn resume_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.get_queue(queue)?.resume().await
    }

    pub async fn empty_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.get_queue(queue)?.empty().await
    }

    pub async fn get_queue_stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        self.get_queue(queue)?.stats().await
    }

    /// One entry per registered queue, ordered by name.
    pub async fn get_all_queue_stats(&self) -> Result<Vec<QueueStats>, QueueError> {
        let mut queues: Vec<Arc<Queue>> = self
            .inner
            .queues
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        queues.sort_by(|a, b| a.name().cmp(b.name()));

        let mut stats = Vec::with_capacity(queues.len());
        for queue in queues {
            stats.push(queue.stats().await?);
        }
        Ok(stats)
    }

    pub async fn health(&self) -> Result<QueueHealth, QueueError> {
        let queues: Vec<QueueHealthEntry> = self
            .get_all_queue_stats()
            .await?
            .into_iter()
            .map(|stats| QueueHealthEntry {
                status: HealthStatus::for_failed(stats.counts.failed),
                stats,
            })
            .collect();
        let status = queues
            .iter()
            .map(|q| q.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Ok(QueueHealth {
            status,
            queues,
            timestamp: Utc::now(),
        })
    }

    /// Lifecycle events from every queue, for monitoring code.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Stop the monitor and every worker, clear the registry and close the
    /// broker connection.
    pub async fn stop(&self) -> Result<(), QueueError> {
        if let Ok(mut slot) = self.inner.monitor.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }

        let queues: Vec<Arc<Queue>> = self
            .inner
            .queues
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        for queue in &queues {
            queue.close().await;
        }
        self.inner.queues.clear();

        self.inner.broker.close().await?;
        tracing::info!(queues = queues.len(), "queue manager stopped");
        Ok(())
    }
}
