//! Background job queues.
//!
//! - `broker.rs` - storage primitives every backend provides
//! - `memory.rs` / `redis.rs` - in-process and Redis backends
//! - `queue.rs` - a named queue handle with default job options
//! - `worker.rs` - per-queue processing loop (retry, backoff, retention)
//! - `schedule.rs` - cron patterns for recurring jobs
//! - `monitor.rs` - periodic backlog check
//! - `manager.rs` - registry of named queues over one shared broker

use serde::Serialize;
use thiserror::Error;

use crate::models::job::JobId;

pub mod broker;
pub mod manager;
pub mod memory;
pub mod monitor;
pub mod queue;
pub mod redis;
pub mod schedule;
pub mod worker;

pub use broker::Broker;
pub use manager::{HealthStatus, QueueHealth, QueueManager};
pub use memory::MemoryBroker;
pub use queue::Queue;
pub use self::redis::RedisBroker;
pub use worker::JobProcessor;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue '{0}' does not exist")]
    QueueNotFound(String),

    #[error("job {id} in queue '{queue}' is active and cannot be removed")]
    JobActive { queue: String, id: JobId },

    #[error("invalid cron pattern '{pattern}': {reason}")]
    InvalidCron { pattern: String, reason: String },

    #[error("queue '{0}' already has a processor")]
    ProcessorExists(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<::redis::RedisError> for QueueError {
    fn from(e: ::redis::RedisError) -> Self {
        QueueError::Broker(e.to_string())
    }
}

/// Job lifecycle notifications, broadcast to any subscriber of
/// [`QueueManager::subscribe`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum QueueEvent {
    Error {
        queue: String,
        message: String,
    },
    Waiting {
        queue: String,
        job_id: JobId,
    },
    Delayed {
        queue: String,
        job_id: JobId,
        process_at: i64,
    },
    Active {
        queue: String,
        job_id: JobId,
        attempt: u32,
    },
    Completed {
        queue: String,
        job_id: JobId,
        result: serde_json::Value,
    },
    Failed {
        queue: String,
        job_id: JobId,
        attempts_made: u32,
        error: String,
    },
    Stalled {
        queue: String,
        job_id: JobId,
    },
}

impl QueueEvent {
    pub fn queue(&self) -> &str {
        match self {
            QueueEvent::Error { queue, .. }
            | QueueEvent::Waiting { queue, .. }
            | QueueEvent::Delayed { queue, .. }
            | QueueEvent::Active { queue, .. }
            | QueueEvent::Completed { queue, .. }
            | QueueEvent::Failed { queue, .. }
            | QueueEvent::Stalled { queue, .. } => queue,
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
