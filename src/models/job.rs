use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub type JobId = u64;

/// Where a job currently sits inside its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Delayed,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state '{}'", s))
    }
}

/// Delay rule applied before a failed job becomes eligible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    /// Constant `delay` milliseconds between attempts.
    Fixed { delay: u64 },
    /// `delay * 2^(attempts_made - 1)` milliseconds.
    Exponential { delay: u64 },
}

impl Backoff {
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => Duration::from_millis(delay),
            Backoff::Exponential { delay } => {
                let exp = attempts_made.saturating_sub(1).min(32);
                Duration::from_millis(delay.saturating_mul(1u64 << exp))
            }
        }
    }
}

/// Marks a job as one instance of a recurring registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatOptions {
    pub cron: String,
    pub key: String,
}

/// Per-job options. Every field is optional so that call-site options can be
/// layered over a queue's defaults with [`JobOptions::merged_over`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total executions allowed, including the first. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
    /// Completed records to retain. `None` keeps all of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<usize>,
    /// Failed records to retain. `None` keeps all of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<usize>,
    /// Milliseconds to hold the job in `delayed` before it may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    /// Lower runs first. Defaults to 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatOptions>,
}

impl JobOptions {
    pub fn merged_over(&self, defaults: &JobOptions) -> JobOptions {
        JobOptions {
            attempts: self.attempts.or(defaults.attempts),
            backoff: self.backoff.or(defaults.backoff),
            remove_on_complete: self.remove_on_complete.or(defaults.remove_on_complete),
            remove_on_fail: self.remove_on_fail.or(defaults.remove_on_fail),
            delay: self.delay.or(defaults.delay),
            priority: self.priority.or(defaults.priority),
            repeat: self.repeat.clone().or_else(|| defaults.repeat.clone()),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.attempts.unwrap_or(1).max(1)
    }

    pub fn priority(&self) -> u32 {
        self.priority.unwrap_or(0)
    }
}

/// A unit of deferred work. The owning queue is fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    queue: String,
    pub payload: serde_json::Value,
    pub options: JobOptions,
    pub state: JobState,
    pub attempts_made: u32,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Earliest Unix millisecond at which the job may leave `delayed`.
    pub process_at: i64,
    #[serde(default)]
    pub processed_at: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
    #[serde(default)]
    pub failed_reason: Option<String>,
    #[serde(default)]
    pub return_value: Option<serde_json::Value>,
}

impl Job {
    pub fn new(
        id: JobId,
        queue: impl Into<String>,
        payload: serde_json::Value,
        options: JobOptions,
        now_ms: i64,
    ) -> Self {
        let delay = options.delay.unwrap_or(0);
        let (state, process_at) = if delay > 0 {
            (JobState::Delayed, now_ms.saturating_add(delay as i64))
        } else {
            (JobState::Waiting, now_ms)
        };
        Self {
            id,
            queue: queue.into(),
            payload,
            options,
            state,
            attempts_made: 0,
            created_at: now_ms,
            process_at,
            processed_at: None,
            finished_at: None,
            failed_reason: None,
            return_value: None,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// True once no further attempt will be scheduled after a failure.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made >= self.options.max_attempts()
    }
}

/// Point-in-time job counts for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub name: String,
    #[serde(flatten)]
    pub counts: QueueCounts,
    pub paused: bool,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fixed_backoff_is_constant() {
        let b = Backoff::Fixed { delay: 5000 };
        assert_eq!(b.delay_for(1), Duration::from_millis(5000));
        assert_eq!(b.delay_for(4), Duration::from_millis(5000));
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let b = Backoff::Exponential { delay: 2000 };
        assert_eq!(b.delay_for(1), Duration::from_millis(2000));
        assert_eq!(b.delay_for(2), Duration::from_millis(4000));
        assert_eq!(b.delay_for(3), Duration::from_millis(8000));
        // does not overflow on absurd attempt counts
        assert!(b.delay_for(200) >= b.delay_for(3));
    }

    #[test]
    fn test_backoff_wire_format() {
        let b: Backoff = serde_json::from_value(json!({"type": "exponential", "delay": 10000})).unwrap();
        assert_eq!(b, Backoff::Exponential { delay: 10000 });
    }

    #[test]
    fn test_options_merge_prefers_call_site() {
        let defaults = JobOptions {
            attempts: Some(3),
            backoff: Some(Backoff::Fixed { delay: 3000 }),
            remove_on_complete: Some(100),
            remove_on_fail: Some(50),
            ..Default::default()
        };
        let call = JobOptions {
            attempts: Some(1),
            delay: Some(250),
            ..Default::default()
        };
        let merged = call.merged_over(&defaults);
        assert_eq!(merged.max_attempts(), 1);
        assert_eq!(merged.delay, Some(250));
        assert_eq!(merged.remove_on_complete, Some(100));
        assert_eq!(merged.backoff, Some(Backoff::Fixed { delay: 3000 }));
    }

    #[test]
    fn test_max_attempts_never_zero() {
        let opts = JobOptions {
            attempts: Some(0),
            ..Default::default()
        };
        assert_eq!(opts.max_attempts(), 1);
        assert_eq!(JobOptions::default().max_attempts(), 1);
    }

    #[test]
    fn test_new_job_with_delay_starts_delayed() {
        let opts = JobOptions {
            delay: Some(5000),
            ..Default::default()
        };
        let job = Job::new(1, "email", json!({}), opts, 1_000);
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.process_at, 6_000);
        assert_eq!(job.queue(), "email");

        let job = Job::new(2, "email", json!({}), JobOptions::default(), 1_000);
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.process_at, 1_000);
    }

    #[test]
    fn test_job_state_parse() {
        assert_eq!("delayed".parse::<JobState>().unwrap(), JobState::Delayed);
        assert!("stuck".parse::<JobState>().is_err());
    }
}
