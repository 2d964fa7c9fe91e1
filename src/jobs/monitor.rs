//! Background job: periodic backlog check across every registered queue.
//!
//! A queue whose `waiting` count exceeds the threshold is logged at warn.
//! Failing to read one queue's counts never stops the check for the others.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time;

use super::queue::Queue;

pub type Registry = Arc<DashMap<String, Arc<Queue>>>;

/// Spawn the monitor task. The caller owns the handle and aborts it on stop.
pub fn spawn(registry: Registry, interval: Duration, threshold: usize) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        // the first tick is immediate; skip it so startup is not reported as a check
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let backlogged = check_backlogs(&registry, threshold).await;
            tracing::debug!(
                queues = registry.len(),
                backlogged = backlogged.len(),
                "queue monitor pass complete"
            );
        }
    })
}

/// Returns `(queue, waiting)` for every queue over the threshold.
pub async fn check_backlogs(registry: &Registry, threshold: usize) -> Vec<(String, usize)> {
    // snapshot first: no map guard may be held across an await
    let queues: Vec<Arc<Queue>> = registry.iter().map(|e| Arc::clone(e.value())).collect();

    let mut backlogged = Vec::new();
    for queue in queues {
        match queue.counts().await {
            Ok(counts) if counts.waiting > threshold => {
                tracing::warn!(
                    queue = %queue.name(),
                    waiting = counts.waiting,
                    threshold,
                    "queue backlog detected"
                );
                backlogged.push((queue.name().to_string(), counts.waiting));
            }
            Ok(_) => {}
            Err(e) => tracing::error!(queue = %queue.name(), error = %e, "queue monitor failed"),
        }
    }
    backlogged.sort();
    backlogged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::MemoryBroker;
    use crate::models::job::JobOptions;
    use serde_json::json;
    use tokio::sync::broadcast;

    #[tokio::test]
    async fn test_backlog_flagged_only_above_threshold() {
        let broker = Arc::new(MemoryBroker::new());
        let (tx, _rx) = broadcast::channel(1024);
        let registry: Registry = Arc::new(DashMap::new());
        for name in ["busy", "quiet"] {
            let q = Queue::new(
                name,
                JobOptions::default(),
                broker.clone(),
                tx.clone(),
                Duration::from_millis(50),
            );
            registry.insert(name.to_string(), Arc::new(q));
        }

        let busy = registry.get("busy").map(|q| Arc::clone(q.value())).unwrap();
        for i in 0..4 {
            busy.add(json!(i), JobOptions::default()).await.unwrap();
        }
        let quiet = registry.get("quiet").map(|q| Arc::clone(q.value())).unwrap();
        for i in 0..3 {
            quiet.add(json!(i), JobOptions::default()).await.unwrap();
        }

        // strictly greater than the threshold
        assert_eq!(
            check_backlogs(&registry, 3).await,
            vec![("busy".to_string(), 4)]
        );
        assert!(check_backlogs(&registry, 4).await.is_empty());
    }
}
