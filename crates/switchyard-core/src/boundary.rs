//! Contracts for collaborators that live outside the hub.
//!
//! The hub only needs "submit and forget" semantics from the durable job
//! queue and "publish" semantics from a cross-instance relay. Both come with
//! in-process defaults suitable for a single-instance deployment.

use crate::error::SwitchyardResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Retry behaviour requested from the job queue for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts after the first one.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Cap on the backoff delay in milliseconds.
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based), capped at `backoff_max_ms`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        delay.min(self.backoff_max_ms)
    }
}

/// One integration step to be executed by an external worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationJob {
    /// Task the step belongs to.
    pub task_id: Uuid,
    /// Step name, e.g. `deploy` or `post`.
    pub step: String,
    /// Run identifier owned by the persistence layer.
    pub run_id: String,
    /// Retry behaviour for the queue.
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Durable queue for integration steps.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueues a job. Returning `Ok` means the queue has taken ownership.
    async fn enqueue(&self, job: IntegrationJob) -> SwitchyardResult<()>;
}

/// Job queue that keeps jobs in memory. Used in single-process mode and tests.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    jobs: Mutex<Vec<IntegrationJob>>,
}

impl InMemoryJobQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns every queued job.
    pub fn drain(&self) -> Vec<IntegrationJob> {
        std::mem::take(&mut *self.jobs.lock())
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: IntegrationJob) -> SwitchyardResult<()> {
        tracing::debug!(
            task_id = %job.task_id,
            step = %job.step,
            run_id = %job.run_id,
            "Integration job queued",
        );
        self.jobs.lock().push(job);
        Ok(())
    }
}

/// Fans a broadcast out to other hub instances.
#[async_trait]
pub trait BroadcastRelay: Send + Sync {
    /// Publishes a serialized envelope.
    async fn publish(&self, frame: &str) -> SwitchyardResult<()>;
}

/// Relay for single-instance deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRelay;

#[async_trait]
impl BroadcastRelay for NoopRelay {
    async fn publish(&self, _frame: &str) -> SwitchyardResult<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_ms(0), 500);
        assert_eq!(policy.backoff_ms(2), 2000);
        assert_eq!(policy.backoff_ms(20), 30_000);
    }

    #[tokio::test]
    async fn test_in_memory_queue_drain() {
        let queue = InMemoryJobQueue::new();
        let job = IntegrationJob {
            task_id: Uuid::new_v4(),
            step: "deploy".into(),
            run_id: "run-1".into(),
            retry: RetryPolicy::default(),
        };
        queue.enqueue(job.clone()).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain(), vec![job]);
        assert!(queue.is_empty());
    }
}
