//! Job queue collaborator.
//!
//! The retry core never owns queue storage; it only needs to push retries
//! (now or later), look up a job type's default queue, and, for cancel,
//! drop scheduled retries. [`MemoryQueue`] implements all of it in-process.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{RetryError, RetryResult};
use crate::job::{JobPayload, JobRegistry};

/// Operations the retry core needs from the host queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Push a job onto `queue` for immediate processing.
    async fn enqueue_to(&self, queue: &str, job_type: &str, args: Vec<Value>) -> RetryResult<()>;

    /// Schedule a job onto `queue` after `delay`.
    async fn enqueue_delayed_to_queue(
        &self,
        queue: &str,
        delay: Duration,
        job_type: &str,
        args: Vec<Value>,
    ) -> RetryResult<()>;

    /// Default queue of a job type.
    fn queue_for(&self, job_type: &str) -> Option<String>;

    /// Remove scheduled jobs matching `job_type` and `args`. Returns how many were removed.
    async fn remove_delayed(&self, job_type: &str, args: &[Value]) -> RetryResult<usize>;

    /// Jobs run synchronously in the caller; no shared store is available.
    fn is_inline(&self) -> bool {
        false
    }

    /// Push a job onto its default queue.
    async fn enqueue(&self, job_type: &str, args: Vec<Value>) -> RetryResult<()> {
        let queue = self.resolve_queue(job_type)?;
        self.enqueue_to(&queue, job_type, args).await
    }

    /// Schedule a job onto its default queue after `delay`.
    async fn enqueue_delayed(&self, delay: Duration, job_type: &str, args: Vec<Value>) -> RetryResult<()> {
        let queue = self.resolve_queue(job_type)?;
        self.enqueue_delayed_to_queue(&queue, delay, job_type, args).await
    }

    /// [`queue_for`](Self::queue_for), failing for unknown job types.
    fn resolve_queue(&self, job_type: &str) -> RetryResult<String> {
        self.queue_for(job_type)
            .ok_or_else(|| RetryError::UnknownJob(job_type.to_string()))
    }
}

/// Where workers take jobs from.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Take the next ready job from the first non-empty queue in `queues`.
    async fn reserve(&self, queues: &[String]) -> RetryResult<Option<JobPayload>>;
}

/// A job waiting in the delayed schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayedJob {
    /// When the job becomes ready.
    pub run_at: DateTime<Utc>,
    /// The job itself.
    pub payload: JobPayload,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: HashMap<String, VecDeque<JobPayload>>,
    delayed: Vec<DelayedJob>,
}

impl QueueState {
    fn push_ready(&mut self, payload: JobPayload) {
        self.ready
            .entry(payload.queue.clone())
            .or_default()
            .push_back(payload);
    }
}

/// In-process queue with a delayed schedule.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    registry: JobRegistry,
    state: Arc<Mutex<QueueState>>,
    inline: bool,
}

impl MemoryQueue {
    /// Create a queue resolving default queues through `registry`.
    #[must_use]
    pub fn new(registry: JobRegistry) -> Self {
        Self {
            registry,
            state: Arc::new(Mutex::new(QueueState::default())),
            inline: false,
        }
    }

    /// Mark the queue as running jobs inline.
    #[must_use]
    pub const fn inline(mut self, inline: bool) -> Self {
        self.inline = inline;
        self
    }

    /// Take the next ready job from `queue`.
    pub async fn pop(&self, queue: &str) -> Option<JobPayload> {
        self.state
            .lock()
            .await
            .ready
            .get_mut(queue)
            .and_then(VecDeque::pop_front)
    }

    /// Ready jobs in `queue`, oldest first.
    pub async fn pending(&self, queue: &str) -> Vec<JobPayload> {
        self.state
            .lock()
            .await
            .ready
            .get(queue)
            .map(|jobs| jobs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Scheduled jobs, in scheduling order.
    pub async fn delayed(&self) -> Vec<DelayedJob> {
        self.state.lock().await.delayed.clone()
    }

    /// Move scheduled jobs due at `now` to their ready queues.
    pub async fn promote_due(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock().await;
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
            .into_iter()
            .partition(|job| job.run_at <= now);
        state.delayed = waiting;
        let promoted = due.len();
        for job in due {
            state.push_ready(job.payload);
        }
        promoted
    }

    /// Move every scheduled job to its ready queue regardless of due time.
    pub async fn promote_all(&self) -> usize {
        let mut state = self.state.lock().await;
        let due = std::mem::take(&mut state.delayed);
        let promoted = due.len();
        for job in due {
            state.push_ready(job.payload);
        }
        promoted
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue_to(&self, queue: &str, job_type: &str, args: Vec<Value>) -> RetryResult<()> {
        debug!(queue = %queue, job = %job_type, "Enqueued job");
        self.state
            .lock()
            .await
            .push_ready(JobPayload::new(job_type, args, queue));
        Ok(())
    }

    async fn enqueue_delayed_to_queue(
        &self,
        queue: &str,
        delay: Duration,
        job_type: &str,
        args: Vec<Value>,
    ) -> RetryResult<()> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| RetryError::Queue(format!("invalid delay: {e}")))?;
        let run_at = Utc::now() + delay;
        debug!(queue = %queue, job = %job_type, run_at = %run_at, "Scheduled job");
        self.state.lock().await.delayed.push(DelayedJob {
            run_at,
            payload: JobPayload::new(job_type, args, queue),
        });
        Ok(())
    }

    fn queue_for(&self, job_type: &str) -> Option<String> {
        self.registry.queue_for(job_type)
    }

    async fn remove_delayed(&self, job_type: &str, args: &[Value]) -> RetryResult<usize> {
        let mut state = self.state.lock().await;
        let before = state.delayed.len();
        state
            .delayed
            .retain(|job| !(job.payload.class == job_type && job.payload.args == args));
        Ok(before - state.delayed.len())
    }

    fn is_inline(&self) -> bool {
        self.inline
    }
}

#[async_trait]
impl JobSource for MemoryQueue {
    async fn reserve(&self, queues: &[String]) -> RetryResult<Option<JobPayload>> {
        self.promote_due(Utc::now()).await;
        for queue in queues {
            if let Some(payload) = self.pop(queue).await {
                return Ok(Some(payload));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::exception::JobFailure;
    use crate::job::Job;
    use serde_json::json;

    struct MailerJob;

    #[async_trait]
    impl Job for MailerJob {
        fn name(&self) -> &str {
            "MailerJob"
        }

        fn queue(&self) -> &str {
            "mailers"
        }

        async fn perform(&self, _args: &[Value], _attempt: i64) -> Result<(), JobFailure> {
            Ok(())
        }
    }

    fn queue() -> MemoryQueue {
        MemoryQueue::new(JobRegistry::new().with(Arc::new(MailerJob)))
    }

    #[tokio::test]
    async fn test_enqueue_uses_default_queue() {
        let queue = queue();
        queue.enqueue("MailerJob", vec![json!(1)]).await.unwrap();
        assert_eq!(
            queue.pending("mailers").await,
            vec![JobPayload::new("MailerJob", vec![json!(1)], "mailers")]
        );
        assert!(matches!(
            queue.enqueue("Nope", vec![]).await,
            Err(RetryError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn test_delayed_jobs_wait_until_due() {
        let queue = queue();
        queue
            .enqueue_delayed(Duration::from_secs(60), "MailerJob", vec![json!("a")])
            .await
            .unwrap();
        assert_eq!(queue.promote_due(Utc::now()).await, 0);
        assert!(queue.reserve(&["mailers".to_string()]).await.unwrap().is_none());

        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(queue.promote_due(later).await, 1);
        assert_eq!(queue.pop("mailers").await.map(|job| job.args), Some(vec![json!("a")]));
    }

    #[tokio::test]
    async fn test_remove_delayed_matches_class_and_args() {
        let queue = queue();
        for args in [vec![json!("a")], vec![json!("b")], vec![json!("a")]] {
            queue
                .enqueue_delayed_to_queue("mailers", Duration::from_secs(5), "MailerJob", args)
                .await
                .unwrap();
        }
        assert_eq!(queue.remove_delayed("MailerJob", &[json!("a")]).await.unwrap(), 2);
        assert_eq!(queue.delayed().await.len(), 1);
        assert_eq!(queue.promote_all().await, 1);
        assert_eq!(queue.pending("mailers").await.len(), 1);
    }

    #[tokio::test]
    async fn test_reserve_checks_queues_in_order() {
        let queue = queue();
        queue.enqueue_to("low", "MailerJob", vec![json!("low")]).await.unwrap();
        queue.enqueue_to("high", "MailerJob", vec![json!("high")]).await.unwrap();
        let queues = vec!["high".to_string(), "low".to_string()];
        let first = queue.reserve(&queues).await.unwrap().unwrap();
        assert_eq!(first.queue, "high");
        let second = queue.reserve(&queues).await.unwrap().unwrap();
        assert_eq!(second.queue, "low");
        assert!(queue.reserve(&queues).await.unwrap().is_none());
    }
}
