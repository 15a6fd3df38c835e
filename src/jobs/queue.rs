//! Job queue over the shared store.
//!
//! Each task type owns one ready list plus a delayed sorted-set for retry
//! backoff. Dequeue first promotes every delayed job whose due time has
//! passed, then blocks briefly on the ready list.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::jobs::payload::JobEnvelope;
use crate::store::KvStore;

pub struct JobQueue {
    store: Arc<dyn KvStore>,
    queue: String,
}

impl JobQueue {
    pub fn new(store: Arc<dyn KvStore>, queue: &str) -> Self {
        Self {
            store,
            queue: queue.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.queue
    }

    pub async fn enqueue(&self, job: &JobEnvelope) -> Result<()> {
        self.store.push_ready(&self.queue, &job.to_json()?).await
    }

    /// Park a job until `delay_secs` from now.
    pub async fn requeue_with_delay(&self, job: &JobEnvelope, delay_secs: u64) -> Result<()> {
        let due_at = Utc::now().timestamp() as f64 + delay_secs as f64;
        info!(
            "requeueing job {} for attempt {} in {delay_secs} s",
            job.session_uid, job.attempt
        );
        self.store
            .push_delayed(&self.queue, &job.to_json()?, due_at)
            .await
    }

    /// Promote due delayed jobs, then pop the next ready one. `None` when
    /// the queue stays empty for the whole timeout.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<JobEnvelope>> {
        let now = Utc::now().timestamp() as f64;
        for payload in self.store.take_due_delayed(&self.queue, now).await? {
            self.store.push_ready(&self.queue, &payload).await?;
        }

        let Some(raw) = self.store.pop_ready(&self.queue, timeout).await? else {
            return Ok(None);
        };
        match JobEnvelope::from_json(&raw) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                warn!("dropping undecodable job payload: {e}");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn queue() -> JobQueue {
        JobQueue::new(Arc::new(MemoryStore::new()), "montgomery-queue")
    }

    fn job(uid: &str) -> JobEnvelope {
        JobEnvelope::from_json(&format!(r#"{{"Type":"KGAI","SessionUID":"{uid}"}}"#)).unwrap()
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_round_trips() {
        let queue = queue();
        queue.enqueue(&job("a")).await.unwrap();
        let popped = queue
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.session_uid, "a");
        assert!(queue.dequeue(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overdue_delayed_jobs_are_promoted_before_ready_pop() {
        let queue = queue();
        // Due in the past, so the next dequeue must surface it.
        queue.requeue_with_delay(&job("delayed"), 0).await.unwrap();
        let popped = queue
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.session_uid, "delayed");
    }

    #[tokio::test]
    async fn undecodable_payload_is_dropped_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        store
            .push_ready("montgomery-queue", "{not json")
            .await
            .unwrap();
        let queue = JobQueue::new(store, "montgomery-queue");
        assert!(queue.dequeue(Duration::from_millis(20)).await.unwrap().is_none());
    }
}
