//! In-process delay-queue scheduler
//!
//! At-least-once, same-process redelivery: a driving loop calls
//! [`QueueScheduler::next_ready`] in a tight loop and hands each job to the
//! executor. Durability across process
//! restarts comes from `startAtEpochMs`/`lockedUntil` on the execution row
//! itself, not from this queue — a crash simply means the periodic
//! `processEnqueued` scan picks the row back up.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::time::DelayQueue;
use uuid::Uuid;

use super::{ReentryContext, Scheduler, SchedulerError};

#[derive(Debug, Clone)]
pub struct ReentryJob {
    pub execution_id: Uuid,
    pub ctx: ReentryContext,
}

pub struct QueueScheduler {
    queue: Mutex<DelayQueue<ReentryJob>>,
}

impl Default for QueueScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueScheduler {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(DelayQueue::new()),
        }
    }

    /// Blocks until a job's delay has elapsed, then returns it. Callers
    /// drive this in a loop from the binary entrypoint.
    pub async fn next_ready(&self) -> Option<ReentryJob> {
        let mut queue = self.queue.lock().await;
        queue.next().await.map(|expired| expired.into_inner())
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.lock().await.len()
    }
}

#[async_trait]
impl Scheduler for QueueScheduler {
    async fn schedule_after(
        &self,
        execution_id: Uuid,
        delay: Duration,
        ctx: ReentryContext,
    ) -> Result<(), SchedulerError> {
        self.queue
            .lock()
            .await
            .insert(ReentryJob { execution_id, ctx }, delay);
        Ok(())
    }

    async fn schedule_at(
        &self,
        execution_id: Uuid,
        epoch_ms: i64,
        ctx: ReentryContext,
    ) -> Result<(), SchedulerError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let delay = (epoch_ms - now_ms).max(0) as u64;
        self.schedule_after(execution_id, Duration::from_millis(delay), ctx)
            .await
    }
}
