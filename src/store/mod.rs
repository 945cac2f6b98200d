//! Durable job state: the queue store and the fail store.
//!
//! The queue store's claim operation is the single serialization point in
//! the dispatch path; everything else reads snapshots. Every transition is
//! made durable before the scheduler acts on it, so a crash between claim
//! and dispatch leaves the job recoverable, never lost or double-claimed.

pub mod fail;
pub mod job;
pub mod memory;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::StoreError;
pub use job::{Job, JobResult, JobState, ResultAction};

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Restrict claims to one job type; `None` claims any ready job.
    pub job_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Retry granted; the job is waiting again and becomes ready at the
    /// given time.
    Requeued { not_before: DateTime<Utc> },
    /// Retry budget exhausted; the caller records the job in the fail
    /// store and marks it terminal.
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub waiting: usize,
    pub claimed: usize,
    pub running: usize,
    pub succeeded: u64,
    pub failed: u64,
}

/// Durable record of job state, keyed by job id.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    async fn enqueue(&self, job: Job) -> Result<(), StoreError>;

    /// Claim one ready job matching the filter, atomically moving it to
    /// `Claimed` so no second caller can take it.
    async fn take_next(&self, filter: &JobFilter) -> Result<Option<Job>, StoreError>;

    /// Durably bind a claimed job to a worker before it is dispatched.
    async fn mark_running(&self, id: Uuid, worker_id: u64) -> Result<(), StoreError>;

    /// Move a job to its terminal state and archive it.
    async fn mark_terminal(&self, id: Uuid, outcome: TerminalOutcome) -> Result<(), StoreError>;

    /// Job-fault retry: consumes one unit of the retry budget. Returns
    /// `Exhausted` once `retry_count` would exceed `max_retries`.
    async fn requeue_for_retry(
        &self,
        id: Uuid,
        backoff: Option<Duration>,
    ) -> Result<RetryDisposition, StoreError>;

    /// Infrastructure requeue: back to waiting without consuming a retry.
    /// An optional backoff delays the next claim (worker `EXECUTE_LATER`
    /// hints come through here).
    async fn release(&self, id: Uuid, backoff: Option<Duration>) -> Result<(), StoreError>;

    /// Cancel a waiting job. Returns false if the job is not waiting.
    async fn cancel(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Recovery sweep: claimed/running jobs untouched for longer than the
    /// grace period and absent from the live assignment set are treated as
    /// lost work and returned to waiting.
    async fn recover_orphans(
        &self,
        grace: Duration,
        live_assignments: &HashSet<Uuid>,
    ) -> Result<Vec<Uuid>, StoreError>;

    async fn counts(&self) -> Result<StoreCounts, StoreError>;

    /// Wake signal fired whenever a job becomes ready to claim.
    fn ready_notify(&self) -> Arc<Notify>;
}
