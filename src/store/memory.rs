//! In-memory job queue store, the stock `job.queue` binding.
//!
//! A single mutex around the whole table makes the claim path trivially
//! at-most-one-claimant. Any backend with atomic compare-and-claim
//! semantics can replace it behind [`JobStore`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::job::{Job, JobState};
use crate::store::{JobFilter, JobStore, RetryDisposition, StoreCounts, TerminalOutcome};

#[derive(Default)]
struct Inner {
    active: HashMap<Uuid, Job>,
    /// FIFO of waiting job ids; may contain stale entries, filtered on claim.
    waiting: VecDeque<Uuid>,
    /// Terminal jobs kept for status queries.
    archive: HashMap<Uuid, Job>,
    /// Last claim/running transition, for orphan recovery.
    touched: HashMap<Uuid, Instant>,
    succeeded: u64,
    failed: u64,
}

pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    notify: Arc<Notify>,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let id = job.id;
        inner.waiting.push_back(id);
        inner.active.insert(id, job);
        drop(inner);
        tracing::debug!(job_id = %id, "job enqueued");
        self.notify.notify_one();
        Ok(())
    }

    async fn take_next(&self, filter: &JobFilter) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let mut picked = None;
        for (pos, id) in inner.waiting.iter().enumerate() {
            let Some(job) = inner.active.get(id) else {
                continue;
            };
            if !job.ready_at(now) {
                continue;
            }
            if let Some(ref wanted) = filter.job_type {
                if &job.job_type != wanted {
                    continue;
                }
            }
            picked = Some((pos, *id));
            break;
        }

        let Some((pos, id)) = picked else {
            return Ok(None);
        };
        inner.waiting.remove(pos);
        inner.touched.insert(id, Instant::now());
        let job = inner
            .active
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        job.state = JobState::Claimed;
        Ok(Some(job.clone()))
    }

    async fn mark_running(&self, id: Uuid, worker_id: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.touched.insert(id, Instant::now());
        let job = inner.active.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        match job.state {
            JobState::Claimed => {
                job.state = JobState::Running;
                job.assigned_worker = Some(worker_id);
                Ok(())
            }
            JobState::Running if job.assigned_worker != Some(worker_id) => {
                Err(StoreError::ClaimConflict(id))
            }
            other => Err(StoreError::InvalidTransition {
                id,
                detail: format!("{other} -> running"),
            }),
        }
    }

    async fn mark_terminal(&self, id: Uuid, outcome: TerminalOutcome) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let mut job = inner.active.remove(&id).ok_or(StoreError::NotFound(id))?;
        inner.touched.remove(&id);
        match outcome {
            TerminalOutcome::Succeeded => {
                job.state = JobState::Succeeded;
                inner.succeeded += 1;
            }
            TerminalOutcome::Failed => {
                job.state = JobState::Failed;
                inner.failed += 1;
            }
        }
        job.assigned_worker = None;
        inner.archive.insert(id, job);
        Ok(())
    }

    async fn requeue_for_retry(
        &self,
        id: Uuid,
        backoff: Option<Duration>,
    ) -> Result<RetryDisposition, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.active.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        match job.state {
            JobState::Claimed | JobState::Running => {}
            other => {
                return Err(StoreError::InvalidTransition {
                    id,
                    detail: format!("{other} -> waiting (retry)"),
                })
            }
        }
        if job.retry_count >= job.max_retries {
            return Ok(RetryDisposition::Exhausted);
        }
        job.retry_count += 1;
        job.state = JobState::Waiting;
        job.assigned_worker = None;
        let not_before = Utc::now()
            + chrono::Duration::milliseconds(
                backoff.map(|d| d.as_millis() as i64).unwrap_or(0),
            );
        job.not_before = Some(not_before);
        inner.waiting.push_back(id);
        inner.touched.remove(&id);
        drop(inner);
        self.notify.notify_one();
        Ok(RetryDisposition::Requeued { not_before })
    }

    async fn release(&self, id: Uuid, backoff: Option<Duration>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.active.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        match job.state {
            JobState::Claimed | JobState::Running => {
                job.state = JobState::Waiting;
                job.assigned_worker = None;
                job.not_before = backoff.map(|d| {
                    Utc::now() + chrono::Duration::milliseconds(d.as_millis() as i64)
                });
                inner.waiting.push_back(id);
                inner.touched.remove(&id);
                drop(inner);
                self.notify.notify_one();
                Ok(())
            }
            other => Err(StoreError::InvalidTransition {
                id,
                detail: format!("{other} -> waiting (release)"),
            }),
        }
    }

    async fn cancel(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.active.get(&id) else {
            return Ok(false);
        };
        if job.state != JobState::Waiting {
            return Ok(false);
        }
        let mut job = inner
            .active
            .remove(&id)
            .ok_or(StoreError::NotFound(id))?;
        job.state = JobState::Cancelled;
        inner.archive.insert(id, job);
        Ok(true)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .active
            .get(&id)
            .or_else(|| inner.archive.get(&id))
            .cloned())
    }

    async fn recover_orphans(
        &self,
        grace: Duration,
        live_assignments: &HashSet<Uuid>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let orphaned: Vec<Uuid> = inner
            .active
            .values()
            .filter(|job| {
                matches!(job.state, JobState::Claimed | JobState::Running)
                    && !live_assignments.contains(&job.id)
            })
            .filter(|job| match inner.touched.get(&job.id) {
                Some(at) => now.duration_since(*at) >= grace,
                None => true,
            })
            .map(|job| job.id)
            .collect();

        for id in &orphaned {
            if let Some(job) = inner.active.get_mut(id) {
                job.state = JobState::Waiting;
                job.assigned_worker = None;
                job.not_before = None;
            }
            inner.waiting.push_back(*id);
            inner.touched.remove(id);
        }
        if !orphaned.is_empty() {
            tracing::warn!(count = orphaned.len(), "recovered orphaned jobs to waiting");
            drop(inner);
            self.notify.notify_one();
        }
        Ok(orphaned)
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let inner = self.inner.lock().await;
        let mut counts = StoreCounts {
            succeeded: inner.succeeded,
            failed: inner.failed,
            ..Default::default()
        };
        for job in inner.active.values() {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Claimed => counts.claimed += 1,
                JobState::Running => counts.running += 1,
                _ => {}
            }
        }
        Ok(counts)
    }

    fn ready_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
