//! Fail store: append-only record of jobs that exhausted their retry
//! budget. Decoupled from the dispatch path; an operator/administrative
//! reader consumes it out of band.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};

use crate::error::StoreError;
use crate::store::job::{Job, JobResult};

#[derive(Debug, Clone, PartialEq)]
pub struct FailEntry {
    pub job: Job,
    pub last_result: JobResult,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait FailStore: Send + Sync + 'static {
    async fn record(&self, job: &Job, last_result: &JobResult) -> Result<(), StoreError>;
}

/// In-memory append-only fail store, the stock `job.fail.store` binding.
pub struct MemoryFailStore {
    entries: Mutex<Vec<FailEntry>>,
}

impl Default for MemoryFailStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFailStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub async fn entries(&self) -> Vec<FailEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl FailStore for MemoryFailStore {
    async fn record(&self, job: &Job, last_result: &JobResult) -> Result<(), StoreError> {
        self.entries.lock().await.push(FailEntry {
            job: job.clone(),
            last_result: last_result.clone(),
            recorded_at: Utc::now(),
        });
        Ok(())
    }
}

/// Write-behind wrapper that keeps the dispatch path from ever blocking on
/// the fail store. Entries go through a bounded channel to a writer task
/// with a bounded retry; a full buffer or a persistent write failure is
/// logged and dropped, never re-thrown into the scheduler.
pub struct BufferedFailStore {
    tx: mpsc::Sender<FailEntry>,
}

impl BufferedFailStore {
    pub fn spawn(inner: Arc<dyn FailStore>, capacity: usize, write_attempts: u32) -> Self {
        let (tx, mut rx) = mpsc::channel::<FailEntry>(capacity);

        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    match inner.record(&entry.job, &entry.last_result).await {
                        Ok(()) => break,
                        Err(e) if attempt < write_attempts => {
                            tracing::warn!(
                                job_id = %entry.job.id,
                                attempt,
                                error = %e,
                                "fail store write failed, retrying"
                            );
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                        Err(e) => {
                            tracing::error!(
                                job_id = %entry.job.id,
                                error = %e,
                                "fail store write dropped after retries"
                            );
                            break;
                        }
                    }
                }
            }
        });

        Self { tx }
    }
}

#[async_trait]
impl FailStore for BufferedFailStore {
    async fn record(&self, job: &Job, last_result: &JobResult) -> Result<(), StoreError> {
        let entry = FailEntry {
            job: job.clone(),
            last_result: last_result.clone(),
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.tx.try_send(entry) {
            tracing::warn!(job_id = %job.id, error = %e, "fail store buffer full, entry dropped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::job::JobResult;

    #[tokio::test]
    async fn memory_fail_store_appends() {
        let store = MemoryFailStore::new();
        let job = Job::new("bad".to_string(), Vec::new(), 1);
        let result = JobResult::failed("always fails".to_string());
        store.record(&job, &result).await.unwrap();
        store.record(&job, &result).await.unwrap();

        let entries = store.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].job.id, job.id);
        assert_eq!(entries[0].last_result, result);
    }

    #[tokio::test]
    async fn buffered_store_flushes_to_inner() {
        let inner = Arc::new(MemoryFailStore::new());
        let buffered = BufferedFailStore::spawn(inner.clone(), 16, 3);

        let job = Job::new("bad".to_string(), Vec::new(), 0);
        let result = JobResult::exception("boom".to_string());
        buffered.record(&job, &result).await.unwrap();

        // Give the writer task a moment to drain.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let entries = inner.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job.id, job.id);
    }

    #[tokio::test]
    async fn buffered_store_never_errors_when_full() {
        struct StuckStore;
        #[async_trait]
        impl FailStore for StuckStore {
            async fn record(&self, _: &Job, _: &JobResult) -> Result<(), StoreError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        let buffered = BufferedFailStore::spawn(Arc::new(StuckStore), 1, 1);
        let job = Job::new("bad".to_string(), Vec::new(), 0);
        let result = JobResult::failed("nope".to_string());
        for _ in 0..10 {
            // Overfilling the buffer must stay non-blocking and Ok.
            buffered.record(&job, &result).await.unwrap();
        }
    }
}
