//! Handler registry and execution engine on the worker side.
//!
//! Application code registers a [`JobHandler`] per job type; the runner
//! executes each dispatched job on its own task and converts the
//! handler's outcome (including a panic) into a [`JobResult`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::job::{Job, JobResult};

/// What a handler wants done with the job it just ran.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Completed; the message is surfaced in status queries.
    Success(String),
    /// Not now. The job goes back to waiting without consuming a retry,
    /// delayed by the hint if one is given.
    Later(Option<Duration>),
}

/// Execution context handed to a handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub job_type: String,
    pub payload: Vec<u8>,
    pub retry_count: u32,
}

impl JobContext {
    fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            retry_count: job.retry_count,
        }
    }
}

/// Application job logic for one job type. An `Err` is a job fault
/// (reported as `ExecuteException`, consuming a retry); return
/// [`Outcome::Later`] to defer without cost.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<Outcome>;
}

/// Per-job-type handler registry plus the execution wrapper.
#[derive(Default)]
pub struct JobRunner {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl JobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`. Re-registration replaces the
    /// previous handler; jobs already executing keep the one they started
    /// with.
    pub async fn register_handler(&self, job_type: &str, handler: Arc<dyn JobHandler>) {
        let previous = self
            .handlers
            .write()
            .await
            .insert(job_type.to_string(), handler);
        if previous.is_some() {
            tracing::info!(job_type, "handler replaced");
        } else {
            tracing::info!(job_type, "handler registered");
        }
    }

    pub async fn has_handler(&self, job_type: &str) -> bool {
        self.handlers.read().await.contains_key(job_type)
    }

    /// Run `job` to a result. Handler panics are contained by the spawned
    /// task and reported as `ExecuteException`, so one bad job never takes
    /// the worker down.
    pub async fn execute(&self, job: &Job) -> JobResult {
        let handler = self.handlers.read().await.get(&job.job_type).cloned();
        let Some(handler) = handler else {
            tracing::warn!(job_id = %job.id, job_type = %job.job_type, "no handler for job type");
            return JobResult::failed(format!("no handler registered for '{}'", job.job_type));
        };

        let ctx = JobContext::from_job(job);
        let job_id = job.id;
        let joined = tokio::spawn(async move { handler.run(ctx).await }).await;

        match joined {
            Ok(Ok(Outcome::Success(message))) => {
                tracing::info!(%job_id, "job handler succeeded");
                JobResult::success(message)
            }
            Ok(Ok(Outcome::Later(delay))) => {
                tracing::info!(%job_id, "job handler deferred");
                JobResult::later(delay.map(|d| d.as_millis() as u64))
            }
            Ok(Err(e)) => {
                tracing::warn!(%job_id, error = %e, "job handler failed");
                // {:#} flattens the anyhow context chain into one line.
                JobResult::exception(format!("{e:#}"))
            }
            Err(join_err) => {
                tracing::error!(%job_id, error = %join_err, "job handler panicked");
                JobResult::exception(format!("handler panicked: {join_err}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::job::ResultAction;

    struct Echo;
    #[async_trait]
    impl JobHandler for Echo {
        async fn run(&self, ctx: JobContext) -> anyhow::Result<Outcome> {
            Ok(Outcome::Success(
                String::from_utf8_lossy(&ctx.payload).into_owned(),
            ))
        }
    }

    struct AlwaysFails;
    #[async_trait]
    impl JobHandler for AlwaysFails {
        async fn run(&self, _ctx: JobContext) -> anyhow::Result<Outcome> {
            anyhow::bail!("bad input")
        }
    }

    struct Panics;
    #[async_trait]
    impl JobHandler for Panics {
        async fn run(&self, _ctx: JobContext) -> anyhow::Result<Outcome> {
            panic!("handler bug")
        }
    }

    fn job(job_type: &str, payload: &[u8]) -> Job {
        Job::new(job_type.to_string(), payload.to_vec(), 1)
    }

    #[tokio::test]
    async fn success_outcome_becomes_success_result() {
        let runner = JobRunner::new();
        runner.register_handler("echo", Arc::new(Echo)).await;

        let result = runner.execute(&job("echo", b"hello")).await;
        assert_eq!(result.action, ResultAction::ExecuteSuccess);
        assert_eq!(result.message, "hello");
    }

    #[tokio::test]
    async fn handler_error_is_a_job_fault() {
        let runner = JobRunner::new();
        runner.register_handler("flaky", Arc::new(AlwaysFails)).await;

        let result = runner.execute(&job("flaky", b"")).await;
        assert_eq!(result.action, ResultAction::ExecuteException);
        assert!(result.message.contains("bad input"));
    }

    #[tokio::test]
    async fn panic_is_contained_as_exception() {
        let runner = JobRunner::new();
        runner.register_handler("buggy", Arc::new(Panics)).await;

        let result = runner.execute(&job("buggy", b"")).await;
        assert_eq!(result.action, ResultAction::ExecuteException);

        // The runner survives and keeps executing.
        runner.register_handler("echo", Arc::new(Echo)).await;
        let result = runner.execute(&job("echo", b"still here")).await;
        assert_eq!(result.action, ResultAction::ExecuteSuccess);
    }

    #[tokio::test]
    async fn missing_handler_fails_the_job() {
        let runner = JobRunner::new();
        let result = runner.execute(&job("unknown", b"")).await;
        assert_eq!(result.action, ResultAction::ExecuteFailed);
        assert!(result.message.contains("unknown"));
    }

    #[tokio::test]
    async fn later_outcome_carries_the_hint() {
        struct Defer;
        #[async_trait]
        impl JobHandler for Defer {
            async fn run(&self, _ctx: JobContext) -> anyhow::Result<Outcome> {
                Ok(Outcome::Later(Some(Duration::from_secs(30))))
            }
        }

        let runner = JobRunner::new();
        runner.register_handler("defer", Arc::new(Defer)).await;
        let result = runner.execute(&job("defer", b"")).await;
        assert_eq!(result.action, ResultAction::ExecuteLater);
        assert_eq!(result.backoff_hint_ms, Some(30_000));
    }

    #[tokio::test]
    async fn re_registration_replaces_handler() {
        let runner = JobRunner::new();
        runner.register_handler("echo", Arc::new(AlwaysFails)).await;
        runner.register_handler("echo", Arc::new(Echo)).await;

        let result = runner.execute(&job("echo", b"second wins")).await;
        assert_eq!(result.action, ResultAction::ExecuteSuccess);
    }
}
