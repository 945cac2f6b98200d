//! Test harness for coordinator/worker cluster integration tests.
//!
//! Spins up a coordinator and a set of workers inside one process, all
//! talking over loopback TCP with port-0 listeners, with timings shortened
//! so liveness expiry and retries resolve within a test's patience.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use taskmesh::config::{CoordinatorConfig, RemotingConfig, WorkerConfig};
use taskmesh::coordinator::Coordinator;
use taskmesh::extension::ExtensionRegistry;
use taskmesh::membership::memory::MemoryCoordination;
use taskmesh::store::job::{Job, JobState};
use taskmesh::worker::{JobContext, JobHandler, JobRunner, Outcome, WorkerNode};

/// Session TTL used by the in-process coordination backend.
pub const TEST_SESSION_TTL: Duration = Duration::from_millis(800);

fn test_remoting() -> RemotingConfig {
    RemotingConfig {
        request_timeout_ms: 2_000,
        connect_timeout_ms: 2_000,
        heartbeat_interval_ms: 200,
        heartbeat_miss_limit: 3,
        reconnect_base_ms: 50,
        reconnect_max_ms: 500,
        max_frame_bytes: 4 * 1024 * 1024,
    }
}

pub struct TestCluster {
    pub coordinator: Coordinator,
    pub workers: Vec<TestWorker>,
    pub backend: Arc<MemoryCoordination>,
    next_worker_id: u64,
}

pub struct TestWorker {
    pub node: WorkerNode,
    pub runner: Arc<JobRunner>,
}

impl TestCluster {
    /// Coordinator plus `num_workers` workers, all registered and
    /// connected before this returns.
    pub async fn start(num_workers: usize, balancer: &str) -> Self {
        let backend = Arc::new(MemoryCoordination::new(TEST_SESSION_TTL));
        let registry = {
            let backend = backend.clone();
            ExtensionRegistry::builder()
                .bind_codec("json", || {
                    Ok(Arc::new(taskmesh::remoting::JsonCodec::default()))
                })
                .bind_balancer("round-robin", || {
                    Ok(Arc::new(taskmesh::dispatch::balancer::RoundRobin::new()))
                })
                .bind_balancer("least-assignments", || {
                    Ok(Arc::new(
                        taskmesh::dispatch::balancer::LeastAssignments::new(),
                    ))
                })
                .bind_balancer("consistent-hash", || {
                    Ok(Arc::new(taskmesh::dispatch::balancer::ConsistentHash::new()))
                })
                .bind_job_store("memory", || {
                    Ok(Arc::new(taskmesh::store::memory::MemoryJobStore::new()))
                })
                .bind_fail_store("memory", || {
                    Ok(Arc::new(taskmesh::store::fail::MemoryFailStore::new()))
                })
                .bind_coordination("memory", move || Ok(backend.clone()))
                .build()
        };

        let mut cfg = CoordinatorConfig::new(1, "127.0.0.1:0".parse().unwrap());
        cfg = cfg.with_balancer(balancer);
        cfg.worker_timeout_ms = TEST_SESSION_TTL.as_millis() as u64;
        cfg.retry_backoff_ms = 100;
        cfg.assignment_timeout_ms = 5_000;
        cfg.remoting = test_remoting();
        let coordinator = Coordinator::start(cfg, &registry)
            .await
            .expect("coordinator failed to start");

        let mut cluster = Self {
            coordinator,
            workers: Vec::new(),
            backend,
            next_worker_id: 100,
        };
        for _ in 0..num_workers {
            cluster.spawn_worker().await;
        }
        cluster.wait_for_workers(num_workers).await;
        cluster
    }

    /// Add one worker with the standard test handlers and wait for its
    /// coordinator link.
    pub async fn spawn_worker(&mut self) -> u64 {
        let node_id = self.next_worker_id;
        self.next_worker_id += 1;

        let mut cfg = WorkerConfig::new(
            node_id,
            "127.0.0.1:0".parse().unwrap(),
            self.coordinator.local_addr().to_string(),
        );
        cfg.session_keepalive_ms = 200;
        cfg.remoting = test_remoting();

        let runner = Arc::new(JobRunner::new());
        runner.register_handler("echo", Arc::new(EchoHandler)).await;
        runner
            .register_handler("always-fails", Arc::new(AlwaysFailsHandler))
            .await;

        let registry = ExtensionRegistry::with_defaults();
        let node = WorkerNode::start(cfg, &registry, runner.clone())
            .await
            .expect("worker failed to start");
        node.wait_connected(Duration::from_secs(5))
            .await
            .expect("worker never connected");

        self.workers.push(TestWorker { node, runner });
        node_id
    }

    /// Kill a worker abruptly: stop its tasks and drop it, as a crash
    /// would. Its session expires on the coordinator after the TTL.
    pub fn kill_worker(&mut self, node_id: u64) {
        if let Some(pos) = self
            .workers
            .iter()
            .position(|w| w.node.node_id() == node_id)
        {
            let worker = self.workers.remove(pos);
            worker.node.shutdown();
        }
    }

    /// Block until the coordinator sees `expected` live workers.
    pub async fn wait_for_workers(&self, expected: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let stats = self.coordinator.stats().await;
            if stats.live_workers as usize == expected {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "coordinator never saw {expected} workers (saw {})",
                stats.live_workers
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Block until the job reaches a terminal state, returning it.
    pub async fn wait_terminal(&self, job_id: Uuid, patience: Duration) -> Job {
        let deadline = tokio::time::Instant::now() + patience;
        loop {
            let job = self
                .coordinator
                .job(job_id)
                .await
                .expect("status query failed")
                .expect("job vanished");
            if job.state.is_terminal() {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} stuck in {}",
                job.state
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn wait_state(&self, job_id: Uuid, state: JobState, patience: Duration) {
        let deadline = tokio::time::Instant::now() + patience;
        loop {
            let job = self
                .coordinator
                .job(job_id)
                .await
                .expect("status query failed")
                .expect("job vanished");
            if job.state == state {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} in {}, wanted {state}",
                job.state
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

// =============================================================================
// Standard test handlers
// =============================================================================

pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<Outcome> {
        Ok(Outcome::Success(
            String::from_utf8_lossy(&ctx.payload).into_owned(),
        ))
    }
}

pub struct AlwaysFailsHandler;

#[async_trait]
impl JobHandler for AlwaysFailsHandler {
    async fn run(&self, _ctx: JobContext) -> anyhow::Result<Outcome> {
        anyhow::bail!("this job never works")
    }
}

/// Fails the first `failures` attempts, then succeeds. The counter is
/// shared across workers, so failover between workers still converges.
pub struct FlakyHandler {
    pub attempts: Arc<AtomicU32>,
    pub failures: u32,
}

#[async_trait]
impl JobHandler for FlakyHandler {
    async fn run(&self, _ctx: JobContext) -> anyhow::Result<Outcome> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            anyhow::bail!("attempt {attempt} failed")
        }
        Ok(Outcome::Success(format!("succeeded on attempt {attempt}")))
    }
}

/// Blocks until told to finish, for tests that need a job pinned on a
/// specific worker.
pub struct BlockingHandler {
    pub release: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl JobHandler for BlockingHandler {
    async fn run(&self, _ctx: JobContext) -> anyhow::Result<Outcome> {
        self.release.notified().await;
        Ok(Outcome::Success("released".to_string()))
    }
}

/// Records which worker ran each job, for distribution assertions.
pub struct RecordingHandler {
    pub node_id: u64,
    pub ran: Arc<std::sync::Mutex<Vec<(u64, Uuid)>>>,
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<Outcome> {
        self.ran
            .lock()
            .expect("recording lock poisoned")
            .push((self.node_id, ctx.job_id));
        Ok(Outcome::Success(String::new()))
    }
}
