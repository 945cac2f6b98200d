//! Worker node: registers with the coordinator, keeps its session alive,
//! accepts dispatched jobs over the wire, and reports results.
//!
//! The worker runs its own remoting server for inbound dispatches and
//! holds one client connection to the coordinator for registration,
//! keepalive, and result reporting. A dispatch is acknowledged as soon as
//! the job is handed to the runner; the outcome goes back later as a
//! `Result` request, retried until the coordinator acknowledges it.

pub mod runner;

pub use runner::{JobContext, JobHandler, JobRunner, Outcome};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::extension::ExtensionRegistry;
use crate::membership::{NodeInfo, NodeType};
use crate::remoting::{Connection, Message, RemotingServer, RequestHandler};
use crate::store::job::JobResult;

/// Attempts to deliver one result before it is dropped.
const RESULT_ATTEMPTS: u32 = 3;

pub struct WorkerNode {
    cfg: WorkerConfig,
    runner: Arc<JobRunner>,
    conn: Arc<Connection>,
    /// Address the remoting server actually bound, for port-0 listeners.
    local_addr: String,
    cancel: CancellationToken,
}

impl WorkerNode {
    /// Bind the dispatch server, connect to the coordinator, and start
    /// the registration/keepalive loop. Handlers may be registered on the
    /// runner before or after start.
    pub async fn start(
        cfg: WorkerConfig,
        registry: &ExtensionRegistry,
        runner: Arc<JobRunner>,
    ) -> crate::error::Result<Self> {
        let codec = registry.codecs.resolve(&cfg.codec)?;
        let cancel = CancellationToken::new();

        let conn = Arc::new(Connection::open(
            cfg.coordinator_addr.clone(),
            codec.clone(),
            cfg.remoting.clone(),
            cfg.node_id,
            None,
        ));

        let service = Arc::new(WorkerService {
            node_id: cfg.node_id,
            runner: runner.clone(),
            conn: conn.clone(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        });
        let server = RemotingServer::new(
            cfg.listen_addr.to_string(),
            codec,
            service,
            cfg.remoting.clone(),
        );
        let local_addr = server.spawn(cancel.clone()).await?;

        let advertise = if cfg.listen_addr.port() == 0 {
            local_addr.clone()
        } else {
            cfg.advertise_addr.clone()
        };
        let node = NodeInfo::new(cfg.node_id, advertise, NodeType::Worker);
        tokio::spawn(session_loop(
            conn.clone(),
            node,
            Duration::from_millis(cfg.session_keepalive_ms),
            cancel.clone(),
        ));

        Ok(Self {
            cfg,
            runner,
            conn,
            local_addr,
            cancel,
        })
    }

    pub fn node_id(&self) -> u64 {
        self.cfg.node_id
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    /// Wait until the coordinator link is up, for startup sequencing.
    pub async fn wait_connected(&self, limit: Duration) -> crate::error::Result<()> {
        self.conn.wait_connected(limit).await?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.conn.close();
    }
}

impl Drop for WorkerNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Register, then keep the session alive with explicit heartbeats. Any
/// failure (link loss, expired session) falls back to re-registration,
/// so a worker that was partitioned away rejoins on its own.
async fn session_loop(
    conn: Arc<Connection>,
    node: NodeInfo,
    keepalive: Duration,
    cancel: CancellationToken,
) {
    let mut seq: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let session = match conn.request(Message::Register { node: node.clone() }).await {
            Ok(Message::RegisterAck { session }) => session,
            Ok(other) => {
                tracing::warn!(?other, "unexpected registration reply");
                if pause(&cancel, keepalive).await {
                    return;
                }
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "registration failed, retrying");
                if pause(&cancel, keepalive).await {
                    return;
                }
                continue;
            }
        };
        tracing::info!(node_id = node.node_id, %session, "registered with coordinator");

        loop {
            if pause(&cancel, keepalive).await {
                return;
            }
            seq += 1;
            match conn
                .request(Message::Heartbeat {
                    node_id: node.node_id,
                    seq,
                })
                .await
            {
                Ok(Message::HeartbeatAck { .. }) => {}
                Ok(Message::Error { detail }) => {
                    // Session gone on the coordinator side; re-register.
                    tracing::warn!(%detail, "session rejected, re-registering");
                    break;
                }
                Ok(other) => {
                    tracing::warn!(?other, "unexpected heartbeat reply");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "keepalive failed, re-registering");
                    break;
                }
            }
        }
    }
}

/// Sleep for `interval` unless cancelled first. Returns true on cancel.
async fn pause(cancel: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(interval) => false,
    }
}

/// Inbound request handler on the worker.
struct WorkerService {
    node_id: u64,
    runner: Arc<JobRunner>,
    conn: Arc<Connection>,
    /// Jobs currently executing, for redelivery de-dup and best-effort
    /// cancel. Entries remove themselves when the result report finishes.
    in_flight: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
}

#[async_trait]
impl RequestHandler for WorkerService {
    async fn handle(&self, message: Message) -> Message {
        match message {
            Message::Dispatch { job } => {
                let job_id = job.id;
                let mut in_flight = self.in_flight.lock().await;
                // At-least-once redelivery of a job we are already
                // running: accept again, run once.
                if in_flight.contains_key(&job_id) {
                    tracing::debug!(%job_id, "duplicate dispatch, already executing");
                    return Message::DispatchAck {
                        job_id,
                        accepted: true,
                        reason: None,
                    };
                }

                let runner = self.runner.clone();
                let conn = self.conn.clone();
                let node_id = self.node_id;
                let table = self.in_flight.clone();
                let handle = tokio::spawn(async move {
                    let result = runner.execute(&job).await;
                    report_result(&conn, node_id, job_id, result).await;
                    table.lock().await.remove(&job_id);
                });
                in_flight.insert(job_id, handle);
                drop(in_flight);

                Message::DispatchAck {
                    job_id,
                    accepted: true,
                    reason: None,
                }
            }
            Message::CancelJob { job_id } => {
                let cancelled = match self.in_flight.lock().await.remove(&job_id) {
                    Some(handle) => {
                        handle.abort();
                        tracing::info!(%job_id, "running job aborted on cancel");
                        true
                    }
                    None => false,
                };
                Message::CancelAck { job_id, cancelled }
            }
            Message::Heartbeat { seq, .. } => Message::HeartbeatAck { seq },
            other => {
                tracing::warn!(?other, "unsupported request on worker");
                Message::Error {
                    detail: "unsupported request".to_string(),
                }
            }
        }
    }
}

/// Push one result to the coordinator, retrying until acknowledged. The
/// coordinator's assignment table drops duplicates, so resending after an
/// ambiguous failure is safe.
async fn report_result(conn: &Connection, worker_id: u64, job_id: Uuid, result: JobResult) {
    for attempt in 1..=RESULT_ATTEMPTS {
        match conn
            .request(Message::Result {
                job_id,
                worker_id,
                result: result.clone(),
            })
            .await
        {
            Ok(Message::ResultAck { .. }) => {
                tracing::debug!(%job_id, "result acknowledged");
                return;
            }
            Ok(other) => {
                tracing::warn!(%job_id, ?other, "unexpected result reply");
            }
            Err(e) => {
                tracing::warn!(%job_id, attempt, error = %e, "result report failed");
            }
        }
        tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
    }
    // The assignment deadline on the coordinator will reclaim the job.
    tracing::error!(%job_id, "result dropped after {RESULT_ATTEMPTS} attempts");
}
