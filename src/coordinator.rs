//! Coordinator node: wires the extension bindings together, serves the
//! wire protocol, and runs the dispatch scheduler.
//!
//! Workers are remote processes, so their registrations arrive over the
//! wire and are bridged into the local coordination backend: one backend
//! session per worker, refreshed by that worker's heartbeat requests.
//! When the heartbeats stop, the session lease runs out and membership
//! emits `Left`, which is what triggers failover.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::dispatch::{DispatchScheduler, WorkerResult};
use crate::error::{Error, MembershipError, Result};
use crate::extension::ExtensionRegistry;
use crate::membership::{CoordinationBackend, MembershipService, NodeInfo, NodeType};
use crate::remoting::{ConnectionPool, Message, RemotingServer, RequestHandler};
use crate::stats::DispatchStats;
use crate::store::fail::{BufferedFailStore, FailStore};
use crate::store::job::Job;
use crate::store::JobStore;

/// Entries buffered ahead of the fail store writer.
const FAIL_BUFFER: usize = 1024;
/// Write attempts per fail store entry before it is dropped.
const FAIL_WRITE_ATTEMPTS: u32 = 3;
/// Hard cap on a submitted payload, under the frame limit with headroom.
const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

pub struct Coordinator {
    cfg: CoordinatorConfig,
    store: Arc<dyn JobStore>,
    backend: Arc<dyn CoordinationBackend>,
    scheduler: Arc<DispatchScheduler>,
    local_addr: String,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Resolve bindings, register this node, bind the wire server, and
    /// start the scheduler.
    pub async fn start(cfg: CoordinatorConfig, registry: &ExtensionRegistry) -> Result<Self> {
        let codec = registry.codecs.resolve(&cfg.codec)?;
        let balancer = registry.balancers.resolve(&cfg.balancer)?;
        let store = registry.job_stores.resolve(&cfg.job_store)?;
        let fail_inner = registry.fail_stores.resolve(&cfg.fail_store)?;
        let backend = registry.coordination.resolve(&cfg.coordination)?;

        let fail_store: Arc<dyn FailStore> = Arc::new(BufferedFailStore::spawn(
            fail_inner,
            FAIL_BUFFER,
            FAIL_WRITE_ATTEMPTS,
        ));

        let cancel = CancellationToken::new();
        let self_node = NodeInfo::new(
            cfg.node_id,
            cfg.advertise_addr.clone(),
            NodeType::Coordinator,
        );
        let registration = backend.register(self_node.clone()).await?;

        let (membership, events) =
            MembershipService::start(backend.clone(), NodeType::Worker).await?;

        // Heartbeat-miss reports from the remoting layer are advisory;
        // membership expiry is what triggers failover.
        let (suspect_tx, mut suspect_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(addr) = suspect_rx.recv().await {
                tracing::warn!(%addr, "worker suspect, awaiting membership verdict");
            }
        });

        let pool = Arc::new(ConnectionPool::new(
            codec.clone(),
            cfg.remoting.clone(),
            cfg.node_id,
            Some(suspect_tx),
        ));

        let scheduler = Arc::new(DispatchScheduler::new(
            cfg.clone(),
            store.clone(),
            fail_store,
            balancer,
            membership,
            pool,
            registration.clone(),
        ));

        let (result_tx, result_rx) = mpsc::channel::<WorkerResult>(256);
        let service = Arc::new(CoordinatorService {
            backend: backend.clone(),
            store: store.clone(),
            scheduler: scheduler.clone(),
            sessions: Mutex::new(HashMap::new()),
            results: result_tx,
            max_payload: MAX_PAYLOAD_BYTES,
        });

        let server = RemotingServer::new(
            cfg.listen_addr.to_string(),
            codec,
            service,
            cfg.remoting.clone(),
        );
        let local_addr = server.spawn(cancel.clone()).await?;

        tokio::spawn(scheduler.clone().run(events, result_rx, cancel.clone()));
        tokio::spawn(own_session_loop(
            backend.clone(),
            self_node,
            registration,
            scheduler.clone(),
            cfg.worker_timeout(),
            cancel.clone(),
        ));

        tracing::info!(
            node_id = cfg.node_id,
            addr = %local_addr,
            balancer = %cfg.balancer,
            "coordinator started"
        );
        Ok(Self {
            cfg,
            store,
            backend,
            scheduler,
            local_addr,
            cancel,
        })
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn node_id(&self) -> u64 {
        self.cfg.node_id
    }

    /// Backend handle, for embedding coordinator and workers in one
    /// process against a shared coordination service.
    pub fn backend(&self) -> Arc<dyn CoordinationBackend> {
        self.backend.clone()
    }

    /// Local (in-process) submission.
    pub async fn submit(
        &self,
        job_type: &str,
        payload: Vec<u8>,
        max_retries: u32,
    ) -> Result<Uuid> {
        if job_type.is_empty() {
            return Err(Error::SubmissionRejected("empty job type".to_string()));
        }
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(Error::SubmissionRejected(format!(
                "payload of {} bytes exceeds limit of {MAX_PAYLOAD_BYTES}",
                payload.len()
            )));
        }
        let job = Job::new(job_type.to_string(), payload, max_retries);
        let id = job.id;
        self.store.enqueue(job).await?;
        Ok(id)
    }

    pub async fn job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.store.get(id).await?)
    }

    /// Cancel a waiting job; a running one gets a best-effort notification
    /// to its holder and stays uncancelled from the store's view.
    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        let cancelled = self.store.cancel(id).await?;
        if !cancelled {
            self.scheduler.forward_cancel(id).await;
        }
        Ok(cancelled)
    }

    pub async fn stats(&self) -> DispatchStats {
        self.scheduler.collect_stats().await
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Keep the coordinator's own session alive; on expiry, re-register and
/// hand the scheduler the fresh registration so dispatch resumes.
async fn own_session_loop(
    backend: Arc<dyn CoordinationBackend>,
    node: NodeInfo,
    mut registration: crate::membership::Registration,
    scheduler: Arc<DispatchScheduler>,
    worker_timeout: Duration,
    cancel: CancellationToken,
) {
    let interval = (worker_timeout / 3).max(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match backend.keepalive(registration.session).await {
            Ok(()) => {}
            Err(MembershipError::SessionExpired) => {
                tracing::warn!("own session expired, re-registering");
                match backend.register(node.clone()).await {
                    Ok(fresh) => {
                        scheduler.replace_registration(fresh.clone());
                        registration = fresh;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "re-registration failed");
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "own keepalive failed");
            }
        }
    }
}

/// Inbound request handler on the coordinator.
struct CoordinatorService {
    backend: Arc<dyn CoordinationBackend>,
    store: Arc<dyn JobStore>,
    scheduler: Arc<DispatchScheduler>,
    /// Wire-registered workers: node id to backend session.
    sessions: Mutex<HashMap<u64, Uuid>>,
    results: mpsc::Sender<WorkerResult>,
    max_payload: usize,
}

#[async_trait]
impl RequestHandler for CoordinatorService {
    async fn handle(&self, message: Message) -> Message {
        match message {
            Message::Register { node } => match self.backend.register(node.clone()).await {
                Ok(registration) => {
                    self.sessions
                        .lock()
                        .await
                        .insert(node.node_id, registration.session);
                    Message::RegisterAck {
                        session: registration.session,
                    }
                }
                Err(e) => Message::Error {
                    detail: format!("registration failed: {e}"),
                }
            },

            Message::Heartbeat { node_id, seq } => {
                let session = self.sessions.lock().await.get(&node_id).copied();
                match session {
                    Some(session) => match self.backend.keepalive(session).await {
                        Ok(()) => Message::HeartbeatAck { seq },
                        Err(e) => {
                            self.sessions.lock().await.remove(&node_id);
                            Message::Error {
                                detail: format!("keepalive failed: {e}"),
                            }
                        }
                    },
                    None => Message::Error {
                        detail: format!("no session for node {node_id}"),
                    },
                }
            }

            Message::Result {
                job_id,
                worker_id,
                result,
            } => {
                let report = WorkerResult {
                    worker_id,
                    job_id,
                    result,
                };
                if self.results.send(report).await.is_err() {
                    return Message::Error {
                        detail: "scheduler unavailable".to_string(),
                    };
                }
                Message::ResultAck { job_id }
            }

            Message::Submit {
                job_type,
                payload,
                max_retries,
            } => {
                if job_type.is_empty() {
                    return Message::SubmitRejected {
                        reason: "empty job type".to_string(),
                    };
                }
                if payload.len() > self.max_payload {
                    return Message::SubmitRejected {
                        reason: format!(
                            "payload of {} bytes exceeds limit of {}",
                            payload.len(),
                            self.max_payload
                        ),
                    };
                }
                let job = Job::new(job_type, payload, max_retries);
                let job_id = job.id;
                match self.store.enqueue(job).await {
                    Ok(()) => Message::SubmitAck { job_id },
                    Err(e) => Message::SubmitRejected {
                        reason: e.to_string(),
                    },
                }
            }

            Message::JobQuery { job_id } => match self.store.get(job_id).await {
                Ok(job) => Message::JobReport { job },
                Err(e) => Message::Error {
                    detail: e.to_string(),
                },
            },

            Message::CancelJob { job_id } => match self.store.cancel(job_id).await {
                Ok(true) => Message::CancelAck {
                    job_id,
                    cancelled: true,
                },
                Ok(false) => {
                    self.scheduler.forward_cancel(job_id).await;
                    Message::CancelAck {
                        job_id,
                        cancelled: false,
                    }
                }
                Err(e) => Message::Error {
                    detail: e.to_string(),
                },
            },

            Message::StatsQuery => Message::StatsReport {
                stats: self.scheduler.collect_stats().await,
            },

            other => {
                tracing::warn!(?other, "unsupported request on coordinator");
                Message::Error {
                    detail: "unsupported request".to_string(),
                }
            }
        }
    }
}
