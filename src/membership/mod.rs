//! Cluster membership: who is alive right now.
//!
//! Nodes register ephemerally with a coordination backend; the record
//! disappears on its own when the owning session expires, so a crashed or
//! partitioned node needs no explicit deregistration. Watchers get a
//! per-node-id ordered stream of join/leave events plus synthesized joins
//! for nodes that were already live when the watch started.
//!
//! Membership is the authority on liveness. Heartbeat misses in the
//! remoting layer are only a faster local signal.

pub mod memory;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::error::MembershipError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Coordinator,
    Worker,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Coordinator => write!(f, "coordinator"),
            NodeType::Worker => write!(f, "worker"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: u64,
    pub addr: String,
    pub node_type: NodeType,
    pub registered_at: DateTime<Utc>,
}

impl NodeInfo {
    pub fn new(node_id: u64, addr: String, node_type: NodeType) -> Self {
        Self {
            node_id,
            addr,
            node_type,
            registered_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MembershipEvent {
    Joined(NodeInfo),
    Left(NodeInfo),
}

impl MembershipEvent {
    pub fn node(&self) -> &NodeInfo {
        match self {
            MembershipEvent::Joined(n) | MembershipEvent::Left(n) => n,
        }
    }
}

/// Handle to an ephemeral registration. Watch `session_valid` before any
/// dispatch decision: a coordinator whose own session has expired must not
/// claim or dispatch until it has re-registered.
#[derive(Debug, Clone)]
pub struct Registration {
    pub session: Uuid,
    valid: watch::Receiver<bool>,
}

impl Registration {
    pub fn new(session: Uuid, valid: watch::Receiver<bool>) -> Self {
        Self { session, valid }
    }

    pub fn session_valid(&self) -> bool {
        *self.valid.borrow()
    }
}

/// Contract the coordinator needs from a coordination service: ephemeral
/// session-bound registration, watchable membership, session keepalive.
/// Any backend with these semantics (a ZooKeeper-style service, or the
/// in-process [`memory::MemoryCoordination`]) is acceptable.
#[async_trait]
pub trait CoordinationBackend: Send + Sync + 'static {
    /// Create an ephemeral record for this node, bound to a new session.
    async fn register(&self, node: NodeInfo) -> Result<Registration, MembershipError>;

    /// Refresh a session's lease. Fails with `SessionExpired` once the
    /// session is gone; the caller must re-register.
    async fn keepalive(&self, session: Uuid) -> Result<(), MembershipError>;

    /// Stream of membership changes for one node type, ordered per node
    /// id. Joins are synthesized for nodes already live at watch start, so
    /// a watcher restarted after a reconnect misses nothing.
    async fn watch(
        &self,
        node_type: NodeType,
    ) -> Result<ReceiverStream<MembershipEvent>, MembershipError>;

    async fn live_nodes(&self, node_type: NodeType) -> Result<Vec<NodeInfo>, MembershipError>;
}

/// Watcher-maintained snapshot of the live set, plus an event feed for the
/// scheduler. The watcher task is the only mutator; readers clone out of
/// the snapshot and never hold it across a blocking call.
pub struct MembershipService {
    live: RwLock<HashMap<u64, NodeInfo>>,
}

impl MembershipService {
    /// Subscribe to the backend and start the watcher task. Returns the
    /// service and a receiver of the same events, forwarded after the
    /// snapshot has been updated.
    ///
    /// A dead subscription (backend reconnect, or pruned for lagging) is
    /// not fatal: the watcher resubscribes, which re-synthesizes joins for
    /// everything live, and reconciles the snapshot against `live_nodes`
    /// so departures missed while the feed was down still surface as Left
    /// events.
    pub async fn start(
        backend: Arc<dyn CoordinationBackend>,
        node_type: NodeType,
    ) -> Result<(Arc<Self>, mpsc::Receiver<MembershipEvent>), MembershipError> {
        let mut stream = backend.watch(node_type).await?;
        let service = Arc::new(Self {
            live: RwLock::new(HashMap::new()),
        });
        let (fwd_tx, fwd_rx) = mpsc::channel(256);

        let watcher = service.clone();
        tokio::spawn(async move {
            'watch: loop {
                while let Some(event) = stream.next().await {
                    if !watcher.apply_and_forward(event, &fwd_tx).await {
                        break 'watch;
                    }
                }

                tracing::error!("membership feed lost, resubscribing");
                loop {
                    match backend.watch(node_type).await {
                        Ok(next) => {
                            stream = next;
                            break;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "membership resubscribe failed");
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    }
                }

                // Joins are re-synthesized by the new subscription and
                // re-applied idempotently; departures are only visible by
                // diffing the snapshot against the live set.
                let live_now = match backend.live_nodes(node_type).await {
                    Ok(nodes) => nodes,
                    Err(e) => {
                        tracing::error!(error = %e, "membership reconcile failed");
                        continue 'watch;
                    }
                };
                let departed: Vec<NodeInfo> = {
                    let live = watcher.live.read().expect("membership snapshot poisoned");
                    live.values()
                        .filter(|n| !live_now.iter().any(|m| m.node_id == n.node_id))
                        .cloned()
                        .collect()
                };
                for node in departed {
                    if !watcher
                        .apply_and_forward(MembershipEvent::Left(node), &fwd_tx)
                        .await
                    {
                        break 'watch;
                    }
                }
            }
            tracing::debug!("membership watcher stopped");
        });

        Ok((service, fwd_rx))
    }

    /// Update the snapshot, log, and forward one event. Returns false once
    /// the forwarding channel is closed and the watcher should stop.
    async fn apply_and_forward(
        &self,
        event: MembershipEvent,
        fwd: &mpsc::Sender<MembershipEvent>,
    ) -> bool {
        {
            let mut live = self.live.write().expect("membership snapshot poisoned");
            match &event {
                MembershipEvent::Joined(node) => {
                    live.insert(node.node_id, node.clone());
                }
                MembershipEvent::Left(node) => {
                    live.remove(&node.node_id);
                }
            }
        }
        match &event {
            MembershipEvent::Joined(node) => {
                tracing::info!(node_id = node.node_id, addr = %node.addr, "node joined")
            }
            MembershipEvent::Left(node) => {
                tracing::info!(node_id = node.node_id, addr = %node.addr, "node left")
            }
        }
        fwd.send(event).await.is_ok()
    }

    /// Snapshot of the live set. Cheap to call from every dispatch
    /// decision; the result is detached from future updates.
    pub fn live_nodes(&self) -> Vec<NodeInfo> {
        self.live
            .read()
            .expect("membership snapshot poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, node_id: u64) -> Option<NodeInfo> {
        self.live
            .read()
            .expect("membership snapshot poisoned")
            .get(&node_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.live.read().expect("membership snapshot poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
