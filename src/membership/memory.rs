//! In-process coordination backend, the stock `coordination.client`
//! binding. Sessions are leases: a registration stays live only as long as
//! keepalives arrive within the TTL. The expiry sweeper runs lazily once
//! the backend is first used inside a runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::error::MembershipError;
use crate::membership::{CoordinationBackend, MembershipEvent, NodeInfo, NodeType, Registration};

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(5);

struct Session {
    node: NodeInfo,
    expires_at: Instant,
    valid_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<Uuid, Session>,
    watchers: Vec<(NodeType, mpsc::Sender<MembershipEvent>)>,
}

pub struct MemoryCoordination {
    inner: Arc<Mutex<Inner>>,
    ttl: Duration,
    sweeper_started: AtomicBool,
}

impl MemoryCoordination {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            ttl,
            sweeper_started: AtomicBool::new(false),
        }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }

    pub fn session_ttl(&self) -> Duration {
        self.ttl
    }

    /// Force-expire the session owning `node_id`, as if the process
    /// crashed or was partitioned away. Test hook.
    pub fn expire_node(&self, node_id: u64) {
        let mut inner = self.inner.lock().expect("coordination state poisoned");
        let expired: Vec<Uuid> = inner
            .sessions
            .iter()
            .filter(|(_, s)| s.node.node_id == node_id)
            .map(|(id, _)| *id)
            .collect();
        for session_id in expired {
            Self::expire_locked(&mut inner, session_id);
        }
    }

    fn expire_locked(inner: &mut Inner, session_id: Uuid) {
        if let Some(session) = inner.sessions.remove(&session_id) {
            let _ = session.valid_tx.send(false);
            tracing::info!(
                node_id = session.node.node_id,
                %session_id,
                "session expired"
            );
            Self::broadcast(inner, MembershipEvent::Left(session.node));
        }
    }

    fn broadcast(inner: &mut Inner, event: MembershipEvent) {
        let node_type = event.node().node_type;
        inner.watchers.retain(|(wanted, tx)| {
            if *wanted != node_type {
                return true;
            }
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                // The watcher is gone; prune it.
                Err(TrySendError::Closed(_)) => false,
                // The watcher cannot keep up. A gapped stream would break
                // the ordered-delivery contract, so the subscription is
                // dropped instead; the watcher resubscribes and re-syncs
                // from the synthesized joins plus a live-nodes reconcile.
                Err(TrySendError::Full(_)) => {
                    tracing::error!(
                        node_id = event.node().node_id,
                        "membership watcher lagging, subscription dropped"
                    );
                    false
                }
            }
        });
    }

    fn ensure_sweeper(&self) {
        if self.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let period = (self.ttl / 4).max(Duration::from_millis(20));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                let now = Instant::now();
                let mut guard = inner.lock().expect("coordination state poisoned");
                let expired: Vec<Uuid> = guard
                    .sessions
                    .iter()
                    .filter(|(_, s)| s.expires_at <= now)
                    .map(|(id, _)| *id)
                    .collect();
                for session_id in expired {
                    Self::expire_locked(&mut guard, session_id);
                }
            }
        });
    }
}

#[async_trait]
impl CoordinationBackend for MemoryCoordination {
    async fn register(&self, node: NodeInfo) -> Result<Registration, MembershipError> {
        self.ensure_sweeper();
        let session_id = Uuid::new_v4();
        let (valid_tx, valid_rx) = watch::channel(true);

        let mut inner = self.inner.lock().expect("coordination state poisoned");
        // Re-registration of the same node id replaces the old session;
        // watchers see the node leave and join again, in that order.
        let stale: Vec<Uuid> = inner
            .sessions
            .iter()
            .filter(|(_, s)| s.node.node_id == node.node_id)
            .map(|(id, _)| *id)
            .collect();
        for old in stale {
            Self::expire_locked(&mut inner, old);
        }

        inner.sessions.insert(
            session_id,
            Session {
                node: node.clone(),
                expires_at: Instant::now() + self.ttl,
                valid_tx,
            },
        );
        tracing::info!(
            node_id = node.node_id,
            node_type = %node.node_type,
            %session_id,
            "node registered"
        );
        Self::broadcast(&mut inner, MembershipEvent::Joined(node));

        Ok(Registration::new(session_id, valid_rx))
    }

    async fn keepalive(&self, session: Uuid) -> Result<(), MembershipError> {
        let mut inner = self.inner.lock().expect("coordination state poisoned");
        match inner.sessions.get_mut(&session) {
            Some(s) => {
                s.expires_at = Instant::now() + self.ttl;
                Ok(())
            }
            None => Err(MembershipError::SessionExpired),
        }
    }

    async fn watch(
        &self,
        node_type: NodeType,
    ) -> Result<ReceiverStream<MembershipEvent>, MembershipError> {
        self.ensure_sweeper();
        let (tx, rx) = mpsc::channel(256);
        let mut inner = self.inner.lock().expect("coordination state poisoned");
        // Synthesize joins for nodes already live, so a late or restarted
        // watcher converges on the current membership.
        for session in inner.sessions.values() {
            if session.node.node_type == node_type {
                let _ = tx.try_send(MembershipEvent::Joined(session.node.clone()));
            }
        }
        inner.watchers.push((node_type, tx));
        Ok(ReceiverStream::new(rx))
    }

    async fn live_nodes(&self, node_type: NodeType) -> Result<Vec<NodeInfo>, MembershipError> {
        let inner = self.inner.lock().expect("coordination state poisoned");
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.node.node_type == node_type)
            .map(|s| s.node.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio_stream::StreamExt;

    fn worker(id: u64) -> NodeInfo {
        NodeInfo::new(id, format!("127.0.0.1:{}", 7000 + id), NodeType::Worker)
    }

    #[tokio::test]
    async fn register_and_watch_delivers_join() {
        let backend = MemoryCoordination::with_default_ttl();
        let mut stream = backend.watch(NodeType::Worker).await.unwrap();

        backend.register(worker(1)).await.unwrap();
        let event = stream.next().await.unwrap();
        assert!(matches!(event, MembershipEvent::Joined(_)));
        assert_eq!(event.node().node_id, 1);
    }

    #[tokio::test]
    async fn watch_synthesizes_joins_for_existing_nodes() {
        let backend = MemoryCoordination::with_default_ttl();
        backend.register(worker(1)).await.unwrap();
        backend.register(worker(2)).await.unwrap();

        let mut stream = backend.watch(NodeType::Worker).await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..2 {
            match stream.next().await.unwrap() {
                MembershipEvent::Joined(n) => seen.push(n.node_id),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn expiry_emits_left_and_invalidates_session() {
        let backend = MemoryCoordination::new(Duration::from_millis(50));
        let registration = backend.register(worker(1)).await.unwrap();
        let mut stream = backend.watch(NodeType::Worker).await.unwrap();
        // Drain the synthesized join.
        assert!(matches!(
            stream.next().await.unwrap(),
            MembershipEvent::Joined(_)
        ));
        assert!(registration.session_valid());

        // No keepalives: the sweeper expires the session.
        let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, MembershipEvent::Left(n) if n.node_id == 1));
        assert!(!registration.session_valid());
    }

    #[tokio::test]
    async fn keepalive_extends_the_lease() {
        let backend = MemoryCoordination::new(Duration::from_millis(100));
        let registration = backend.register(worker(1)).await.unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            backend.keepalive(registration.session).await.unwrap();
        }
        assert!(registration.session_valid());
        assert_eq!(backend.live_nodes(NodeType::Worker).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn keepalive_after_expiry_fails() {
        let backend = MemoryCoordination::with_default_ttl();
        let registration = backend.register(worker(1)).await.unwrap();
        backend.expire_node(1);

        let err = backend.keepalive(registration.session).await.unwrap_err();
        assert!(matches!(err, MembershipError::SessionExpired));
        assert!(!registration.session_valid());
    }

    #[tokio::test]
    async fn watchers_are_scoped_by_node_type() {
        let backend = MemoryCoordination::with_default_ttl();
        let mut workers = backend.watch(NodeType::Worker).await.unwrap();

        backend
            .register(NodeInfo::new(
                10,
                "127.0.0.1:7070".to_string(),
                NodeType::Coordinator,
            ))
            .await
            .unwrap();
        backend.register(worker(2)).await.unwrap();

        let event = workers.next().await.unwrap();
        assert_eq!(event.node().node_id, 2);
    }

    #[tokio::test]
    async fn lagging_watcher_loses_its_subscription() {
        let backend = MemoryCoordination::with_default_ttl();
        let mut stream = backend.watch(NodeType::Worker).await.unwrap();

        // Overflow the watch buffer without consuming anything. Rather
        // than deliver a gapped stream, the backend drops the whole
        // subscription; the buffered prefix drains and the stream ends.
        for id in 0..300 {
            backend.register(worker(id)).await.unwrap();
        }
        let mut delivered = 0;
        while stream.next().await.is_some() {
            delivered += 1;
        }
        assert!(delivered < 300, "expected the subscription to be dropped");
    }

    /// Backend whose first subscription dies right after its synthesized
    /// joins, losing a departure that only a reconcile can recover.
    struct ReconnectingFeed {
        live: Mutex<Vec<NodeInfo>>,
        keep: Mutex<Option<mpsc::Sender<MembershipEvent>>>,
        watches: AtomicU32,
    }

    impl ReconnectingFeed {
        fn new(live: Vec<NodeInfo>) -> Self {
            Self {
                live: Mutex::new(live),
                keep: Mutex::new(None),
                watches: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl CoordinationBackend for ReconnectingFeed {
        async fn register(&self, _node: NodeInfo) -> Result<Registration, MembershipError> {
            unreachable!("not exercised")
        }

        async fn keepalive(&self, _session: Uuid) -> Result<(), MembershipError> {
            Ok(())
        }

        async fn watch(
            &self,
            _node_type: NodeType,
        ) -> Result<ReceiverStream<MembershipEvent>, MembershipError> {
            let call = self.watches.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(8);
            for node in self.live.lock().unwrap().iter() {
                let _ = tx.try_send(MembershipEvent::Joined(node.clone()));
            }
            if call == 0 {
                // Sender dropped: the stream ends after the synthesized
                // joins. Worker 1 departs while no feed is up.
                self.live.lock().unwrap().retain(|n| n.node_id != 1);
            } else {
                *self.keep.lock().unwrap() = Some(tx);
            }
            Ok(ReceiverStream::new(rx))
        }

        async fn live_nodes(&self, _node_type: NodeType) -> Result<Vec<NodeInfo>, MembershipError> {
            Ok(self.live.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn service_resubscribes_and_reconciles_after_feed_loss() {
        let backend = Arc::new(ReconnectingFeed::new(vec![worker(1), worker(2)]));
        let (service, mut events) =
            crate::membership::MembershipService::start(backend.clone(), NodeType::Worker)
                .await
                .unwrap();

        // Both joins arrive, the feed dies, the service resubscribes and
        // reconciles: worker 1 left while the feed was down, so a Left is
        // synthesized for it.
        let left = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await.unwrap() {
                    MembershipEvent::Left(n) => break n,
                    MembershipEvent::Joined(_) => {}
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(left.node_id, 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let live = service.live_nodes();
            if live.len() == 1 && live[0].node_id == 2 {
                break;
            }
            assert!(
                Instant::now() < deadline,
                "snapshot never reconciled: {live:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(backend.watches.load(Ordering::SeqCst) >= 2);
        // The second subscription is still being served.
        assert!(backend.keep.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn membership_service_tracks_snapshot() {
        let backend = Arc::new(MemoryCoordination::with_default_ttl());
        let (service, mut events) =
            crate::membership::MembershipService::start(backend.clone(), NodeType::Worker)
                .await
                .unwrap();

        backend.register(worker(3)).await.unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(event, MembershipEvent::Joined(_)));
        assert_eq!(service.live_nodes().len(), 1);

        backend.expire_node(3);
        let event = events.recv().await.unwrap();
        assert!(matches!(event, MembershipEvent::Left(_)));
        assert!(service.is_empty());
    }
}
