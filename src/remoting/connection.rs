//! Client side of the framed RPC layer.
//!
//! One [`Connection`] owns a background i/o task driving the state machine
//! `Disconnected -> Connecting -> Connected -> (Reconnecting | Closed)`.
//! Requests are correlated by a per-connection monotonically increasing id;
//! responses with an unknown or stale id are discarded. While reconnecting,
//! queued requests are held until the connect timeout elapses and then fail
//! with `ConnectionLost`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Instant};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::config::RemotingConfig;
use crate::error::RemotingError;
use crate::remoting::codec::{Codec, Envelope, FrameKind, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

type Waiter = oneshot::Sender<Result<Envelope, RemotingError>>;
type Pending = Arc<Mutex<HashMap<u64, Waiter>>>;

pub(crate) fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

pub struct Connection {
    addr: String,
    cfg: RemotingConfig,
    next_correlation: Arc<AtomicU64>,
    pending: Pending,
    outbound_tx: mpsc::Sender<Envelope>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl Connection {
    /// Open a connection to `addr`. Returns immediately; the i/o task
    /// connects (and reconnects) in the background. `node_id` identifies
    /// the local node in heartbeat frames.
    pub fn open(
        addr: String,
        codec: Arc<dyn Codec>,
        cfg: RemotingConfig,
        node_id: u64,
        suspect_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Self {
        let next_correlation = Arc::new(AtomicU64::new(0));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();

        let io = IoTask {
            addr: addr.clone(),
            node_id,
            codec,
            cfg: cfg.clone(),
            next_correlation: next_correlation.clone(),
            pending: pending.clone(),
            state_tx,
            suspect_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(io.run(outbound_rx));

        Self {
            addr,
            cfg,
            next_correlation,
            pending,
            outbound_tx,
            state_rx,
            cancel,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Send a request and wait for its correlated response.
    pub async fn request(&self, message: Message) -> Result<Message, RemotingError> {
        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(correlation, tx);

        let envelope = Envelope::request(correlation, message);
        if self.outbound_tx.send(envelope).await.is_err() {
            self.pending
                .lock()
                .expect("pending map poisoned")
                .remove(&correlation);
            return Err(RemotingError::Closed);
        }

        match timeout(self.cfg.request_timeout(), rx).await {
            Ok(Ok(result)) => result.map(|envelope| envelope.message),
            Ok(Err(_)) => Err(RemotingError::ConnectionLost {
                addr: self.addr.clone(),
            }),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&correlation);
                Err(RemotingError::RequestTimeout {
                    correlation,
                    timeout_ms: self.cfg.request_timeout_ms,
                })
            }
        }
    }

    /// Fire-and-forget send. The peer's response, if any, is discarded as
    /// an unknown correlation. Used for best-effort notifications.
    pub async fn notify(&self, message: Message) -> Result<(), RemotingError> {
        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed) + 1;
        let envelope = Envelope::request(correlation, message);
        self.outbound_tx
            .send(envelope)
            .await
            .map_err(|_| RemotingError::Closed)
    }

    /// Wait until the connection reaches `Connected`, up to `limit`.
    pub async fn wait_connected(&self, limit: Duration) -> Result<(), RemotingError> {
        let mut state_rx = self.state_rx.clone();
        let waited = timeout(limit, async {
            loop {
                match *state_rx.borrow() {
                    ConnectionState::Connected => return true,
                    ConnectionState::Closed => return false,
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        match waited {
            Ok(true) => Ok(()),
            _ => Err(RemotingError::ConnectionLost {
                addr: self.addr.clone(),
            }),
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct IoTask {
    addr: String,
    node_id: u64,
    codec: Arc<dyn Codec>,
    cfg: RemotingConfig,
    next_correlation: Arc<AtomicU64>,
    pending: Pending,
    state_tx: watch::Sender<ConnectionState>,
    suspect_tx: Option<mpsc::UnboundedSender<String>>,
    cancel: CancellationToken,
}

impl IoTask {
    async fn run(self, mut outbound_rx: mpsc::Receiver<Envelope>) {
        let mut backoff_ms = self.cfg.reconnect_base_ms;
        let mut down_since = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let _ = self.state_tx.send(ConnectionState::Connecting);

            let stream = match timeout(self.cfg.connect_timeout(), TcpStream::connect(&self.addr))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::debug!(addr = %self.addr, error = %e, "connect failed");
                    self.after_failed_attempt(&mut outbound_rx, down_since);
                    let _ = self.state_tx.send(ConnectionState::Reconnecting);
                    if self.sleep_backoff(&mut backoff_ms).await {
                        break;
                    }
                    continue;
                }
                Err(_) => {
                    tracing::debug!(addr = %self.addr, "connect timed out");
                    self.after_failed_attempt(&mut outbound_rx, down_since);
                    let _ = self.state_tx.send(ConnectionState::Reconnecting);
                    if self.sleep_backoff(&mut backoff_ms).await {
                        break;
                    }
                    continue;
                }
            };

            tracing::debug!(addr = %self.addr, "connected");
            backoff_ms = self.cfg.reconnect_base_ms;
            let _ = self.state_tx.send(ConnectionState::Connected);

            let open = self.drive_connected(stream, &mut outbound_rx).await;
            if !open {
                let _ = self.state_tx.send(ConnectionState::Closed);
                self.fail_all();
                return;
            }

            down_since = Instant::now();
            let _ = self.state_tx.send(ConnectionState::Reconnecting);
            if self.sleep_backoff(&mut backoff_ms).await {
                break;
            }
        }

        let _ = self.state_tx.send(ConnectionState::Closed);
        self.fail_all();
    }

    /// Drive one established connection until it drops. Returns false if
    /// the connection (and the whole task) should close for good.
    async fn drive_connected(
        &self,
        stream: TcpStream,
        outbound_rx: &mut mpsc::Receiver<Envelope>,
    ) -> bool {
        let mut framed = Framed::new(stream, frame_codec(self.cfg.max_frame_bytes));
        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(self.cfg.heartbeat_interval_ms));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        heartbeat.tick().await;

        let mut sent_since_tick = false;
        let mut hb_outstanding: Option<u64> = None;
        let mut hb_missed: u32 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return false;
                }

                maybe = outbound_rx.recv() => {
                    let Some(envelope) = maybe else {
                        // Every handle to this connection is gone.
                        return false;
                    };
                    sent_since_tick = true;
                    match self.codec.encode(&envelope) {
                        Ok(buf) => {
                            if let Err(e) = framed.send(buf).await {
                                tracing::warn!(addr = %self.addr, error = %e, "send failed");
                                return true;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                addr = %self.addr,
                                correlation = envelope.correlation,
                                error = %e,
                                "outbound message dropped, encode failed"
                            );
                            if let Some(waiter) = self
                                .pending
                                .lock()
                                .expect("pending map poisoned")
                                .remove(&envelope.correlation)
                            {
                                let _ = waiter.send(Err(RemotingError::Codec(e)));
                            }
                        }
                    }
                }

                frame = framed.next() => {
                    match frame {
                        None => {
                            tracing::debug!(addr = %self.addr, "peer closed connection");
                            return true;
                        }
                        Some(Err(e)) => {
                            tracing::warn!(addr = %self.addr, error = %e, "read failed");
                            return true;
                        }
                        Some(Ok(bytes)) => match self.codec.decode(&bytes) {
                            // A codec failure drops the message, never the
                            // connection.
                            Err(e) => {
                                tracing::warn!(addr = %self.addr, error = %e, "inbound frame dropped");
                            }
                            Ok(envelope) => {
                                if envelope.kind != FrameKind::Response {
                                    tracing::trace!(
                                        addr = %self.addr,
                                        correlation = envelope.correlation,
                                        "ignoring non-response frame on client connection"
                                    );
                                    continue;
                                }
                                if hb_outstanding == Some(envelope.correlation) {
                                    hb_outstanding = None;
                                    hb_missed = 0;
                                    continue;
                                }
                                let waiter = self
                                    .pending
                                    .lock()
                                    .expect("pending map poisoned")
                                    .remove(&envelope.correlation);
                                match waiter {
                                    Some(waiter) => {
                                        let _ = waiter.send(Ok(envelope));
                                    }
                                    None => {
                                        tracing::trace!(
                                            addr = %self.addr,
                                            correlation = envelope.correlation,
                                            "stale or unknown correlation, discarding"
                                        );
                                    }
                                }
                            }
                        },
                    }
                }

                _ = heartbeat.tick() => {
                    if hb_outstanding.is_some() {
                        hb_missed += 1;
                        hb_outstanding = None;
                        if hb_missed >= self.cfg.heartbeat_miss_limit {
                            tracing::warn!(
                                addr = %self.addr,
                                missed = hb_missed,
                                "peer unresponsive to heartbeats"
                            );
                            if let Some(tx) = &self.suspect_tx {
                                let _ = tx.send(self.addr.clone());
                            }
                        }
                    }
                    // Heartbeat only when the link was otherwise idle.
                    if sent_since_tick {
                        sent_since_tick = false;
                        continue;
                    }
                    let correlation =
                        self.next_correlation.fetch_add(1, Ordering::Relaxed) + 1;
                    let envelope = Envelope::request(
                        correlation,
                        Message::Heartbeat {
                            node_id: self.node_id,
                            seq: correlation,
                        },
                    );
                    match self.codec.encode(&envelope) {
                        Ok(buf) => {
                            if let Err(e) = framed.send(buf).await {
                                tracing::warn!(addr = %self.addr, error = %e, "heartbeat send failed");
                                return true;
                            }
                            hb_outstanding = Some(correlation);
                        }
                        Err(e) => {
                            tracing::warn!(addr = %self.addr, error = %e, "heartbeat encode failed");
                        }
                    }
                }
            }
        }
    }

    /// After a failed connect attempt: once the connect timeout has
    /// elapsed since the link went down, fail everything that was queued.
    fn after_failed_attempt(&self, outbound_rx: &mut mpsc::Receiver<Envelope>, down_since: Instant) {
        if down_since.elapsed() < self.cfg.connect_timeout() {
            return;
        }
        self.fail_all();
        while let Ok(envelope) = outbound_rx.try_recv() {
            tracing::debug!(
                addr = %self.addr,
                correlation = envelope.correlation,
                "dropping queued request, connection lost"
            );
        }
    }

    fn fail_all(&self) {
        let mut pending = self.pending.lock().expect("pending map poisoned");
        for (_, waiter) in pending.drain() {
            let _ = waiter.send(Err(RemotingError::ConnectionLost {
                addr: self.addr.clone(),
            }));
        }
    }

    /// Sleep the current backoff (with jitter) and advance it. Returns
    /// true if cancelled while sleeping.
    async fn sleep_backoff(&self, backoff_ms: &mut u64) -> bool {
        let jitter = rand::thread_rng().gen_range(0..=*backoff_ms / 2);
        let delay = Duration::from_millis(*backoff_ms + jitter);
        *backoff_ms = (*backoff_ms * 2).min(self.cfg.reconnect_max_ms);
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}
