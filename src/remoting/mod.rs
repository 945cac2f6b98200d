//! Framed request/response RPC over TCP.
//!
//! Length-delimited frames carry codec-encoded [`codec::Envelope`]s. The
//! client side ([`connection::Connection`]) reconnects with bounded
//! exponential backoff and probes idle links with heartbeats; the server
//! side ([`server::RemotingServer`]) dispatches every request to a
//! [`server::RequestHandler`].

pub mod codec;
pub mod connection;
pub mod server;

pub use codec::{Codec, Envelope, FrameKind, JsonCodec, Message};
pub use connection::{Connection, ConnectionState};
pub use server::{RemotingServer, RequestHandler};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::config::RemotingConfig;

/// Shared pool of client connections, keyed by remote address. The
/// coordinator keeps one connection per worker it dispatches to; entries
/// for departed workers are removed on membership `Left`.
pub struct ConnectionPool {
    codec: Arc<dyn Codec>,
    cfg: RemotingConfig,
    node_id: u64,
    suspect_tx: Option<mpsc::UnboundedSender<String>>,
    conns: Mutex<HashMap<String, Arc<Connection>>>,
}

impl ConnectionPool {
    pub fn new(
        codec: Arc<dyn Codec>,
        cfg: RemotingConfig,
        node_id: u64,
        suspect_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Self {
        Self {
            codec,
            cfg,
            node_id,
            suspect_tx,
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Connection to `addr`, opening one if none exists yet.
    pub async fn get(&self, addr: &str) -> Arc<Connection> {
        let mut conns = self.conns.lock().await;
        if let Some(conn) = conns.get(addr) {
            return conn.clone();
        }
        let conn = Arc::new(Connection::open(
            addr.to_string(),
            self.codec.clone(),
            self.cfg.clone(),
            self.node_id,
            self.suspect_tx.clone(),
        ));
        conns.insert(addr.to_string(), conn.clone());
        conn
    }

    /// Drop and close the connection to `addr`, if any.
    pub async fn remove(&self, addr: &str) {
        if let Some(conn) = self.conns.lock().await.remove(addr) {
            conn.close();
        }
    }

    pub async fn len(&self) -> usize {
        self.conns.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conns.lock().await.is_empty()
    }
}
