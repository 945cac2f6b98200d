//! Server side of the framed RPC layer: an accept loop that feeds every
//! inbound request to a [`RequestHandler`] and writes the response back
//! under the request's correlation id.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::config::RemotingConfig;
use crate::error::RemotingError;
use crate::remoting::codec::{Codec, Envelope, FrameKind, Message};
use crate::remoting::connection::frame_codec;

/// Message-level service contract. The handler must be quick: anything
/// slow (job execution, store writes with retry) belongs on a spawned
/// task, with the reply carrying only the acceptance decision.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> Message;
}

pub struct RemotingServer {
    addr: String,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn RequestHandler>,
    cfg: RemotingConfig,
}

impl RemotingServer {
    pub fn new(
        addr: String,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn RequestHandler>,
        cfg: RemotingConfig,
    ) -> Self {
        Self {
            addr,
            codec,
            handler,
            cfg,
        }
    }

    /// Bind and serve until `cancel` fires. Returns the bound address,
    /// which differs from the configured one when port 0 was requested.
    pub async fn spawn(self, cancel: CancellationToken) -> Result<String, RemotingError> {
        let listener = TcpListener::bind(&self.addr).await?;
        let local = listener.local_addr()?.to_string();
        tracing::info!(addr = %local, "remoting server listening");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(addr = %self.addr, "remoting server stopped");
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                tracing::debug!(%peer, "accepted connection");
                                let codec = self.codec.clone();
                                let handler = self.handler.clone();
                                let max_frame = self.cfg.max_frame_bytes;
                                let conn_cancel = cancel.clone();
                                tokio::spawn(async move {
                                    serve_conn(stream, codec, handler, max_frame, conn_cancel)
                                        .await;
                                });
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "accept failed");
                            }
                        }
                    }
                }
            }
        });

        Ok(local)
    }
}

async fn serve_conn(
    stream: TcpStream,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn RequestHandler>,
    max_frame: usize,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(stream, frame_codec(max_frame));

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = framed.next() => frame,
        };
        let bytes = match frame {
            None => return,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "read failed, closing connection");
                return;
            }
            Some(Ok(bytes)) => bytes,
        };

        // A frame the codec cannot decode is dropped; the connection
        // stays up for well-formed traffic.
        let envelope = match codec.decode(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "inbound frame dropped");
                continue;
            }
        };
        if envelope.kind != FrameKind::Request {
            tracing::trace!(
                correlation = envelope.correlation,
                "ignoring non-request frame on server connection"
            );
            continue;
        }

        let correlation = envelope.correlation;
        let reply = handler.handle(envelope.message).await;
        let response = Envelope::response(correlation, reply);
        match codec.encode(&response) {
            Ok(buf) => {
                if let Err(e) = framed.send(buf).await {
                    tracing::warn!(error = %e, "response send failed, closing connection");
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(correlation, error = %e, "response dropped, encode failed");
            }
        }
    }
}
