//! Wire model and pluggable codec.
//!
//! Frames on the wire are length-delimited; the payload of each frame is
//! one encoded [`Envelope`]. The codec in use is resolved by name through
//! the extension registry; `json` is the stock binding.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CodecError;
use crate::membership::{MembershipEvent, NodeInfo};
use crate::stats::DispatchStats;
use crate::store::job::{Job, JobResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    Request,
    Response,
}

/// One correlated frame. Requests and responses share a correlation id
/// scoped to the connection that carries them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub correlation: u64,
    pub kind: FrameKind,
    pub message: Message,
}

impl Envelope {
    pub fn request(correlation: u64, message: Message) -> Self {
        Self {
            correlation,
            kind: FrameKind::Request,
            message,
        }
    }

    pub fn response(correlation: u64, message: Message) -> Self {
        Self {
            correlation,
            kind: FrameKind::Response,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Worker -> coordinator: ephemeral registration.
    Register { node: NodeInfo },
    RegisterAck { session: Uuid },

    /// Link liveness and session keepalive.
    Heartbeat { node_id: u64, seq: u64 },
    HeartbeatAck { seq: u64 },

    /// Coordinator -> worker: run this job. The ack only confirms delivery;
    /// the outcome arrives later as a `Result` request from the worker.
    Dispatch { job: Job },
    DispatchAck {
        job_id: Uuid,
        accepted: bool,
        reason: Option<String>,
    },

    /// Worker -> coordinator: terminal outcome of an attempt.
    Result {
        job_id: Uuid,
        worker_id: u64,
        result: JobResult,
    },
    ResultAck { job_id: Uuid },

    /// Producer -> coordinator: synchronous submission.
    Submit {
        job_type: String,
        payload: Vec<u8>,
        max_retries: u32,
    },
    SubmitAck { job_id: Uuid },
    SubmitRejected { reason: String },

    JobQuery { job_id: Uuid },
    JobReport { job: Option<Job> },

    /// Cancel is honored only while the job is waiting; for a running job
    /// it is a best-effort notification to the worker.
    CancelJob { job_id: Uuid },
    CancelAck { job_id: Uuid, cancelled: bool },

    StatsQuery,
    StatsReport { stats: DispatchStats },

    /// Coordinator -> interested peers: a node joined or left the cluster.
    /// Notification only, no response expected beyond transport delivery.
    MembershipChange { event: MembershipEvent },

    Error { detail: String },
}

pub trait Codec: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn encode(&self, envelope: &Envelope) -> Result<Bytes, CodecError>;

    fn decode(&self, frame: &[u8]) -> Result<Envelope, CodecError>;
}

/// serde_json-backed codec, the default binding.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    max_frame_bytes: usize,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self {
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

impl JsonCodec {
    pub fn with_max_frame(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Bytes, CodecError> {
        let buf = serde_json::to_vec(envelope).map_err(|e| CodecError::Encode(e.to_string()))?;
        if buf.len() > self.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                len: buf.len(),
                max: self.max_frame_bytes,
            });
        }
        Ok(Bytes::from(buf))
    }

    fn decode(&self, frame: &[u8]) -> Result<Envelope, CodecError> {
        if frame.len() > self.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_bytes,
            });
        }
        serde_json::from_slice(frame).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::NodeType;
    use chrono::Utc;

    fn round_trip(envelope: Envelope) {
        let codec = JsonCodec::default();
        let bytes = codec.encode(&envelope).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn dispatch_round_trips_payload_byte_for_byte() {
        let job = Job::new("echo".to_string(), vec![0, 1, 2, 255, 128, 7], 2);
        round_trip(Envelope::request(17, Message::Dispatch { job }));
    }

    #[test]
    fn result_round_trips() {
        let result = JobResult::exception("worker blew up: division by zero".to_string());
        round_trip(Envelope::response(
            99,
            Message::Result {
                job_id: Uuid::new_v4(),
                worker_id: 3,
                result,
            },
        ));
    }

    #[test]
    fn heartbeat_round_trips() {
        round_trip(Envelope::request(1, Message::Heartbeat { node_id: 5, seq: 42 }));
        round_trip(Envelope::response(1, Message::HeartbeatAck { seq: 42 }));
    }

    #[test]
    fn register_round_trips() {
        let node = NodeInfo {
            node_id: 9,
            addr: "127.0.0.1:7081".to_string(),
            node_type: NodeType::Worker,
            registered_at: Utc::now(),
        };
        round_trip(Envelope::request(3, Message::Register { node }));
    }

    #[test]
    fn membership_change_round_trips() {
        let node = NodeInfo {
            node_id: 4,
            addr: "127.0.0.1:7082".to_string(),
            node_type: NodeType::Worker,
            registered_at: Utc::now(),
        };
        round_trip(Envelope::request(
            8,
            Message::MembershipChange {
                event: MembershipEvent::Joined(node.clone()),
            },
        ));
        round_trip(Envelope::request(
            9,
            Message::MembershipChange {
                event: MembershipEvent::Left(node),
            },
        ));
    }

    #[test]
    fn oversized_frame_is_rejected_on_encode() {
        let codec = JsonCodec::with_max_frame(64);
        let job = Job::new("echo".to_string(), vec![7u8; 1024], 0);
        let err = codec
            .encode(&Envelope::request(1, Message::Dispatch { job }))
            .unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { .. }));
    }

    #[test]
    fn malformed_input_is_a_decode_error() {
        let codec = JsonCodec::default();
        let err = codec.decode(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
