use thiserror::Error;
use uuid::Uuid;

/// Failure to resolve a named binding for an extension point.
///
/// Resolution failures are fatal at startup: the component that asked for
/// the binding cannot run without it.
#[derive(Error, Debug)]
pub enum ExtensionError {
    #[error("no binding named {name:?} for extension point {key:?}")]
    UnknownBinding { key: &'static str, name: String },

    #[error("binding {name:?} for extension point {key:?} failed to construct")]
    Construction {
        key: &'static str,
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Per-message codec failure. Logged and the message dropped; never tears
/// down the connection it arrived on.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
}

#[derive(Error, Debug)]
pub enum RemotingError {
    #[error("connection to {addr} lost")]
    ConnectionLost { addr: String },

    #[error("request {correlation} timed out after {timeout_ms}ms")]
    RequestTimeout { correlation: u64, timeout_ms: u64 },

    #[error("connection closed")]
    Closed,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(Uuid),

    /// Two claimants observed for one job. Impossible under correct store
    /// semantics; surfaced as an invariant-violation alarm, never retried.
    #[error("claim conflict on job {0}")]
    ClaimConflict(Uuid),

    #[error("invalid transition for job {id}: {detail}")]
    InvalidTransition { id: Uuid, detail: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum MembershipError {
    #[error("session expired")]
    SessionExpired,

    #[error("coordination backend unavailable: {0}")]
    BackendUnavailable(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Remoting(#[from] RemotingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error("submission rejected: {0}")]
    SubmissionRejected(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
