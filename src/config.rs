use std::net::SocketAddr;
use std::time::Duration;

/// Tuning knobs for the framed RPC layer.
///
/// One instance is shared by every connection a node opens; per-request
/// timeouts and reconnect pacing all come from here.
#[derive(Debug, Clone)]
pub struct RemotingConfig {
    /// How long a single request may wait for its response.
    pub request_timeout_ms: u64,
    /// How long a connect attempt may take, and how long queued requests
    /// survive a disconnect before failing with `ConnectionLost`.
    pub connect_timeout_ms: u64,
    /// Idle heartbeat interval on an established connection.
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeat acks before the peer is flagged suspect.
    pub heartbeat_miss_limit: u32,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_ms: u64,
    /// Upper bound on the reconnect delay.
    pub reconnect_max_ms: u64,
    /// Hard limit on a single wire frame.
    pub max_frame_bytes: usize,
}

impl Default for RemotingConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 3_000,
            connect_timeout_ms: 5_000,
            heartbeat_interval_ms: 1_000,
            heartbeat_miss_limit: 3,
            reconnect_base_ms: 100,
            reconnect_max_ms: 5_000,
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

impl RemotingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Configuration for a coordinator node.
///
/// The `codec`, `balancer`, `job_store`, `fail_store`, and `coordination`
/// fields are binding names resolved through the extension registry at
/// startup.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub node_id: u64,
    pub listen_addr: SocketAddr,
    /// Address workers and clients use to reach this node.
    pub advertise_addr: String,
    /// Upper bound on jobs claimed per scheduling wake.
    pub dispatch_batch: usize,
    /// Concurrency ceiling per worker; workers at the ceiling are excluded
    /// from selection.
    pub per_worker_concurrency: usize,
    /// Liveness grace. A registration with no keepalive for this long is
    /// expired, and orphaned claims older than this are recovered.
    pub worker_timeout_ms: u64,
    /// Default delay before a retried job becomes ready again.
    pub retry_backoff_ms: u64,
    /// Deadline for an in-flight assignment before it is treated as lost.
    pub assignment_timeout_ms: u64,
    pub codec: String,
    pub balancer: String,
    pub job_store: String,
    pub fail_store: String,
    pub coordination: String,
    pub remoting: RemotingConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            // SAFETY: hardcoded valid address
            listen_addr: "127.0.0.1:7070"
                .parse()
                .expect("default listen address is valid"),
            advertise_addr: "127.0.0.1:7070".to_string(),
            dispatch_batch: 16,
            per_worker_concurrency: 4,
            worker_timeout_ms: 5_000,
            retry_backoff_ms: 1_000,
            assignment_timeout_ms: 60_000,
            codec: "json".to_string(),
            balancer: "round-robin".to_string(),
            job_store: "memory".to_string(),
            fail_store: "memory".to_string(),
            coordination: "memory".to_string(),
            remoting: RemotingConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn new(node_id: u64, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            advertise_addr: listen_addr.to_string(),
            ..Default::default()
        }
    }

    pub fn with_balancer(mut self, name: &str) -> Self {
        self.balancer = name.to_string();
        self
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn assignment_timeout(&self) -> Duration {
        Duration::from_millis(self.assignment_timeout_ms)
    }
}

/// Configuration for a worker node.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub node_id: u64,
    pub listen_addr: SocketAddr,
    /// Address the coordinator uses to dispatch to this worker.
    pub advertise_addr: String,
    /// Address of the coordinator's remoting server.
    pub coordinator_addr: String,
    /// Session keepalive interval; must be well under the coordinator's
    /// worker timeout.
    pub session_keepalive_ms: u64,
    pub codec: String,
    pub remoting: RemotingConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            node_id: 2,
            // SAFETY: hardcoded valid address
            listen_addr: "127.0.0.1:7071"
                .parse()
                .expect("default listen address is valid"),
            advertise_addr: "127.0.0.1:7071".to_string(),
            coordinator_addr: "127.0.0.1:7070".to_string(),
            session_keepalive_ms: 1_000,
            codec: "json".to_string(),
            remoting: RemotingConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(node_id: u64, listen_addr: SocketAddr, coordinator_addr: String) -> Self {
        Self {
            node_id,
            listen_addr,
            advertise_addr: listen_addr.to_string(),
            coordinator_addr,
            ..Default::default()
        }
    }
}
