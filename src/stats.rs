use serde::{Deserialize, Serialize};

/// Snapshot of dispatch-side health, pulled by an external reporter.
///
/// The core never pushes metrics anywhere; a periodic reporter polls
/// [`Coordinator::stats`](crate::coordinator::Coordinator::stats) and
/// forwards the snapshot to whatever monitoring store it likes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Jobs waiting to be claimed.
    pub queue_depth: u64,
    /// Workers currently in the live membership snapshot.
    pub live_workers: u64,
    /// Assignments currently outstanding.
    pub in_flight: u64,
    /// Jobs that reached terminal failure since startup.
    pub failed_count: u64,
}
