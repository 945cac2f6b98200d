//! Worker selection policies, bound under the `loadbalance` extension
//! point. Candidates arrive pre-filtered to live workers with spare
//! capacity, paired with their current in-flight assignment count.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::membership::NodeInfo;
use crate::store::job::Job;

pub trait LoadBalancer: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Pick a worker for `job` from `candidates`, or `None` when the
    /// slice is empty.
    fn select(&self, job: &Job, candidates: &[(NodeInfo, usize)]) -> Option<NodeInfo>;
}

/// Cycles through candidates in arrival order.
#[derive(Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(&self, _job: &Job, candidates: &[(NodeInfo, usize)]) -> Option<NodeInfo> {
        if candidates.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[i].0.clone())
    }
}

/// Picks the worker with the fewest in-flight assignments, breaking ties
/// by the lower node id so the choice is deterministic.
#[derive(Default)]
pub struct LeastAssignments;

impl LeastAssignments {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastAssignments {
    fn name(&self) -> &'static str {
        "least-assignments"
    }

    fn select(&self, _job: &Job, candidates: &[(NodeInfo, usize)]) -> Option<NodeInfo> {
        candidates
            .iter()
            .min_by_key(|(node, in_flight)| (*in_flight, node.node_id))
            .map(|(node, _)| node.clone())
    }
}

/// Routes each job type to a stable worker as long as the candidate set
/// holds, so jobs of one type land where their state or cache already is.
#[derive(Default)]
pub struct ConsistentHash;

impl ConsistentHash {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for ConsistentHash {
    fn name(&self) -> &'static str {
        "consistent-hash"
    }

    fn select(&self, job: &Job, candidates: &[(NodeInfo, usize)]) -> Option<NodeInfo> {
        if candidates.is_empty() {
            return None;
        }
        let mut ids: Vec<u64> = candidates.iter().map(|(n, _)| n.node_id).collect();
        ids.sort_unstable();

        let mut hasher = DefaultHasher::new();
        job.job_type.hash(&mut hasher);
        let wanted = ids[(hasher.finish() % ids.len() as u64) as usize];

        candidates
            .iter()
            .find(|(n, _)| n.node_id == wanted)
            .map(|(n, _)| n.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::NodeType;

    fn workers(n: u64) -> Vec<(NodeInfo, usize)> {
        (1..=n)
            .map(|id| {
                (
                    NodeInfo::new(id, format!("127.0.0.1:{}", 7000 + id), NodeType::Worker),
                    0,
                )
            })
            .collect()
    }

    fn job(job_type: &str) -> Job {
        Job::new(job_type.to_string(), Vec::new(), 0)
    }

    #[test]
    fn round_robin_cycles() {
        let lb = RoundRobin::new();
        let candidates = workers(3);
        let picks: Vec<u64> = (0..6)
            .map(|_| lb.select(&job("t"), &candidates).unwrap().node_id)
            .collect();
        assert_eq!(picks, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn empty_candidates_yield_none() {
        let j = job("t");
        assert!(RoundRobin::new().select(&j, &[]).is_none());
        assert!(LeastAssignments::new().select(&j, &[]).is_none());
        assert!(ConsistentHash::new().select(&j, &[]).is_none());
    }

    #[test]
    fn least_assignments_prefers_idle_worker() {
        let lb = LeastAssignments::new();
        let mut candidates = workers(3);
        candidates[0].1 = 4;
        candidates[1].1 = 1;
        candidates[2].1 = 2;
        assert_eq!(lb.select(&job("t"), &candidates).unwrap().node_id, 2);
    }

    #[test]
    fn least_assignments_breaks_ties_by_node_id() {
        let lb = LeastAssignments::new();
        let candidates = workers(3);
        assert_eq!(lb.select(&job("t"), &candidates).unwrap().node_id, 1);
    }

    #[test]
    fn consistent_hash_is_stable_per_job_type() {
        let lb = ConsistentHash::new();
        let candidates = workers(5);
        let first = lb.select(&job("report"), &candidates).unwrap().node_id;
        for _ in 0..10 {
            assert_eq!(lb.select(&job("report"), &candidates).unwrap().node_id, first);
        }
        // Candidate order must not matter.
        let mut shuffled = candidates.clone();
        shuffled.reverse();
        assert_eq!(lb.select(&job("report"), &shuffled).unwrap().node_id, first);
    }
}
