//! In-flight assignment bookkeeping. One entry per job currently out on a
//! worker; the entry is the at-least-once guard: results are applied only
//! while the assignment is present, and removing it is what makes a
//! duplicate result a no-op.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Assignment {
    pub job_id: Uuid,
    pub worker_id: u64,
    pub dispatched_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

#[derive(Default)]
pub struct AssignmentTable {
    by_job: HashMap<Uuid, Assignment>,
}

impl AssignmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, assignment: Assignment) {
        self.by_job.insert(assignment.job_id, assignment);
    }

    /// Remove and return the assignment for `job_id`. `None` means the
    /// job is no longer in flight (already resolved or failed over).
    pub fn remove(&mut self, job_id: Uuid) -> Option<Assignment> {
        self.by_job.remove(&job_id)
    }

    pub fn get(&self, job_id: Uuid) -> Option<&Assignment> {
        self.by_job.get(&job_id)
    }

    /// Remove every assignment held by `worker_id`, returning them for
    /// requeue. Used on worker departure.
    pub fn drain_worker(&mut self, worker_id: u64) -> Vec<Assignment> {
        let ids: Vec<Uuid> = self
            .by_job
            .values()
            .filter(|a| a.worker_id == worker_id)
            .map(|a| a.job_id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.by_job.remove(&id))
            .collect()
    }

    /// Assignments past their deadline at `now`, left in place; the
    /// caller decides per assignment whether to fail over.
    pub fn overdue(&self, now: DateTime<Utc>) -> Vec<Assignment> {
        self.by_job
            .values()
            .filter(|a| a.deadline <= now)
            .cloned()
            .collect()
    }

    pub fn count_for(&self, worker_id: u64) -> usize {
        self.by_job
            .values()
            .filter(|a| a.worker_id == worker_id)
            .count()
    }

    pub fn live_job_ids(&self) -> HashSet<Uuid> {
        self.by_job.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.by_job.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_job.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn assignment(worker_id: u64, overdue: bool) -> Assignment {
        let now = Utc::now();
        Assignment {
            job_id: Uuid::new_v4(),
            worker_id,
            dispatched_at: now,
            deadline: if overdue {
                now - Duration::seconds(1)
            } else {
                now + Duration::seconds(60)
            },
        }
    }

    #[test]
    fn remove_is_single_shot() {
        let mut table = AssignmentTable::new();
        let a = assignment(1, false);
        let id = a.job_id;
        table.insert(a);

        assert!(table.remove(id).is_some());
        assert!(table.remove(id).is_none());
    }

    #[test]
    fn drain_worker_takes_only_that_workers_jobs() {
        let mut table = AssignmentTable::new();
        for _ in 0..3 {
            table.insert(assignment(1, false));
        }
        table.insert(assignment(2, false));

        let drained = table.drain_worker(1);
        assert_eq!(drained.len(), 3);
        assert_eq!(table.len(), 1);
        assert_eq!(table.count_for(2), 1);
    }

    #[test]
    fn overdue_reports_expired_deadlines() {
        let mut table = AssignmentTable::new();
        table.insert(assignment(1, true));
        table.insert(assignment(1, false));

        let overdue = table.overdue(Utc::now());
        assert_eq!(overdue.len(), 1);
        // Reporting does not remove.
        assert_eq!(table.len(), 2);
    }
}
