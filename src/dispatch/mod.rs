//! The dispatch scheduler: claims ready jobs, picks workers, pushes work
//! out, and consumes results exactly once.
//!
//! Delivery is at-least-once. A dispatch whose ack is lost may execute
//! anyway, and the retry path can run a job twice; the assignment table
//! makes the *result* single-shot, so duplicate reports never double-apply
//! a transition.

pub mod assignment;
pub mod balancer;

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::dispatch::assignment::{Assignment, AssignmentTable};
use crate::dispatch::balancer::LoadBalancer;
use crate::membership::{MembershipEvent, MembershipService, NodeInfo, Registration};
use crate::remoting::{ConnectionPool, Message};
use crate::stats::DispatchStats;
use crate::store::fail::FailStore;
use crate::store::job::{Job, JobResult, ResultAction};
use crate::store::{JobFilter, JobStore, RetryDisposition, TerminalOutcome};

/// Periodic maintenance cadence: overdue assignments and orphan recovery.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// One execution report from a worker, fed into the scheduler loop by the
/// coordinator's request handler.
#[derive(Debug)]
pub struct WorkerResult {
    pub worker_id: u64,
    pub job_id: Uuid,
    pub result: JobResult,
}

pub struct DispatchScheduler {
    cfg: CoordinatorConfig,
    store: Arc<dyn JobStore>,
    fail_store: Arc<dyn FailStore>,
    balancer: Arc<dyn LoadBalancer>,
    membership: Arc<MembershipService>,
    pool: Arc<ConnectionPool>,
    registration: RwLock<Registration>,
    assignments: Mutex<AssignmentTable>,
}

impl DispatchScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: CoordinatorConfig,
        store: Arc<dyn JobStore>,
        fail_store: Arc<dyn FailStore>,
        balancer: Arc<dyn LoadBalancer>,
        membership: Arc<MembershipService>,
        pool: Arc<ConnectionPool>,
        registration: Registration,
    ) -> Self {
        Self {
            cfg,
            store,
            fail_store,
            balancer,
            membership,
            pool,
            registration: RwLock::new(registration),
            assignments: Mutex::new(AssignmentTable::new()),
        }
    }

    /// Swap in a fresh registration after the coordinator re-registers.
    pub fn replace_registration(&self, registration: Registration) {
        *self
            .registration
            .write()
            .expect("registration lock poisoned") = registration;
    }

    /// Main loop. Wakes on ready jobs, membership changes, incoming
    /// results, and the maintenance tick; every wake ends in a drain pass
    /// so no trigger leaves claimable work sitting.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<MembershipEvent>,
        mut results: mpsc::Receiver<WorkerResult>,
        cancel: CancellationToken,
    ) {
        let notify = self.store.ready_notify();
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("dispatch scheduler stopped");
                    return;
                }
                _ = notify.notified() => {}
                event = events.recv() => {
                    match event {
                        Some(MembershipEvent::Left(node)) => self.fail_over(&node).await,
                        Some(MembershipEvent::Joined(node)) => {
                            tracing::debug!(node_id = node.node_id, "worker available");
                        }
                        None => {
                            tracing::debug!("membership feed closed, scheduler stopping");
                            return;
                        }
                    }
                }
                report = results.recv() => {
                    let Some(report) = report else {
                        tracing::debug!("result feed closed, scheduler stopping");
                        return;
                    };
                    self.consume_result(report).await;
                }
                _ = sweep.tick() => {
                    self.sweep().await;
                }
            }
            self.clone().drain().await;
        }
    }

    /// Claim-and-dispatch until the batch limit, the queue, or the worker
    /// capacity runs out. Only store transitions are awaited here; the
    /// network send runs on its own task, so one slow worker never stalls
    /// the claim loop.
    async fn drain(self: Arc<Self>) {
        let session_valid = self
            .registration
            .read()
            .expect("registration lock poisoned")
            .session_valid();
        if !session_valid {
            // Own session expired: no dispatch until re-registered.
            tracing::warn!("coordinator session invalid, dispatch paused");
            return;
        }

        for _ in 0..self.cfg.dispatch_batch {
            let candidates = self.candidates();
            if candidates.is_empty() {
                return;
            }

            let job = match self.store.take_next(&JobFilter::default()).await {
                Ok(Some(job)) => job,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(error = %e, "claim failed");
                    return;
                }
            };

            let Some(target) = self.balancer.select(&job, &candidates) else {
                // Claimed but nowhere to send it; put it back untouched.
                if let Err(e) = self.store.release(job.id, None).await {
                    tracing::error!(job_id = %job.id, error = %e, "release failed");
                }
                return;
            };

            self.clone().dispatch_one(job, target).await;
        }
    }

    /// Live workers with spare capacity, paired with their in-flight count.
    fn candidates(&self) -> Vec<(NodeInfo, usize)> {
        let table = self.assignments.lock().expect("assignment table poisoned");
        self.membership
            .live_nodes()
            .into_iter()
            .map(|node| {
                let in_flight = table.count_for(node.node_id);
                (node, in_flight)
            })
            .filter(|(_, in_flight)| *in_flight < self.cfg.per_worker_concurrency)
            .collect()
    }

    async fn dispatch_one(self: Arc<Self>, mut job: Job, target: NodeInfo) {
        // Bind the job to the worker durably before anything leaves this
        // process; a crash right after still leaves it recoverable.
        if let Err(e) = self.store.mark_running(job.id, target.node_id).await {
            tracing::error!(job_id = %job.id, error = %e, "mark_running failed");
            return;
        }
        job.assigned_worker = Some(target.node_id);

        let now = chrono::Utc::now();
        let deadline = now
            + chrono::Duration::from_std(self.cfg.assignment_timeout())
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.assignments
            .lock()
            .expect("assignment table poisoned")
            .insert(Assignment {
                job_id: job.id,
                worker_id: target.node_id,
                dispatched_at: now,
                deadline,
            });

        // The assignment is in the books; the send and its rollback can
        // settle in the background while the claim loop moves on.
        tokio::spawn(async move {
            self.settle_dispatch(job, target).await;
        });
    }

    /// Send one dispatch and handle its acknowledgement, rolling back on
    /// refusal or failure.
    async fn settle_dispatch(&self, job: Job, target: NodeInfo) {
        let conn = self.pool.get(&target.addr).await;
        let job_id = job.id;
        let reply = conn.request(Message::Dispatch { job }).await;

        match reply {
            Ok(Message::DispatchAck { accepted: true, .. }) => {
                tracing::info!(%job_id, worker_id = target.node_id, "job dispatched");
            }
            Ok(Message::DispatchAck {
                accepted: false,
                reason,
                ..
            }) => {
                tracing::warn!(
                    %job_id,
                    worker_id = target.node_id,
                    reason = reason.as_deref().unwrap_or("unspecified"),
                    "dispatch refused"
                );
                self.undo_dispatch(job_id, None).await;
            }
            Ok(other) => {
                tracing::warn!(%job_id, ?other, "unexpected dispatch reply");
                self.undo_dispatch(job_id, None).await;
            }
            Err(e) => {
                // The worker may still have received the frame; if it did,
                // the duplicate result is dropped by the assignment guard.
                tracing::warn!(%job_id, worker_id = target.node_id, error = %e, "dispatch failed");
                self.undo_dispatch(job_id, Some(self.cfg.retry_backoff())).await;
            }
        }
    }

    /// Roll an unacknowledged dispatch back to waiting. Infrastructure
    /// fault: no retry is consumed. A missing assignment means the job was
    /// already settled (result applied, failed over, or reclaimed) while
    /// the send was in flight; there is nothing left to roll back.
    async fn undo_dispatch(&self, job_id: Uuid, backoff: Option<Duration>) {
        let removed = self
            .assignments
            .lock()
            .expect("assignment table poisoned")
            .remove(job_id);
        if removed.is_none() {
            return;
        }
        if let Err(e) = self.store.release(job_id, backoff).await {
            tracing::error!(%job_id, error = %e, "release failed");
        }
    }

    /// Apply one worker result. Removing the assignment first makes this
    /// exactly-once: a duplicate or stale report finds no assignment and
    /// is dropped.
    pub async fn consume_result(&self, report: WorkerResult) {
        let removed = self
            .assignments
            .lock()
            .expect("assignment table poisoned")
            .remove(report.job_id);
        let Some(assignment) = removed else {
            tracing::debug!(
                job_id = %report.job_id,
                worker_id = report.worker_id,
                "stale or duplicate result, dropped"
            );
            return;
        };
        if assignment.worker_id != report.worker_id {
            // The job was failed over and re-dispatched; the old holder's
            // report no longer speaks for it.
            tracing::debug!(
                job_id = %report.job_id,
                reporter = report.worker_id,
                holder = assignment.worker_id,
                "result from superseded worker, dropped"
            );
            self.assignments
                .lock()
                .expect("assignment table poisoned")
                .insert(assignment);
            return;
        }

        let job_id = report.job_id;
        match report.result.action {
            ResultAction::ExecuteSuccess => {
                tracing::info!(%job_id, worker_id = report.worker_id, "job succeeded");
                if let Err(e) = self.store.mark_terminal(job_id, TerminalOutcome::Succeeded).await {
                    tracing::error!(%job_id, error = %e, "mark_terminal failed");
                }
            }
            ResultAction::ExecuteLater => {
                // Deferred by the worker itself; no retry consumed.
                let backoff = report
                    .result
                    .backoff_hint_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.cfg.retry_backoff());
                tracing::info!(%job_id, backoff_ms = backoff.as_millis() as u64, "job deferred by worker");
                if let Err(e) = self.store.release(job_id, Some(backoff)).await {
                    tracing::error!(%job_id, error = %e, "release failed");
                }
            }
            ResultAction::ExecuteFailed | ResultAction::ExecuteException => {
                self.retry_or_fail(job_id, &report.result).await;
            }
        }
    }

    async fn retry_or_fail(&self, job_id: Uuid, result: &JobResult) {
        let backoff = result
            .backoff_hint_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.cfg.retry_backoff());

        match self.store.requeue_for_retry(job_id, Some(backoff)).await {
            Ok(RetryDisposition::Requeued { not_before }) => {
                tracing::info!(%job_id, %not_before, "job requeued for retry");
            }
            Ok(RetryDisposition::Exhausted) => {
                tracing::warn!(%job_id, message = %result.message, "retries exhausted, job failed");
                match self.store.get(job_id).await {
                    Ok(Some(job)) => {
                        if let Err(e) = self.fail_store.record(&job, result).await {
                            tracing::error!(%job_id, error = %e, "fail store record failed");
                        }
                    }
                    Ok(None) => tracing::warn!(%job_id, "failed job missing from store"),
                    Err(e) => tracing::error!(%job_id, error = %e, "fail store lookup failed"),
                }
                if let Err(e) = self.store.mark_terminal(job_id, TerminalOutcome::Failed).await {
                    tracing::error!(%job_id, error = %e, "mark_terminal failed");
                }
            }
            Err(e) => {
                tracing::error!(%job_id, error = %e, "requeue_for_retry failed");
            }
        }
    }

    /// Worker departure: everything it held goes back to waiting with no
    /// retry consumed, then the connection is discarded.
    pub async fn fail_over(&self, node: &NodeInfo) {
        let orphaned = self
            .assignments
            .lock()
            .expect("assignment table poisoned")
            .drain_worker(node.node_id);
        tracing::warn!(
            node_id = node.node_id,
            jobs = orphaned.len(),
            "worker left, failing over its assignments"
        );
        for assignment in orphaned {
            if let Err(e) = self.store.release(assignment.job_id, None).await {
                tracing::error!(job_id = %assignment.job_id, error = %e, "failover release failed");
            }
        }
        self.pool.remove(&node.addr).await;
    }

    /// Maintenance pass: overdue assignments (a live worker whose result
    /// was lost) and orphaned claims in the store.
    async fn sweep(&self) {
        let overdue = {
            let mut table = self.assignments.lock().expect("assignment table poisoned");
            let overdue = table.overdue(chrono::Utc::now());
            for a in &overdue {
                table.remove(a.job_id);
            }
            overdue
        };
        for assignment in overdue {
            tracing::warn!(
                job_id = %assignment.job_id,
                worker_id = assignment.worker_id,
                "assignment deadline passed, reclaiming"
            );
            if let Err(e) = self.store.release(assignment.job_id, None).await {
                tracing::error!(job_id = %assignment.job_id, error = %e, "reclaim release failed");
            }
        }

        let live = self
            .assignments
            .lock()
            .expect("assignment table poisoned")
            .live_job_ids();
        match self
            .store
            .recover_orphans(self.cfg.worker_timeout(), &live)
            .await
        {
            Ok(recovered) if !recovered.is_empty() => {
                tracing::warn!(jobs = recovered.len(), "orphaned claims recovered");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "orphan recovery failed"),
        }
    }

    /// Best-effort cancel of a job already out on a worker: tell the
    /// holder, keep the assignment. If the worker aborts it, no result
    /// arrives and the deadline sweep returns the job to waiting.
    pub async fn forward_cancel(&self, job_id: Uuid) {
        let holder = self
            .assignments
            .lock()
            .expect("assignment table poisoned")
            .get(job_id)
            .map(|a| a.worker_id);
        let Some(worker_id) = holder else { return };
        let Some(node) = self.membership.get(worker_id) else {
            return;
        };
        let conn = self.pool.get(&node.addr).await;
        if let Err(e) = conn.notify(Message::CancelJob { job_id }).await {
            tracing::warn!(%job_id, worker_id, error = %e, "cancel notification failed");
        }
    }

    pub async fn collect_stats(&self) -> DispatchStats {
        let counts = self.store.counts().await.unwrap_or_default();
        let in_flight = self.assignments.lock().expect("assignment table poisoned").len();
        DispatchStats {
            queue_depth: counts.waiting as u64,
            live_workers: self.membership.len() as u64,
            in_flight: in_flight as u64,
            failed_count: counts.failed,
        }
    }

    #[cfg(test)]
    fn insert_assignment(&self, job_id: Uuid, worker_id: u64) {
        let now = chrono::Utc::now();
        self.assignments
            .lock()
            .expect("assignment table poisoned")
            .insert(Assignment {
                job_id,
                worker_id,
                dispatched_at: now,
                deadline: now + chrono::Duration::seconds(60),
            });
    }
}
