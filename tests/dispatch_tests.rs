//! End-to-end dispatch tests over loopback TCP: submission, execution,
//! retry accounting, distribution across workers, and the wire client
//! surface.

mod test_harness;

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;

use taskmesh::remoting::{Connection, JsonCodec, Message};
use taskmesh::store::job::JobState;

use test_harness::{FlakyHandler, RecordingHandler, TestCluster};

#[tokio::test]
async fn echo_job_runs_to_success() {
    let cluster = TestCluster::start(2, "round-robin").await;

    let job_id = cluster
        .coordinator
        .submit("echo", b"hello out there".to_vec(), 3)
        .await
        .unwrap();
    let job = cluster.wait_terminal(job_id, Duration::from_secs(10)).await;

    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.payload, b"hello out there");
}

#[tokio::test]
async fn jobs_spread_across_workers() {
    let mut cluster = TestCluster::start(2, "round-robin").await;

    let ran = Arc::new(std::sync::Mutex::new(Vec::new()));
    for worker in &mut cluster.workers {
        worker
            .runner
            .register_handler(
                "record",
                Arc::new(RecordingHandler {
                    node_id: worker.node.node_id(),
                    ran: ran.clone(),
                }),
            )
            .await;
    }

    let mut job_ids = Vec::new();
    for _ in 0..12 {
        job_ids.push(
            cluster
                .coordinator
                .submit("record", Vec::new(), 0)
                .await
                .unwrap(),
        );
    }
    for job_id in job_ids {
        let job = cluster.wait_terminal(job_id, Duration::from_secs(10)).await;
        assert_eq!(job.state, JobState::Succeeded);
    }

    let ran = ran.lock().unwrap();
    assert_eq!(ran.len(), 12);
    let first_worker = ran[0].0;
    assert!(
        ran.iter().any(|(node_id, _)| *node_id != first_worker),
        "all 12 jobs landed on worker {first_worker}"
    );
}

#[tokio::test]
async fn retries_consume_budget_then_fail() {
    let cluster = TestCluster::start(1, "round-robin").await;

    let job_id = cluster
        .coordinator
        .submit("always-fails", Vec::new(), 2)
        .await
        .unwrap();
    let job = cluster.wait_terminal(job_id, Duration::from_secs(15)).await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.retry_count, 2);

    let stats = cluster.coordinator.stats().await;
    assert_eq!(stats.failed_count, 1);
}

#[tokio::test]
async fn flaky_job_succeeds_within_budget() {
    let mut cluster = TestCluster::start(2, "round-robin").await;

    let attempts = Arc::new(AtomicU32::new(0));
    for worker in &mut cluster.workers {
        worker
            .runner
            .register_handler(
                "flaky",
                Arc::new(FlakyHandler {
                    attempts: attempts.clone(),
                    failures: 2,
                }),
            )
            .await;
    }

    let job_id = cluster
        .coordinator
        .submit("flaky", Vec::new(), 5)
        .await
        .unwrap();
    let job = cluster.wait_terminal(job_id, Duration::from_secs(15)).await;

    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.retry_count, 2);
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
}

#[tokio::test]
async fn empty_job_type_is_rejected() {
    let cluster = TestCluster::start(1, "round-robin").await;
    let err = cluster
        .coordinator
        .submit("", Vec::new(), 0)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("rejected"));
}

#[tokio::test]
async fn wire_client_submit_status_and_stats() {
    let cluster = TestCluster::start(1, "round-robin").await;

    let conn = Connection::open(
        cluster.coordinator.local_addr().to_string(),
        Arc::new(JsonCodec::default()),
        Default::default(),
        0,
        None,
    );
    conn.wait_connected(Duration::from_secs(5)).await.unwrap();

    let reply = conn
        .request(Message::Submit {
            job_type: "echo".to_string(),
            payload: b"over the wire".to_vec(),
            max_retries: 1,
        })
        .await
        .unwrap();
    let Message::SubmitAck { job_id } = reply else {
        panic!("unexpected reply: {reply:?}");
    };

    let job = cluster.wait_terminal(job_id, Duration::from_secs(10)).await;
    assert_eq!(job.state, JobState::Succeeded);

    let reply = conn.request(Message::JobQuery { job_id }).await.unwrap();
    let Message::JobReport { job: Some(job) } = reply else {
        panic!("unexpected reply: {reply:?}");
    };
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.payload, b"over the wire");

    let reply = conn.request(Message::StatsQuery).await.unwrap();
    let Message::StatsReport { stats } = reply else {
        panic!("unexpected reply: {reply:?}");
    };
    assert_eq!(stats.live_workers, 1);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn waiting_job_can_be_cancelled_over_the_wire() {
    // No workers: the job can never leave the queue.
    let cluster = TestCluster::start(0, "round-robin").await;

    let job_id = cluster
        .coordinator
        .submit("echo", Vec::new(), 0)
        .await
        .unwrap();

    let conn = Connection::open(
        cluster.coordinator.local_addr().to_string(),
        Arc::new(JsonCodec::default()),
        Default::default(),
        0,
        None,
    );
    conn.wait_connected(Duration::from_secs(5)).await.unwrap();

    let reply = conn.request(Message::CancelJob { job_id }).await.unwrap();
    assert_eq!(
        reply,
        Message::CancelAck {
            job_id,
            cancelled: true
        }
    );

    let job = cluster.coordinator.job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);

    // Cancelling again is a no-op.
    let reply = conn.request(Message::CancelJob { job_id }).await.unwrap();
    assert_eq!(
        reply,
        Message::CancelAck {
            job_id,
            cancelled: false
        }
    );
}

#[tokio::test]
async fn oversized_submission_is_rejected() {
    let cluster = TestCluster::start(1, "round-robin").await;
    let err = cluster
        .coordinator
        .submit("echo", vec![0u8; 2 * 1024 * 1024], 0)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exceeds"));
}
