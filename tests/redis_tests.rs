//! Integration tests against a real Redis.
//!
//! Skipped unless JUDGE_TEST_REDIS_URL is set, e.g.
//! `JUDGE_TEST_REDIS_URL=redis://localhost:6379`. The instance must be
//! disposable; the tests write under the worker's key namespace.

use std::time::{SystemTime, UNIX_EPOCH};

use redis::AsyncCommands;

use arbiter::queue::{keys, JobQueue};
use arbiter::reporter::{ReportError, ResultReporter};
use arbiter::verdict::{aggregate, ExecutionResult, JudgeReport, Status};

fn redis_url() -> Option<String> {
    std::env::var("JUDGE_TEST_REDIS_URL").ok()
}

fn unique(tag: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{}-{}", tag, nanos)
}

fn accepted_report(job_id: &str, wall_ms: u64) -> JudgeReport {
    let results = vec![ExecutionResult {
        status: Status::Accepted,
        wall_time_ms: wall_ms,
        cpu_time_ms: wall_ms,
        peak_memory_kb: 1024 + wall_ms,
        stdout: "ok\n".into(),
        stderr: String::new(),
        exit_code: 0,
    }];
    aggregate(job_id, &results, 1)
}

#[tokio::test]
async fn terminal_reports_are_write_once() {
    let Some(url) = redis_url() else { return };
    let reporter = ResultReporter::connect(&url, "judge:results")
        .await
        .unwrap();
    let job_id = unique("report");

    let first = accepted_report(&job_id, 10);
    reporter.report(&first).await.unwrap();

    // Redelivery after a crash-before-ack: same outcome, new metrics.
    let rerun = accepted_report(&job_id, 42);
    reporter.report(&rerun).await.unwrap();

    // A different verdict for the same job must be refused.
    let conflicting = JudgeReport::system_error(&job_id, "disk died".into());
    match reporter.report(&conflicting).await {
        Err(ReportError::DuplicateTerminalReport { job_id: id }) => assert_eq!(id, job_id),
        other => panic!("expected a duplicate-report error, got {:?}", other.err()),
    }

    // The first report stands, untouched by either redelivery.
    let client = redis::Client::open(url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let stored: String = conn
        .get(format!("{}{}", keys::JUDGE_RESULT_PREFIX, job_id))
        .await
        .unwrap();
    let stored: JudgeReport = serde_json::from_str(&stored).unwrap();
    assert_eq!(stored.status, Status::Accepted);
    assert_eq!(stored.max_time_ms, 10);
}

#[tokio::test]
async fn unacked_delivery_survives_recovery_and_ack_is_final() {
    let Some(url) = redis_url() else { return };
    let mut queue = JobQueue::connect(&url).await.unwrap();
    let processing_key = format!("{}{}", keys::PROCESSING_PREFIX, queue.worker_id());
    let payload = format!("{{\"job_id\":\"{}\"}}", unique("ack"));

    let client = redis::Client::open(url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    conn.rpush::<_, _, ()>(keys::JUDGE_QUEUE, &payload)
        .await
        .unwrap();

    // Delivery parks the payload on the processing list.
    let delivered = queue.pop().await.unwrap();
    assert_eq!(delivered, payload);
    let parked: Vec<String> = conn.lrange(&processing_key, 0, -1).await.unwrap();
    assert!(parked.contains(&payload));

    // Never acked: recovery pushes it back onto the shared queue.
    let recovered = queue.recover_orphans().await.unwrap();
    assert_eq!(recovered, 1);

    let redelivered = queue.pop().await.unwrap();
    assert_eq!(redelivered, payload);

    // Acked after the (re)delivery is persisted: gone for good.
    queue.acker().ack(&payload).await.unwrap();
    let parked: Vec<String> = conn.lrange(&processing_key, 0, -1).await.unwrap();
    assert!(!parked.contains(&payload));
}
