use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout, Duration};
use tracing::{error, info, warn};

use arbiter::orchestrator::judge;
use arbiter::queue::{JobAcker, JobQueue};
use arbiter::reporter::{ReportError, ResultReporter};
use arbiter::sandbox::Sandbox;
use arbiter::verdict::JudgeReport;
use arbiter::{init_languages, SubmissionJob, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("arbiter=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = Arc::new(WorkerConfig::from_env());

    init_languages()?;
    info!("Loaded language configurations");

    info!("Starting judge worker...");
    let mut queue = JobQueue::connect(&config.redis_url).await?;
    let worker_id = queue.worker_id();

    let recovered = queue.recover_orphans().await?;
    if recovered > 0 {
        info!("Requeued {} orphaned job(s)", recovered);
    }

    let reporter = Arc::new(
        ResultReporter::connect(&config.redis_url, &config.result_channel).await?,
    );
    let sandbox = Arc::new(Sandbox::new().with_output_cap(config.caps.output_cap_bytes));
    let permits = Arc::new(Semaphore::new(config.prefetch));

    info!(worker_id, prefetch = config.prefetch, "Waiting for jobs...");

    tokio::select! {
        res = consume_loop(&mut queue, permits, sandbox, reporter, config) => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

/// Pull payloads forever, at most `prefetch` in flight at once.
async fn consume_loop(
    queue: &mut JobQueue,
    permits: Arc<Semaphore>,
    sandbox: Arc<Sandbox>,
    reporter: Arc<ResultReporter>,
    config: Arc<WorkerConfig>,
) -> Result<()> {
    loop {
        let permit = permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow::anyhow!("worker semaphore closed"))?;
        let payload = queue.pop().await?;
        let acker = queue.acker();

        let sandbox = sandbox.clone();
        let reporter = reporter.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let _permit = permit;
            handle_payload(payload, sandbox, reporter, config, acker).await;
        });
    }
}

async fn handle_payload(
    payload: String,
    sandbox: Arc<Sandbox>,
    reporter: Arc<ResultReporter>,
    config: Arc<WorkerConfig>,
    acker: JobAcker,
) {
    let Some(report) = judge_payload(&payload, &sandbox, &config).await else {
        // Unparseable payload without even a job id: nothing to report
        // against, so drop it rather than redeliver forever.
        if let Err(e) = acker.ack(&payload).await {
            warn!("Failed to drop malformed payload: {}", e);
        }
        return;
    };

    match reporter.report(&report).await {
        Ok(()) => {}
        Err(ReportError::DuplicateTerminalReport { .. }) => {
            // Already logged by the reporter; the stored verdict stands.
        }
        Err(e) => {
            // Not persisted: leave the payload in the processing list so
            // orphan recovery redelivers it.
            error!(job_id = %report.job_id, "Failed to store judge result: {}", e);
            return;
        }
    }

    if let Err(e) = acker.ack(&payload).await {
        warn!(job_id = %report.job_id, "Failed to acknowledge job: {}", e);
    }
}

/// Judge one payload to a terminal report.
///
/// Infrastructure errors are retried up to the configured attempt count
/// with exponential backoff, then collapsed into a system-error report.
/// `None` means the payload could not be parsed and carries no job id.
async fn judge_payload(
    payload: &str,
    sandbox: &Sandbox,
    config: &WorkerConfig,
) -> Option<JudgeReport> {
    let job: SubmissionJob = match serde_json::from_str(payload) {
        Ok(job) => job,
        Err(e) => {
            let job_id = serde_json::from_str::<serde_json::Value>(payload)
                .ok()
                .and_then(|v| v.get("job_id")?.as_str().map(str::to_string));
            return match job_id {
                Some(id) => {
                    warn!(job_id = %id, "Malformed job payload: {}", e);
                    Some(JudgeReport::system_error(&id, format!("malformed job: {}", e)))
                }
                None => {
                    warn!("Unparseable job payload without job_id: {}", e);
                    None
                }
            };
        }
    };

    info!(job_id = %job.job_id, language = %job.language, "Received judge job");

    let budget = Duration::from_millis(job.wall_budget_ms(&config.caps));
    let mut last_err = None;
    for attempt in 1..=config.max_attempts {
        match timeout(budget, judge(sandbox, &config.caps, &job)).await {
            Ok(Ok(report)) => return Some(report),
            Ok(Err(e)) => {
                warn!(
                    job_id = %job.job_id,
                    attempt,
                    "Judging attempt failed: {:#}",
                    e
                );
                last_err = Some(format!("{:#}", e));
            }
            Err(_) => {
                warn!(
                    job_id = %job.job_id,
                    attempt,
                    "Job exceeded its wall-clock ceiling of {:?}",
                    budget
                );
                last_err = Some(format!("job exceeded wall-clock ceiling of {:?}", budget));
            }
        }

        if attempt < config.max_attempts {
            sleep(config.retry_backoff * 2u32.saturating_pow(attempt - 1)).await;
        }
    }

    let reason = last_err.unwrap_or_else(|| "judging failed".to_string());
    error!(job_id = %job.job_id, "Giving up on job: {}", reason);
    Some(JudgeReport::system_error(&job.job_id, reason))
}
