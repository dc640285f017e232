//! Result reporter.
//!
//! Persists terminal reports under `judge:result:{job_id}` and publishes
//! them on the configured channel. Persistence uses SET NX so the
//! at-least-once queue can redeliver a job without overwriting its
//! verdict: a redelivery reaching the same outcome is a no-op, a
//! conflicting one is an error.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::{debug, error};

use crate::queue::keys;
use crate::verdict::JudgeReport;

/// How long stored reports live before expiring.
const RESULT_EXPIRY_SECS: u64 = 3600; // 1 hour

#[derive(Debug, Error)]
pub enum ReportError {
    /// A different terminal report is already stored for this job.
    /// Verdicts are write-once; this is logged, never resolved by overwrite.
    #[error("conflicting terminal report already stored for job {job_id}")]
    DuplicateTerminalReport { job_id: String },

    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Publishes judge reports to Redis. Clone-able; the underlying
/// connection manager reconnects on its own.
#[derive(Clone)]
pub struct ResultReporter {
    conn: ConnectionManager,
    channel: String,
}

impl ResultReporter {
    pub async fn connect(redis_url: &str, channel: &str) -> Result<Self, ReportError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            channel: channel.to_string(),
        })
    }

    /// Persist and publish one terminal report.
    ///
    /// Exactly one report wins per job. A redelivered job reaching the
    /// same outcome is acknowledged silently; a conflicting outcome means
    /// something upstream double-assigned the job ID.
    pub async fn report(&self, report: &JudgeReport) -> Result<(), ReportError> {
        let json = serde_json::to_string(report)?;
        let key = format!("{}{}", keys::JUDGE_RESULT_PREFIX, report.job_id);
        let mut conn = self.conn.clone();

        let stored: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&json)
            .arg("NX")
            .arg("EX")
            .arg(RESULT_EXPIRY_SECS as usize)
            .query_async(&mut conn)
            .await?;

        if stored.is_some() {
            debug!(job_id = %report.job_id, "Stored terminal report");
            // Ignore publish errors; there may be no subscribers and the
            // stored key is the source of truth for pollers.
            let _ = conn.publish::<_, _, ()>(&self.channel, &json).await;
            return Ok(());
        }

        let existing: Option<String> = conn.get(&key).await?;
        match existing {
            Some(prev) => match reconcile(&prev, report) {
                Reconciliation::Identical => {
                    debug!(job_id = %report.job_id, "Report already stored; redelivery no-op");
                    Ok(())
                }
                Reconciliation::Conflicting => {
                    error!(
                        job_id = %report.job_id,
                        "Refusing to overwrite existing terminal report with a different one"
                    );
                    Err(ReportError::DuplicateTerminalReport {
                        job_id: report.job_id.clone(),
                    })
                }
            },
            // Expired between the NX attempt and the read: store normally.
            None => {
                conn.set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
                    .await?;
                let _ = conn.publish::<_, _, ()>(&self.channel, &json).await;
                Ok(())
            }
        }
    }
}

/// What a redelivered report amounts to, judged against the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reconciliation {
    /// Same outcome; the redelivery is the expected recovery path.
    Identical,
    /// Different outcome for the same job ID.
    Conflicting,
}

fn reconcile(stored: &str, incoming: &JudgeReport) -> Reconciliation {
    match serde_json::from_str::<JudgeReport>(stored) {
        Ok(prev) if same_outcome(&prev, incoming) => Reconciliation::Identical,
        _ => Reconciliation::Conflicting,
    }
}

/// Outcome equality, ignoring measurements. A crash between persist and
/// ack means the job is judged again, and the rerun's wall times and
/// peak memory never reproduce exactly; only the verdict-bearing fields
/// decide whether the redelivery agrees with the stored report.
fn same_outcome(a: &JudgeReport, b: &JudgeReport) -> bool {
    a.job_id == b.job_id
        && a.status == b.status
        && a.total == b.total
        && a.passed == b.passed
        && a.first_failed == b.first_failed
        && a.compile_output == b.compile_output
        && a.tests.len() == b.tests.len()
        && a.tests
            .iter()
            .zip(&b.tests)
            .all(|(x, y)| x.index == y.index && x.status == y.status)
}
