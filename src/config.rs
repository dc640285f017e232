//! Worker configuration, loaded from the environment.

use std::time::Duration;

use tracing::warn;

/// System-wide caps and budgets applied to every job.
#[derive(Debug, Clone)]
pub struct JudgeCaps {
    /// Largest per-test time limit a job may request, in ms.
    pub max_time_limit_ms: u64,
    /// Largest per-test memory limit a job may request, in KB.
    pub max_memory_limit_kb: u64,
    /// Largest accepted source blob, in bytes.
    pub max_source_bytes: usize,
    pub max_test_cases: usize,
    /// Compile phase budget (separate from the per-test limits).
    pub compile_time_limit_ms: u64,
    pub compile_memory_limit_kb: u64,
    /// Hard ceiling on one job's total wall time, in ms.
    pub max_job_wall_ms: u64,
    /// Captured stdout/stderr are truncated beyond this many bytes.
    pub output_cap_bytes: usize,
}

impl Default for JudgeCaps {
    fn default() -> Self {
        Self {
            max_time_limit_ms: 10_000,
            max_memory_limit_kb: 1_048_576, // 1 GB
            max_source_bytes: 256 * 1024,
            max_test_cases: 200,
            compile_time_limit_ms: 30_000,
            compile_memory_limit_kb: 2_097_152, // 2 GB
            max_job_wall_ms: 120_000,
            output_cap_bytes: 10 * 1024 * 1024, // 10 MB
        }
    }
}

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    /// In-flight jobs per worker process (bounds concurrent sandboxes).
    pub prefetch: usize,
    /// Attempts per job on infrastructure failure before giving up.
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub retry_backoff: Duration,
    /// Pub/sub channel the reporter notifies, injected at construction.
    pub result_channel: String,
    pub caps: JudgeCaps,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());

        let prefetch = env_parse("JUDGE_PREFETCH", 2usize).clamp(1, 4);
        let max_attempts = env_parse("JUDGE_MAX_ATTEMPTS", 3u32).max(1);
        let retry_backoff = Duration::from_millis(env_parse("JUDGE_RETRY_BACKOFF_MS", 500u64));
        let result_channel =
            std::env::var("JUDGE_RESULT_CHANNEL").unwrap_or_else(|_| "judge:results".into());

        Self {
            redis_url,
            prefetch,
            max_attempts,
            retry_backoff,
            result_channel,
            caps: JudgeCaps::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Invalid value for {}: {:?}, using default", name, raw);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let caps = JudgeCaps::default();
        assert!(caps.max_time_limit_ms > 0);
        assert!(caps.compile_time_limit_ms >= caps.max_time_limit_ms);
        assert!(caps.max_job_wall_ms > caps.max_time_limit_ms);
        assert_eq!(caps.output_cap_bytes, 10 * 1024 * 1024);
    }
}
