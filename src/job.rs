//! Submission job and test case types received from the queue.

use serde::{Deserialize, Serialize};

use crate::comparator::ComparisonPolicy;
use crate::config::JudgeCaps;
use crate::languages::Language;

/// One (input, expected-output) pair. Immutable once attached to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub hidden: bool,
}

/// Unit of work pulled from the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionJob {
    pub job_id: String,
    pub code: String,
    pub language: Language,
    pub test_cases: Vec<TestCase>,
    pub time_limit_ms: u64,
    pub memory_limit_kb: u64,
    /// Run-only mode: execute inputs, never grade the output.
    #[serde(default)]
    pub is_trial_run: bool,
    #[serde(default)]
    pub comparison: ComparisonPolicy,
    /// Disable early exit and report passed/failed counts for every test.
    #[serde(default)]
    pub run_all_tests: bool,
}

impl SubmissionJob {
    /// Fail-fast validation against the system-wide caps. A violation is
    /// a configuration error: reported as a system error, never retried,
    /// and nothing is executed.
    pub fn validate(&self, caps: &JudgeCaps) -> Result<(), String> {
        if self.job_id.is_empty() {
            return Err("job id is empty".into());
        }
        if self.code.is_empty() {
            return Err("source code is empty".into());
        }
        if self.code.len() > caps.max_source_bytes {
            return Err(format!(
                "source exceeds {} bytes",
                caps.max_source_bytes
            ));
        }
        if !self.is_trial_run && self.test_cases.is_empty() {
            return Err("graded submission has no test cases".into());
        }
        if self.test_cases.len() > caps.max_test_cases {
            return Err(format!(
                "too many test cases ({} > {})",
                self.test_cases.len(),
                caps.max_test_cases
            ));
        }
        if self.time_limit_ms == 0 || self.time_limit_ms > caps.max_time_limit_ms {
            return Err(format!(
                "time limit {}ms outside (0, {}]",
                self.time_limit_ms, caps.max_time_limit_ms
            ));
        }
        if self.memory_limit_kb == 0 || self.memory_limit_kb > caps.max_memory_limit_kb {
            return Err(format!(
                "memory limit {}KB outside (0, {}]",
                self.memory_limit_kb, caps.max_memory_limit_kb
            ));
        }
        Ok(())
    }

    /// Whole-job wall-clock ceiling enforced by the queue consumer,
    /// independently of the per-test timeouts inside the sandbox. Covers
    /// every test at a generous multiple of its limit plus the compile
    /// budget, capped by the system-wide maximum.
    pub fn wall_budget_ms(&self, caps: &JudgeCaps) -> u64 {
        let tests = self.test_cases.len() as u64;
        let budget = tests * self.time_limit_ms * 3 + caps.compile_time_limit_ms + 5_000;
        budget.min(caps.max_job_wall_ms)
    }
}
