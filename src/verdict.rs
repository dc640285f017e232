//! Verdict statuses, per-test execution results and the aggregation rule.
//!
//! Aggregation is a pure function over an ordered list of execution
//! results so it can be tested without touching a sandbox.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal status of one test case or of a whole submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    CompilationError,
    SystemError,
    /// Test was never run because an earlier test failed under early exit.
    Skipped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Accepted => "accepted",
            Status::WrongAnswer => "wrong_answer",
            Status::TimeLimitExceeded => "time_limit_exceeded",
            Status::MemoryLimitExceeded => "memory_limit_exceeded",
            Status::RuntimeError => "runtime_error",
            Status::CompilationError => "compilation_error",
            Status::SystemError => "system_error",
            Status::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of running the submitted program against one test case.
///
/// Appended to an ordered list by the orchestrator and never mutated
/// after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: Status,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub peak_memory_kb: u64,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Per-test entry in the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub index: usize,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wall_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_memory_kb: Option<u64>,
    /// Program output preview (bounded), only for non-hidden tests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Maximum size of the per-test output preview carried in a report.
const OUTPUT_PREVIEW_CHARS: usize = 4096;

/// The aggregated judgement for one submission. Terminal: a rejudge
/// produces a new report for a new job, never recomputes this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeReport {
    pub job_id: String,
    pub status: Status,
    pub total: usize,
    pub passed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_failed: Option<usize>,
    /// Max wall time across passed tests, in milliseconds.
    pub max_time_ms: u64,
    /// Max peak memory across passed tests, in KB.
    pub max_memory_kb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub tests: Vec<TestReport>,
}

impl JudgeReport {
    /// Report for a submission that failed to compile. No tests were run.
    pub fn compilation_error(job_id: &str, total: usize, compile_output: String) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: Status::CompilationError,
            total,
            passed: 0,
            first_failed: None,
            max_time_ms: 0,
            max_memory_kb: 0,
            compile_output: Some(compile_output),
            error_message: None,
            tests: Vec::new(),
        }
    }

    /// Terminal report for an infrastructure or configuration failure.
    pub fn system_error(job_id: &str, reason: String) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: Status::SystemError,
            total: 0,
            passed: 0,
            first_failed: None,
            max_time_ms: 0,
            max_memory_kb: 0,
            compile_output: None,
            error_message: Some(reason),
            tests: Vec::new(),
        }
    }
}

/// Aggregate an ordered list of execution results into a final report.
///
/// Overall status is `Accepted` iff every one of `total` tests was run and
/// accepted; otherwise it is the status of the first failing result in
/// index order. Tests beyond `results.len()` were skipped under early
/// exit and are reported as such. Max time/memory are taken over passed
/// tests only.
pub fn aggregate(job_id: &str, results: &[ExecutionResult], total: usize) -> JudgeReport {
    debug_assert!(results.len() <= total);

    let mut passed = 0usize;
    let mut first_failed = None;
    let mut max_time_ms = 0u64;
    let mut max_memory_kb = 0u64;
    let mut tests = Vec::with_capacity(total);

    for (index, res) in results.iter().enumerate() {
        if res.status == Status::Accepted {
            passed += 1;
            max_time_ms = max_time_ms.max(res.wall_time_ms);
            max_memory_kb = max_memory_kb.max(res.peak_memory_kb);
        } else if first_failed.is_none() {
            first_failed = Some(index);
        }

        let output = if res.stdout.is_empty() {
            None
        } else {
            Some(res.stdout.chars().take(OUTPUT_PREVIEW_CHARS).collect())
        };

        tests.push(TestReport {
            index,
            status: res.status,
            wall_time_ms: Some(res.wall_time_ms),
            peak_memory_kb: Some(res.peak_memory_kb),
            output,
        });
    }

    for index in results.len()..total {
        tests.push(TestReport {
            index,
            status: Status::Skipped,
            wall_time_ms: None,
            peak_memory_kb: None,
            output: None,
        });
    }

    let status = match first_failed {
        None if passed == total => Status::Accepted,
        // All executed tests passed but some were never run: only possible
        // when the caller aborted the job, which it reports separately.
        None => Status::SystemError,
        Some(i) => results[i].status,
    };

    JudgeReport {
        job_id: job_id.to_string(),
        status,
        total,
        passed,
        first_failed,
        max_time_ms,
        max_memory_kb,
        compile_output: None,
        error_message: None,
        tests,
    }
}
