//! Judging orchestrator.
//!
//! Drives one submission through `Queued -> Compiling -> Running(i) ->
//! Aggregating -> Done`. Infrastructure failures (scratch dir creation,
//! missing toolchain binary) propagate as errors for the queue consumer's
//! retry logic; everything attributable to the submitted program becomes
//! a judged status and is never retried.

use std::fmt;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::comparator::outputs_match;
use crate::config::JudgeCaps;
use crate::job::{SubmissionJob, TestCase};
use crate::languages::{self, CompileSpec};
use crate::sandbox::{ExecStatus, ExecutionLimits, ExecutionSpec, RunReport, Runner};
use crate::verdict::{aggregate, ExecutionResult, JudgeReport, Status};

/// Where the state machine currently is; logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Compiling,
    Running(usize),
    Aggregating,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Queued => write!(f, "queued"),
            Phase::Compiling => write!(f, "compiling"),
            Phase::Running(i) => write!(f, "running({})", i),
            Phase::Aggregating => write!(f, "aggregating"),
        }
    }
}

/// Judge one submission to a terminal report.
///
/// `Ok` carries a terminal report, including compilation errors and
/// fail-fast configuration errors. `Err` means infrastructure failed and
/// the job is retryable.
pub async fn judge<R: Runner + ?Sized>(
    runner: &R,
    caps: &JudgeCaps,
    job: &SubmissionJob,
) -> Result<JudgeReport> {
    let mut phase = Phase::Queued;
    debug!(job_id = %job.job_id, phase = %phase, "Judging started");

    if let Err(reason) = job.validate(caps) {
        warn!(job_id = %job.job_id, %reason, "Rejecting invalid job");
        return Ok(JudgeReport::system_error(&job.job_id, reason));
    }

    let lang = languages::spec(job.language).context("language table not initialized")?;

    // Staging dir owned by this job alone: source, then compile artifacts.
    // Each sandbox invocation stages these files into its own scratch dir.
    let staging = tempfile::Builder::new()
        .prefix("judge-job-")
        .tempdir()
        .context("failed to create staging directory")?;
    tokio::fs::write(staging.path().join(&lang.source_file), &job.code)
        .await
        .context("failed to write source file")?;

    // One empty input keeps a trial run without tests meaningful.
    let fallback_case;
    let cases: &[TestCase] = if job.is_trial_run && job.test_cases.is_empty() {
        fallback_case = [TestCase {
            input: String::new(),
            expected: String::new(),
            explanation: None,
            hidden: false,
        }];
        &fallback_case
    } else {
        &job.test_cases
    };
    let total = cases.len();

    if let Some(compile) = lang.compile_spec(staging.path()) {
        phase = Phase::Compiling;
        debug!(job_id = %job.job_id, phase = %phase, "Compiling submission");

        if let Some(output) = compile_submission(runner, caps, &compile).await? {
            info!(job_id = %job.job_id, verdict = %Status::CompilationError, "Compilation failed");
            return Ok(JudgeReport::compilation_error(&job.job_id, total, output));
        }
    }

    let time_ms = lang.adjusted_time_ms(job.time_limit_ms);
    let memory_kb = lang.adjusted_memory_kb(job.memory_limit_kb);

    let mut results = Vec::with_capacity(total);
    for (index, case) in cases.iter().enumerate() {
        phase = Phase::Running(index);
        debug!(job_id = %job.job_id, phase = %phase, "Running test case");

        let run_spec = lang.run_spec(staging.path());
        let exec = ExecutionSpec::new(staging.path())
            .with_argv(run_spec.argv)
            .with_env(run_spec.env)
            .with_limits(ExecutionLimits { time_ms, memory_kb })
            .with_stdin(case.input.clone());

        let run = runner
            .run(&exec)
            .await
            .with_context(|| format!("execution of test {} failed", index))?;

        let status = classify(job, case, &run);
        results.push(ExecutionResult {
            status,
            wall_time_ms: run.wall_time_ms,
            cpu_time_ms: run.cpu_time_ms,
            peak_memory_kb: run.peak_memory_kb,
            // Hidden tests never leak program output into the report.
            stdout: if case.hidden { String::new() } else { run.stdout },
            stderr: run.stderr,
            exit_code: run.exit_code,
        });

        if status != Status::Accepted && !job.run_all_tests {
            break;
        }
    }

    phase = Phase::Aggregating;
    debug!(job_id = %job.job_id, phase = %phase, "Aggregating results");
    let report = aggregate(&job.job_id, &results, total);

    info!(
        job_id = %job.job_id,
        verdict = %report.status,
        passed = report.passed,
        total = report.total,
        max_time_ms = report.max_time_ms,
        max_memory_kb = report.max_memory_kb,
        "Judging finished"
    );
    Ok(report)
}

/// Run the compile step. `Ok(Some(output))` is a compilation failure
/// with the compiler's output; `Ok(None)` means the artifact is ready.
async fn compile_submission<R: Runner + ?Sized>(
    runner: &R,
    caps: &JudgeCaps,
    compile: &CompileSpec,
) -> Result<Option<String>> {
    let exec = ExecutionSpec::new(&compile.dir)
        .with_argv(compile.argv.clone())
        .with_limits(ExecutionLimits {
            time_ms: caps.compile_time_limit_ms,
            memory_kb: caps.compile_memory_limit_kb,
        })
        .with_copy_out(true);

    let run = runner.run(&exec).await.context("compile step failed")?;

    if !run.is_success() {
        return Ok(Some(compile_output(&run)));
    }

    if let Some(artifact) = &compile.artifact {
        if !compile.dir.join(artifact).exists() {
            return Ok(Some(format!(
                "compiler exited successfully but produced no {}",
                artifact
            )));
        }
    }

    Ok(None)
}

fn compile_output(run: &RunReport) -> String {
    if !run.stderr.is_empty() {
        run.stderr.clone()
    } else if !run.stdout.is_empty() {
        run.stdout.clone()
    } else {
        match run.status {
            ExecStatus::TimeLimitExceeded => "compilation timed out".to_string(),
            ExecStatus::MemoryLimitExceeded => "compiler ran out of memory".to_string(),
            ExecStatus::Signaled(sig) => format!("compiler killed by signal {}", sig),
            ExecStatus::Exited(code) => format!("compilation failed with exit code {}", code),
        }
    }
}

/// Map a raw run report to a judged status for one test case.
fn classify(job: &SubmissionJob, case: &TestCase, run: &RunReport) -> Status {
    match run.status {
        ExecStatus::TimeLimitExceeded => Status::TimeLimitExceeded,
        ExecStatus::MemoryLimitExceeded => Status::MemoryLimitExceeded,
        ExecStatus::Signaled(_) => Status::RuntimeError,
        ExecStatus::Exited(0) => {
            // A trial run is never graded against expected output.
            if job.is_trial_run || outputs_match(&run.stdout, &case.expected, job.comparison) {
                Status::Accepted
            } else {
                Status::WrongAnswer
            }
        }
        ExecStatus::Exited(_) => Status::RuntimeError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_report(status: ExecStatus, stdout: &str) -> RunReport {
        RunReport {
            status,
            exit_code: match status {
                ExecStatus::Exited(code) => code,
                _ => -1,
            },
            stdout: stdout.into(),
            stderr: String::new(),
            wall_time_ms: 5,
            cpu_time_ms: 5,
            peak_memory_kb: 100,
            timed_out: matches!(status, ExecStatus::TimeLimitExceeded),
            oom_killed: matches!(status, ExecStatus::MemoryLimitExceeded),
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    fn graded_job() -> SubmissionJob {
        serde_json::from_str(
            r#"{
                "job_id": "j",
                "code": "print(2)",
                "language": "python",
                "test_cases": [{"input": "", "expected": "2"}],
                "time_limit_ms": 1000,
                "memory_limit_kb": 65536
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn classify_grades_output_on_clean_exit() {
        let job = graded_job();
        let case = &job.test_cases[0];
        assert_eq!(
            classify(&job, case, &run_report(ExecStatus::Exited(0), "2\n")),
            Status::Accepted
        );
        assert_eq!(
            classify(&job, case, &run_report(ExecStatus::Exited(0), "3\n")),
            Status::WrongAnswer
        );
    }

    #[test]
    fn classify_maps_raw_statuses() {
        let job = graded_job();
        let case = &job.test_cases[0];
        assert_eq!(
            classify(&job, case, &run_report(ExecStatus::Exited(7), "")),
            Status::RuntimeError
        );
        assert_eq!(
            classify(&job, case, &run_report(ExecStatus::Signaled(11), "")),
            Status::RuntimeError
        );
        assert_eq!(
            classify(&job, case, &run_report(ExecStatus::TimeLimitExceeded, "")),
            Status::TimeLimitExceeded
        );
        assert_eq!(
            classify(&job, case, &run_report(ExecStatus::MemoryLimitExceeded, "")),
            Status::MemoryLimitExceeded
        );
    }

    #[test]
    fn trial_run_never_grades_output() {
        let mut job = graded_job();
        job.is_trial_run = true;
        let case = &job.test_cases[0];
        assert_eq!(
            classify(&job, case, &run_report(ExecStatus::Exited(0), "anything")),
            Status::Accepted
        );
    }
}
