//! Integration tests that run real processes through the sandbox.
//!
//! Everything here uses POSIX utilities (/bin/cat, /bin/sh, /bin/sleep)
//! so the tests run on any Linux host without a toolchain installed.

use arbiter::sandbox::{
    ExecStatus, ExecutionLimits, ExecutionSpec, Sandbox, TRUNCATION_MARKER,
};

fn work_dir() -> tempfile::TempDir {
    tempfile::Builder::new().prefix("sandbox-test-").tempdir().unwrap()
}

#[tokio::test]
async fn cat_echoes_stdin() {
    let dir = work_dir();
    let spec = ExecutionSpec::new(dir.path())
        .with_argv(["/bin/cat"])
        .with_stdin("hello sandbox\n");

    let report = Sandbox::new().execute(&spec).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.status, ExecStatus::Exited(0));
    assert_eq!(report.stdout, "hello sandbox\n");
    assert!(report.stderr.is_empty());
    assert!(!report.timed_out);
    assert!(!report.oom_killed);
}

#[tokio::test]
async fn work_dir_files_are_staged_into_scratch() {
    let dir = work_dir();
    std::fs::write(dir.path().join("data.txt"), "staged content").unwrap();

    let spec = ExecutionSpec::new(dir.path()).with_argv(["/bin/cat", "data.txt"]);
    let report = Sandbox::new().execute(&spec).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.stdout, "staged content");
}

#[tokio::test]
async fn scratch_dir_is_removed_after_run() {
    let dir = work_dir();
    let scratch_root = work_dir();

    let spec = ExecutionSpec::new(dir.path()).with_argv(["/bin/true"]);
    let sandbox = Sandbox::new().with_scratch_root(scratch_root.path());
    sandbox.execute(&spec).await.unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(scratch_root.path())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(leftovers.is_empty(), "scratch dir leaked: {:?}", leftovers);
}

#[tokio::test]
async fn wall_clock_deadline_kills_sleepers() {
    let dir = work_dir();
    let spec = ExecutionSpec::new(dir.path())
        .with_argv(["/bin/sleep", "30"])
        .with_limits(ExecutionLimits {
            time_ms: 300,
            memory_kb: 65_536,
        });

    let report = Sandbox::new().execute(&spec).await.unwrap();

    assert_eq!(report.status, ExecStatus::TimeLimitExceeded);
    assert!(report.timed_out);
    // Killed around the deadline, nowhere near the sleep duration.
    assert!(report.wall_time_ms < 5_000, "took {}ms", report.wall_time_ms);
}

#[tokio::test]
async fn allocation_past_the_limit_is_memory_limit_exceeded() {
    let dir = work_dir();
    // Doubling a shell variable with builtins only: no forks, memory
    // grows geometrically until the address-space cap stops it. Peak RSS
    // is well past the configured limit by then, whatever exit path the
    // shell takes, so the classification must be the memory verdict and
    // not the runtime error the failed allocation produces.
    let spec = ExecutionSpec::new(dir.path())
        .with_argv([
            "/bin/sh",
            "-c",
            "s=x; i=0; while [ $i -lt 26 ]; do s=$s$s; i=$((i+1)); done; echo done",
        ])
        .with_limits(ExecutionLimits {
            time_ms: 10_000,
            memory_kb: 32_768,
        });

    let report = Sandbox::new().execute(&spec).await.unwrap();

    assert_eq!(report.status, ExecStatus::MemoryLimitExceeded);
    assert!(report.oom_killed);
    assert!(!report.is_success());
    assert!(
        report.peak_memory_kb > 32_768,
        "peak {}KB not past the limit",
        report.peak_memory_kb
    );
}

#[tokio::test]
async fn nonzero_exit_is_reported() {
    let dir = work_dir();
    let spec = ExecutionSpec::new(dir.path()).with_argv(["/bin/sh", "-c", "exit 7"]);

    let report = Sandbox::new().execute(&spec).await.unwrap();

    assert_eq!(report.status, ExecStatus::Exited(7));
    assert_eq!(report.exit_code, 7);
    assert!(!report.is_success());
}

#[tokio::test]
async fn output_beyond_cap_is_truncated() {
    let dir = work_dir();
    let spec = ExecutionSpec::new(dir.path()).with_argv([
        "/bin/sh",
        "-c",
        "i=0; while [ $i -lt 5000 ]; do echo aaaaaaaaaaaaaaaa; i=$((i+1)); done",
    ]);

    let cap = 1024;
    let report = Sandbox::new()
        .with_output_cap(cap)
        .execute(&spec)
        .await
        .unwrap();

    assert!(report.is_success());
    assert!(report.stdout_truncated);
    assert!(report.stdout.ends_with(TRUNCATION_MARKER));
    assert!(report.stdout.len() <= cap + TRUNCATION_MARKER.len());
}

#[tokio::test]
async fn stdout_and_stderr_are_captured_separately() {
    let dir = work_dir();
    let spec = ExecutionSpec::new(dir.path()).with_argv([
        "/bin/sh",
        "-c",
        "echo to-stdout; echo to-stderr 1>&2",
    ]);

    let report = Sandbox::new().execute(&spec).await.unwrap();

    assert_eq!(report.stdout, "to-stdout\n");
    assert_eq!(report.stderr, "to-stderr\n");
}

#[tokio::test]
async fn empty_argv_is_rejected() {
    let dir = work_dir();
    let spec = ExecutionSpec::new(dir.path());
    assert!(Sandbox::new().execute(&spec).await.is_err());
}

#[tokio::test]
async fn files_written_in_scratch_copy_back_when_requested() {
    let dir = work_dir();
    let spec = ExecutionSpec::new(dir.path())
        .with_argv(["/bin/sh", "-c", "echo artifact > out.bin"])
        .with_copy_out(true);

    let report = Sandbox::new().execute(&spec).await.unwrap();

    assert!(report.is_success());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("out.bin")).unwrap(),
        "artifact\n"
    );
}
