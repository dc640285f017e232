//! Process-supervision sandbox.
//!
//! Runs one command in a fresh scratch directory with rlimit ceilings, a
//! wall-clock deadline enforced by killing the whole process group, and
//! rusage-based time/memory measurement. The sandbox does NOT:
//! - Interpret verdicts (that's the orchestrator's job)
//! - Know about languages or compilation
//! - Compare outputs
//!
//! Commands are structured argv lists spawned directly, never through a
//! shell, so user-controlled filenames and content cannot inject.

use std::io::{Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::fs;
use tracing::debug;
use wait4::Wait4;

/// Marker appended to captured output that hit the capture cap.
pub const TRUNCATION_MARKER: &str = "\n...[output truncated]";

/// Default bound on captured stdout/stderr, per stream.
pub const DEFAULT_OUTPUT_CAP: usize = 10 * 1024 * 1024;

const MAX_PROCESSES: u64 = 64;
const MAX_FILE_SIZE_KB: u64 = 262_144;

/// Resource limits for one execution.
#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    /// Wall-clock and CPU limit in milliseconds.
    pub time_ms: u64,
    /// Peak resident memory limit in KB.
    pub memory_kb: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            time_ms: 1000,
            memory_kb: 262_144,
        }
    }
}

/// One command to run inside the sandbox.
#[derive(Debug, Clone)]
pub struct ExecutionSpec {
    /// Host directory whose files are staged into the scratch dir.
    pub work_dir: PathBuf,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub limits: ExecutionLimits,
    pub stdin: Option<String>,
    /// Copy files the command produced back into `work_dir` (compile
    /// artifacts survive the scratch dir this way).
    pub copy_out: bool,
}

impl ExecutionSpec {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            argv: Vec::new(),
            env: Vec::new(),
            limits: ExecutionLimits::default(),
            stdin: None,
            copy_out: false,
        }
    }

    pub fn with_argv(mut self, argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.argv = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env = env.into_iter().collect();
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_copy_out(mut self, copy_out: bool) -> Self {
        self.copy_out = copy_out;
        self
    }
}

/// Raw execution status, before any verdict interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// Program exited normally with the given exit code.
    Exited(i32),
    /// Killed by a signal (crash).
    Signaled(i32),
    TimeLimitExceeded,
    MemoryLimitExceeded,
}

/// What happened when one command was run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: ExecStatus,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub peak_memory_kb: u64,
    pub timed_out: bool,
    pub oom_killed: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecStatus::Exited(0))
    }
}

/// Abstraction over execution so the orchestrator can be driven by a
/// scripted runner in tests.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, spec: &ExecutionSpec) -> Result<RunReport>;
}

/// The production sandbox.
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    /// Where scratch dirs are created; system temp dir when unset.
    scratch_root: Option<PathBuf>,
    /// Per-stream output capture bound; `DEFAULT_OUTPUT_CAP` when unset.
    output_cap: Option<usize>,
}

impl Sandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn with_output_cap(mut self, cap: usize) -> Self {
        self.output_cap = Some(cap);
        self
    }

    /// Run one command to completion inside a fresh scratch directory.
    ///
    /// The scratch dir is uniquely named, never shared between
    /// invocations, and removed on every exit path (the `TempDir` guard
    /// drops even when the supervisor fails).
    pub async fn execute(&self, spec: &ExecutionSpec) -> Result<RunReport> {
        if spec.argv.is_empty() {
            anyhow::bail!("no command specified for execution");
        }

        let scratch = match &self.scratch_root {
            Some(root) => tempfile::Builder::new().prefix("judge-box-").tempdir_in(root),
            None => tempfile::Builder::new().prefix("judge-box-").tempdir(),
        }
        .context("failed to create scratch directory")?;

        copy_dir_files(&spec.work_dir, scratch.path()).await?;

        debug!(argv = ?spec.argv, scratch = %scratch.path().display(), "Spawning sandboxed command");

        let supervised = Supervised {
            dir: scratch.path().to_path_buf(),
            argv: spec.argv.clone(),
            env: spec.env.clone(),
            limits: spec.limits.clone(),
            stdin: spec.stdin.clone(),
            output_cap: self.output_cap.unwrap_or(DEFAULT_OUTPUT_CAP),
        };

        let report = tokio::task::spawn_blocking(move || supervise(supervised))
            .await
            .context("sandbox supervisor panicked")??;

        if spec.copy_out {
            copy_dir_files(scratch.path(), &spec.work_dir).await?;
        }

        drop(scratch);
        Ok(report)
    }
}

#[async_trait]
impl Runner for Sandbox {
    async fn run(&self, spec: &ExecutionSpec) -> Result<RunReport> {
        self.execute(spec).await
    }
}

struct Supervised {
    dir: PathBuf,
    argv: Vec<String>,
    env: Vec<(String, String)>,
    limits: ExecutionLimits,
    stdin: Option<String>,
    output_cap: usize,
}

/// Blocking side: spawn, enforce the deadline, reap with rusage.
fn supervise(spec: Supervised) -> Result<RunReport> {
    let time_ms = spec.limits.time_ms;
    let memory_kb = spec.limits.memory_kb;

    let mut cmd = Command::new(&spec.argv[0]);
    cmd.args(&spec.argv[1..])
        .current_dir(&spec.dir)
        .env_clear()
        .env("PATH", "/usr/local/bin:/usr/bin:/bin")
        .env("HOME", &spec.dir)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Own process group, so the deadline kill reaches descendants.
        .process_group(0);

    let cpu_secs = time_ms / 1000 + 1;
    // Address-space cap at twice the limit: allocations fail inside the
    // program while maxrss can still exceed the limit and be classified.
    let as_bytes = memory_kb.saturating_mul(2048);
    unsafe {
        cmd.pre_exec(move || {
            let apply = |res, limit| {
                setrlimit(res, limit, limit)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            };
            apply(Resource::RLIMIT_CPU, cpu_secs)?;
            apply(Resource::RLIMIT_AS, as_bytes)?;
            apply(Resource::RLIMIT_FSIZE, MAX_FILE_SIZE_KB * 1024)?;
            apply(Resource::RLIMIT_NPROC, MAX_PROCESSES)?;
            apply(Resource::RLIMIT_CORE, 0)?;
            Ok(())
        });
    }

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", spec.argv[0]))?;
    let pid = child.id() as i32;

    // Deadline killer. The pid could in principle be reused by a future
    // process, so the notifier disables the killer on normal exit.
    let timed_out = Arc::new(AtomicBool::new(false));
    let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
    let killer_flag = Arc::clone(&timed_out);
    std::thread::spawn(move || {
        if cancel_rx.recv_timeout(Duration::from_millis(time_ms)).is_err() {
            killer_flag.store(true, Ordering::SeqCst);
            let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
        }
    });

    // EPIPE here just means the program never read its input.
    let stdin_thread = child.stdin.take().map(|mut pipe| {
        let input = spec.stdin.unwrap_or_default();
        std::thread::spawn(move || {
            let _ = pipe.write_all(input.as_bytes());
        })
    });

    let cap = spec.output_cap;
    let stdout_pipe = child.stdout.take().context("child stdout not captured")?;
    let stderr_pipe = child.stderr.take().context("child stderr not captured")?;
    let stdout_thread = std::thread::spawn(move || read_capped(stdout_pipe, cap));
    let stderr_thread = std::thread::spawn(move || read_capped(stderr_pipe, cap));

    let reaped = child.wait4().context("failed to wait for child")?;
    let wall_time_ms = start.elapsed().as_millis() as u64;
    let _ = cancel_tx.send(());

    if let Some(handle) = stdin_thread {
        let _ = handle.join();
    }
    let (stdout_bytes, stdout_truncated) = stdout_thread
        .join()
        .unwrap_or_else(|_| (Vec::new(), false));
    let (stderr_bytes, stderr_truncated) = stderr_thread
        .join()
        .unwrap_or_else(|_| (Vec::new(), false));

    let cpu_time_ms =
        (reaped.rusage.utime.as_millis() + reaped.rusage.stime.as_millis()) as u64;
    // wait4 reports maxrss in bytes.
    let peak_memory_kb = reaped.rusage.maxrss / 1024;

    let exit_code = reaped.status.code().unwrap_or(-1);
    let signal = reaped.status.signal();
    let timed_out = timed_out.load(Ordering::SeqCst) || cpu_time_ms > time_ms;
    let oom_killed = peak_memory_kb > memory_kb;

    let status = if timed_out {
        ExecStatus::TimeLimitExceeded
    } else if oom_killed {
        ExecStatus::MemoryLimitExceeded
    } else if let Some(sig) = signal {
        ExecStatus::Signaled(sig)
    } else {
        ExecStatus::Exited(exit_code)
    };

    Ok(RunReport {
        status,
        exit_code,
        stdout: into_capped_string(stdout_bytes, stdout_truncated),
        stderr: into_capped_string(stderr_bytes, stderr_truncated),
        wall_time_ms,
        cpu_time_ms,
        peak_memory_kb,
        timed_out,
        oom_killed,
        stdout_truncated,
        stderr_truncated,
    })
}

/// Read a pipe to EOF, keeping at most `cap` bytes. Excess is drained
/// and dropped so the child never blocks on a full pipe.
fn read_capped<R: Read>(mut reader: R, cap: usize) -> (Vec<u8>, bool) {
    let mut out = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if out.len() < cap {
                    let take = n.min(cap - out.len());
                    out.extend_from_slice(&buf[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    (out, truncated)
}

fn into_capped_string(bytes: Vec<u8>, truncated: bool) -> String {
    let mut s = String::from_utf8_lossy(&bytes).into_owned();
    if truncated {
        s.push_str(TRUNCATION_MARKER);
    }
    s
}

/// Copy the regular files of `src` into `dst` (non-recursive, permissions
/// preserved). Subdirectories are deliberately not staged.
async fn copy_dir_files(src: &Path, dst: &Path) -> Result<()> {
    let mut entries = fs::read_dir(src)
        .await
        .with_context(|| format!("failed to read {:?}", src))?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.metadata().await?.is_dir() {
            continue;
        }
        let dest = dst.join(entry.file_name());
        if dest == entry.path() {
            continue;
        }
        fs::copy(entry.path(), &dest)
            .await
            .with_context(|| format!("failed to copy {:?} to {:?}", entry.path(), dest))?;
    }
    Ok(())
}
