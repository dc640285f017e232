//! Sandboxed code execution and judging worker.
//!
//! Pulls submission jobs from a Redis queue, compiles and runs each one
//! against its test cases inside a resource-limited process sandbox, and
//! reports a terminal verdict back through Redis.

pub mod comparator;
pub mod config;
pub mod job;
pub mod languages;
pub mod orchestrator;
pub mod queue;
pub mod reporter;
pub mod sandbox;
pub mod verdict;

pub use comparator::{outputs_match, ComparisonPolicy};
pub use config::{JudgeCaps, WorkerConfig};
pub use job::{SubmissionJob, TestCase};
pub use languages::{init_languages, Language};
pub use orchestrator::judge;
pub use queue::{JobAcker, JobQueue};
pub use reporter::{ReportError, ResultReporter};
pub use sandbox::{ExecutionLimits, ExecutionSpec, RunReport, Runner, Sandbox};
pub use verdict::{JudgeReport, Status, TestReport};
