//! Output comparison policies.
//!
//! The policy is a property of the problem and travels with the job.
//! `Tokenized` is the default: it tolerates line-ending and spacing
//! differences without accepting semantically different output.

use serde::{Deserialize, Serialize};

/// Equivalence policy for comparing actual vs expected output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonPolicy {
    /// Byte-for-byte equality.
    Exact,
    /// Equality after trimming leading/trailing whitespace from the blob.
    Trimmed,
    /// Equality of whitespace-separated token sequences.
    #[default]
    Tokenized,
}

/// Compare program output with the expected output under a policy.
pub fn outputs_match(actual: &str, expected: &str, policy: ComparisonPolicy) -> bool {
    match policy {
        ComparisonPolicy::Exact => actual == expected,
        ComparisonPolicy::Trimmed => actual.trim() == expected.trim(),
        ComparisonPolicy::Tokenized => actual.split_whitespace().eq(expected.split_whitespace()),
    }
}
