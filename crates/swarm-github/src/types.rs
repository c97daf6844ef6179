//! Typed views over gh CLI JSON output.

use serde::{Deserialize, Serialize};

/// An open issue as returned by `gh issue list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueSummary {
    pub number: i64,
    pub title: String,
    #[serde(default)]
    pub body: String,
}

/// One comment inside a review thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadComment {
    pub author: String,
    pub body: String,
}

/// An unresolved review thread, normalized from GraphQL (or synthesized from
/// REST comments on fallback).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewThread {
    pub path: String,
    pub line: Option<i64>,
    pub comments: Vec<ThreadComment>,
}

/// One CI check from `gh pr checks --json name,state,bucket`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub bucket: String,
}

/// Normalized CI verdict for a PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    /// No checks reported yet, or at least one still running.
    Pending,
    /// All checks terminal and green.
    Passed,
    /// At least one check failed or errored.
    Failed,
}

pub fn normalize_ci_status(checks: &[CheckRun]) -> CiStatus {
    if checks.is_empty() {
        return CiStatus::Pending;
    }
    if checks
        .iter()
        .any(|c| c.state.eq_ignore_ascii_case("PENDING") || c.bucket.eq_ignore_ascii_case("pending"))
    {
        return CiStatus::Pending;
    }
    if checks.iter().any(|c| {
        c.bucket.eq_ignore_ascii_case("fail")
            || c.state.eq_ignore_ascii_case("FAILURE")
            || c.state.eq_ignore_ascii_case("ERROR")
    }) {
        return CiStatus::Failed;
    }
    CiStatus::Passed
}
