//! Entity types shared across the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::state::{
    AgentKind, AgentRunStatus, ReviewIterationStatus, UnknownStatus, WorkItemStatus,
};

/// Opaque per-run identifier, e.g. `agent-issue-42-attempt-1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn implement_agent_id(issue_number: i64, attempt: u32) -> AgentId {
    AgentId(format!("agent-issue-{issue_number}-attempt-{attempt}"))
}

pub fn fix_agent_id(pr_number: i64, iteration: u32) -> AgentId {
    AgentId(format!("agent-fix-{pr_number}-iter-{iteration}"))
}

pub fn resume_agent_id(issue_number: i64, resume_count: u32) -> AgentId {
    AgentId(format!("agent-resume-{issue_number}-{resume_count}"))
}

/// An issue on the hosting service that is in scope for automation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub number: i64,
    pub title: String,
    pub body: String,
    pub status: WorkItemStatus,
    pub assigned_agent_id: Option<AgentId>,
    pub pr_number: Option<i64>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(number: i64, title: impl Into<String>, body: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            number,
            title: title.into(),
            body: body.into(),
            status: WorkItemStatus::Pending,
            assigned_agent_id: None,
            pr_number: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One invocation of the external agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRun {
    pub agent_id: AgentId,
    pub work_item_number: i64,
    pub pr_number: Option<i64>,
    pub kind: AgentKind,
    pub status: AgentRunStatus,
    pub worktree_path: Option<PathBuf>,
    pub branch_name: Option<String>,
    pub pid: Option<u32>,
    pub session_id: Option<String>,
    pub resume_count: u32,
    pub rate_limited_at: Option<DateTime<Utc>>,
    pub turns_used: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Taxonomy of the agent's stream-json events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEventKind {
    System,
    Assistant,
    ToolUse,
    User,
    Result,
    Error,
    RateLimitEvent,
}

impl AgentEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Assistant => "assistant",
            Self::ToolUse => "tool_use",
            Self::User => "user",
            Self::Result => "result",
            Self::Error => "error",
            Self::RateLimitEvent => "rate_limit_event",
        }
    }
}

impl fmt::Display for AgentEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentEventKind {
    type Err = UnknownStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "system" => Ok(Self::System),
            "assistant" => Ok(Self::Assistant),
            "tool_use" => Ok(Self::ToolUse),
            "user" => Ok(Self::User),
            "result" => Ok(Self::Result),
            "error" => Ok(Self::Error),
            "rate_limit_event" => Ok(Self::RateLimitEvent),
            other => Err(UnknownStatus {
                entity: "agent event",
                value: other.to_string(),
            }),
        }
    }
}

/// One stored stream-json event. The auto-incrementing `id` is the canonical
/// per-agent ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEventRecord {
    pub id: i64,
    pub agent_id: AgentId,
    pub kind: AgentEventKind,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

/// One observed cycle of the review-fix loop on a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewIteration {
    pub id: i64,
    pub pr_number: i64,
    pub iteration: u32,
    pub comments_count: u32,
    pub comments_json: Option<String>,
    pub agent_id: Option<AgentId>,
    pub status: ReviewIterationStatus,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counters served by `/api/metrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub active_agents: u64,
    pub total_issues: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub pr_created: u64,
    pub resolved: u64,
    pub needs_human: u64,
    pub avg_turns: f64,
    pub rate_limited: u64,
    pub stderr_signature_hits: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_work_item_starts_pending_with_zero_attempts() {
        let item = WorkItem::new(42, "Add endpoint", "plan body");
        assert_eq!(item.status, WorkItemStatus::Pending);
        assert_eq!(item.attempts, 0);
        assert!(item.assigned_agent_id.is_none());
        assert!(item.pr_number.is_none());
    }

    #[test]
    fn agent_id_formats_encode_kind_and_counter() {
        assert_eq!(implement_agent_id(42, 1).as_str(), "agent-issue-42-attempt-1");
        assert_eq!(fix_agent_id(99, 3).as_str(), "agent-fix-99-iter-3");
        assert_eq!(resume_agent_id(42, 2).as_str(), "agent-resume-42-2");
    }

    #[test]
    fn agent_event_kind_round_trips_and_serializes_snake_case() {
        for kind in [
            AgentEventKind::System,
            AgentEventKind::Assistant,
            AgentEventKind::ToolUse,
            AgentEventKind::User,
            AgentEventKind::Result,
            AgentEventKind::Error,
            AgentEventKind::RateLimitEvent,
        ] {
            assert_eq!(kind.as_str().parse::<AgentEventKind>().unwrap(), kind);
        }
        let json = serde_json::to_string(&AgentEventKind::RateLimitEvent).unwrap();
        assert_eq!(json, "\"rate_limit_event\"");
    }

    #[test]
    fn work_item_status_serializes_snake_case() {
        let json = serde_json::to_string(&WorkItemStatus::NeedsHuman).unwrap();
        assert_eq!(json, "\"needs_human\"");
    }
}
