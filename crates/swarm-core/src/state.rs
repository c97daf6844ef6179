//! Status enums and the transition guards that keep concurrent handlers safe.
//!
//! Every store write that moves a work item or agent run between statuses
//! checks these predicates inside the write, so two handlers racing on the
//! same row cannot both apply a transition.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    InProgress,
    PrCreated,
    Resolved,
    NeedsHuman,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::PrCreated => "pr_created",
            Self::Resolved => "resolved",
            Self::NeedsHuman => "needs_human",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::NeedsHuman)
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkItemStatus {
    type Err = UnknownStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "pr_created" => Ok(Self::PrCreated),
            "resolved" => Ok(Self::Resolved),
            "needs_human" => Ok(Self::NeedsHuman),
            other => Err(UnknownStatus {
                entity: "work item",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Running,
    Completed,
    Failed,
    Timeout,
    RateLimited,
    Resumed,
}

impl AgentRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Resumed => "resumed",
        }
    }

    /// A run in this status holds its work-item / PR exclusivity slot.
    /// Rate-limited runs keep the slot but release pool capacity.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::RateLimited)
    }
}

impl fmt::Display for AgentRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRunStatus {
    type Err = UnknownStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "rate_limited" => Ok(Self::RateLimited),
            "resumed" => Ok(Self::Resumed),
            other => Err(UnknownStatus {
                entity: "agent run",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Implement,
    FixReview,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implement => "implement",
            Self::FixReview => "fix_review",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = UnknownStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "implement" => Ok(Self::Implement),
            "fix_review" => Ok(Self::FixReview),
            other => Err(UnknownStatus {
                entity: "agent kind",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewIterationStatus {
    Pending,
    Fixing,
    Fixed,
    Failed,
}

impl ReviewIterationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fixing => "fixing",
            Self::Fixed => "fixed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ReviewIterationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewIterationStatus {
    type Err = UnknownStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "pending" => Ok(Self::Pending),
            "fixing" => Ok(Self::Fixing),
            "fixed" => Ok(Self::Fixed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatus {
                entity: "review iteration",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {entity} status: {value}")]
pub struct UnknownStatus {
    pub entity: &'static str,
    pub value: String,
}

pub fn is_work_item_transition_allowed(from: WorkItemStatus, to: WorkItemStatus) -> bool {
    use WorkItemStatus::*;

    if from == to {
        return true;
    }

    match (from, to) {
        (Pending, InProgress | PrCreated | NeedsHuman) => true,
        (InProgress, Pending | PrCreated | NeedsHuman) => true,
        (PrCreated, Resolved | NeedsHuman) => true,
        // A prematurely resolved item whose PR turns out to still be open
        // goes back under monitoring.
        (Resolved, PrCreated) => true,
        _ => false,
    }
}

pub fn is_agent_transition_allowed(from: AgentRunStatus, to: AgentRunStatus) -> bool {
    use AgentRunStatus::*;

    if from == to {
        return true;
    }

    match (from, to) {
        (Running, Completed | Failed | Timeout | RateLimited) => true,
        (RateLimited, Resumed | Failed) => true,
        _ => false,
    }
}
