//! Core types and configuration for the swarm orchestrator.

pub mod config;
pub mod state;
pub mod types;

pub use config::{ConfigError, SwarmConfig};
pub use state::{
    is_agent_transition_allowed, is_work_item_transition_allowed, AgentKind, AgentRunStatus,
    ReviewIterationStatus, WorkItemStatus,
};
pub use types::{
    fix_agent_id, implement_agent_id, resume_agent_id, AgentEventKind, AgentEventRecord, AgentId,
    AgentRun, MetricsSnapshot, ReviewIteration, WorkItem,
};
