//! The read seam between the HTTP handlers and the daemon's state store.

use swarm_core::{AgentEventRecord, AgentRun, MetricsSnapshot, ReviewIteration, WorkItem};

#[derive(Debug, Clone, thiserror::Error)]
#[error("store query failed: {0}")]
pub struct QueryError(pub String);

/// Read-only view the dashboard needs. The daemon implements this over its
/// SQLite store; handlers run the calls on the blocking pool.
pub trait DashboardStore: Send + Sync + 'static {
    fn metrics(&self) -> Result<MetricsSnapshot, QueryError>;
    fn agent_runs(&self) -> Result<Vec<AgentRun>, QueryError>;
    fn agent_events(&self, agent_id: &str, since_id: i64) -> Result<Vec<AgentEventRecord>, QueryError>;
    fn work_items(&self) -> Result<Vec<WorkItem>, QueryError>;
    fn review_iterations(&self) -> Result<Vec<ReviewIteration>, QueryError>;
}
