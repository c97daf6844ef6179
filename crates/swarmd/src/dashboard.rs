//! Adapter exposing the state store to the dashboard crate.

use std::sync::Arc;

use swarm_core::{
    AgentEventRecord, AgentId, AgentRun, MetricsSnapshot, ReviewIteration, WorkItem,
};
use swarm_web::{DashboardStore, QueryError};

use crate::store::StoreHandle;
use crate::supervisor::RateLimitStats;

const LOGS_PAGE_LIMIT: u32 = 200;

/// Read view over the store plus the supervisor's signature-hit counter.
#[derive(Clone)]
pub struct DashboardData {
    store: StoreHandle,
    stats: Arc<RateLimitStats>,
}

impl DashboardData {
    pub fn new(store: StoreHandle, stats: Arc<RateLimitStats>) -> Self {
        Self { store, stats }
    }
}

impl DashboardStore for DashboardData {
    fn metrics(&self) -> Result<MetricsSnapshot, QueryError> {
        let mut snapshot = self
            .store
            .with(|s| s.metrics())
            .map_err(|err| QueryError(err.to_string()))?;
        snapshot.stderr_signature_hits = self.stats.stderr_hits();
        Ok(snapshot)
    }

    fn agent_runs(&self) -> Result<Vec<AgentRun>, QueryError> {
        self.store
            .with(|s| s.all_agent_runs())
            .map_err(|err| QueryError(err.to_string()))
    }

    fn agent_events(
        &self,
        agent_id: &str,
        since_id: i64,
    ) -> Result<Vec<AgentEventRecord>, QueryError> {
        self.store
            .with(|s| s.events_since(&AgentId::new(agent_id), since_id, LOGS_PAGE_LIMIT))
            .map_err(|err| QueryError(err.to_string()))
    }

    fn work_items(&self) -> Result<Vec<WorkItem>, QueryError> {
        self.store
            .with(|s| s.all_work_items())
            .map_err(|err| QueryError(err.to_string()))
    }

    fn review_iterations(&self) -> Result<Vec<ReviewIteration>, QueryError> {
        self.store
            .with(|s| s.all_review_iterations())
            .map_err(|err| QueryError(err.to_string()))
    }
}
