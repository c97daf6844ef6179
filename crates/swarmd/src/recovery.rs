//! Startup reconciliation after a crash or restart.
//!
//! Agents are detached processes, so a run recorded as `running` may still
//! be alive. Live pids are left alone; dead ones are marked failed and their
//! work items handed back to the poller. Rate-limited runs keep their
//! worktrees untouched for the watcher.

use tracing::{info, warn};

use swarm_core::{AgentRunStatus, WorkItemStatus};
use swarm_git::WorktreeManager;

use crate::store::{StoreError, StoreHandle};

/// Summary of one recovery pass, mostly for logs and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub still_running: usize,
    pub orphans_failed: usize,
    pub items_requeued: usize,
    pub rate_limited_kept: usize,
}

pub fn recover_stale_agents(
    store: &StoreHandle,
    worktrees: &WorktreeManager,
    pid_alive: impl Fn(u32) -> bool,
) -> Result<RecoveryReport, StoreError> {
    let mut report = RecoveryReport::default();

    for run in store.with(|s| s.running_agents())? {
        if let Some(pid) = run.pid {
            if pid_alive(pid) {
                info!(
                    agent = %run.agent_id,
                    pid,
                    "agent survived restart, leaving it alone"
                );
                report.still_running += 1;
                continue;
            }
        }

        warn!(
            agent = %run.agent_id,
            pid = run.pid,
            "agent process is gone, marking run orphaned"
        );
        store.with(|s| {
            s.record_agent_status(&run.agent_id, AgentRunStatus::Failed, Some("orphaned"))
        })?;
        report.orphans_failed += 1;

        // Requeue only items that never got a PR; items with a PR stay under
        // the PR monitor.
        if let Some(item) = store.with(|s| s.work_item(run.work_item_number))? {
            if item.status == WorkItemStatus::InProgress && item.pr_number.is_none() {
                store.with(|s| s.reset_work_item_to_pending(item.number))?;
                report.items_requeued += 1;
            }
        }

        if let Some(path) = &run.worktree_path {
            if path.exists() {
                worktrees.cleanup(path);
            }
        }
    }

    let rate_limited = store.with(|s| s.rate_limited_agents())?;
    report.rate_limited_kept = rate_limited.len();
    if !rate_limited.is_empty() {
        info!(
            count = rate_limited.len(),
            "rate-limited agents found, the watcher will resume them"
        );
    }

    Ok(report)
}
