//! Issue intake loop: discovers labelled issues, applies the trigger gate,
//! and asks the supervisor for implement dispatches.
//!
//! The decision is a pure function (`plan_issue_actions`) over a per-issue
//! snapshot; `tick` only assembles snapshots and executes the planned
//! actions, so every intake rule is testable without gh.

use std::time::Duration;

use tracing::{debug, info, warn};

use swarm_core::{SwarmConfig, WorkItem, WorkItemStatus};
use swarm_git::implement_branch_name;
use swarm_github::{GithubClient, IssueSummary};

use crate::shutdown::ShutdownFlag;
use crate::skills::discover_skills;
use crate::store::StoreHandle;
use crate::supervisor::{AgentPool, SupervisorError};

const ISSUE_LIST_LIMIT: u32 = 50;
const BACKOFF_CAP: Duration = Duration::from_secs(600);

#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Github(#[from] swarm_github::GithubError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// What a tick did, for logs and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub discovered: usize,
    pub seeded_pr_created: usize,
    pub dispatched: usize,
    pub reopened: usize,
}

/// Everything the planner may consult about one listed issue. Snapshot
/// assembly probes the hosting service only for the fields the decision on
/// this issue can actually reach (see [`IssuePoller::snapshot_issue`]).
#[derive(Debug, Clone, Default)]
pub struct IssueSnapshot {
    pub number: i64,
    pub tracked: Option<WorkItem>,
    /// Open PR on the issue's `fix/issue-{N}` branch, when probed.
    pub open_pr: Option<i64>,
    /// Trigger-gate verdict, when probed. The gate itself treats an empty
    /// mention as always-triggered.
    pub triggered: bool,
}

/// One intake decision, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueAction {
    /// Insert the issue as pending, or refresh the tracked title/body
    /// snapshot of an existing row.
    Track,
    /// Brand-new issue whose branch already has an open PR: record it as
    /// `pr_created` for the PR monitor, never dispatch.
    SeedPrCreated { pr_number: i64 },
    /// Ask the supervisor for an implement agent.
    Dispatch,
    /// Resolved item whose PR turned out to be open again: put it back
    /// under monitoring.
    Reopen { pr_number: i64 },
}

/// The intake decision table. Pure: snapshot in, ordered actions out.
pub fn plan_issue_actions(snapshot: &IssueSnapshot, max_retries: u32) -> Vec<IssueAction> {
    let Some(item) = &snapshot.tracked else {
        if let Some(pr_number) = snapshot.open_pr {
            return vec![IssueAction::SeedPrCreated { pr_number }];
        }
        return if snapshot.triggered {
            vec![IssueAction::Track, IssueAction::Dispatch]
        } else {
            vec![IssueAction::Track]
        };
    };

    let mut actions = vec![IssueAction::Track];
    match item.status {
        WorkItemStatus::Pending if item.attempts < max_retries && snapshot.triggered => {
            actions.push(IssueAction::Dispatch);
        }
        WorkItemStatus::Resolved => {
            if let Some(pr_number) = snapshot.open_pr {
                actions.push(IssueAction::Reopen { pr_number });
            }
        }
        // At the attempt ceiling, active elsewhere, or escalated: the
        // snapshot refresh is all this tick may do.
        _ => {}
    }
    actions
}

/// Consecutive-error backoff: exponential on the poll interval, capped.
pub fn backoff_delay(consecutive_errors: u32, base: Duration) -> Duration {
    let factor = 2u64.saturating_pow(consecutive_errors.saturating_sub(1).min(16));
    base.saturating_mul(factor as u32).min(BACKOFF_CAP)
}

pub struct IssuePoller {
    config: SwarmConfig,
    store: StoreHandle,
    github: GithubClient,
    pool: AgentPool,
}

impl IssuePoller {
    pub fn new(
        config: SwarmConfig,
        store: StoreHandle,
        github: GithubClient,
        pool: AgentPool,
    ) -> Self {
        Self {
            config,
            store,
            github,
            pool,
        }
    }

    /// Blocking loop; returns when shutdown is requested.
    pub fn run(&self, shutdown: &ShutdownFlag) {
        info!(
            interval_secs = self.config.poll_interval_seconds,
            "issue poller started"
        );
        let interval = Duration::from_secs(self.config.poll_interval_seconds);
        let mut consecutive_errors: u32 = 0;

        while !shutdown.is_set() {
            match self.tick() {
                Ok(summary) => {
                    consecutive_errors = 0;
                    debug!(?summary, "issue poll tick complete");
                    shutdown.wait(interval);
                }
                Err(err) => {
                    consecutive_errors += 1;
                    warn!(
                        error = %err,
                        consecutive = consecutive_errors,
                        "issue poll tick failed"
                    );
                    shutdown.wait(backoff_delay(consecutive_errors, interval));
                }
            }
        }
        info!("issue poller stopped");
    }

    /// One poll cycle: list labelled issues, plan each, execute the plan.
    pub fn tick(&self) -> Result<PollSummary, PollerError> {
        let issues = self
            .github
            .list_open_issues(&self.config.issue_label, ISSUE_LIST_LIMIT)?;
        debug!(
            count = issues.len(),
            label = %self.config.issue_label,
            "polled open issues"
        );

        let skills = if self.config.skills_enabled {
            discover_skills(&self.config.skills_dir)
        } else {
            Vec::new()
        };

        let mut summary = PollSummary {
            discovered: issues.len(),
            ..Default::default()
        };

        for issue in &issues {
            let snapshot = self.snapshot_issue(issue)?;
            for action in plan_issue_actions(&snapshot, self.config.max_issue_retries) {
                self.execute(issue, action, &skills, &mut summary)?;
            }
        }

        Ok(summary)
    }

    /// Assemble the planner's view of one issue. The two hosting-service
    /// probes are conditional on the store state, mirroring the branches of
    /// `plan_issue_actions` that can consume them: the PR probe matters for
    /// untracked and resolved items, the trigger probe for items that could
    /// be dispatched this tick.
    fn snapshot_issue(&self, issue: &IssueSummary) -> Result<IssueSnapshot, PollerError> {
        let tracked = self.store.with(|s| s.work_item(issue.number))?;

        let wants_pr_probe = match &tracked {
            None => true,
            Some(item) => item.status == WorkItemStatus::Resolved,
        };
        let open_pr = if wants_pr_probe {
            let branch = implement_branch_name(issue.number);
            self.github.find_open_pr_for_branch(&branch).unwrap_or(None)
        } else {
            None
        };

        let wants_trigger_probe = match &tracked {
            None => open_pr.is_none(),
            Some(item) => {
                item.status == WorkItemStatus::Pending
                    && item.attempts < self.config.max_issue_retries
            }
        };
        let triggered = wants_trigger_probe
            && self
                .github
                .issue_has_trigger(issue.number, &self.config.trigger_mention)?;

        Ok(IssueSnapshot {
            number: issue.number,
            tracked,
            open_pr,
            triggered,
        })
    }

    fn execute(
        &self,
        issue: &IssueSummary,
        action: IssueAction,
        skills: &[String],
        summary: &mut PollSummary,
    ) -> Result<(), PollerError> {
        match action {
            IssueAction::Track => {
                self.store
                    .with(|s| s.upsert_work_item(issue.number, &issue.title, &issue.body))?;
            }
            IssueAction::SeedPrCreated { pr_number } => {
                info!(
                    issue = issue.number,
                    pr = pr_number,
                    "existing open PR found, seeding as pr_created"
                );
                self.store.with(|s| {
                    s.seed_work_item_pr_created(issue.number, &issue.title, &issue.body, pr_number)
                })?;
                summary.seeded_pr_created += 1;
            }
            IssueAction::Dispatch => {
                match self.pool.dispatch_implement(issue.number, skills)? {
                    Some(agent_id) => {
                        info!(issue = issue.number, agent = %agent_id, "implement agent dispatched");
                        summary.dispatched += 1;
                    }
                    None => debug!(issue = issue.number, "dispatch deferred"),
                }
            }
            IssueAction::Reopen { pr_number } => {
                warn!(
                    issue = issue.number,
                    pr = pr_number,
                    "resolved item has an open PR again, reopening for monitoring"
                );
                self.store
                    .with(|s| s.reopen_for_monitoring(issue.number, pr_number))?;
                summary.reopened += 1;
            }
        }
        Ok(())
    }
}
