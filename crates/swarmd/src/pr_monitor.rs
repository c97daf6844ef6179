//! PR review loop: polls open change proposals for unresolved review
//! threads and CI status, dispatches fix agents, and resolves work items
//! once the hosting service confirms the merge.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info, warn};

use swarm_core::{ReviewIterationStatus, SwarmConfig, WorkItemStatus};
use swarm_github::{fetch_thread_view, CiStatus, GithubClient, ThreadFidelity, ThreadView};

use crate::shutdown::ShutdownFlag;
use crate::skills::discover_skills;
use crate::store::StoreHandle;
use crate::supervisor::{AgentPool, SupervisorError};

const NEEDS_HUMAN_LABEL: &str = "needs-human";

#[derive(Debug, thiserror::Error)]
pub enum PrMonitorError {
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Github(#[from] swarm_github::GithubError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("serialization error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

/// Everything the decision needs, assembled by the tick.
#[derive(Debug, Clone)]
pub struct PrSnapshot {
    pub iterations: u32,
    pub fix_outstanding: bool,
    pub ci: CiStatus,
    pub fidelity: ThreadFidelity,
    pub unresolved_count: usize,
    /// Comment count seen at the last dispatch (heuristic fidelity only).
    pub last_seen_comments: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrAction {
    /// Iteration ceiling reached: label and escalate.
    Escalate,
    /// A fix agent is still working this PR.
    WaitForFix,
    /// CI has not finished and there is nothing new to fix.
    WaitForCi,
    /// New feedback or a CI failure: open an iteration and dispatch.
    DispatchFix { reason: String },
    /// Clean: ask the hosting service whether the PR is merged.
    CheckMerge,
}

/// The decision table. Pure so every branch is testable without gh.
pub fn plan_pr_action(snapshot: &PrSnapshot, max_fix_retries: u32) -> PrAction {
    if snapshot.iterations >= max_fix_retries {
        return PrAction::Escalate;
    }
    if snapshot.fix_outstanding {
        return PrAction::WaitForFix;
    }

    // On the heuristic path only a count increase is "new": re-dispatching on
    // a stale count would loop forever on already-addressed comments.
    let new_feedback = match snapshot.fidelity {
        ThreadFidelity::Resolved => snapshot.unresolved_count,
        ThreadFidelity::CommentHeuristic => {
            if snapshot.unresolved_count > snapshot.last_seen_comments {
                snapshot.unresolved_count
            } else {
                0
            }
        }
    };

    if snapshot.ci == CiStatus::Pending && new_feedback == 0 {
        return PrAction::WaitForCi;
    }
    if new_feedback > 0 || snapshot.ci == CiStatus::Failed {
        let mut reasons = Vec::new();
        if new_feedback > 0 {
            reasons.push(format!("{new_feedback} unresolved thread(s)"));
        }
        if snapshot.ci == CiStatus::Failed {
            reasons.push("CI failed".to_string());
        }
        return PrAction::DispatchFix {
            reason: reasons.join(", "),
        };
    }
    PrAction::CheckMerge
}

pub struct PrMonitor {
    config: SwarmConfig,
    store: StoreHandle,
    github: GithubClient,
    pool: AgentPool,
    /// pr_number -> comment count at last dispatch, REST-fallback memory.
    last_seen_comments: Mutex<HashMap<i64, usize>>,
}

impl PrMonitor {
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
            last_seen_comments: Mutex::new(HashMap::new()),
        }
    }

    /// Blocking loop; returns when shutdown is requested.
    pub fn run(&self, shutdown: &ShutdownFlag) {
        info!(
            interval_secs = self.config.pr_poll_interval_seconds,
            "PR monitor started"
        );
        let interval = Duration::from_secs(self.config.pr_poll_interval_seconds);
        while !shutdown.is_set() {
            if let Err(err) = self.tick() {
                warn!(error = %err, "PR monitor tick failed");
            }
            shutdown.wait(interval);
        }
        info!("PR monitor stopped");
    }

    /// Walk every work item awaiting review and act on its PR state.
    pub fn tick(&self) -> Result<(), PrMonitorError> {
        let items = self
            .store
            .with(|s| s.work_items_by_status(WorkItemStatus::PrCreated))?;

        for item in items {
            let Some(pr_number) = item.pr_number else {
                continue;
            };
            if let Err(err) = self.check_pr(item.number, pr_number) {
                warn!(
                    issue = item.number,
                    pr = pr_number,
                    error = %err,
                    "PR check failed, will retry next tick"
                );
            }
        }
        Ok(())
    }

    fn check_pr(&self, issue_number: i64, pr_number: i64) -> Result<(), PrMonitorError> {
        let iterations = self.store.with(|s| s.iteration_count(pr_number))?;
        let fix_outstanding = self
            .store
            .with(|s| s.has_running_fix_for_pr(pr_number))?;

        // Ceiling and outstanding-fix checks need no hosting-service calls.
        let mut snapshot = PrSnapshot {
            iterations,
            fix_outstanding,
            ci: CiStatus::Pending,
            fidelity: ThreadFidelity::Resolved,
            unresolved_count: 0,
            last_seen_comments: 0,
        };
        match plan_pr_action(&snapshot, self.config.max_pr_fix_retries) {
            PrAction::Escalate => return self.escalate(issue_number, pr_number),
            PrAction::WaitForFix => {
                debug!(pr = pr_number, "fix agent still running");
                return Ok(());
            }
            _ => {}
        }

        let checks = self.github.pr_checks(pr_number)?;
        snapshot.ci = swarm_github::normalize_ci_status(&checks);

        let view = fetch_thread_view(&self.github, pr_number)?;
        snapshot.fidelity = view.fidelity;
        snapshot.unresolved_count = view.count();
        snapshot.last_seen_comments = self
            .last_seen_comments
            .lock()
            .map(|seen| seen.get(&pr_number).copied().unwrap_or(0))
            .unwrap_or(0);

        match plan_pr_action(&snapshot, self.config.max_pr_fix_retries) {
            PrAction::Escalate | PrAction::WaitForFix => Ok(()),
            PrAction::WaitForCi => {
                debug!(pr = pr_number, "CI still running, waiting");
                Ok(())
            }
            PrAction::DispatchFix { reason } => {
                info!(
                    pr = pr_number,
                    iteration = snapshot.iterations + 1,
                    %reason,
                    "PR needs fixes, dispatching fix agent"
                );
                self.dispatch_fix(issue_number, pr_number, &snapshot, &view)
            }
            PrAction::CheckMerge => self.check_merge(issue_number, pr_number),
        }
    }

    fn dispatch_fix(
        &self,
        issue_number: i64,
        pr_number: i64,
        snapshot: &PrSnapshot,
        view: &ThreadView,
    ) -> Result<(), PrMonitorError> {
        let Some(branch) = self.github.pr_head_branch(pr_number)? else {
            warn!(pr = pr_number, "could not determine head branch");
            return Ok(());
        };

        // Reuse a pending iteration from an earlier deferred dispatch so the
        // sequence stays dense and bounded by the retry ceiling.
        let existing = self.store.with(|s| s.review_iterations(pr_number))?;
        let (iteration_id, iteration) = match existing.last() {
            Some(last)
                if last.status == ReviewIterationStatus::Pending && last.agent_id.is_none() =>
            {
                (last.id, last.iteration)
            }
            _ => {
                let iteration = snapshot.iterations + 1;
                let comments_json = serde_json::to_string(&view.threads)?;
                let id = self.store.with(|s| {
                    s.create_review_iteration(
                        pr_number,
                        iteration,
                        view.count() as u32,
                        Some(&comments_json),
                    )
                })?;
                (id, iteration)
            }
        };

        if snapshot.fidelity == ThreadFidelity::CommentHeuristic {
            if let Ok(mut seen) = self.last_seen_comments.lock() {
                seen.insert(pr_number, snapshot.unresolved_count);
            }
        }

        let skills = if self.config.skills_enabled {
            discover_skills(&self.config.skills_dir)
        } else {
            Vec::new()
        };

        // The heuristic view has no resolution state, so the agent is told to
        // fetch comments itself rather than trust a synthesized digest.
        let threads = match snapshot.fidelity {
            ThreadFidelity::Resolved => Some(view.threads.as_slice()),
            ThreadFidelity::CommentHeuristic => None,
        };

        match self.pool.dispatch_fix(
            pr_number,
            &branch,
            issue_number,
            iteration,
            threads,
            &skills,
        )? {
            Some(agent_id) => {
                self.store
                    .with(|s| s.link_fix_agent(iteration_id, &agent_id))?;
                info!(pr = pr_number, agent = %agent_id, "fix agent linked to iteration");
            }
            None => {
                debug!(pr = pr_number, "fix dispatch deferred, iteration stays pending");
            }
        }
        Ok(())
    }

    fn check_merge(&self, issue_number: i64, pr_number: i64) -> Result<(), PrMonitorError> {
        if self.github.pr_merged(pr_number)? {
            info!(issue = issue_number, pr = pr_number, "PR merged, resolving work item");
            self.store.with(|s| s.record_resolved(issue_number))?;
        } else {
            debug!(
                issue = issue_number,
                pr = pr_number,
                "clean but not merged yet, awaiting merge"
            );
        }
        Ok(())
    }

    fn escalate(&self, issue_number: i64, pr_number: i64) -> Result<(), PrMonitorError> {
        warn!(
            issue = issue_number,
            pr = pr_number,
            max = self.config.max_pr_fix_retries,
            "fix iteration ceiling reached, escalating"
        );
        self.store.with(|s| s.record_needs_human(issue_number))?;
        if let Err(err) = self
            .github
            .add_issue_label(issue_number, NEEDS_HUMAN_LABEL)
        {
            warn!(issue = issue_number, error = %err, "failed to apply escalation label");
        }
        Ok(())
    }
}
