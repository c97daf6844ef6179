//! JSON view models for the dashboard endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use swarm_core::{AgentRun, ReviewIteration};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRunView {
    pub agent_id: String,
    pub issue_number: i64,
    pub pr_number: Option<i64>,
    pub kind: String,
    pub status: String,
    pub turns_used: u32,
    pub resume_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: i64,
    pub error_message: Option<String>,
}

impl From<&AgentRun> for AgentRunView {
    fn from(run: &AgentRun) -> Self {
        let end = run.finished_at.unwrap_or_else(Utc::now);
        Self {
            agent_id: run.agent_id.to_string(),
            issue_number: run.work_item_number,
            pr_number: run.pr_number,
            kind: run.kind.to_string(),
            status: run.status.to_string(),
            turns_used: run.turns_used,
            resume_count: run.resume_count,
            started_at: run.started_at,
            finished_at: run.finished_at,
            elapsed_seconds: (end - run.started_at).num_seconds().max(0),
            error_message: run.error_message.clone(),
        }
    }
}

/// Per-PR roll-up of its review iterations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrView {
    pub pr_number: i64,
    pub iterations: u32,
    pub latest_status: String,
    pub total_comments: u32,
}

/// Group iteration rows (ordered by pr, iteration) into one view per PR.
pub fn group_pr_views(iterations: &[ReviewIteration]) -> Vec<PrView> {
    let mut views: Vec<PrView> = Vec::new();
    for iteration in iterations {
        match views.last_mut() {
            Some(view) if view.pr_number == iteration.pr_number => {
                view.iterations = view.iterations.max(iteration.iteration);
                view.latest_status = iteration.status.to_string();
                view.total_comments += iteration.comments_count;
            }
            _ => views.push(PrView {
                pr_number: iteration.pr_number,
                iterations: iteration.iteration,
                latest_status: iteration.status.to_string(),
                total_comments: iteration.comments_count,
            }),
        }
    }
    views
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use swarm_core::{AgentId, AgentKind, AgentRunStatus, ReviewIterationStatus};

    fn iteration(pr: i64, n: u32, comments: u32, status: ReviewIterationStatus) -> ReviewIteration {
        ReviewIteration {
            id: 0,
            pr_number: pr,
            iteration: n,
            comments_count: comments,
            comments_json: None,
            agent_id: None,
            status,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn group_pr_views_rolls_up_per_pr() {
        let iterations = vec![
            iteration(99, 1, 3, ReviewIterationStatus::Fixed),
            iteration(99, 2, 1, ReviewIterationStatus::Fixing),
            iteration(100, 1, 2, ReviewIterationStatus::Pending),
        ];
        let views = group_pr_views(&iterations);
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].pr_number, 99);
        assert_eq!(views[0].iterations, 2);
        assert_eq!(views[0].latest_status, "fixing");
        assert_eq!(views[0].total_comments, 4);
        assert_eq!(views[1].pr_number, 100);
        assert_eq!(views[1].iterations, 1);
    }

    #[test]
    fn group_pr_views_handles_empty_input() {
        assert!(group_pr_views(&[]).is_empty());
    }

    #[test]
    fn agent_run_view_reports_elapsed_for_finished_runs() {
        let started = Utc::now() - chrono::Duration::seconds(90);
        let run = AgentRun {
            agent_id: AgentId::new("a-1"),
            work_item_number: 7,
            pr_number: Some(55),
            kind: AgentKind::Implement,
            status: AgentRunStatus::Completed,
            worktree_path: None,
            branch_name: None,
            pid: None,
            session_id: None,
            resume_count: 0,
            rate_limited_at: None,
            turns_used: 9,
            started_at: started,
            finished_at: Some(started + chrono::Duration::seconds(60)),
            error_message: None,
        };
        let view = AgentRunView::from(&run);
        assert_eq!(view.elapsed_seconds, 60);
        assert_eq!(view.kind, "implement");
        assert_eq!(view.status, "completed");
    }
}
