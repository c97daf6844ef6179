//! Agent pool supervisor: spawns and monitors agent subprocesses.
//!
//! Each live run owns three threads: a stdout reader feeding the event
//! store, a stderr scanner watching for rate-limit signatures, and a monitor
//! that enforces the wall-clock timeout and reaps completion. The monitor is
//! the only place terminal run status is decided; everything it decides goes
//! through the store's guarded transitions.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};

use swarm_agents::{
    is_rate_limit_failure, parse_stream_line, spawn_detached, terminate_gracefully, AgentCli,
    ParsedEvent, PrNumberSource,
};
use swarm_core::{
    fix_agent_id, implement_agent_id, resume_agent_id, AgentEventKind, AgentId, AgentKind,
    AgentRun, AgentRunStatus, ReviewIterationStatus, SwarmConfig, WorkItemStatus,
};
use swarm_git::{
    ensure_repo_updated, has_unpushed_commits, is_branch_pushed, push_branch, Git, GitError,
    WorktreeManager,
};
use swarm_github::{GithubClient, GithubError, ReviewThread};

use crate::prompts::{
    build_fix_review_prompt, build_implement_prompt, build_resume_fix_prompt,
    build_resume_implement_prompt, PromptContext,
};
use crate::store::{StoreError, StoreHandle};

const STDERR_EXCERPT_LIMIT: usize = 500;
const NEEDS_HUMAN_LABEL: &str = "needs-human";

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Github(#[from] GithubError),
    #[error("failed to spawn agent process: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
    #[error("work item not found: #{number}")]
    WorkItemNotFound { number: i64 },
}

/// Counter for stderr rate-limit signature hits, surfaced through metrics so
/// drift in the pattern list stays observable.
#[derive(Debug, Default)]
pub struct RateLimitStats {
    stderr_hits: AtomicU64,
}

impl RateLimitStats {
    pub fn record_stderr_hit(&self) {
        self.stderr_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stderr_hits(&self) -> u64 {
        self.stderr_hits.load(Ordering::Relaxed)
    }
}

/// Tunables that tests shrink; production uses the defaults.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub monitor_poll: Duration,
    pub kill_grace: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            monitor_poll: Duration::from_secs(5),
            kill_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
struct LiveAgent {
    kind: AgentKind,
    work_item_number: i64,
    pr_number: Option<i64>,
}

struct PoolShared {
    config: SwarmConfig,
    store: StoreHandle,
    github: GithubClient,
    git: Git,
    worktrees: WorktreeManager,
    cli: AgentCli,
    stats: Arc<RateLimitStats>,
    options: PoolOptions,
    live: Mutex<HashMap<String, LiveAgent>>,
}

/// Owns every live agent handle. All other components reach agent state
/// through the store only.
#[derive(Clone)]
pub struct AgentPool {
    shared: Arc<PoolShared>,
}

impl AgentPool {
    pub fn new(
        config: SwarmConfig,
        store: StoreHandle,
        github: GithubClient,
        cli: AgentCli,
        stats: Arc<RateLimitStats>,
        options: PoolOptions,
    ) -> Self {
        let git = Git::default();
        let worktrees = WorktreeManager::new(
            git.clone(),
            config.target_repo_path.clone(),
            config.worktree_dir.clone(),
        );
        Self {
            shared: Arc::new(PoolShared {
                config,
                store,
                github,
                git,
                worktrees,
                cli,
                stats,
                options,
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn can_dispatch(&self) -> Result<bool, SupervisorError> {
        let running = self.shared.store.with(|store| store.running_count())?;
        Ok((running as usize) < self.shared.config.max_concurrent_agents)
    }

    /// Number of runs this pool is currently tracking in-process.
    pub fn live_count(&self) -> usize {
        self.shared.live.lock().map(|live| live.len()).unwrap_or(0)
    }

    /// Dispatch an implement agent for a pending work item. Returns `None`
    /// when capacity or exclusivity defers the dispatch to a later tick.
    pub fn dispatch_implement(
        &self,
        issue_number: i64,
        skills: &[String],
    ) -> Result<Option<AgentId>, SupervisorError> {
        let shared = &self.shared;

        if !self.can_dispatch()? {
            warn!(issue = issue_number, "agent pool full, deferring dispatch");
            return Ok(None);
        }
        if shared
            .store
            .with(|store| store.active_run_for_work_item(issue_number))?
            .is_some()
        {
            return Ok(None);
        }
        let item = shared
            .store
            .with(|store| store.work_item(issue_number))?
            .ok_or(SupervisorError::WorkItemNotFound {
                number: issue_number,
            })?;
        if item.status != WorkItemStatus::Pending
            || item.attempts >= shared.config.max_issue_retries
        {
            return Ok(None);
        }

        let agent_id = implement_agent_id(issue_number, item.attempts + 1);

        ensure_repo_updated(
            &shared.git,
            &shared.config.target_repo_path,
            &shared.config.base_branch,
        )?;
        let worktree = shared
            .worktrees
            .create_for_implement(issue_number, &shared.config.base_branch)?;

        if let Err(err) = shared
            .store
            .with(|store| store.claim_work_item(issue_number, &agent_id))
        {
            shared.worktrees.cleanup(&worktree.path);
            return match err {
                StoreError::ClaimConflict { .. } => Ok(None),
                other => Err(other.into()),
            };
        }

        let ctx = PromptContext {
            repo_slug: &shared.config.github_repo,
            skills,
        };
        let prompt = build_implement_prompt(&ctx, issue_number);
        let command = shared.cli.work_command(&prompt);

        let child = match spawn_detached(&command, &worktree.path, &shared.child_env()) {
            Ok(child) => child,
            Err(source) => {
                error!(issue = issue_number, error = %source, "agent spawn failed");
                shared.worktrees.cleanup(&worktree.path);
                // The dispatch concluded without a run; attempts were already
                // counted by the claim.
                shared.conclude_implement_failure(issue_number)?;
                return Err(SupervisorError::Spawn { source });
            }
        };

        let run = AgentRun {
            agent_id: agent_id.clone(),
            work_item_number: issue_number,
            pr_number: None,
            kind: AgentKind::Implement,
            status: AgentRunStatus::Running,
            worktree_path: Some(worktree.path.clone()),
            branch_name: Some(worktree.branch.clone()),
            pid: Some(child.id()),
            session_id: None,
            resume_count: 0,
            rate_limited_at: None,
            turns_used: 0,
            started_at: Utc::now(),
            finished_at: None,
            error_message: None,
        };
        shared.store.with(|store| store.record_agent_started(&run))?;

        info!(agent = %agent_id, issue = issue_number, pid = child.id(), "dispatched implement agent");
        launch_threads(&self.shared, run, child);
        Ok(Some(agent_id))
    }

    /// Dispatch a fix agent for a review iteration that the PR monitor just
    /// opened. Returns `None` when the pool is full.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch_fix(
        &self,
        pr_number: i64,
        branch: &str,
        issue_number: i64,
        iteration: u32,
        threads: Option<&[ReviewThread]>,
        skills: &[String],
    ) -> Result<Option<AgentId>, SupervisorError> {
        let shared = &self.shared;

        if !self.can_dispatch()? {
            warn!(pr = pr_number, "agent pool full, deferring fix dispatch");
            return Ok(None);
        }
        if shared
            .store
            .with(|store| store.has_running_fix_for_pr(pr_number))?
        {
            return Ok(None);
        }

        let agent_id = fix_agent_id(pr_number, iteration);

        ensure_repo_updated(
            &shared.git,
            &shared.config.target_repo_path,
            &shared.config.base_branch,
        )?;
        let worktree = shared.worktrees.create_for_fix(pr_number, branch)?;

        let ctx = PromptContext {
            repo_slug: &shared.config.github_repo,
            skills,
        };
        let prompt = build_fix_review_prompt(&ctx, pr_number, threads);
        let command = shared.cli.work_command(&prompt);

        let child = match spawn_detached(&command, &worktree.path, &shared.child_env()) {
            Ok(child) => child,
            Err(source) => {
                error!(pr = pr_number, error = %source, "fix agent spawn failed");
                shared.worktrees.cleanup(&worktree.path);
                return Err(SupervisorError::Spawn { source });
            }
        };

        let run = AgentRun {
            agent_id: agent_id.clone(),
            work_item_number: issue_number,
            pr_number: Some(pr_number),
            kind: AgentKind::FixReview,
            status: AgentRunStatus::Running,
            worktree_path: Some(worktree.path.clone()),
            branch_name: Some(branch.to_string()),
            pid: Some(child.id()),
            session_id: None,
            resume_count: 0,
            rate_limited_at: None,
            turns_used: 0,
            started_at: Utc::now(),
            finished_at: None,
            error_message: None,
        };
        shared.store.with(|store| store.record_agent_started(&run))?;

        info!(agent = %agent_id, pr = pr_number, pid = child.id(), "dispatched fix agent");
        launch_threads(&self.shared, run, child);
        Ok(Some(agent_id))
    }

    /// Resume a rate-limited run in its preserved worktree. Returns `None`
    /// when deferred (pool full) or when the run was concluded instead
    /// (resume ceiling hit, worktree lost).
    pub fn resume_rate_limited(
        &self,
        run: &AgentRun,
        skills: &[String],
    ) -> Result<Option<AgentId>, SupervisorError> {
        let shared = &self.shared;

        if !self.can_dispatch()? {
            info!(agent = %run.agent_id, "pool full, deferring rate-limit resume");
            return Ok(None);
        }

        let next_resume = run.resume_count + 1;
        if next_resume > shared.config.max_rate_limit_resumes {
            warn!(
                agent = %run.agent_id,
                resumes = run.resume_count,
                "resume ceiling reached, giving up on run"
            );
            shared.store.with(|store| {
                store.record_agent_status(
                    &run.agent_id,
                    AgentRunStatus::Failed,
                    Some("exceeded max rate-limit resumes"),
                )
            })?;
            shared.conclude_abandoned_run(run)?;
            return Ok(None);
        }

        let Some(worktree_path) = run.worktree_path.clone().filter(|path| path.exists()) else {
            error!(agent = %run.agent_id, "worktree lost during rate-limit wait");
            shared.store.with(|store| {
                store.record_agent_status(
                    &run.agent_id,
                    AgentRunStatus::Failed,
                    Some("worktree lost during rate-limit wait"),
                )
            })?;
            shared.conclude_abandoned_run(run)?;
            return Ok(None);
        };

        let ctx = PromptContext {
            repo_slug: &shared.config.github_repo,
            skills,
        };
        let prompt = match run.kind {
            AgentKind::Implement => build_resume_implement_prompt(&ctx, run.work_item_number),
            AgentKind::FixReview => {
                // Freshest review state at resume time.
                let threads = run
                    .pr_number
                    .and_then(|pr| shared.github.unresolved_threads(pr).ok());
                build_resume_fix_prompt(&ctx, run.pr_number.unwrap_or_default(), threads.as_deref())
            }
        };
        let command = shared
            .cli
            .resume_command(&prompt, run.session_id.as_deref());

        let child = spawn_detached(&command, &worktree_path, &shared.child_env())
            .map_err(|source| SupervisorError::Spawn { source })?;

        let new_agent_id = resume_agent_id(run.work_item_number, next_resume);

        shared.store.with(|store| {
            store.record_agent_status(&run.agent_id, AgentRunStatus::Resumed, None)
        })?;
        let successor = AgentRun {
            agent_id: new_agent_id.clone(),
            work_item_number: run.work_item_number,
            pr_number: run.pr_number,
            kind: run.kind,
            status: AgentRunStatus::Running,
            worktree_path: Some(worktree_path),
            branch_name: run.branch_name.clone(),
            pid: Some(child.id()),
            session_id: None,
            resume_count: next_resume,
            rate_limited_at: None,
            turns_used: 0,
            started_at: Utc::now(),
            finished_at: None,
            error_message: None,
        };
        shared
            .store
            .with(|store| store.record_agent_started(&successor))?;
        shared
            .store
            .with(|store| store.set_work_item_agent(run.work_item_number, &new_agent_id))?;

        info!(
            old = %run.agent_id,
            new = %new_agent_id,
            resume = next_resume,
            "resumed rate-limited agent"
        );
        launch_threads(&self.shared, successor, child);
        Ok(Some(new_agent_id))
    }

    /// Orderly shutdown: running agents are detached and keep going; startup
    /// recovery reconciles them on the next run.
    pub fn shutdown(&self) {
        let Ok(live) = self.shared.live.lock() else {
            return;
        };
        for (agent_id, agent) in live.iter() {
            info!(
                agent = %agent_id,
                kind = %agent.kind,
                issue = agent.work_item_number,
                pr = agent.pr_number,
                "agent continues detached across shutdown"
            );
        }
    }
}

impl PoolShared {
    fn child_env(&self) -> Vec<(String, String)> {
        vec![
            (
                "CLAUDE_CODE_OAUTH_TOKEN".to_string(),
                self.config.claude_token.clone(),
            ),
            ("GH_TOKEN".to_string(), self.config.gh_token.clone()),
        ]
    }
}

/// Start the reader, stderr scanner, and monitor for a freshly spawned run.
fn launch_threads(shared: &Arc<PoolShared>, run: AgentRun, mut child: std::process::Child) {
    let agent_key = run.agent_id.as_str().to_string();
    if let Ok(mut live) = shared.live.lock() {
        live.insert(
            agent_key.clone(),
            LiveAgent {
                kind: run.kind,
                work_item_number: run.work_item_number,
                pr_number: run.pr_number,
            },
        );
    }

    let events: Arc<Mutex<Vec<ParsedEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let stderr_text: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
    let stderr_flag = Arc::new(AtomicBool::new(false));

    let reader_handle = child.stdout.take().map(|stdout| {
        let shared = Arc::clone(shared);
        let agent_id = run.agent_id.clone();
        let events = Arc::clone(&events);
        thread::Builder::new()
            .name(format!("reader-{agent_key}"))
            .spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    let Some(event) = parse_stream_line(&line) else {
                        continue;
                    };
                    if let Some(session) = &event.session_id {
                        let _ = shared
                            .store
                            .with(|store| store.record_agent_session(&agent_id, session));
                    }
                    if event.kind == AgentEventKind::ToolUse {
                        info!(agent = %agent_id, "{}", event.summary);
                    }
                    let payload = event.payload_json();
                    let _ = shared
                        .store
                        .with(|store| store.append_event(&agent_id, event.kind, &payload));
                    if let Ok(mut collected) = events.lock() {
                        collected.push(event);
                    }
                }
            })
            .ok()
    });

    let stderr_handle = child.stderr.take().map(|stderr| {
        let shared = Arc::clone(shared);
        let stderr_text = Arc::clone(&stderr_text);
        let stderr_flag = Arc::clone(&stderr_flag);
        thread::Builder::new()
            .name(format!("stderr-{agent_key}"))
            .spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    if swarm_agents::has_rate_limit_signature(&line) {
                        shared.stats.record_stderr_hit();
                        stderr_flag.store(true, Ordering::Relaxed);
                    }
                    if let Ok(mut text) = stderr_text.lock() {
                        text.push_str(&line);
                        text.push('\n');
                    }
                }
            })
            .ok()
    });

    let shared = Arc::clone(shared);
    let _ = thread::Builder::new()
        .name(format!("monitor-{agent_key}"))
        .spawn(move || {
            let started = Instant::now();
            let timeout = Duration::from_secs(shared.config.agent_timeout_seconds);
            let mut timed_out = false;

            let exit_status = loop {
                match child.try_wait() {
                    Ok(Some(status)) => break Some(status),
                    Ok(None) => {}
                    Err(err) => {
                        error!(agent = %run.agent_id, error = %err, "wait failed");
                        break None;
                    }
                }
                if started.elapsed() > timeout {
                    warn!(
                        agent = %run.agent_id,
                        timeout_secs = shared.config.agent_timeout_seconds,
                        "agent timed out, stopping"
                    );
                    timed_out = true;
                    let _ = terminate_gracefully(&mut child, shared.options.kill_grace);
                    break None;
                }
                thread::sleep(shared.options.monitor_poll);
            };

            if let Some(Some(handle)) = reader_handle {
                let _ = handle.join();
            }
            if let Some(Some(handle)) = stderr_handle {
                let _ = handle.join();
            }

            let events = events.lock().map(|e| e.clone()).unwrap_or_default();
            let stderr = stderr_text.lock().map(|t| t.clone()).unwrap_or_default();
            let stderr_flagged = stderr_flag.load(Ordering::Relaxed);

            if let Err(err) = shared.reap(
                &run,
                exit_status,
                timed_out,
                &events,
                &stderr,
                stderr_flagged,
            ) {
                error!(agent = %run.agent_id, error = %err, "completion handling failed");
            }

            if let Ok(mut live) = shared.live.lock() {
                live.remove(run.agent_id.as_str());
            }
        });
}

impl PoolShared {
    fn conclude_implement_failure(&self, issue_number: i64) -> Result<(), SupervisorError> {
        let Some(item) = self.store.with(|store| store.work_item(issue_number))? else {
            return Err(SupervisorError::WorkItemNotFound {
                number: issue_number,
            });
        };
        if item.status != WorkItemStatus::InProgress {
            return Ok(());
        }
        if item.attempts >= self.config.max_issue_retries {
            warn!(
                issue = issue_number,
                attempts = item.attempts,
                "attempt ceiling reached, escalating to needs_human"
            );
            self.store
                .with(|store| store.record_needs_human(issue_number))?;
            if let Err(err) = self.github.add_issue_label(issue_number, NEEDS_HUMAN_LABEL) {
                error!(issue = issue_number, error = %err, "failed to label issue");
            }
        } else {
            self.store
                .with(|store| store.reset_work_item_to_pending(issue_number))?;
        }
        Ok(())
    }

    /// Wind down the work attached to a run that will never continue
    /// (resume ceiling, lost worktree).
    fn conclude_abandoned_run(&self, run: &AgentRun) -> Result<(), SupervisorError> {
        match run.kind {
            AgentKind::Implement => self.conclude_implement_failure(run.work_item_number)?,
            AgentKind::FixReview => {
                if let Some(iteration_id) = self
                    .store
                    .with(|store| store.iteration_for_agent(&run.agent_id))?
                {
                    self.store.with(|store| {
                        store.record_iteration_status(iteration_id, ReviewIterationStatus::Failed)
                    })?;
                }
            }
        }
        if let Some(path) = &run.worktree_path {
            if path.exists() {
                self.worktrees.cleanup(path);
            }
        }
        Ok(())
    }
}

impl PoolShared {
    /// Terminal handling once the child exited (or was killed on timeout)
    /// and both stream readers drained.
    fn reap(
        &self,
        run: &AgentRun,
        exit_status: Option<std::process::ExitStatus>,
        timed_out: bool,
        events: &[ParsedEvent],
        stderr: &str,
        stderr_flagged: bool,
    ) -> Result<(), SupervisorError> {
        let turns = self.store.with(|store| store.turn_count(&run.agent_id))?;
        self.store
            .with(|store| store.record_agent_turns(&run.agent_id, turns))?;

        if timed_out {
            self.store.with(|store| {
                store.record_agent_status(
                    &run.agent_id,
                    AgentRunStatus::Timeout,
                    Some("agent exceeded wall-clock timeout"),
                )
            })?;
            self.conclude_abandoned_run(run)?;
            return Ok(());
        }

        let succeeded = exit_status.map(|status| status.success()).unwrap_or(false);
        if succeeded {
            info!(agent = %run.agent_id, turns, "agent finished (exit 0)");
            match run.kind {
                AgentKind::Implement => self.handle_implement_complete(run, events)?,
                AgentKind::FixReview => {
                    self.store.with(|store| {
                        store.record_agent_status(&run.agent_id, AgentRunStatus::Completed, None)
                    })?;
                    if let Some(iteration_id) = self
                        .store
                        .with(|store| store.iteration_for_agent(&run.agent_id))?
                    {
                        self.store.with(|store| {
                            store.record_iteration_status(iteration_id, ReviewIterationStatus::Fixed)
                        })?;
                    }
                    if let Some(path) = &run.worktree_path {
                        self.worktrees.cleanup(path);
                    }
                }
            }
            return Ok(());
        }

        let error_summaries: Vec<&str> = events
            .iter()
            .filter(|event| {
                matches!(
                    event.kind,
                    AgentEventKind::Error | AgentEventKind::RateLimitEvent
                )
            })
            .map(|event| event.summary.as_str())
            .collect();

        if stderr_flagged || is_rate_limit_failure(stderr, error_summaries.iter().copied()) {
            warn!(
                agent = %run.agent_id,
                "rate limit detected, preserving worktree for resume"
            );
            let excerpt = excerpt(stderr);
            self.store.with(|store| {
                store.mark_agent_rate_limited(
                    &run.agent_id,
                    (!excerpt.is_empty()).then_some(excerpt.as_str()),
                )
            })?;
            // Work item stays in_progress, attempts untouched, worktree kept:
            // the watcher owns the rest.
            return Ok(());
        }

        let message = if stderr.trim().is_empty() {
            match exit_status.and_then(|status| status.code()) {
                Some(code) => format!("exit code {code}"),
                None => "killed by signal".to_string(),
            }
        } else {
            excerpt(stderr)
        };
        error!(agent = %run.agent_id, error = %message, "agent failed");
        self.store.with(|store| {
            store.record_agent_status(&run.agent_id, AgentRunStatus::Failed, Some(&message))
        })?;
        self.conclude_abandoned_run(run)?;
        Ok(())
    }

    /// An implement agent exited 0; make sure a PR actually exists before
    /// declaring victory.
    fn handle_implement_complete(
        &self,
        run: &AgentRun,
        events: &[ParsedEvent],
    ) -> Result<(), SupervisorError> {
        let issue_number = run.work_item_number;
        let branch = run
            .branch_name
            .clone()
            .unwrap_or_else(|| swarm_git::implement_branch_name(issue_number));

        // 1. PR number advertised in the event stream.
        let mut pr_number = match swarm_agents::extract_pr_number(events) {
            Some((number, PrNumberSource::Structured)) => Some(number),
            Some((number, PrNumberSource::Pattern)) => {
                warn!(
                    agent = %run.agent_id,
                    pr = number,
                    "PR number recovered by pattern match only; agent output format may have drifted"
                );
                Some(number)
            }
            None => None,
        };

        // 2. Ask the hosting service directly.
        if pr_number.is_none() {
            pr_number = self.github.find_open_pr_for_branch(&branch).unwrap_or(None);
        }

        // 3./4. Branch pushed (or pushable) but no PR: open one ourselves.
        if pr_number.is_none() {
            if let Some(worktree) = &run.worktree_path {
                let pushed = is_branch_pushed(&self.git, worktree, &branch).unwrap_or(false);
                if pushed {
                    warn!(agent = %run.agent_id, "branch pushed but no PR, creating one");
                    pr_number = self.github.create_pr(&branch, issue_number).ok();
                } else if has_unpushed_commits(&self.git, worktree, &self.config.base_branch)
                    .unwrap_or(false)
                {
                    warn!(agent = %run.agent_id, "unpushed commits found, pushing and creating PR");
                    if push_branch(&self.git, worktree, &branch).is_ok() {
                        pr_number = self.github.create_pr(&branch, issue_number).ok();
                    }
                }
            }
        }

        match pr_number {
            Some(pr) => {
                info!(agent = %run.agent_id, issue = issue_number, pr, "PR confirmed");
                self.store.with(|store| {
                    store.record_agent_status(&run.agent_id, AgentRunStatus::Completed, None)
                })?;
                self.store
                    .with(|store| store.record_agent_pr(&run.agent_id, pr))?;
                self.store
                    .with(|store| store.record_pr_created(issue_number, pr))?;
                if let Some(path) = &run.worktree_path {
                    self.worktrees.cleanup(path);
                }
            }
            None => {
                warn!(agent = %run.agent_id, "agent exited 0 but produced no PR");
                self.store.with(|store| {
                    store.record_agent_status(
                        &run.agent_id,
                        AgentRunStatus::Failed,
                        Some("no PR produced: no commits, pushed branch, or PR found"),
                    )
                })?;
                self.conclude_abandoned_run(run)?;
            }
        }
        Ok(())
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(STDERR_EXCERPT_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::process::Command;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use swarm_core::{AgentRunStatus, SwarmConfig, WorkItemStatus};
    use swarm_github::{GhCli, GithubClient};

    use super::{AgentPool, PoolOptions, RateLimitStats};
    use crate::store::{SqliteStore, StoreHandle};

    fn run_git(cwd: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn commit_file(repo: &Path, name: &str, contents: &str, message: &str) {
        fs::write(repo.join(name), contents).expect("write file");
        run_git(repo, &["add", name]);
        run_git(
            repo,
            &[
                "-c",
                "user.name=Test User",
                "-c",
                "user.email=test@example.com",
                "commit",
                "-m",
                message,
            ],
        );
    }

    fn target_repo_with_origin(root: &Path) -> PathBuf {
        let origin = root.join("origin.git");
        let repo = root.join("repo");
        run_git(root, &["init", "--bare", "origin.git"]);
        run_git(root, &["init", "-b", "main", "repo"]);
        commit_file(&repo, "README.md", "init\n", "init");
        run_git(&repo, &["remote", "add", "origin", origin.to_str().unwrap()]);
        run_git(&repo, &["push", "-u", "origin", "main"]);
        repo
    }

    /// Fake agent: a shell script standing in for the agent CLI.
    fn fake_agent(root: &Path, body: &str) -> PathBuf {
        let path = root.join("fake-claude");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        }
        path
    }

    fn test_config(root: &Path, repo: &Path, timeout_seconds: u64) -> SwarmConfig {
        let mut vars = HashMap::new();
        vars.insert("CLAUDE_CODE_OAUTH_TOKEN".to_string(), "token-a".to_string());
        vars.insert("GH_TOKEN".to_string(), "token-b".to_string());
        vars.insert("GITHUB_REPO".to_string(), "acme/widgets".to_string());
        vars.insert(
            "TARGET_REPO_PATH".to_string(),
            repo.to_string_lossy().into_owned(),
        );
        vars.insert(
            "WORKTREE_DIR".to_string(),
            root.join("worktrees").to_string_lossy().into_owned(),
        );
        vars.insert(
            "AGENT_TIMEOUT_SECONDS".to_string(),
            timeout_seconds.to_string(),
        );
        vars.insert("SKILLS_ENABLED".to_string(), "false".to_string());
        SwarmConfig::from_vars(&vars).expect("config")
    }

    fn mk_pool(config: SwarmConfig, agent_executable: &Path) -> (AgentPool, StoreHandle) {
        let store = SqliteStore::open_in_memory().expect("store");
        store.migrate().expect("migrate");
        let handle = StoreHandle::new(store);
        // `false` exits 1 for every gh call: recovery paths that would need
        // the hosting service simply find nothing.
        let github = GithubClient::new(GhCli::with_binary("false", "token-b"), "acme/widgets");
        let cli = swarm_agents::AgentCli::new(
            agent_executable.to_string_lossy().into_owned(),
            config.skills_enabled,
        );
        let pool = AgentPool::new(
            config,
            handle.clone(),
            github,
            cli,
            Arc::new(RateLimitStats::default()),
            PoolOptions {
                monitor_poll: Duration::from_millis(50),
                kill_grace: Duration::from_millis(500),
            },
        );
        (pool, handle)
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("condition not reached within {deadline:?}");
    }

    #[test]
    fn dispatch_implement_happy_path_records_pr_from_events() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let repo = target_repo_with_origin(tmp.path());
        let agent = fake_agent(
            tmp.path(),
            r#"echo '{"type": "system", "session_id": "sess-1"}'
echo '{"type": "assistant", "message": {"content": [{"type": "text", "text": "working"}]}}'
echo '{"type": "result", "result": "opened https://github.com/acme/widgets/pull/55"}'
exit 0"#,
        );
        let config = test_config(tmp.path(), &repo, 600);
        let (pool, store) = mk_pool(config, &agent);

        store
            .with(|s| s.upsert_work_item(7, "Add endpoint", "plan"))
            .expect("item");
        let agent_id = pool
            .dispatch_implement(7, &[])
            .expect("dispatch")
            .expect("spawned");

        wait_until(Duration::from_secs(10), || {
            store
                .with(|s| s.work_item(7))
                .ok()
                .flatten()
                .map(|item| item.status == WorkItemStatus::PrCreated)
                .unwrap_or(false)
        });

        let item = store.with(|s| s.work_item(7)).expect("get").expect("exists");
        assert_eq!(item.pr_number, Some(55));
        assert_eq!(item.attempts, 1);

        let run = store
            .with(|s| s.agent_run(&agent_id))
            .expect("get")
            .expect("exists");
        assert_eq!(run.status, AgentRunStatus::Completed);
        assert_eq!(run.pr_number, Some(55));
        assert_eq!(run.session_id.as_deref(), Some("sess-1"));
        assert_eq!(run.turns_used, 1);

        // Worktree cleaned after completion.
        wait_until(Duration::from_secs(5), || {
            !tmp.path().join("worktrees").join("issue-7").exists()
        });
    }

    #[test]
    fn failed_agent_resets_item_and_cleans_worktree() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let repo = target_repo_with_origin(tmp.path());
        let agent = fake_agent(tmp.path(), "echo 'boom' >&2\nexit 1");
        let config = test_config(tmp.path(), &repo, 600);
        let (pool, store) = mk_pool(config, &agent);

        store.with(|s| s.upsert_work_item(8, "t", "b")).expect("item");
        let agent_id = pool
            .dispatch_implement(8, &[])
            .expect("dispatch")
            .expect("spawned");

        wait_until(Duration::from_secs(10), || {
            store
                .with(|s| s.agent_run(&agent_id))
                .ok()
                .flatten()
                .map(|run| run.status == AgentRunStatus::Failed)
                .unwrap_or(false)
        });

        let item = store.with(|s| s.work_item(8)).expect("get").expect("exists");
        assert_eq!(item.status, WorkItemStatus::Pending, "re-queued for retry");
        assert_eq!(item.attempts, 1);

        let run = store
            .with(|s| s.agent_run(&agent_id))
            .expect("get")
            .expect("exists");
        assert!(run.error_message.as_deref().unwrap_or("").contains("boom"));

        wait_until(Duration::from_secs(5), || {
            !tmp.path().join("worktrees").join("issue-8").exists()
        });
    }

    #[test]
    fn rate_limited_agent_preserves_worktree_and_attempts() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let repo = target_repo_with_origin(tmp.path());
        let agent = fake_agent(
            tmp.path(),
            "echo 'Error: rate limit exceeded, try again later' >&2\nexit 1",
        );
        let config = test_config(tmp.path(), &repo, 600);
        let (pool, store) = mk_pool(config, &agent);

        store.with(|s| s.upsert_work_item(9, "t", "b")).expect("item");
        let agent_id = pool
            .dispatch_implement(9, &[])
            .expect("dispatch")
            .expect("spawned");

        wait_until(Duration::from_secs(10), || {
            store
                .with(|s| s.agent_run(&agent_id))
                .ok()
                .flatten()
                .map(|run| run.status == AgentRunStatus::RateLimited)
                .unwrap_or(false)
        });

        let run = store
            .with(|s| s.agent_run(&agent_id))
            .expect("get")
            .expect("exists");
        assert!(run.rate_limited_at.is_some());

        let item = store.with(|s| s.work_item(9)).expect("get").expect("exists");
        assert_eq!(item.status, WorkItemStatus::InProgress, "item stays claimed");
        assert_eq!(item.attempts, 1, "rate limits never count as attempts");

        assert!(
            tmp.path().join("worktrees").join("issue-9").exists(),
            "worktree must be preserved for resume"
        );
    }

    #[test]
    fn timeout_kills_agent_and_requeues_item() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let repo = target_repo_with_origin(tmp.path());
        let agent = fake_agent(tmp.path(), "sleep 60");
        let config = test_config(tmp.path(), &repo, 1);
        let (pool, store) = mk_pool(config, &agent);

        store.with(|s| s.upsert_work_item(10, "t", "b")).expect("item");
        let agent_id = pool
            .dispatch_implement(10, &[])
            .expect("dispatch")
            .expect("spawned");

        wait_until(Duration::from_secs(15), || {
            store
                .with(|s| s.agent_run(&agent_id))
                .ok()
                .flatten()
                .map(|run| run.status == AgentRunStatus::Timeout)
                .unwrap_or(false)
        });

        let item = store.with(|s| s.work_item(10)).expect("get").expect("exists");
        assert_eq!(item.status, WorkItemStatus::Pending);
        assert_eq!(item.attempts, 1);

        wait_until(Duration::from_secs(5), || {
            !tmp.path().join("worktrees").join("issue-10").exists()
        });
    }

    #[test]
    fn dispatch_skips_items_that_are_not_pending() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let repo = target_repo_with_origin(tmp.path());
        let agent = fake_agent(tmp.path(), "exit 0");
        let config = test_config(tmp.path(), &repo, 600);
        let (pool, store) = mk_pool(config, &agent);

        store.with(|s| s.upsert_work_item(11, "t", "b")).expect("item");
        store
            .with(|s| s.claim_work_item(11, &swarm_core::AgentId::new("other")))
            .expect("claim");

        let dispatched = pool.dispatch_implement(11, &[]).expect("dispatch");
        assert!(dispatched.is_none());
    }

    #[test]
    fn dispatch_defers_when_pool_is_full() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let repo = target_repo_with_origin(tmp.path());
        let agent = fake_agent(tmp.path(), "sleep 30");
        let mut config = test_config(tmp.path(), &repo, 600);
        config.max_concurrent_agents = 1;
        let (pool, store) = mk_pool(config, &agent);

        store.with(|s| s.upsert_work_item(12, "t", "b")).expect("item");
        store.with(|s| s.upsert_work_item(13, "t", "b")).expect("item");

        let first = pool.dispatch_implement(12, &[]).expect("dispatch");
        assert!(first.is_some());
        let second = pool.dispatch_implement(13, &[]).expect("dispatch");
        assert!(second.is_none(), "capacity cap defers the second dispatch");

        let item = store.with(|s| s.work_item(13)).expect("get").expect("exists");
        assert_eq!(item.status, WorkItemStatus::Pending);
        assert_eq!(item.attempts, 0, "deferred dispatch never claims");
    }

    #[test]
    fn resume_ceiling_fails_run_and_requeues_item() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let repo = target_repo_with_origin(tmp.path());
        let agent = fake_agent(tmp.path(), "exit 0");
        let config = test_config(tmp.path(), &repo, 600);
        let max_resumes = config.max_rate_limit_resumes;
        let (pool, store) = mk_pool(config, &agent);

        // A rate-limited run already at the resume ceiling.
        store.with(|s| s.upsert_work_item(14, "t", "b")).expect("item");
        let agent_id = swarm_core::AgentId::new("agent-issue-14-attempt-1");
        store
            .with(|s| s.claim_work_item(14, &agent_id))
            .expect("claim");
        let worktree = tmp.path().join("worktrees").join("issue-14");
        fs::create_dir_all(&worktree).expect("mkdir");
        let mut run = super::AgentRun {
            agent_id: agent_id.clone(),
            work_item_number: 14,
            pr_number: None,
            kind: swarm_core::AgentKind::Implement,
            status: AgentRunStatus::Running,
            worktree_path: Some(worktree),
            branch_name: Some("fix/issue-14".to_string()),
            pid: None,
            session_id: None,
            resume_count: max_resumes,
            rate_limited_at: None,
            turns_used: 0,
            started_at: chrono::Utc::now(),
            finished_at: None,
            error_message: None,
        };
        store.with(|s| s.record_agent_started(&run)).expect("run");
        store
            .with(|s| s.mark_agent_rate_limited(&agent_id, None))
            .expect("limit");
        run.status = AgentRunStatus::RateLimited;

        let resumed = pool.resume_rate_limited(&run, &[]).expect("resume");
        assert!(resumed.is_none());

        let stored = store
            .with(|s| s.agent_run(&agent_id))
            .expect("get")
            .expect("exists");
        assert_eq!(stored.status, AgentRunStatus::Failed);

        let item = store.with(|s| s.work_item(14)).expect("get").expect("exists");
        assert_eq!(item.status, WorkItemStatus::Pending);
    }

    #[test]
    fn resume_spawns_successor_and_supersedes_old_run() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let repo = target_repo_with_origin(tmp.path());
        let agent = fake_agent(
            tmp.path(),
            r#"echo '{"type": "assistant", "message": {"content": [{"type": "text", "text": "resumed"}]}}'
exit 0"#,
        );
        let config = test_config(tmp.path(), &repo, 600);
        let (pool, store) = mk_pool(config, &agent);

        store.with(|s| s.upsert_work_item(15, "t", "b")).expect("item");
        let agent_id = swarm_core::AgentId::new("agent-issue-15-attempt-1");
        store
            .with(|s| s.claim_work_item(15, &agent_id))
            .expect("claim");
        let worktree = tmp.path().join("worktrees").join("issue-15");
        fs::create_dir_all(&worktree).expect("mkdir");
        let mut run = super::AgentRun {
            agent_id: agent_id.clone(),
            work_item_number: 15,
            pr_number: None,
            kind: swarm_core::AgentKind::Implement,
            status: AgentRunStatus::Running,
            worktree_path: Some(worktree),
            branch_name: Some("fix/issue-15".to_string()),
            pid: None,
            session_id: Some("sess-old".to_string()),
            resume_count: 0,
            rate_limited_at: None,
            turns_used: 0,
            started_at: chrono::Utc::now(),
            finished_at: None,
            error_message: None,
        };
        store.with(|s| s.record_agent_started(&run)).expect("run");
        store
            .with(|s| s.mark_agent_rate_limited(&agent_id, None))
            .expect("limit");
        run.status = AgentRunStatus::RateLimited;

        let new_id = pool
            .resume_rate_limited(&run, &[])
            .expect("resume")
            .expect("spawned");
        assert_eq!(new_id.as_str(), "agent-resume-15-1");

        let old = store
            .with(|s| s.agent_run(&agent_id))
            .expect("get")
            .expect("exists");
        assert_eq!(old.status, AgentRunStatus::Resumed);

        let successor = store
            .with(|s| s.agent_run(&new_id))
            .expect("get")
            .expect("exists");
        assert_eq!(successor.resume_count, 1);

        let item = store.with(|s| s.work_item(15)).expect("get").expect("exists");
        assert_eq!(item.assigned_agent_id, Some(new_id.clone()));

        // Successor eventually terminates; its exit-0 run goes through PR
        // recovery, finds nothing (gh is stubbed out), and concludes failed.
        wait_until(Duration::from_secs(10), || {
            store
                .with(|s| s.agent_run(&new_id))
                .ok()
                .flatten()
                .map(|r| r.status != AgentRunStatus::Running)
                .unwrap_or(false)
        });
    }
}
