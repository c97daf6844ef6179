//! SQLite state store: the single point of truth for work items, agent runs,
//! events, and review iterations.
//!
//! One connection in WAL mode behind a mutex gives single-writer
//! serialization with concurrent readers. Status transitions are guarded by
//! the predicates in `swarm_core::state` and applied with
//! compare-and-swap-style `UPDATE ... WHERE status = ?` writes, so two
//! handlers racing on the same row cannot both win.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use swarm_core::state::UnknownStatus;
use swarm_core::{
    is_agent_transition_allowed, is_work_item_transition_allowed, AgentEventKind,
    AgentEventRecord, AgentId, AgentKind, AgentRun, AgentRunStatus, MetricsSnapshot,
    ReviewIteration, ReviewIterationStatus, WorkItem, WorkItemStatus,
};

/// Columns added after the initial schema shipped. Probing for the column
/// must precede the alter so re-running migration stays idempotent.
const MIGRATION_COLUMNS: &[(&str, &str, &str)] = &[
    ("agent_runs", "session_id", "TEXT"),
    ("agent_runs", "resume_count", "INTEGER DEFAULT 0"),
    ("agent_runs", "rate_limited_at", "TEXT"),
    ("review_iterations", "comments_json", "TEXT"),
];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
    #[error("timestamp parse error for value '{value}': {source}")]
    TimestampParse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error(transparent)]
    Status(#[from] UnknownStatus),
    #[error("work item not found: #{number}")]
    WorkItemNotFound { number: i64 },
    #[error("agent run not found: {agent_id}")]
    AgentNotFound { agent_id: String },
    #[error("review iteration not found: {id}")]
    IterationNotFound { id: i64 },
    #[error("work item #{number} is not claimable (not pending or concurrently claimed)")]
    ClaimConflict { number: i64 },
    #[error("illegal {entity} transition {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("{entity} was modified concurrently, transition not applied")]
    ConcurrentUpdate { entity: &'static str },
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            // Best effort; Connection::open reports the real failure.
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }

    /// Create the schema if absent, then add any missing late columns.
    /// Running this any number of times is equivalent to running it once.
    pub fn migrate(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS work_items (
    number INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    body TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending',
    assigned_agent_id TEXT,
    pr_number INTEGER,
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_work_items_status ON work_items(status);

CREATE TABLE IF NOT EXISTS agent_runs (
    agent_id TEXT PRIMARY KEY,
    work_item_number INTEGER NOT NULL,
    pr_number INTEGER,
    kind TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    worktree_path TEXT,
    branch_name TEXT,
    pid INTEGER,
    turns_used INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    error_message TEXT,
    FOREIGN KEY (work_item_number) REFERENCES work_items(number)
);

CREATE INDEX IF NOT EXISTS idx_agent_runs_status ON agent_runs(status);
CREATE INDEX IF NOT EXISTS idx_agent_runs_item ON agent_runs(work_item_number, started_at);

CREATE TABLE IF NOT EXISTS agent_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    event_data TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    FOREIGN KEY (agent_id) REFERENCES agent_runs(agent_id)
);

CREATE INDEX IF NOT EXISTS idx_agent_events_agent ON agent_events(agent_id, id);

CREATE TABLE IF NOT EXISTS review_iterations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pr_number INTEGER NOT NULL,
    iteration INTEGER NOT NULL,
    comments_count INTEGER NOT NULL DEFAULT 0,
    agent_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    FOREIGN KEY (agent_id) REFERENCES agent_runs(agent_id)
);

CREATE INDEX IF NOT EXISTS idx_review_iterations_pr ON review_iterations(pr_number, iteration);
"#,
        )?;

        for (table, column, column_type) in MIGRATION_COLUMNS {
            self.add_column_if_missing(table, column, column_type)?;
        }
        Ok(())
    }

    fn add_column_if_missing(
        &self,
        table: &str,
        column: &str,
        column_type: &str,
    ) -> Result<(), StoreError> {
        let probe = format!("SELECT {column} FROM {table} LIMIT 1");
        if self.conn.prepare(&probe).is_ok() {
            return Ok(());
        }
        self.conn.execute(
            &format!("ALTER TABLE {table} ADD COLUMN {column} {column_type}"),
            [],
        )?;
        Ok(())
    }

    // --- Work items ---

    /// Insert a newly discovered issue as `pending`, or refresh the remote
    /// snapshot (title/body) of a tracked one. Never touches status,
    /// attempts, or PR linkage of an existing row.
    pub fn upsert_work_item(&self, number: i64, title: &str, body: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            r#"
INSERT INTO work_items (number, title, body, status, attempts, created_at, updated_at)
VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4)
ON CONFLICT(number) DO UPDATE SET
  title = excluded.title,
  body = excluded.body,
  updated_at = excluded.updated_at
"#,
            params![number, title, body, now],
        )?;
        Ok(())
    }

    /// Seed a brand-new work item directly as `pr_created` when an open PR
    /// already exists for its branch. Returns false if the item was already
    /// tracked (in which case nothing changes).
    pub fn seed_work_item_pr_created(
        &self,
        number: i64,
        title: &str,
        body: &str,
        pr_number: i64,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let inserted = self.conn.execute(
            r#"
INSERT INTO work_items (number, title, body, status, pr_number, attempts, created_at, updated_at)
VALUES (?1, ?2, ?3, 'pr_created', ?4, 0, ?5, ?5)
ON CONFLICT(number) DO NOTHING
"#,
            params![number, title, body, pr_number, now],
        )?;
        Ok(inserted > 0)
    }

    /// Atomic `pending -> in_progress` claim; increments `attempts`.
    /// Exactly one of two concurrent claims can succeed.
    pub fn claim_work_item(&self, number: i64, agent_id: &AgentId) -> Result<WorkItem, StoreError> {
        let now = Utc::now().to_rfc3339();
        let updated = self.conn.execute(
            r#"
UPDATE work_items
SET status = 'in_progress',
    assigned_agent_id = ?2,
    attempts = attempts + 1,
    updated_at = ?3
WHERE number = ?1 AND status = 'pending'
"#,
            params![number, agent_id.as_str(), now],
        )?;
        if updated == 0 {
            return Err(StoreError::ClaimConflict { number });
        }
        self.work_item(number)?
            .ok_or(StoreError::WorkItemNotFound { number })
    }

    pub fn record_pr_created(&self, number: i64, pr_number: i64) -> Result<(), StoreError> {
        self.transition_work_item(number, WorkItemStatus::PrCreated, Some(pr_number))
    }

    pub fn record_resolved(&self, number: i64) -> Result<(), StoreError> {
        self.transition_work_item(number, WorkItemStatus::Resolved, None)
    }

    pub fn record_needs_human(&self, number: i64) -> Result<(), StoreError> {
        self.transition_work_item(number, WorkItemStatus::NeedsHuman, None)
    }

    /// Failure path: hand the item back to the poller. Only legal while the
    /// item has no PR attached.
    pub fn reset_work_item_to_pending(&self, number: i64) -> Result<(), StoreError> {
        self.transition_work_item(number, WorkItemStatus::Pending, None)
    }

    /// A prematurely `resolved` item whose PR turned out to be open again.
    pub fn reopen_for_monitoring(&self, number: i64, pr_number: i64) -> Result<(), StoreError> {
        self.transition_work_item(number, WorkItemStatus::PrCreated, Some(pr_number))
    }

    /// Re-point the item at a successor run (rate-limit resume).
    pub fn set_work_item_agent(&self, number: i64, agent_id: &AgentId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let updated = self.conn.execute(
            "UPDATE work_items SET assigned_agent_id = ?2, updated_at = ?3 WHERE number = ?1",
            params![number, agent_id.as_str(), now],
        )?;
        if updated == 0 {
            return Err(StoreError::WorkItemNotFound { number });
        }
        Ok(())
    }

    fn transition_work_item(
        &self,
        number: i64,
        to: WorkItemStatus,
        pr_number: Option<i64>,
    ) -> Result<(), StoreError> {
        let current = self
            .work_item(number)?
            .ok_or(StoreError::WorkItemNotFound { number })?;
        if !is_work_item_transition_allowed(current.status, to) {
            return Err(StoreError::InvalidTransition {
                entity: "work item",
                from: current.status.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now().to_rfc3339();
        let updated = if let Some(pr) = pr_number {
            self.conn.execute(
                "UPDATE work_items SET status = ?2, pr_number = ?3, updated_at = ?4
                 WHERE number = ?1 AND status = ?5",
                params![number, to.as_str(), pr, now, current.status.as_str()],
            )?
        } else if to == WorkItemStatus::Pending {
            // Re-queue clears the agent assignment.
            self.conn.execute(
                "UPDATE work_items SET status = ?2, assigned_agent_id = NULL, updated_at = ?3
                 WHERE number = ?1 AND status = ?4",
                params![number, to.as_str(), now, current.status.as_str()],
            )?
        } else {
            self.conn.execute(
                "UPDATE work_items SET status = ?2, updated_at = ?3
                 WHERE number = ?1 AND status = ?4",
                params![number, to.as_str(), now, current.status.as_str()],
            )?
        };

        if updated == 0 {
            return Err(StoreError::ConcurrentUpdate {
                entity: "work item",
            });
        }
        Ok(())
    }

    pub fn work_item(&self, number: i64) -> Result<Option<WorkItem>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT number, title, body, status, assigned_agent_id, pr_number, attempts,
                        created_at, updated_at
                 FROM work_items WHERE number = ?1",
                params![number],
                work_item_row,
            )
            .optional()?;
        row.map(work_item_from_row).transpose()
    }

    pub fn work_items_by_status(
        &self,
        status: WorkItemStatus,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT number, title, body, status, assigned_agent_id, pr_number, attempts,
                    created_at, updated_at
             FROM work_items WHERE status = ?1 ORDER BY number",
        )?;
        let rows = stmt.query_map(params![status.as_str()], work_item_row)?;
        collect_work_items(rows)
    }

    pub fn all_work_items(&self) -> Result<Vec<WorkItem>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT number, title, body, status, assigned_agent_id, pr_number, attempts,
                    created_at, updated_at
             FROM work_items ORDER BY number",
        )?;
        let rows = stmt.query_map([], work_item_row)?;
        collect_work_items(rows)
    }

    // --- Agent runs ---

    pub fn record_agent_started(&self, run: &AgentRun) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
INSERT INTO agent_runs (agent_id, work_item_number, pr_number, kind, status, worktree_path,
                        branch_name, pid, session_id, resume_count, turns_used, started_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
"#,
            params![
                run.agent_id.as_str(),
                run.work_item_number,
                run.pr_number,
                run.kind.as_str(),
                run.status.as_str(),
                run.worktree_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                run.branch_name,
                run.pid,
                run.session_id,
                run.resume_count,
                run.turns_used,
                run.started_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Guarded status transition; terminal statuses stamp `finished_at`.
    pub fn record_agent_status(
        &self,
        agent_id: &AgentId,
        to: AgentRunStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let current = self.agent_run(agent_id)?.ok_or_else(|| StoreError::AgentNotFound {
            agent_id: agent_id.to_string(),
        })?;
        if !is_agent_transition_allowed(current.status, to) {
            return Err(StoreError::InvalidTransition {
                entity: "agent run",
                from: current.status.to_string(),
                to: to.to_string(),
            });
        }

        let finished_at = (to != AgentRunStatus::Running).then(|| Utc::now().to_rfc3339());
        let updated = self.conn.execute(
            "UPDATE agent_runs
             SET status = ?2, error_message = COALESCE(?3, error_message), finished_at = COALESCE(?4, finished_at)
             WHERE agent_id = ?1 AND status = ?5",
            params![
                agent_id.as_str(),
                to.as_str(),
                error,
                finished_at,
                current.status.as_str()
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::ConcurrentUpdate { entity: "agent run" });
        }
        Ok(())
    }

    /// `running -> rate_limited` plus the pause timestamp, in one write.
    pub fn mark_agent_rate_limited(
        &self,
        agent_id: &AgentId,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.record_agent_status(agent_id, AgentRunStatus::RateLimited, error)?;
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE agent_runs SET rate_limited_at = ?2 WHERE agent_id = ?1",
            params![agent_id.as_str(), now],
        )?;
        Ok(())
    }

    /// First session id wins; later sightings are ignored.
    pub fn record_agent_session(&self, agent_id: &AgentId, session_id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE agent_runs SET session_id = ?2 WHERE agent_id = ?1 AND session_id IS NULL",
            params![agent_id.as_str(), session_id],
        )?;
        Ok(())
    }

    pub fn record_agent_pid(&self, agent_id: &AgentId, pid: u32) -> Result<(), StoreError> {
        self.require_agent_update(
            "UPDATE agent_runs SET pid = ?2 WHERE agent_id = ?1",
            params![agent_id.as_str(), pid],
            agent_id,
        )
    }

    pub fn record_agent_pr(&self, agent_id: &AgentId, pr_number: i64) -> Result<(), StoreError> {
        self.require_agent_update(
            "UPDATE agent_runs SET pr_number = ?2 WHERE agent_id = ?1",
            params![agent_id.as_str(), pr_number],
            agent_id,
        )
    }

    pub fn record_agent_turns(&self, agent_id: &AgentId, turns: u32) -> Result<(), StoreError> {
        self.require_agent_update(
            "UPDATE agent_runs SET turns_used = ?2 WHERE agent_id = ?1",
            params![agent_id.as_str(), turns],
            agent_id,
        )
    }

    pub fn record_agent_resume_count(&self, agent_id: &AgentId, count: u32) -> Result<(), StoreError> {
        self.require_agent_update(
            "UPDATE agent_runs SET resume_count = ?2 WHERE agent_id = ?1",
            params![agent_id.as_str(), count],
            agent_id,
        )
    }

    fn require_agent_update(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        agent_id: &AgentId,
    ) -> Result<(), StoreError> {
        let updated = self.conn.execute(sql, params)?;
        if updated == 0 {
            return Err(StoreError::AgentNotFound {
                agent_id: agent_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn agent_run(&self, agent_id: &AgentId) -> Result<Option<AgentRun>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("{AGENT_RUN_SELECT} WHERE agent_id = ?1"),
                params![agent_id.as_str()],
                agent_run_row,
            )
            .optional()?;
        row.map(agent_run_from_row).transpose()
    }

    pub fn running_agents(&self) -> Result<Vec<AgentRun>, StoreError> {
        self.runs_where("WHERE status = 'running' ORDER BY started_at", params![])
    }

    pub fn rate_limited_agents(&self) -> Result<Vec<AgentRun>, StoreError> {
        self.runs_where(
            "WHERE status = 'rate_limited' ORDER BY rate_limited_at",
            params![],
        )
    }

    pub fn all_agent_runs(&self) -> Result<Vec<AgentRun>, StoreError> {
        self.runs_where("ORDER BY started_at DESC", params![])
    }

    fn runs_where(
        &self,
        clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<AgentRun>, StoreError> {
        let mut stmt = self.conn.prepare(&format!("{AGENT_RUN_SELECT} {clause}"))?;
        let rows = stmt.query_map(params, agent_run_row)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(agent_run_from_row(row?)?);
        }
        Ok(runs)
    }

    /// Count of runs holding a concurrency slot. Rate-limited runs have
    /// released theirs.
    pub fn running_count(&self) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM agent_runs WHERE status = 'running'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// The run (if any) that holds this work item's exclusivity slot.
    pub fn active_run_for_work_item(&self, number: i64) -> Result<Option<AgentRun>, StoreError> {
        let mut runs = self.runs_where(
            "WHERE work_item_number = ?1 AND status IN ('running', 'rate_limited')
             ORDER BY started_at DESC LIMIT 1",
            params![number],
        )?;
        Ok(runs.pop())
    }

    pub fn has_running_fix_for_pr(&self, pr_number: i64) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM agent_runs
             WHERE pr_number = ?1 AND kind = 'fix_review' AND status IN ('running', 'rate_limited')",
            params![pr_number],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // --- Agent events ---

    pub fn append_event(
        &self,
        agent_id: &AgentId,
        kind: AgentEventKind,
        payload: &str,
    ) -> Result<i64, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO agent_events (agent_id, event_type, event_data, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![agent_id.as_str(), kind.as_str(), payload, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn events_since(
        &self,
        agent_id: &AgentId,
        since_id: i64,
        limit: u32,
    ) -> Result<Vec<AgentEventRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, agent_id, event_type, event_data, timestamp
             FROM agent_events
             WHERE agent_id = ?1 AND id > ?2
             ORDER BY id
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![agent_id.as_str(), since_id, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, agent, kind_raw, payload, timestamp_raw) = row?;
            events.push(AgentEventRecord {
                id,
                agent_id: AgentId::new(agent),
                kind: kind_raw.parse()?,
                payload,
                timestamp: parse_timestamp(&timestamp_raw)?,
            });
        }
        Ok(events)
    }

    /// Turns are the count of `assistant` events.
    pub fn turn_count(&self, agent_id: &AgentId) -> Result<u32, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM agent_events WHERE agent_id = ?1 AND event_type = 'assistant'",
            params![agent_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    // --- Review iterations ---

    pub fn create_review_iteration(
        &self,
        pr_number: i64,
        iteration: u32,
        comments_count: u32,
        comments_json: Option<&str>,
    ) -> Result<i64, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO review_iterations (pr_number, iteration, comments_count, comments_json, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![pr_number, iteration, comments_count, comments_json, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn link_fix_agent(&self, iteration_id: i64, agent_id: &AgentId) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE review_iterations SET agent_id = ?2, status = 'fixing' WHERE id = ?1",
            params![iteration_id, agent_id.as_str()],
        )?;
        if updated == 0 {
            return Err(StoreError::IterationNotFound { id: iteration_id });
        }
        Ok(())
    }

    pub fn record_iteration_status(
        &self,
        iteration_id: i64,
        status: ReviewIterationStatus,
    ) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE review_iterations SET status = ?2 WHERE id = ?1",
            params![iteration_id, status.as_str()],
        )?;
        if updated == 0 {
            return Err(StoreError::IterationNotFound { id: iteration_id });
        }
        Ok(())
    }

    pub fn review_iterations(&self, pr_number: i64) -> Result<Vec<ReviewIteration>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, pr_number, iteration, comments_count, comments_json, agent_id, status, created_at
             FROM review_iterations WHERE pr_number = ?1 ORDER BY iteration",
        )?;
        let rows = stmt.query_map(params![pr_number], review_iteration_row)?;
        collect_iterations(rows)
    }

    pub fn all_review_iterations(&self) -> Result<Vec<ReviewIteration>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, pr_number, iteration, comments_count, comments_json, agent_id, status, created_at
             FROM review_iterations ORDER BY pr_number, iteration",
        )?;
        let rows = stmt.query_map([], review_iteration_row)?;
        collect_iterations(rows)
    }

    pub fn iteration_count(&self, pr_number: i64) -> Result<u32, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM review_iterations WHERE pr_number = ?1",
            params![pr_number],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// The iteration a fix agent is currently linked to, if any.
    pub fn iteration_for_agent(&self, agent_id: &AgentId) -> Result<Option<i64>, StoreError> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM review_iterations WHERE agent_id = ?1 ORDER BY iteration DESC LIMIT 1",
                params![agent_id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(id)
    }

    // --- Metrics ---

    /// Aggregate counters; `stderr_signature_hits` is owned by the
    /// supervisor and merged in by the caller.
    pub fn metrics(&self) -> Result<MetricsSnapshot, StoreError> {
        let count = |sql: &str| -> Result<u64, StoreError> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };

        let avg_turns: f64 = self
            .conn
            .query_row(
                "SELECT AVG(turns_used) FROM agent_runs WHERE status = 'completed'",
                [],
                |row| row.get::<_, Option<f64>>(0),
            )?
            .unwrap_or(0.0);

        Ok(MetricsSnapshot {
            active_agents: count("SELECT COUNT(*) FROM agent_runs WHERE status = 'running'")?,
            total_issues: count("SELECT COUNT(*) FROM work_items")?,
            pending: count("SELECT COUNT(*) FROM work_items WHERE status = 'pending'")?,
            in_progress: count("SELECT COUNT(*) FROM work_items WHERE status = 'in_progress'")?,
            pr_created: count("SELECT COUNT(*) FROM work_items WHERE status = 'pr_created'")?,
            resolved: count("SELECT COUNT(*) FROM work_items WHERE status = 'resolved'")?,
            needs_human: count("SELECT COUNT(*) FROM work_items WHERE status = 'needs_human'")?,
            avg_turns: (avg_turns * 10.0).round() / 10.0,
            rate_limited: count("SELECT COUNT(*) FROM agent_runs WHERE status = 'rate_limited'")?,
            stderr_signature_hits: 0,
        })
    }
}

/// Cloneable, thread-safe handle; all access goes through the single-writer
/// mutex.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    inner: Arc<Mutex<SqliteStore>>,
}

impl StoreHandle {
    pub fn new(store: SqliteStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&SqliteStore) -> R) -> R {
        let guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }
}

const AGENT_RUN_SELECT: &str = "SELECT agent_id, work_item_number, pr_number, kind, status, worktree_path, branch_name, \
     pid, session_id, resume_count, rate_limited_at, turns_used, started_at, finished_at, \
     error_message FROM agent_runs";

type WorkItemRow = (
    i64,
    String,
    String,
    String,
    Option<String>,
    Option<i64>,
    i64,
    String,
    String,
);

fn work_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkItemRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn work_item_from_row(row: WorkItemRow) -> Result<WorkItem, StoreError> {
    let (number, title, body, status_raw, agent_raw, pr_number, attempts, created_raw, updated_raw) =
        row;
    Ok(WorkItem {
        number,
        title,
        body,
        status: status_raw.parse()?,
        assigned_agent_id: agent_raw.map(AgentId::new),
        pr_number,
        attempts: attempts as u32,
        created_at: parse_timestamp(&created_raw)?,
        updated_at: parse_timestamp(&updated_raw)?,
    })
}

fn collect_work_items(
    rows: impl Iterator<Item = rusqlite::Result<WorkItemRow>>,
) -> Result<Vec<WorkItem>, StoreError> {
    let mut items = Vec::new();
    for row in rows {
        items.push(work_item_from_row(row?)?);
    }
    Ok(items)
}

type AgentRunRow = (
    String,
    i64,
    Option<i64>,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<u32>,
    Option<String>,
    i64,
    Option<String>,
    i64,
    String,
    Option<String>,
    Option<String>,
);

fn agent_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRunRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
    ))
}

fn agent_run_from_row(row: AgentRunRow) -> Result<AgentRun, StoreError> {
    let (
        agent_id,
        work_item_number,
        pr_number,
        kind_raw,
        status_raw,
        worktree_raw,
        branch_name,
        pid,
        session_id,
        resume_count,
        rate_limited_raw,
        turns_used,
        started_raw,
        finished_raw,
        error_message,
    ) = row;
    Ok(AgentRun {
        agent_id: AgentId::new(agent_id),
        work_item_number,
        pr_number,
        kind: kind_raw.parse::<AgentKind>()?,
        status: status_raw.parse()?,
        worktree_path: worktree_raw.map(Into::into),
        branch_name,
        pid,
        session_id,
        resume_count: resume_count as u32,
        rate_limited_at: rate_limited_raw
            .map(|raw| parse_timestamp(&raw))
            .transpose()?,
        turns_used: turns_used as u32,
        started_at: parse_timestamp(&started_raw)?,
        finished_at: finished_raw.map(|raw| parse_timestamp(&raw)).transpose()?,
        error_message,
    })
}

type ReviewIterationRow = (
    i64,
    i64,
    i64,
    i64,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn review_iteration_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReviewIterationRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn collect_iterations(
    rows: impl Iterator<Item = rusqlite::Result<ReviewIterationRow>>,
) -> Result<Vec<ReviewIteration>, StoreError> {
    let mut iterations = Vec::new();
    for row in rows {
        let (id, pr_number, iteration, comments_count, comments_json, agent_raw, status_raw, created_raw) =
            row?;
        iterations.push(ReviewIteration {
            id,
            pr_number,
            iteration: iteration as u32,
            comments_count: comments_count as u32,
            comments_json,
            agent_id: agent_raw.map(AgentId::new),
            status: status_raw.parse()?,
            created_at: parse_timestamp(&created_raw)?,
        });
    }
    Ok(iterations)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| StoreError::TimestampParse {
            value: raw.to_string(),
            source,
        })
}
