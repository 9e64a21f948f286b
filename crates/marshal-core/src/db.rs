use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::types::{
    LockRecord, LockStatus, Message, PipelineExecution, PipelineStatus, Project, RepoTarget,
    Session, Task, TaskStatus, WorkerRepository,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

/// Fixed-width UTC text format. Lexicographic order is chronological, which
/// the lock-age and staleness SQL guards rely on.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| parse_ts(&v))
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn bad_column(idx: usize, detail: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, detail.into())
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status_str: String = row.get(5)?;
    let status = TaskStatus::parse(&status_str)
        .ok_or_else(|| bad_column(5, format!("unknown task status {status_str:?}")))?;
    let created_at_str: String = row.get(6)?;
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        task_source_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        status,
        created_at: parse_ts(&created_at_str),
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let created_at_str: String = row.get(3)?;
    Ok(Session {
        id: row.get(0)?,
        task_id: row.get(1)?,
        runner: row.get(2)?,
        created_at: parse_ts(&created_at_str),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let created_at_str: String = row.get(4)?;
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        created_at: parse_ts(&created_at_str),
    })
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<PipelineExecution> {
    let status_str: String = row.get(4)?;
    let status = PipelineStatus::parse(&status_str)
        .ok_or_else(|| bad_column(4, format!("unknown pipeline status {status_str:?}")))?;
    let last_update_str: String = row.get(5)?;
    let created_at_str: String = row.get(6)?;
    Ok(PipelineExecution {
        id: row.get(0)?,
        session_id: row.get(1)?,
        worker_repository_id: row.get(2)?,
        pipeline_id: row.get(3)?,
        status,
        last_status_update: parse_ts(&last_update_str),
        created_at: parse_ts(&created_at_str),
    })
}

fn row_to_repo_target(row: &rusqlite::Row<'_>) -> rusqlite::Result<RepoTarget> {
    Ok(RepoTarget {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        clone_url: row.get(3)?,
    })
}

fn row_to_worker_repository(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkerRepository> {
    Ok(WorkerRepository {
        id: row.get(0)?,
        project_id: row.get(1)?,
        remote_project_id: row.get(2)?,
        host: row.get(3)?,
        encrypted_token: row.get(4)?,
        ci_version: row.get(5)?,
        pipeline_ref: row.get(6)?,
    })
}

fn row_to_lock_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<LockRecord> {
    let status_str: String = row.get(2)?;
    let status = LockStatus::parse(&status_str)
        .ok_or_else(|| bad_column(2, format!("unknown lock status {status_str:?}")))?;
    Ok(LockRecord {
        issue_id: row.get(0)?,
        scope_id: row.get(1)?,
        status,
        last_processed_at: parse_opt_ts(row.get(3)?),
        result_task_id: row.get(4)?,
        lock_holder_id: row.get(5)?,
        lock_acquired_at: parse_opt_ts(row.get(6)?),
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        Ok(())
    }

    // ── Lock records ──────────────────────────────────────────────────────
    //
    // Every transition here is a single SQL statement. The multi-process
    // deployment races independent workers against the same rows; a
    // read-then-write sequence would reintroduce exactly the race this
    // table exists to prevent.

    /// Atomically claim the (issue, scope) lock. Succeeds when no row
    /// exists, the row is not `processing`, or the current lock is older
    /// than `lock_timeout_secs`.
    pub fn try_acquire_lock(
        &self,
        issue_id: &str,
        scope_id: i64,
        holder_id: &str,
        lock_timeout_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let cutoff = now - Duration::seconds(lock_timeout_secs);
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "INSERT INTO lock_records (issue_id, scope_id, status, lock_holder_id, lock_acquired_at) \
                 VALUES (?1, ?2, 'processing', ?3, ?4) \
                 ON CONFLICT(issue_id, scope_id) DO UPDATE SET \
                   status = 'processing', \
                   lock_holder_id = excluded.lock_holder_id, \
                   lock_acquired_at = excluded.lock_acquired_at \
                 WHERE lock_records.status != 'processing' \
                    OR lock_records.lock_acquired_at <= ?5",
                params![issue_id, scope_id, holder_id, fmt_ts(now), fmt_ts(cutoff)],
            )
            .context("try_acquire_lock")?;
        Ok(n > 0)
    }

    /// Return the lock to `idle`. A no-op unless the record is currently
    /// `processing`, so releasing a never-locked or completed issue cannot
    /// clobber its state.
    pub fn release_lock(&self, issue_id: &str, scope_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE lock_records SET status='idle', lock_holder_id=NULL, lock_acquired_at=NULL \
             WHERE issue_id = ?1 AND scope_id = ?2 AND status = 'processing'",
            params![issue_id, scope_id],
        )
        .context("release_lock")?;
        Ok(())
    }

    /// Record successful completion. Unconditional upsert: a second
    /// completion signal overwrites the timestamp/task id rather than
    /// erroring.
    pub fn complete_lock(
        &self,
        issue_id: &str,
        scope_id: i64,
        completed_at: DateTime<Utc>,
        task_id: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO lock_records (issue_id, scope_id, status, last_processed_at, result_task_id) \
             VALUES (?1, ?2, 'completed', ?3, ?4) \
             ON CONFLICT(issue_id, scope_id) DO UPDATE SET \
               status = 'completed', \
               last_processed_at = excluded.last_processed_at, \
               result_task_id = excluded.result_task_id, \
               lock_holder_id = NULL, \
               lock_acquired_at = NULL",
            params![issue_id, scope_id, fmt_ts(completed_at), task_id],
        )
        .context("complete_lock")?;
        Ok(())
    }

    pub fn lock_processed_since(
        &self,
        issue_id: &str,
        scope_id: i64,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let found = conn
            .query_row(
                "SELECT 1 FROM lock_records \
                 WHERE issue_id = ?1 AND scope_id = ?2 \
                 AND status = 'completed' AND last_processed_at >= ?3",
                params![issue_id, scope_id, fmt_ts(since)],
                |_| Ok(()),
            )
            .optional()
            .context("lock_processed_since")?;
        Ok(found.is_some())
    }

    pub fn lock_result_task(&self, issue_id: &str, scope_id: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result: Option<Option<i64>> = conn
            .query_row(
                "SELECT result_task_id FROM lock_records \
                 WHERE issue_id = ?1 AND scope_id = ?2 AND status = 'completed'",
                params![issue_id, scope_id],
                |r| r.get(0),
            )
            .optional()
            .context("lock_result_task")?;
        Ok(result.flatten())
    }

    pub fn get_lock_record(&self, issue_id: &str, scope_id: i64) -> Result<Option<LockRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT issue_id, scope_id, status, last_processed_at, result_task_id, \
                 lock_holder_id, lock_acquired_at \
                 FROM lock_records WHERE issue_id = ?1 AND scope_id = ?2",
                params![issue_id, scope_id],
                row_to_lock_record,
            )
            .optional()
            .context("get_lock_record")?;
        Ok(result)
    }

    // ── Tasks ─────────────────────────────────────────────────────────────

    pub fn insert_task(
        &self,
        project_id: Option<i64>,
        task_source_id: Option<i64>,
        title: &str,
        description: &str,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO tasks (project_id, task_source_id, title, description, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                project_id,
                task_source_id,
                title,
                description,
                status.as_str(),
                fmt_ts(now)
            ],
        )
        .context("insert_task")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT id, project_id, task_source_id, title, description, status, created_at \
                 FROM tasks WHERE id = ?1",
                params![id],
                row_to_task,
            )
            .optional()
            .context("get_task")?;
        Ok(result)
    }

    pub fn update_task_status(&self, id: i64, status: TaskStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )
        .context("update_task_status")?;
        Ok(())
    }

    // ── Sessions ──────────────────────────────────────────────────────────

    pub fn insert_session(&self, task_id: i64, runner: &str, now: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO sessions (task_id, runner, created_at) VALUES (?1, ?2, ?3)",
            params![task_id, runner, fmt_ts(now)],
        )
        .context("insert_session")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_session(&self, id: i64) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT id, task_id, runner, created_at FROM sessions WHERE id = ?1",
                params![id],
                row_to_session,
            )
            .optional()
            .context("get_session")?;
        Ok(result)
    }

    // ── Messages ──────────────────────────────────────────────────────────

    pub fn insert_message(
        &self,
        session_id: i64,
        role: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO messages (session_id, role, content, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, role, content, fmt_ts(now)],
        )
        .context("insert_message")?;
        Ok(conn.last_insert_rowid())
    }

    /// Messages in emission order (insertion rowid, not wall clock, so
    /// same-second chunks never reorder on read).
    pub fn get_messages(&self, session_id: i64) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, content, created_at \
             FROM messages WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let messages = stmt
            .query_map(params![session_id], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_messages")?;
        Ok(messages)
    }

    // ── Projects / repo targets / worker repositories ─────────────────────

    pub fn upsert_project(&self, name: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO projects (name) VALUES (?1) \
             ON CONFLICT(name) DO UPDATE SET name = excluded.name",
            params![name],
        )
        .context("upsert_project")?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM projects WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .context("upsert_project get id")?;
        Ok(id)
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT id, name FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("get_project")?;
        Ok(result)
    }

    pub fn upsert_repo_target(
        &self,
        project_id: i64,
        name: &str,
        clone_url: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO repo_targets (project_id, name, clone_url) VALUES (?1, ?2, ?3) \
             ON CONFLICT(project_id, name) DO UPDATE SET clone_url = excluded.clone_url",
            params![project_id, name, clone_url],
        )
        .context("upsert_repo_target")?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM repo_targets WHERE project_id = ?1 AND name = ?2",
                params![project_id, name],
                |row| row.get(0),
            )
            .context("upsert_repo_target get id")?;
        Ok(id)
    }

    pub fn list_repo_targets(&self, project_id: i64) -> Result<Vec<RepoTarget>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, project_id, name, clone_url \
             FROM repo_targets WHERE project_id = ?1 ORDER BY id ASC",
        )?;
        let targets = stmt
            .query_map(params![project_id], row_to_repo_target)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_repo_targets")?;
        Ok(targets)
    }

    pub fn upsert_worker_repository(
        &self,
        project_id: i64,
        remote_project_id: &str,
        host: &str,
        encrypted_token: &str,
        ci_version: &str,
        pipeline_ref: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO worker_repositories \
             (project_id, remote_project_id, host, encrypted_token, ci_version, pipeline_ref) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(project_id) DO UPDATE SET \
               remote_project_id = excluded.remote_project_id, \
               host = excluded.host, \
               encrypted_token = excluded.encrypted_token, \
               ci_version = excluded.ci_version, \
               pipeline_ref = excluded.pipeline_ref",
            params![
                project_id,
                remote_project_id,
                host,
                encrypted_token,
                ci_version,
                pipeline_ref
            ],
        )
        .context("upsert_worker_repository")?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM worker_repositories WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .context("upsert_worker_repository get id")?;
        Ok(id)
    }

    pub fn get_worker_repository(&self, id: i64) -> Result<Option<WorkerRepository>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT id, project_id, remote_project_id, host, encrypted_token, ci_version, \
                 pipeline_ref FROM worker_repositories WHERE id = ?1",
                params![id],
                row_to_worker_repository,
            )
            .optional()
            .context("get_worker_repository")?;
        Ok(result)
    }

    pub fn worker_repository_for_project(
        &self,
        project_id: i64,
    ) -> Result<Option<WorkerRepository>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT id, project_id, remote_project_id, host, encrypted_token, ci_version, \
                 pipeline_ref FROM worker_repositories WHERE project_id = ?1",
                params![project_id],
                row_to_worker_repository,
            )
            .optional()
            .context("worker_repository_for_project")?;
        Ok(result)
    }

    // ── Pipeline executions ───────────────────────────────────────────────

    pub fn insert_pipeline_execution(
        &self,
        session_id: i64,
        worker_repository_id: i64,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO pipeline_executions \
             (session_id, worker_repository_id, pipeline_id, status, last_status_update, created_at) \
             VALUES (?1, ?2, '', 'pending', ?3, ?3)",
            params![session_id, worker_repository_id, fmt_ts(now)],
        )
        .context("insert_pipeline_execution")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_pipeline_execution(&self, id: i64) -> Result<Option<PipelineExecution>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT id, session_id, worker_repository_id, pipeline_id, status, \
                 last_status_update, created_at \
                 FROM pipeline_executions WHERE id = ?1",
                params![id],
                row_to_execution,
            )
            .optional()
            .context("get_pipeline_execution")?;
        Ok(result)
    }

    /// Persist the external pipeline handle after a successful trigger.
    pub fn record_pipeline_handle(
        &self,
        id: i64,
        pipeline_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE pipeline_executions \
             SET pipeline_id = ?1, status = 'pending', last_status_update = ?2 \
             WHERE id = ?3",
            params![pipeline_id, fmt_ts(now), id],
        )
        .context("record_pipeline_handle")?;
        Ok(())
    }

    /// Set the execution status and refresh the staleness clock, even when
    /// the status value itself is unchanged.
    pub fn update_pipeline_execution_status(
        &self,
        id: i64,
        status: PipelineStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE pipeline_executions SET status = ?1, last_status_update = ?2 WHERE id = ?3",
            params![status.as_str(), fmt_ts(now), id],
        )
        .context("update_pipeline_execution_status")?;
        Ok(())
    }

    /// Non-terminal executions whose staleness clock has fallen behind.
    pub fn find_stale_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<PipelineExecution>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, session_id, worker_repository_id, pipeline_id, status, \
             last_status_update, created_at \
             FROM pipeline_executions \
             WHERE status IN ('pending', 'running') AND last_status_update < ?1 \
             ORDER BY id ASC",
        )?;
        let executions = stmt
            .query_map(params![fmt_ts(older_than)], row_to_execution)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("find_stale_executions")?;
        Ok(executions)
    }
}
