use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::db::Db;

/// The dedup + mutual-exclusion gate for issue processing.
///
/// Multiple independent worker processes race for the same lock rows, so
/// every operation delegates to a single conditional SQL statement in the
/// lock store. A store outage surfaces as an error to the caller — it is
/// never treated as "not locked", which would break mutual exclusion.
#[derive(Clone)]
pub struct TrafficLight {
    db: Arc<Db>,
}

impl TrafficLight {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// True iff the issue completed successfully at or after `since`. The
    /// idempotence gate: issues whose upstream `updated_at` has not advanced
    /// past the last successful run are skipped on every poll cycle.
    pub fn is_processed_since(
        &self,
        issue_id: &str,
        scope_id: i64,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        self.db.lock_processed_since(issue_id, scope_id, since)
    }

    /// Claim the issue for `holder_id`. Returns false when another holder
    /// owns a lock younger than `lock_timeout_secs`; a stale lock (crashed
    /// or stuck worker) is re-acquirable by anyone, including the original
    /// holder after a restart.
    pub fn try_acquire(
        &self,
        issue_id: &str,
        scope_id: i64,
        holder_id: &str,
        lock_timeout_secs: i64,
    ) -> Result<bool> {
        self.db
            .try_acquire_lock(issue_id, scope_id, holder_id, lock_timeout_secs, Utc::now())
    }

    /// Give the issue back after a processing failure so another worker (or
    /// a retry) can claim it. Idempotent; releasing an idle or never-locked
    /// issue is a no-op.
    pub fn release(&self, issue_id: &str, scope_id: i64) -> Result<()> {
        self.db.release_lock(issue_id, scope_id)
    }

    /// Record successful completion. Idempotent by (issue, scope): a second
    /// completion overwrites the timestamp and task id.
    pub fn mark_complete(
        &self,
        issue_id: &str,
        scope_id: i64,
        completed_at: DateTime<Utc>,
        task_id: i64,
    ) -> Result<()> {
        self.db
            .complete_lock(issue_id, scope_id, completed_at, task_id)
    }

    pub fn completed_task_for(&self, issue_id: &str, scope_id: i64) -> Result<Option<i64>> {
        self.db.lock_result_task(issue_id, scope_id)
    }
}
