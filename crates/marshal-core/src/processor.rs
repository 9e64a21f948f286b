use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::agent::{AgentBackend, SessionRequest};
use crate::db::Db;
use crate::executor::PipelineExecutor;
use crate::git::WorkspaceProvider;
use crate::issue::IssueRecord;
use crate::runner::RunnerSelector;
use crate::traffic_light::TrafficLight;
use crate::types::TaskStatus;

/// How a claimed issue is turned into work: a direct in-process agent run,
/// or an externalized CI-pipeline execution.
pub enum Dispatch {
    Agent(Arc<dyn AgentBackend>),
    Ci(Arc<PipelineExecutor>),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Completed at or after the issue's current `updated_at`; nothing to do.
    AlreadyProcessed,
    /// Another worker holds the lock (or won the race). Normal skip.
    LockDenied,
    Dispatched { task_id: i64 },
}

/// The per-issue state machine:
/// seen → (skip if completed-since) → lock → task/session/workspaces →
/// dispatch → {complete | release-on-failure}.
pub struct IssueProcessor {
    db: Arc<Db>,
    traffic: TrafficLight,
    runners: Arc<RunnerSelector>,
    workspaces: Arc<dyn WorkspaceProvider>,
    dispatch: Dispatch,
    worker_id: String,
    lock_timeout_secs: i64,
}

impl IssueProcessor {
    pub fn new(
        db: Arc<Db>,
        runners: Arc<RunnerSelector>,
        workspaces: Arc<dyn WorkspaceProvider>,
        dispatch: Dispatch,
        worker_id: String,
        lock_timeout_secs: i64,
    ) -> Self {
        let traffic = TrafficLight::new(Arc::clone(&db));
        Self {
            db,
            traffic,
            runners,
            workspaces,
            dispatch,
            worker_id,
            lock_timeout_secs,
        }
    }

    pub async fn process_issue(&self, issue: &IssueRecord) -> Result<ProcessOutcome> {
        if self
            .traffic
            .is_processed_since(&issue.unique_id, issue.project_id, issue.updated_at)?
        {
            return Ok(ProcessOutcome::AlreadyProcessed);
        }
        if !self.traffic.try_acquire(
            &issue.unique_id,
            issue.project_id,
            &self.worker_id,
            self.lock_timeout_secs,
        )? {
            info!(issue = %issue.unique_id, "lock held elsewhere, skipping");
            return Ok(ProcessOutcome::LockDenied);
        }
        info!(issue = %issue.unique_id, holder = %self.worker_id, "claimed issue");

        match self.run_locked(issue).await {
            Ok(task_id) => Ok(ProcessOutcome::Dispatched { task_id }),
            Err(e) => {
                // Make the issue retryable again before surfacing the error.
                if let Err(release_err) = self.traffic.release(&issue.unique_id, issue.project_id)
                {
                    warn!(issue = %issue.unique_id, "release after failure: {release_err}");
                }
                Err(e)
            }
        }
    }

    async fn run_locked(&self, issue: &IssueRecord) -> Result<i64> {
        let targets = self.db.list_repo_targets(issue.project_id)?;
        if targets.is_empty() {
            bail!(
                "project {} has no repository targets; nothing to operate on for issue {}",
                issue.project_id,
                issue.unique_id
            );
        }

        let runner = self.runners.select().to_string();
        let task_id = self.db.insert_task(
            Some(issue.project_id),
            issue.task_source_id,
            &issue.title,
            &issue.description,
            TaskStatus::Processing,
            Utc::now(),
        )?;
        let session_id = self.db.insert_session(task_id, &runner, Utc::now())?;

        let branch = issue.branch_name();
        let mut workspace_paths = Vec::with_capacity(targets.len());
        for target in &targets {
            let path = self
                .workspaces
                .prepare(target, &branch)
                .with_context(|| {
                    format!(
                        "prepare workspace {} for issue {}",
                        target.name, issue.unique_id
                    )
                })?;
            workspace_paths.push(path);
        }

        match &self.dispatch {
            Dispatch::Agent(backend) => {
                let request = SessionRequest {
                    session_id,
                    runner,
                    issue: issue.clone(),
                    workspaces: workspace_paths,
                };
                let mut chunks = backend.run_session(request).await?;

                let mut finished = false;
                while let Some(chunk) = chunks.recv().await {
                    self.db
                        .insert_message(session_id, chunk.role(), chunk.content(), Utc::now())?;
                    if chunk.is_result() {
                        finished = true;
                    }
                }
                if !finished {
                    bail!("agent stream for session {session_id} ended without a result chunk");
                }

                self.db.update_task_status(task_id, TaskStatus::Completed)?;
                self.traffic
                    .mark_complete(&issue.unique_id, issue.project_id, Utc::now(), task_id)?;
                info!(issue = %issue.unique_id, task_id, "issue completed");
            }
            Dispatch::Ci(executor) => {
                let outcome = executor.trigger(session_id).await?;
                // The pipeline's own outcome is the monitor's problem from
                // here; a successful hand-off satisfies the dedup gate.
                self.traffic
                    .mark_complete(&issue.unique_id, issue.project_id, Utc::now(), task_id)?;
                info!(
                    issue = %issue.unique_id,
                    task_id,
                    execution_id = outcome.execution_id,
                    url = %outcome.pipeline_url,
                    "issue handed off to CI pipeline"
                );
            }
        }

        Ok(task_id)
    }
}
