use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::ci::{self, CiClient, TRIGGER_ATTEMPTS};
use crate::db::Db;
use crate::secrets::SecretKey;
use crate::types::PipelineStatus;

pub struct TriggerOutcome {
    pub execution_id: i64,
    pub pipeline_url: String,
}

/// Turns a session into an externally-executed CI pipeline run.
pub struct PipelineExecutor {
    db: Arc<Db>,
    ci: Arc<dyn CiClient>,
    key: SecretKey,
}

impl PipelineExecutor {
    pub fn new(db: Arc<Db>, ci: Arc<dyn CiClient>, key: SecretKey) -> Self {
        Self { db, ci, key }
    }

    /// Resolve the session → task → project → worker-repository chain,
    /// create the execution record, and trigger the external pipeline.
    ///
    /// The execution record is created *before* the trigger call: if the
    /// call succeeds and the process dies before the handle is persisted,
    /// the monitor's stale scan still finds the `pending` row and can
    /// reconcile it. Any failure after creation marks the record `failed`
    /// before propagating, so nothing is left silently pending forever.
    pub async fn trigger(&self, session_id: i64) -> Result<TriggerOutcome> {
        let session = self
            .db
            .get_session(session_id)?
            .ok_or_else(|| anyhow!("session {session_id} not found"))?;
        let task = self
            .db
            .get_task(session.task_id)?
            .ok_or_else(|| anyhow!("task {} for session {session_id} not found", session.task_id))?;
        let project_id = task
            .project_id
            .ok_or_else(|| anyhow!("task {} is not linked to a project", task.id))?;
        let repo = self
            .db
            .worker_repository_for_project(project_id)?
            .ok_or_else(|| {
                anyhow!(
                    "project {project_id} has no worker repository registered; \
                     register one before dispatching pipelines"
                )
            })?;
        let endpoint = ci::resolve_endpoint(&repo, &self.key)?;

        let execution_id = self
            .db
            .insert_pipeline_execution(session_id, repo.id, Utc::now())?;

        let variables = vec![
            ("MARSHAL_SESSION_ID".to_string(), session_id.to_string()),
            ("MARSHAL_EXECUTION_ID".to_string(), execution_id.to_string()),
            (
                "MARSHAL_CI_CONFIG".to_string(),
                format!("{}/{}.yml", repo.ci_version, session.runner),
            ),
        ];

        let triggered = ci::with_retry("trigger pipeline", TRIGGER_ATTEMPTS, || {
            self.ci
                .trigger_pipeline(&endpoint, &repo.pipeline_ref, &variables)
        })
        .await;

        match triggered {
            Ok(pipeline) => {
                self.db
                    .record_pipeline_handle(execution_id, &pipeline.id, Utc::now())?;
                info!(
                    execution_id,
                    pipeline_id = %pipeline.id,
                    session_id,
                    "pipeline triggered"
                );
                Ok(TriggerOutcome {
                    execution_id,
                    pipeline_url: pipeline.url,
                })
            }
            Err(e) => {
                if let Err(db_err) = self.db.update_pipeline_execution_status(
                    execution_id,
                    PipelineStatus::Failed,
                    Utc::now(),
                ) {
                    warn!(execution_id, "mark execution failed: {db_err}");
                }
                Err(anyhow::Error::new(e)
                    .context(format!("trigger pipeline for session {session_id}")))
            }
        }
    }
}
