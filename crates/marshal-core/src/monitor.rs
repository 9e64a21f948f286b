use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::ci::{self, CiClient, TRIGGER_ATTEMPTS};
use crate::db::Db;
use crate::secrets::SecretKey;

/// Safety net for externally-executed pipelines: the CI system may never
/// deliver a final status update, so executions stuck past a staleness
/// window get their true status re-fetched and reconciled on a polling
/// cadence.
pub struct PipelineMonitor {
    db: Arc<Db>,
    ci: Arc<dyn CiClient>,
    key: SecretKey,
    timeout_minutes: i64,
    poll_interval: Duration,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineMonitor {
    pub fn new(
        db: Arc<Db>,
        ci: Arc<dyn CiClient>,
        key: SecretKey,
        timeout_minutes: i64,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            ci,
            key,
            timeout_minutes,
            poll_interval,
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
        })
    }

    /// Re-fetch one execution's true status from the CI system and
    /// reconcile. Refreshes the staleness clock on every successful check,
    /// even when the mapped status is unchanged — `last_status_update` is a
    /// clock, not a change-log.
    pub async fn reconcile_one(&self, execution_id: i64) -> Result<()> {
        let execution = self
            .db
            .get_pipeline_execution(execution_id)?
            .ok_or_else(|| anyhow!("pipeline execution {execution_id} not found"))?;
        if execution.pipeline_id.is_empty() {
            info!(execution_id, "no external pipeline handle yet, skipping");
            return Ok(());
        }
        let repo = self
            .db
            .get_worker_repository(execution.worker_repository_id)?
            .ok_or_else(|| {
                anyhow!(
                    "worker repository {} for execution {execution_id} not found",
                    execution.worker_repository_id
                )
            })?;
        let endpoint = ci::resolve_endpoint(&repo, &self.key)?;

        let external = ci::with_retry("fetch pipeline status", TRIGGER_ATTEMPTS, || {
            self.ci.get_pipeline(&endpoint, &execution.pipeline_id)
        })
        .await?;

        let mapped = ci::map_pipeline_status(&external.status);
        self.db
            .update_pipeline_execution_status(execution_id, mapped, Utc::now())?;
        if mapped != execution.status {
            info!(
                execution_id,
                pipeline_id = %execution.pipeline_id,
                from = execution.status.as_str(),
                to = mapped.as_str(),
                "reconciled pipeline status"
            );
        }
        Ok(())
    }

    /// Reconcile every non-terminal execution whose `last_status_update` is
    /// older than `timeout_minutes`. One bad execution never aborts the
    /// batch. Returns the number successfully reconciled.
    pub async fn scan_stale(&self, timeout_minutes: i64) -> Result<usize> {
        let older_than = Utc::now() - chrono::Duration::minutes(timeout_minutes);
        let stale = self.db.find_stale_executions(older_than)?;
        let mut reconciled = 0usize;
        for execution in &stale {
            match self.reconcile_one(execution.id).await {
                Ok(()) => reconciled += 1,
                Err(e) => warn!(execution_id = execution.id, "reconcile failed: {e}"),
            }
        }
        Ok(reconciled)
    }

    /// Spawn the periodic scan loop. Runs once immediately so a restart
    /// does not wait a full interval before the first check.
    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        let token = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                match monitor.scan_stale(monitor.timeout_minutes).await {
                    Ok(n) if n > 0 => info!(reconciled = n, "stale pipeline scan complete"),
                    Ok(_) => {}
                    Err(e) => error!("stale pipeline scan: {e}"),
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(monitor.poll_interval) => {}
                }
            }
        });
        let mut guard = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(handle);
    }

    /// Cancel the scan loop and wait for it to finish.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = {
            let mut guard = self.handle.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
