use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use marshal_core::ci::{CiClient, CiEndpoint, ExternalPipeline, TriggeredPipeline};
use marshal_core::db::Db;
use marshal_core::error::CiError;
use marshal_core::monitor::PipelineMonitor;
use marshal_core::secrets::SecretKey;
use marshal_core::types::{PipelineStatus, TaskStatus};

fn mem_db() -> Arc<Db> {
    let db = Db::open(":memory:").unwrap();
    db.migrate().unwrap();
    Arc::new(db)
}

fn test_key() -> SecretKey {
    SecretKey::from_base64(&BASE64.encode([7u8; 32])).unwrap()
}

/// Seed project → worker repository → task → session; returns
/// (session_id, worker_repository_id).
fn seed(db: &Db, key: &SecretKey) -> (i64, i64) {
    let project_id = db.upsert_project("demo").unwrap();
    let token = key.encrypt("gl-token").unwrap();
    let repo_id = db
        .upsert_worker_repository(project_id, "123", "https://gitlab.example", &token, "v3", "main")
        .unwrap();
    let task_id = db
        .insert_task(
            Some(project_id),
            None,
            "watched task",
            "",
            TaskStatus::Processing,
            Utc::now(),
        )
        .unwrap();
    let session_id = db.insert_session(task_id, "claude", Utc::now()).unwrap();
    (session_id, repo_id)
}

/// Insert an execution whose staleness clock is `age_mins` in the past.
fn seed_execution(
    db: &Db,
    session_id: i64,
    repo_id: i64,
    pipeline_id: &str,
    status: PipelineStatus,
    age_mins: i64,
) -> i64 {
    let id = db
        .insert_pipeline_execution(session_id, repo_id, Utc::now())
        .unwrap();
    if !pipeline_id.is_empty() {
        db.record_pipeline_handle(id, pipeline_id, Utc::now())
            .unwrap();
    }
    db.update_pipeline_execution_status(id, status, Utc::now() - chrono::Duration::minutes(age_mins))
        .unwrap();
    id
}

/// Serves one status string; individual pipeline ids can be made to fail.
struct StatusCi {
    status: String,
    fail_for: Option<String>,
    calls: AtomicU32,
    fetched: Mutex<Vec<String>>,
}

impl StatusCi {
    fn new(status: &str) -> Arc<Self> {
        Arc::new(Self {
            status: status.to_string(),
            fail_for: None,
            calls: AtomicU32::new(0),
            fetched: Mutex::new(Vec::new()),
        })
    }

    fn failing_for(status: &str, bad_pipeline: &str) -> Arc<Self> {
        Arc::new(Self {
            status: status.to_string(),
            fail_for: Some(bad_pipeline.to_string()),
            calls: AtomicU32::new(0),
            fetched: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CiClient for StatusCi {
    async fn trigger_pipeline(
        &self,
        _endpoint: &CiEndpoint,
        _pipeline_ref: &str,
        _variables: &[(String, String)],
    ) -> Result<TriggeredPipeline, CiError> {
        Err(CiError::config("trigger not expected in this test"))
    }

    async fn get_pipeline(
        &self,
        _endpoint: &CiEndpoint,
        pipeline_id: &str,
    ) -> Result<ExternalPipeline, CiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.fetched.lock().unwrap().push(pipeline_id.to_string());
        if self.fail_for.as_deref() == Some(pipeline_id) {
            return Err(CiError::config("pipeline lookup rejected"));
        }
        Ok(ExternalPipeline {
            status: self.status.clone(),
        })
    }
}

fn monitor(db: &Arc<Db>, ci: Arc<dyn CiClient>) -> Arc<PipelineMonitor> {
    PipelineMonitor::new(
        Arc::clone(db),
        ci,
        test_key(),
        30,
        Duration::from_secs(600),
    )
}

#[tokio::test(start_paused = true)]
async fn test_scan_only_touches_executions_past_the_window() {
    let db = mem_db();
    let key = test_key();
    let (session_id, repo_id) = seed(&db, &key);
    seed_execution(&db, session_id, repo_id, "p-5", PipelineStatus::Running, 5);
    let stale_id = seed_execution(&db, session_id, repo_id, "p-45", PipelineStatus::Running, 45);
    seed_execution(&db, session_id, repo_id, "p-10", PipelineStatus::Running, 10);

    let ci = StatusCi::new("running");
    let reconciled = monitor(&db, ci.clone()).scan_stale(30).await.unwrap();

    assert_eq!(reconciled, 1);
    assert_eq!(*ci.fetched.lock().unwrap(), vec!["p-45".to_string()]);
    let refreshed = db.get_pipeline_execution(stale_id).unwrap().unwrap();
    assert!(refreshed.last_status_update > Utc::now() - chrono::Duration::minutes(1));
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_refreshes_clock_even_when_status_is_unchanged() {
    let db = mem_db();
    let key = test_key();
    let (session_id, repo_id) = seed(&db, &key);
    let id = seed_execution(&db, session_id, repo_id, "p-1", PipelineStatus::Running, 45);

    monitor(&db, StatusCi::new("running")).reconcile_one(id).await.unwrap();

    let execution = db.get_pipeline_execution(id).unwrap().unwrap();
    assert_eq!(execution.status, PipelineStatus::Running);
    assert!(execution.last_status_update > Utc::now() - chrono::Duration::minutes(1));
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_skips_execution_without_pipeline_handle() {
    let db = mem_db();
    let key = test_key();
    let (session_id, repo_id) = seed(&db, &key);
    let id = seed_execution(&db, session_id, repo_id, "", PipelineStatus::Pending, 45);

    let ci = StatusCi::new("running");
    monitor(&db, ci.clone()).reconcile_one(id).await.unwrap();

    // Nothing to check yet: no external call, clock untouched.
    assert_eq!(ci.calls.load(Ordering::SeqCst), 0);
    let execution = db.get_pipeline_execution(id).unwrap().unwrap();
    assert!(execution.last_status_update < Utc::now() - chrono::Duration::minutes(40));
}

#[tokio::test(start_paused = true)]
async fn test_scan_isolates_per_execution_failures() {
    let db = mem_db();
    let key = test_key();
    let (session_id, repo_id) = seed(&db, &key);
    let bad = seed_execution(&db, session_id, repo_id, "p-bad", PipelineStatus::Running, 50);
    let good = seed_execution(&db, session_id, repo_id, "p-good", PipelineStatus::Running, 45);

    let ci = StatusCi::failing_for("success", "p-bad");
    let reconciled = monitor(&db, ci.clone()).scan_stale(30).await.unwrap();

    // The bad execution did not abort the batch.
    assert_eq!(reconciled, 1);
    assert_eq!(ci.calls.load(Ordering::SeqCst), 2);
    let good_row = db.get_pipeline_execution(good).unwrap().unwrap();
    assert_eq!(good_row.status, PipelineStatus::Success);
    let bad_row = db.get_pipeline_execution(bad).unwrap().unwrap();
    assert_eq!(bad_row.status, PipelineStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_external_status_reconciles_to_failed() {
    let db = mem_db();
    let key = test_key();
    let (session_id, repo_id) = seed(&db, &key);
    let id = seed_execution(&db, session_id, repo_id, "p-1", PipelineStatus::Running, 45);

    monitor(&db, StatusCi::new("weird_unknown")).reconcile_one(id).await.unwrap();

    let execution = db.get_pipeline_execution(id).unwrap().unwrap();
    assert_eq!(execution.status, PipelineStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_executions_drop_out_of_the_stale_scan() {
    let db = mem_db();
    let key = test_key();
    let (session_id, repo_id) = seed(&db, &key);
    seed_execution(&db, session_id, repo_id, "p-1", PipelineStatus::Running, 45);

    let ci = StatusCi::new("success");
    let mon = monitor(&db, ci.clone());
    assert_eq!(mon.scan_stale(30).await.unwrap(), 1);
    // Now terminal; a second sweep finds nothing to do.
    assert_eq!(mon.scan_stale(30).await.unwrap(), 0);
    assert_eq!(ci.calls.load(Ordering::SeqCst), 1);
}
