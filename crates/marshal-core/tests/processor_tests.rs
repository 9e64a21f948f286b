use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use marshal_core::agent::{AgentBackend, AgentChunk, SessionRequest};
use marshal_core::ci::{CiClient, CiEndpoint, ExternalPipeline, TriggeredPipeline};
use marshal_core::db::Db;
use marshal_core::error::CiError;
use marshal_core::executor::PipelineExecutor;
use marshal_core::git::WorkspaceProvider;
use marshal_core::issue::{IssueProvider, IssueRecord};
use marshal_core::processor::{Dispatch, IssueProcessor, ProcessOutcome};
use marshal_core::runner::RunnerSelector;
use marshal_core::secrets::SecretKey;
use marshal_core::traffic_light::TrafficLight;
use marshal_core::types::{LockStatus, PipelineStatus, RepoTarget, TaskStatus};
use tokio::sync::mpsc;

fn mem_db() -> Arc<Db> {
    let db = Db::open(":memory:").unwrap();
    db.migrate().unwrap();
    Arc::new(db)
}

fn test_key() -> SecretKey {
    SecretKey::from_base64(&BASE64.encode([7u8; 32])).unwrap()
}

fn issue(project_id: i64) -> IssueRecord {
    IssueRecord {
        id: 77,
        iid: Some(5),
        title: "Crash on logout".to_string(),
        description: "Logging out with an expired session panics.".to_string(),
        updated_at: Utc::now(),
        unique_id: "gitlab-77".to_string(),
        provider: IssueProvider::GitLab,
        project_id,
        task_source_id: None,
    }
}

/// Replays a fixed chunk script, then closes the stream.
struct ScriptedAgent {
    chunks: Vec<AgentChunk>,
}

#[async_trait]
impl AgentBackend for ScriptedAgent {
    async fn run_session(&self, _req: SessionRequest) -> Result<mpsc::Receiver<AgentChunk>> {
        let (tx, rx) = mpsc::channel(16);
        let chunks = self.chunks.clone();
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// Hands out scratch directories instead of real git checkouts.
struct TempWorkspaces {
    root: tempfile::TempDir,
}

impl TempWorkspaces {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            root: tempfile::tempdir().unwrap(),
        })
    }
}

impl WorkspaceProvider for TempWorkspaces {
    fn prepare(&self, target: &RepoTarget, branch: &str) -> Result<String> {
        let dir = self
            .root
            .path()
            .join(&target.name)
            .join(branch.replace('/', "-"));
        std::fs::create_dir_all(&dir)?;
        Ok(dir.to_string_lossy().into_owned())
    }
}

struct RecordingCi;

#[async_trait]
impl CiClient for RecordingCi {
    async fn trigger_pipeline(
        &self,
        _endpoint: &CiEndpoint,
        _pipeline_ref: &str,
        _variables: &[(String, String)],
    ) -> Result<TriggeredPipeline, CiError> {
        Ok(TriggeredPipeline {
            id: "9001".to_string(),
            url: "https://gitlab.example/demo/-/pipelines/9001".to_string(),
        })
    }

    async fn get_pipeline(
        &self,
        _endpoint: &CiEndpoint,
        _pipeline_id: &str,
    ) -> Result<ExternalPipeline, CiError> {
        Err(CiError::config("get_pipeline not expected in this test"))
    }
}

fn seed_project(db: &Db, with_target: bool) -> i64 {
    let project_id = db.upsert_project("demo").unwrap();
    if with_target {
        db.upsert_repo_target(project_id, "api", "https://gitlab.example/demo/api.git")
            .unwrap();
    }
    project_id
}

fn agent_processor(db: &Arc<Db>, chunks: Vec<AgentChunk>) -> IssueProcessor {
    IssueProcessor::new(
        Arc::clone(db),
        Arc::new(RunnerSelector::new(vec!["claude".into(), "codex".into()]).unwrap()),
        TempWorkspaces::new(),
        Dispatch::Agent(Arc::new(ScriptedAgent { chunks })),
        "worker-1".to_string(),
        3600,
    )
}

#[tokio::test]
async fn test_successful_run_completes_task_and_lock() {
    let db = mem_db();
    let project_id = seed_project(&db, true);
    let processor = agent_processor(
        &db,
        vec![
            AgentChunk::System {
                content: "agent session abc123".to_string(),
            },
            AgentChunk::Progress {
                content: "patched logout handler".to_string(),
            },
            AgentChunk::Result {
                content: "done; tests pass".to_string(),
            },
        ],
    );
    let issue = issue(project_id);

    let outcome = processor.process_issue(&issue).await.unwrap();
    let ProcessOutcome::Dispatched { task_id } = outcome else {
        panic!("expected Dispatched, got {outcome:?}");
    };

    let task = db.get_task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.project_id, Some(project_id));

    // Every chunk persisted, in emission order.
    let messages = db.get_messages(1).unwrap();
    let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
    assert_eq!(roles, vec!["system", "progress", "result"]);

    let light = TrafficLight::new(Arc::clone(&db));
    assert_eq!(
        light.completed_task_for(&issue.unique_id, project_id).unwrap(),
        Some(task_id)
    );

    // A second sweep with the same updated_at is a dedup skip.
    let again = processor.process_issue(&issue).await.unwrap();
    assert_eq!(again, ProcessOutcome::AlreadyProcessed);
}

#[tokio::test]
async fn test_mid_stream_failure_releases_lock_and_leaves_task_processing() {
    let db = mem_db();
    let project_id = seed_project(&db, true);
    // Stream ends without a terminal result chunk.
    let processor = agent_processor(
        &db,
        vec![AgentChunk::Progress {
            content: "started looking".to_string(),
        }],
    );
    let issue = issue(project_id);

    let result = processor.process_issue(&issue).await;
    assert!(result.is_err());

    let task = db.get_task(1).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Processing);

    // The lock is free again: a retry claims it immediately.
    let light = TrafficLight::new(Arc::clone(&db));
    assert!(light
        .try_acquire(&issue.unique_id, project_id, "worker-2", 3600)
        .unwrap());
}

#[tokio::test]
async fn test_issue_without_repo_targets_is_a_hard_error() {
    let db = mem_db();
    let project_id = seed_project(&db, false);
    let processor = agent_processor(
        &db,
        vec![AgentChunk::Result {
            content: "unreachable".to_string(),
        }],
    );
    let issue = issue(project_id);

    let result = processor.process_issue(&issue).await;
    assert!(result.is_err());

    // Failed before any task was created, and the lock is released.
    assert!(db.get_task(1).unwrap().is_none());
    let record = db.get_lock_record(&issue.unique_id, project_id).unwrap().unwrap();
    assert_eq!(record.status, LockStatus::Idle);
}

#[tokio::test]
async fn test_lock_held_elsewhere_is_a_normal_skip() {
    let db = mem_db();
    let project_id = seed_project(&db, true);
    let issue = issue(project_id);

    let light = TrafficLight::new(Arc::clone(&db));
    assert!(light
        .try_acquire(&issue.unique_id, project_id, "other-worker", 3600)
        .unwrap());

    let processor = agent_processor(
        &db,
        vec![AgentChunk::Result {
            content: "unreachable".to_string(),
        }],
    );
    let outcome = processor.process_issue(&issue).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::LockDenied);
    assert!(db.get_task(1).unwrap().is_none());
}

#[tokio::test]
async fn test_ci_dispatch_hands_off_and_completes_lock() {
    let db = mem_db();
    let key = test_key();
    let project_id = seed_project(&db, true);
    let token = key.encrypt("gl-token").unwrap();
    db.upsert_worker_repository(project_id, "123", "https://gitlab.example", &token, "v3", "main")
        .unwrap();

    let executor = Arc::new(PipelineExecutor::new(
        Arc::clone(&db),
        Arc::new(RecordingCi),
        key,
    ));
    let processor = IssueProcessor::new(
        Arc::clone(&db),
        Arc::new(RunnerSelector::new(vec!["claude".into()]).unwrap()),
        TempWorkspaces::new(),
        Dispatch::Ci(executor),
        "worker-1".to_string(),
        3600,
    );
    let issue = issue(project_id);

    let outcome = processor.process_issue(&issue).await.unwrap();
    let ProcessOutcome::Dispatched { task_id } = outcome else {
        panic!("expected Dispatched, got {outcome:?}");
    };

    // The execution record carries the external handle.
    let execution = db.get_pipeline_execution(1).unwrap().unwrap();
    assert_eq!(execution.pipeline_id, "9001");
    assert_eq!(execution.status, PipelineStatus::Pending);

    // Hand-off satisfies the dedup gate; the task itself stays processing
    // until the pipeline's outcome is known.
    let light = TrafficLight::new(Arc::clone(&db));
    assert_eq!(
        light.completed_task_for(&issue.unique_id, project_id).unwrap(),
        Some(task_id)
    );
    let task = db.get_task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Processing);
}

#[tokio::test]
async fn test_runner_selection_round_robins_across_issues() {
    let db = mem_db();
    let project_id = seed_project(&db, true);
    let processor = agent_processor(
        &db,
        vec![AgentChunk::Result {
            content: "ok".to_string(),
        }],
    );

    for n in 0..3 {
        let mut rec = issue(project_id);
        rec.id = 100 + n;
        rec.unique_id = format!("gitlab-{}", rec.id);
        processor.process_issue(&rec).await.unwrap();
    }

    let runners: Vec<String> = (1..=3)
        .map(|id| db.get_session(id).unwrap().unwrap().runner)
        .collect();
    assert_eq!(runners, vec!["claude", "codex", "claude"]);
}
