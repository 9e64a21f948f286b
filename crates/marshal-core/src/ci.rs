use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::CiError;
use crate::secrets::SecretKey;
use crate::types::{PipelineStatus, WorkerRepository};

/// Trigger calls get three attempts with exponential backoff starting at
/// two seconds; non-retryable errors abort without consuming the budget.
pub const TRIGGER_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

/// A resolved, decrypted CI endpoint for one worker repository.
#[derive(Debug)]
pub struct CiEndpoint {
    pub host: String,
    pub token: String,
    pub remote_project_id: String,
}

pub struct TriggeredPipeline {
    /// External pipeline handle.
    pub id: String,
    pub url: String,
}

pub struct ExternalPipeline {
    /// Raw status string in the CI system's vocabulary.
    pub status: String,
}

#[async_trait]
pub trait CiClient: Send + Sync {
    async fn trigger_pipeline(
        &self,
        endpoint: &CiEndpoint,
        pipeline_ref: &str,
        variables: &[(String, String)],
    ) -> Result<TriggeredPipeline, CiError>;

    async fn get_pipeline(
        &self,
        endpoint: &CiEndpoint,
        pipeline_id: &str,
    ) -> Result<ExternalPipeline, CiError>;
}

// ── GitLab implementation ─────────────────────────────────────────────────

pub struct GitLabCi {
    client: reqwest::Client,
}

impl GitLabCi {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for GitLabCi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CiClient for GitLabCi {
    async fn trigger_pipeline(
        &self,
        endpoint: &CiEndpoint,
        pipeline_ref: &str,
        variables: &[(String, String)],
    ) -> Result<TriggeredPipeline, CiError> {
        let url = format!(
            "{}/api/v4/projects/{}/pipeline",
            endpoint.host.trim_end_matches('/'),
            endpoint.remote_project_id
        );
        let vars: Vec<Value> = variables
            .iter()
            .map(|(k, v)| json!({"key": k, "value": v}))
            .collect();
        let resp = self
            .client
            .post(&url)
            .header("PRIVATE-TOKEN", &endpoint.token)
            .json(&json!({"ref": pipeline_ref, "variables": vars}))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = resp.json().await?;
        let id = body
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| CiError::config(format!("trigger response missing pipeline id: {body}")))?;
        let web_url = body
            .get("web_url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(TriggeredPipeline {
            id: id.to_string(),
            url: web_url,
        })
    }

    async fn get_pipeline(
        &self,
        endpoint: &CiEndpoint,
        pipeline_id: &str,
    ) -> Result<ExternalPipeline, CiError> {
        let url = format!(
            "{}/api/v4/projects/{}/pipelines/{}",
            endpoint.host.trim_end_matches('/'),
            endpoint.remote_project_id,
            pipeline_id
        );
        let resp = self
            .client
            .get(&url)
            .header("PRIVATE-TOKEN", &endpoint.token)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = resp.json().await?;
        let status = body
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| CiError::config(format!("pipeline response missing status: {body}")))?
            .to_string();
        Ok(ExternalPipeline { status })
    }
}

// ── Endpoint resolution ───────────────────────────────────────────────────

/// Validate a worker repository's CI descriptor and decrypt its credential.
/// Every failure here is a configuration error; the retry loop never sees
/// these.
pub fn resolve_endpoint(
    repo: &WorkerRepository,
    key: &SecretKey,
) -> Result<CiEndpoint, CiError> {
    if repo.remote_project_id.is_empty() {
        return Err(CiError::config(format!(
            "worker repository {} has no remote project id",
            repo.id
        )));
    }
    if repo.host.is_empty() {
        return Err(CiError::config(format!(
            "worker repository {} has no host",
            repo.id
        )));
    }
    if repo.encrypted_token.is_empty() {
        return Err(CiError::config(format!(
            "worker repository {} has no credential",
            repo.id
        )));
    }
    if repo.ci_version.is_empty() {
        return Err(CiError::config(format!(
            "worker repository {} has no current CI version",
            repo.id
        )));
    }
    let token = key.decrypt(&repo.encrypted_token)?;
    Ok(CiEndpoint {
        host: repo.host.clone(),
        token,
        remote_project_id: repo.remote_project_id.clone(),
    })
}

// ── Status mapping ────────────────────────────────────────────────────────

/// Map the CI system's status vocabulary onto the internal five-state
/// enum. Unrecognised values fail closed.
pub fn map_pipeline_status(external: &str) -> PipelineStatus {
    match external {
        "created" | "pending" | "queued" | "preparing" | "waiting_for_resource"
        | "waiting_for_callback" | "scheduled" => PipelineStatus::Pending,
        "running" => PipelineStatus::Running,
        "success" => PipelineStatus::Success,
        "failed" => PipelineStatus::Failed,
        "canceled" | "canceling" | "skipped" | "manual" => PipelineStatus::Canceled,
        other => {
            warn!(status = other, "unexpected external pipeline status, treating as failed");
            PipelineStatus::Failed
        }
    }
}

// ── Retry ─────────────────────────────────────────────────────────────────

/// Run `call` up to `attempts` times, sleeping with exponential backoff
/// between retryable failures. Non-retryable errors abort immediately.
pub async fn with_retry<T, F, Fut>(label: &str, attempts: u32, mut call: F) -> Result<T, CiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CiError>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1u32;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if e.retryable() && attempt < attempts => {
                warn!(attempt, "{label} failed, retrying in {delay:?}: {e}");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
