use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marshal_core::issue::{IssueProvider, IssueRecord, IssueSource};
use serde_json::Value;
use tracing::warn;

/// Polls one GitLab project for issues updated since the previous sweep.
pub struct GitLabIssueSource {
    client: reqwest::Client,
    host: String,
    token: String,
    /// Remote project path or numeric id as GitLab expects it.
    remote_project: String,
    /// Local project scope the fetched issues are processed under.
    project_id: i64,
    last_sweep: Mutex<Option<DateTime<Utc>>>,
}

impl GitLabIssueSource {
    pub fn new(
        host: impl Into<String>,
        token: impl Into<String>,
        remote_project: impl Into<String>,
        project_id: i64,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            host: host.into(),
            token: token.into(),
            remote_project: remote_project.into(),
            project_id,
            last_sweep: Mutex::new(None),
        }
    }

    fn parse_issue(&self, item: &Value) -> Option<IssueRecord> {
        let id = item.get("id").and_then(Value::as_i64)?;
        let updated_at = item
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))?;
        Some(IssueRecord {
            id,
            iid: item.get("iid").and_then(Value::as_i64),
            title: item
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            description: item
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            updated_at,
            unique_id: format!("gitlab-{id}"),
            provider: IssueProvider::GitLab,
            project_id: self.project_id,
            task_source_id: None,
        })
    }
}

#[async_trait]
impl IssueSource for GitLabIssueSource {
    async fn fetch_updated(&self) -> Result<Vec<IssueRecord>> {
        let since = {
            let guard = self.last_sweep.lock().unwrap_or_else(|e| e.into_inner());
            *guard
        };
        let mut url = format!(
            "{}/api/v4/projects/{}/issues?state=opened&order_by=updated_at&sort=asc&per_page=100",
            self.host.trim_end_matches('/'),
            self.remote_project.replace('/', "%2F"),
        );
        if let Some(since) = since {
            url.push_str(&format!("&updated_after={}", since.to_rfc3339()));
        }

        let body: Vec<Value> = self
            .client
            .get(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await
            .context("fetch issues")?
            .error_for_status()
            .context("fetch issues")?
            .json()
            .await
            .context("decode issues")?;

        let mut issues = Vec::with_capacity(body.len());
        for item in &body {
            match self.parse_issue(item) {
                Some(issue) => issues.push(issue),
                None => warn!("skipping malformed issue record: {item}"),
            }
        }

        let mut guard = self.last_sweep.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Utc::now());
        Ok(issues)
    }
}
