use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// External tracker the issue came from. Closed set; adding a provider is a
/// compile-time-checked change at the match sites below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueProvider {
    GitLab,
    GitHub,
    Jira,
}

impl IssueProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GitLab => "gitlab",
            Self::GitHub => "github",
            Self::Jira => "jira",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gitlab" => Some(Self::GitLab),
            "github" => Some(Self::GitHub),
            "jira" => Some(Self::Jira),
            _ => None,
        }
    }
}

/// One issue record yielded by an issue source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRecord {
    pub id: i64,
    /// Project-scoped issue number, where the provider has one.
    pub iid: Option<i64>,
    pub title: String,
    pub description: String,
    /// Must be monotonically non-decreasing per issue for the dedup gate to
    /// be meaningful.
    pub updated_at: DateTime<Utc>,
    /// Globally unique across providers; the lock key.
    pub unique_id: String,
    pub provider: IssueProvider,
    /// The project this issue is processed under; the lock scope.
    pub project_id: i64,
    /// The source registration this issue was fetched through, if any.
    pub task_source_id: Option<i64>,
}

impl IssueRecord {
    /// Deterministic per-issue branch name. Re-entry after a release reuses
    /// the same branch instead of creating duplicates.
    pub fn branch_name(&self) -> String {
        format!("issue/{}-{}", self.provider.as_str(), self.id)
    }
}

/// An opaque source of issue records, polled once per sweep.
#[async_trait]
pub trait IssueSource: Send + Sync {
    async fn fetch_updated(&self) -> Result<Vec<IssueRecord>>;
}
