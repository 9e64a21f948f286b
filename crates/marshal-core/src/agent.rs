use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::issue::IssueRecord;

/// One progress chunk emitted by a running agent session.
#[derive(Debug, Clone)]
pub enum AgentChunk {
    /// Session initialisation (backend identity, session handle, ...).
    System { content: String },
    /// Intermediate output: assistant text, tool activity.
    Progress { content: String },
    /// Terminal chunk, emitted once at the very end of a successful run.
    Result { content: String },
}

impl AgentChunk {
    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::Progress { .. } => "progress",
            Self::Result { .. } => "result",
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::System { content } | Self::Progress { content } | Self::Result { content } => {
                content
            }
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result { .. })
    }
}

/// Everything a backend needs to run one session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub session_id: i64,
    pub runner: String,
    pub issue: IssueRecord,
    /// Prepared workspace paths, one per configured repo target.
    pub workspaces: Vec<String>,
}

/// An agent execution backend.
///
/// `run_session` returns the receiving end of a lazy, finite,
/// non-restartable chunk sequence. The producer owns the subprocess; the
/// caller persists chunks and inspects the terminal one. A stream that ends
/// without a `Result` chunk means the run failed.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn run_session(&self, req: SessionRequest) -> Result<mpsc::Receiver<AgentChunk>>;
}
