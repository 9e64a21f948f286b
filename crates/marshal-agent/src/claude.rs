use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use marshal_core::agent::{AgentBackend, AgentChunk, SessionRequest};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Runs the Claude Code CLI as a subprocess, streaming its NDJSON output
/// as agent chunks.
pub struct ClaudeBackend {
    /// Path to the `claude` CLI binary.
    pub claude_bin: String,
    /// Model override; empty uses the CLI default.
    pub model: String,
    /// Kill the subprocess and end the stream after this many seconds
    /// (0 = no limit).
    pub timeout_s: u64,
}

impl ClaudeBackend {
    pub fn new(claude_bin: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            claude_bin: claude_bin.into(),
            model: model.into(),
            timeout_s: 0,
        }
    }

    pub fn with_timeout(mut self, timeout_s: u64) -> Self {
        self.timeout_s = timeout_s;
        self
    }
}

fn build_instruction(req: &SessionRequest) -> String {
    let issue = &req.issue;
    let mut s = format!(
        "Resolve the following {} issue.\n\nTitle: {}\n",
        issue.provider.as_str(),
        issue.title
    );
    if !issue.description.is_empty() {
        s.push_str("\nDescription:\n");
        s.push_str(&issue.description);
        s.push('\n');
    }
    s.push_str("\nWorkspaces (each already on the issue branch):\n");
    for path in &req.workspaces {
        s.push_str("  - ");
        s.push_str(path);
        s.push('\n');
    }
    s.push_str("\nMake the necessary changes and commit them in each affected workspace.");
    s
}

#[async_trait]
impl AgentBackend for ClaudeBackend {
    async fn run_session(&self, req: SessionRequest) -> Result<mpsc::Receiver<AgentChunk>> {
        let instruction = build_instruction(&req);
        let workdir = req
            .workspaces
            .first()
            .cloned()
            .unwrap_or_else(|| ".".to_string());

        let mut cmd = Command::new(&self.claude_bin);
        cmd.args(["--output-format", "stream-json", "--verbose", "--max-turns", "200"]);
        if !self.model.is_empty() {
            cmd.args(["--model", &self.model]);
        }
        cmd.arg("--print").arg(instruction);

        info!(
            session_id = req.session_id,
            runner = %req.runner,
            workdir = %workdir,
            "spawning claude subprocess"
        );

        let mut child = cmd
            .kill_on_drop(true)
            .current_dir(&workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn claude: {}", self.claude_bin))?;

        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;

        let (tx, rx) = mpsc::channel::<AgentChunk>(64);
        let session_id = req.session_id;
        let timeout_s = self.timeout_s;

        tokio::spawn(async move {
            // Dropping this future (timeout path) drops the child; with
            // kill_on_drop the subprocess dies with it, and the closed
            // channel ends the stream without a result chunk.
            let io_future = async move {
                let mut stdout_reader = BufReader::new(stdout).lines();
                let mut stderr_reader = BufReader::new(stderr).lines();

                loop {
                    tokio::select! {
                        line = stdout_reader.next_line() => {
                            match line {
                                Ok(Some(l)) => {
                                    if let Some(chunk) = crate::event::chunk_from_line(&l) {
                                        if tx.send(chunk).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(session_id, "error reading agent stdout: {e}");
                                    break;
                                }
                            }
                        }
                        line = stderr_reader.next_line() => {
                            if let Ok(Some(l)) = line {
                                if !l.is_empty() {
                                    warn!(session_id, "claude stderr: {l}");
                                }
                            }
                        }
                    }
                }

                while let Ok(Some(l)) = stderr_reader.next_line().await {
                    if !l.is_empty() {
                        warn!(session_id, "claude stderr: {l}");
                    }
                }

                match child.wait().await {
                    Ok(status) if !status.success() => {
                        warn!(session_id, code = ?status.code(), "claude subprocess failed");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(session_id, "failed to wait for claude: {e}"),
                }
            };

            if timeout_s > 0 {
                let limit = std::time::Duration::from_secs(timeout_s);
                if tokio::time::timeout(limit, io_future).await.is_err() {
                    warn!(session_id, timeout_s, "claude subprocess timed out");
                }
            } else {
                io_future.await;
            }
        });

        Ok(rx)
    }
}
