mod source;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use marshal_agent::claude::ClaudeBackend;
use marshal_core::{
    ci::{CiClient, GitLabCi},
    config::{Config, DispatchKind},
    db::Db,
    executor::PipelineExecutor,
    git::{GitWorkspace, WorkspaceProvider},
    issue::IssueSource,
    monitor::PipelineMonitor,
    processor::{Dispatch, IssueProcessor},
    runner::RunnerSelector,
    secrets::SecretKey,
};
use tracing::{error, info, warn};

use crate::source::GitLabIssueSource;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marshal_server=info,marshal_core=info,marshal_agent=info".into()),
        )
        .init();

    let config = Config::from_env()?;

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = format!("{}/marshal.db", config.data_dir);
    let db = Arc::new(Db::open(&db_path)?);
    db.migrate()?;

    if config.secret_key.is_empty() {
        bail!("MARSHAL_SECRET_KEY is not set (base64-encoded 32-byte key)");
    }
    let key = SecretKey::from_base64(&config.secret_key).context("MARSHAL_SECRET_KEY")?;

    // Seed the configured registration rows, as with every startup-owned
    // piece of config: later runs update in place.
    let project_id = db.upsert_project(&config.project_name)?;
    for (name, clone_url) in &config.repo_targets {
        db.upsert_repo_target(project_id, name, clone_url)?;
    }
    if !config.worker_repo_remote_id.is_empty() {
        let encrypted = key.encrypt(&config.worker_repo_token)?;
        db.upsert_worker_repository(
            project_id,
            &config.worker_repo_remote_id,
            &config.worker_repo_host,
            &encrypted,
            &config.worker_repo_ci_version,
            &config.worker_repo_ref,
        )?;
    }

    let ci: Arc<dyn CiClient> = Arc::new(GitLabCi::new());
    let runners = Arc::new(RunnerSelector::new(config.runners.clone())?);
    let workspaces: Arc<dyn WorkspaceProvider> =
        Arc::new(GitWorkspace::new(&config.workspace_root));

    let dispatch = match config.dispatch {
        DispatchKind::Agent => Dispatch::Agent(Arc::new(
            ClaudeBackend::new(&config.claude_bin, &config.model)
                .with_timeout(config.agent_timeout_secs),
        )),
        DispatchKind::Pipeline => Dispatch::Ci(Arc::new(PipelineExecutor::new(
            Arc::clone(&db),
            Arc::clone(&ci),
            key.clone(),
        ))),
    };

    let processor = IssueProcessor::new(
        Arc::clone(&db),
        runners,
        workspaces,
        dispatch,
        config.worker_id.clone(),
        config.lock_timeout_secs,
    );

    let monitor = PipelineMonitor::new(
        Arc::clone(&db),
        Arc::clone(&ci),
        key.clone(),
        config.monitor_timeout_mins,
        Duration::from_secs(config.monitor_interval_secs),
    );
    monitor.start();

    info!(
        worker_id = %config.worker_id,
        project = %config.project_name,
        "marshal daemon started"
    );

    let sweep = async {
        if config.gitlab_project.is_empty() {
            warn!("MARSHAL_GITLAB_PROJECT not set; running monitor only");
            std::future::pending::<()>().await;
            return;
        }
        let source = GitLabIssueSource::new(
            config.gitlab_host.clone(),
            config.gitlab_token.clone(),
            config.gitlab_project.clone(),
            project_id,
        );
        loop {
            match source.fetch_updated().await {
                Ok(issues) => {
                    if !issues.is_empty() {
                        info!(count = issues.len(), "sweep fetched updated issues");
                    }
                    for issue in &issues {
                        if let Err(e) = processor.process_issue(issue).await {
                            error!(issue = %issue.unique_id, "process issue: {e:#}");
                        }
                    }
                }
                Err(e) => warn!("issue sweep failed: {e:#}"),
            }
            tokio::time::sleep(Duration::from_secs(config.sweep_interval_secs)).await;
        }
    };

    tokio::select! {
        _ = sweep => {}
        _ = shutdown_signal() => info!("shutdown signal received"),
    }

    monitor.stop().await;
    info!("marshal daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("install ctrl-c handler: {e}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
