use std::collections::HashMap;

use anyhow::{bail, Result};

/// Which dispatch strategy the daemon runs claimed issues through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    /// Direct in-process agent execution.
    Agent,
    /// Externalized CI-pipeline execution.
    Pipeline,
}

/// Full daemon configuration.
/// Loaded once at startup from env / `.env`; sensitive values (tokens, the
/// secret key) never come from anywhere else.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,
    pub workspace_root: String,
    pub worker_id: String,
    pub dispatch: DispatchKind,

    // Coordination
    pub runners: Vec<String>,
    pub lock_timeout_secs: i64,
    pub sweep_interval_secs: u64,
    pub monitor_interval_secs: u64,
    pub monitor_timeout_mins: i64,

    // Secrets
    pub secret_key: String,

    // Issue source (GitLab)
    pub gitlab_host: String,
    pub gitlab_token: String,
    pub gitlab_project: String,

    // Seeded registration for the configured project
    pub project_name: String,
    /// `name=clone_url` pairs, comma-separated in the env var.
    pub repo_targets: Vec<(String, String)>,
    pub worker_repo_remote_id: String,
    pub worker_repo_host: String,
    pub worker_repo_token: String,
    pub worker_repo_ci_version: String,
    pub worker_repo_ref: String,

    // Agent backend
    pub claude_bin: String,
    pub model: String,
    pub agent_timeout_secs: u64,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_list(key: &str, dotenv: &HashMap<String, String>) -> Vec<String> {
    get(key, dotenv)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{host}-{}", std::process::id())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        let dispatch = match get_str("MARSHAL_DISPATCH", &dotenv, "agent").as_str() {
            "agent" => DispatchKind::Agent,
            "pipeline" => DispatchKind::Pipeline,
            other => bail!("MARSHAL_DISPATCH must be 'agent' or 'pipeline', got {other:?}"),
        };

        let repo_targets = get_list("MARSHAL_REPO_TARGETS", &dotenv)
            .into_iter()
            .map(|pair| {
                pair.split_once('=')
                    .map(|(name, url)| (name.trim().to_string(), url.trim().to_string()))
                    .ok_or_else(|| {
                        anyhow::anyhow!("MARSHAL_REPO_TARGETS entry {pair:?} is not name=url")
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            data_dir: get_str("MARSHAL_DATA_DIR", &dotenv, "store"),
            workspace_root: get_str("MARSHAL_WORKSPACE_ROOT", &dotenv, "store/workspaces"),
            worker_id: get("MARSHAL_WORKER_ID", &dotenv).unwrap_or_else(default_worker_id),
            dispatch,
            runners: get_list("MARSHAL_RUNNERS", &dotenv),
            lock_timeout_secs: get_i64("MARSHAL_LOCK_TIMEOUT_S", &dotenv, 3600),
            sweep_interval_secs: get_u64("MARSHAL_SWEEP_INTERVAL_S", &dotenv, 600),
            monitor_interval_secs: get_u64("MARSHAL_MONITOR_INTERVAL_S", &dotenv, 600),
            monitor_timeout_mins: get_i64("MARSHAL_MONITOR_TIMEOUT_MINS", &dotenv, 30),
            secret_key: get_str("MARSHAL_SECRET_KEY", &dotenv, ""),
            gitlab_host: get_str("MARSHAL_GITLAB_HOST", &dotenv, "https://gitlab.com"),
            gitlab_token: get_str("MARSHAL_GITLAB_TOKEN", &dotenv, ""),
            gitlab_project: get_str("MARSHAL_GITLAB_PROJECT", &dotenv, ""),
            project_name: get_str("MARSHAL_PROJECT", &dotenv, "default"),
            repo_targets,
            worker_repo_remote_id: get_str("MARSHAL_WORKER_REPO_ID", &dotenv, ""),
            worker_repo_host: get_str("MARSHAL_WORKER_REPO_HOST", &dotenv, ""),
            worker_repo_token: get_str("MARSHAL_WORKER_REPO_TOKEN", &dotenv, ""),
            worker_repo_ci_version: get_str("MARSHAL_WORKER_REPO_CI_VERSION", &dotenv, ""),
            worker_repo_ref: get_str("MARSHAL_WORKER_REPO_REF", &dotenv, "main"),
            claude_bin: get_str("MARSHAL_CLAUDE_BIN", &dotenv, "claude"),
            model: get_str("MARSHAL_MODEL", &dotenv, ""),
            agent_timeout_secs: get_u64("MARSHAL_AGENT_TIMEOUT_S", &dotenv, 0),
        })
    }
}
