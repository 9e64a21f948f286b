use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};

use crate::types::RepoTarget;

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

pub struct Git {
    pub repo_path: String,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    pub fn exec(&self, args: &[&str]) -> Result<ExecResult> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_path)
            .args(args)
            .output()
            .with_context(|| {
                format!("failed to spawn git -C {} {}", self.repo_path, args.join(" "))
            })?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    pub fn clone_repo(url: &str, dest: &Path) -> Result<()> {
        let output = Command::new("git")
            .arg("clone")
            .arg(url)
            .arg(dest)
            .output()
            .with_context(|| format!("failed to spawn git clone {url}"))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git clone {url} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        Ok(())
    }

    pub fn fetch_origin(&self) -> Result<()> {
        let result = self.exec(&["fetch", "origin"])?;
        if !result.success() {
            return Err(anyhow!(
                "git fetch origin failed: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    /// Switch to `branch`, creating it from the current HEAD if it does not
    /// exist yet. Branch names are deterministic per issue, so re-entry
    /// after a released lock lands on the same branch.
    pub fn switch_or_create(&self, branch: &str) -> Result<()> {
        let switch = self.exec(&["switch", branch])?;
        if switch.success() {
            return Ok(());
        }
        let create = self.exec(&["switch", "-c", branch])?;
        if !create.success() {
            return Err(anyhow!(
                "git switch -c {branch} failed: {}",
                create.combined_output()
            ));
        }
        Ok(())
    }
}

/// Prepares a working copy for one repo target on the issue's branch.
pub trait WorkspaceProvider: Send + Sync {
    fn prepare(&self, target: &RepoTarget, branch: &str) -> Result<String>;
}

/// Clone-and-branch workspace layout under a configured root:
/// `{root}/{project_id}/{target_name}`.
pub struct GitWorkspace {
    root: PathBuf,
}

impl GitWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl WorkspaceProvider for GitWorkspace {
    fn prepare(&self, target: &RepoTarget, branch: &str) -> Result<String> {
        let dest = self
            .root
            .join(target.project_id.to_string())
            .join(&target.name);
        if !dest.join(".git").exists() {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create workspace dir {}", parent.display()))?;
            }
            Git::clone_repo(&target.clone_url, &dest)?;
        }
        let git = Git::new(dest.to_string_lossy().into_owned());
        // Best-effort: a stale remote view is recoverable, a missing branch
        // is not.
        if let Err(e) = git.fetch_origin() {
            tracing::warn!(target = %target.name, "fetch before branch switch: {e}");
        }
        git.switch_or_create(branch)?;
        Ok(dest.to_string_lossy().into_owned())
    }
}
