use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Result};

/// Round-robin chooser over the configured agent runner identifiers.
///
/// One shared cursor per process; concurrent processing loops advance it
/// atomically. The cursor resets on restart — fairness across restarts is
/// not a requirement.
pub struct RunnerSelector {
    runners: Vec<String>,
    cursor: AtomicUsize,
}

impl RunnerSelector {
    pub fn new(runners: Vec<String>) -> Result<Self> {
        if runners.is_empty() {
            bail!("runner list is empty; configure at least one runner");
        }
        Ok(Self {
            runners,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn select(&self) -> &str {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        &self.runners[i % self.runners.len()]
    }
}
