//! JSON snapshot of the fleet state (goals, work items, runs, escalations).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{Escalation, Goal, Run, WorkItem};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Snapshot {
    pub goals: Vec<Goal>,
    pub work_items: Vec<WorkItem>,
    pub runs: Vec<Run>,
    pub escalations: Vec<Escalation>,
}

impl Snapshot {
    pub fn items_of<'a>(&'a self, goal_id: &'a str) -> impl Iterator<Item = &'a WorkItem> + 'a {
        self.work_items
            .iter()
            .filter(move |item| item.goal_id == goal_id)
    }

    pub fn runs_of<'a>(&'a self, work_item_id: &'a str) -> impl Iterator<Item = &'a Run> + 'a {
        self.runs
            .iter()
            .filter(move |run| run.work_item_id == work_item_id)
    }
}

pub fn load_snapshot(path: &Path) -> Result<Snapshot> {
    debug!(path = %path.display(), "loading snapshot");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read snapshot {}", path.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&contents)
        .with_context(|| format!("parse snapshot {}", path.display()))?;
    debug!(
        goals = snapshot.goals.len(),
        work_items = snapshot.work_items.len(),
        runs = snapshot.runs.len(),
        "snapshot loaded"
    );
    Ok(snapshot)
}

/// Atomically write the snapshot to disk (temp file + rename).
pub fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    debug!(path = %path.display(), goals = snapshot.goals.len(), "writing snapshot");
    let mut buf = serde_json::to_string_pretty(snapshot).context("serialize snapshot")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
