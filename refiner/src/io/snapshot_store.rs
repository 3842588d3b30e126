//! Snapshot persistence invoked at committed cycle boundaries.

use std::path::PathBuf;

use anyhow::{Result, bail};
use tracing::debug;

use crate::io::workflow_store::write_workflow;
use crate::workflow::Workflow;

pub trait SnapshotStore {
    fn save(&self, workflow: &Workflow) -> Result<()>;
}

/// Store that keeps nothing.
pub struct NoSnapshots;

impl SnapshotStore for NoSnapshots {
    fn save(&self, _workflow: &Workflow) -> Result<()> {
        Ok(())
    }
}

/// Writes `<root>/<workflow_id>/<version>.json`.
pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path for one snapshot; both parts must be single path segments.
    pub fn snapshot_path(&self, workflow_id: &str, version: &str) -> Result<PathBuf> {
        check_segment("workflow_id", workflow_id)?;
        check_segment("version", version)?;
        Ok(self.root.join(workflow_id).join(format!("{version}.json")))
    }
}

fn check_segment(field: &str, value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\']) {
        bail!("{field} '{value}' cannot be used as a snapshot path segment");
    }
    Ok(())
}

impl SnapshotStore for FsSnapshotStore {
    fn save(&self, workflow: &Workflow) -> Result<()> {
        let path = self.snapshot_path(&workflow.workflow_id, &workflow.version)?;
        debug!(path = %path.display(), "saving snapshot");
        write_workflow(&path, workflow)
    }
}
