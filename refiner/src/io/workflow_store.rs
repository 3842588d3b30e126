//! Workflow snapshot load/save with schema validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::debug;

use crate::workflow::Workflow;

const WORKFLOW_SCHEMA: &str = include_str!("../../schemas/workflow.schema.json");

/// Load a workflow snapshot and check it against the snapshot schema.
///
/// Graph validity is not checked here; that is the graph engine's job.
pub fn load_workflow(path: &Path) -> Result<Workflow> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read workflow {}", path.display()))?;
    parse_workflow(&contents).with_context(|| format!("load workflow {}", path.display()))
}

pub fn parse_workflow(contents: &str) -> Result<Workflow> {
    let value: Value = serde_json::from_str(contents).context("parse workflow json")?;
    validate_schema(&value)?;
    let workflow: Workflow = serde_json::from_value(value).context("deserialize workflow")?;
    debug!(workflow_id = %workflow.workflow_id, version = %workflow.version, "workflow loaded");
    Ok(workflow)
}

/// Atomically write a workflow snapshot (temp file + rename).
pub fn write_workflow(path: &Path, workflow: &Workflow) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(workflow).context("serialize workflow")?;
    buf.push('\n');
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp workflow {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace workflow {}", path.display()))
}

fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(WORKFLOW_SCHEMA).context("parse workflow schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "workflow schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}
