//! Folding accepted variants back into a single child snapshot.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::core::graph::validate;
use crate::error::MergeError;
use crate::workflow::{Workflow, next_version};

/// Merge metadata from `variants` into `base` and bump the version.
///
/// Conflicting keys resolve to the most complete value (see
/// [`compare_completeness`]), which depends only on the values themselves, so
/// the result does not depend on the order of `variants`. Variants that fail
/// graph validation are skipped. `base` is expected to be valid already.
pub fn merge(base: &Workflow, variants: &[Workflow]) -> Result<Workflow, MergeError> {
    if let Some(stranger) = variants.iter().find(|v| v.workflow_id != base.workflow_id) {
        return Err(MergeError::IdentityMismatch {
            base: base.workflow_id.clone(),
            variant: stranger.workflow_id.clone(),
        });
    }

    let mut metadata: BTreeMap<String, Value> = base.metadata.clone();
    let mut merged_count = 0usize;
    for variant in variants {
        if let Err(err) = validate(variant).into_result() {
            warn!(version = %variant.version, error = %err, "excluded invalid variant from merge");
            continue;
        }
        merged_count += 1;
        for (key, value) in &variant.metadata {
            match metadata.get(key) {
                Some(current) if compare_completeness(value, current) != Ordering::Greater => {}
                _ => {
                    metadata.insert(key.clone(), value.clone());
                }
            }
        }
    }

    let mut child = base.clone();
    child.version = next_version(&base.version);
    if metadata != base.metadata {
        child.metadata = metadata;
        child.evaluation = None;
    }
    debug!(
        workflow_id = %child.workflow_id,
        from = %base.version,
        to = %child.version,
        merged = merged_count,
        offered = variants.len(),
        "merged variants"
    );
    Ok(child)
}

/// Total order on metadata values by completeness.
///
/// Non-empty beats empty, then longer rendering beats shorter, then the
/// lexicographically greater rendering wins.
pub fn compare_completeness(a: &Value, b: &Value) -> Ordering {
    let (a_text, b_text) = (a.to_string(), b.to_string());
    is_filled(a)
        .cmp(&is_filled(b))
        .then_with(|| a_text.len().cmp(&b_text.len()))
        .then_with(|| a_text.cmp(&b_text))
}

fn is_filled(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}
