//! Structural comparison of two snapshots from one workflow lineage.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::hooks::SimilarityHook;
use crate::error::{DiffError, ThresholdError};
use crate::workflow::{Phase, Workflow};

/// Minimum diff size at which regeneration is recommended.
///
/// Always finite and strictly positive, so a snapshot compared with itself
/// never recommends regeneration.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct AdaptiveThreshold(f64);

impl AdaptiveThreshold {
    pub fn new(value: f64) -> Result<Self, ThresholdError> {
        if !value.is_finite() || value <= 0.0 {
            return Err(ThresholdError::OutOfRange {
                field: "threshold",
                value,
                expected: "finite and > 0".to_string(),
            });
        }
        Ok(Self(value))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for AdaptiveThreshold {
    type Error = ThresholdError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AdaptiveThreshold> for f64 {
    fn from(threshold: AdaptiveThreshold) -> Self {
        threshold.0
    }
}

/// Differences between an old and a candidate snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub changed_fields: BTreeSet<String>,
    pub added_phases: BTreeSet<String>,
    pub removed_phases: BTreeSet<String>,
    pub modified_phases: BTreeSet<String>,
    pub diff_size: usize,
    pub regeneration_recommended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_similarity: Option<f64>,
}

/// Compare `old` and `new` structurally.
///
/// Metadata keys and phase ids are compared as sets. A phase present on both
/// sides is modified when its title, its ordered task list, or the content of
/// any module it lists changed.
pub fn compute_diff_summary(
    old: &Workflow,
    new: &Workflow,
    threshold: AdaptiveThreshold,
) -> Result<DiffSummary, DiffError> {
    if old.workflow_id != new.workflow_id {
        return Err(DiffError::IdentityMismatch {
            old: old.workflow_id.clone(),
            new: new.workflow_id.clone(),
        });
    }

    let changed_fields: BTreeSet<String> = old
        .metadata
        .keys()
        .chain(new.metadata.keys())
        .filter(|key| old.metadata.get(*key) != new.metadata.get(*key))
        .cloned()
        .collect();

    let old_phases: BTreeSet<&str> = old.phases.iter().map(|p| p.id.as_str()).collect();
    let new_phases: BTreeSet<&str> = new.phases.iter().map(|p| p.id.as_str()).collect();
    let added_phases: BTreeSet<String> = new_phases
        .difference(&old_phases)
        .map(|id| id.to_string())
        .collect();
    let removed_phases: BTreeSet<String> = old_phases
        .difference(&new_phases)
        .map(|id| id.to_string())
        .collect();
    let modified_phases: BTreeSet<String> = new
        .phases
        .iter()
        .filter_map(|phase| old.phase(&phase.id).map(|before| (before, phase)))
        .filter(|(before, after)| phase_modified(old, before, new, after))
        .map(|(_, after)| after.id.clone())
        .collect();

    let diff_size =
        changed_fields.len() + added_phases.len() + removed_phases.len() + modified_phases.len();

    Ok(DiffSummary {
        changed_fields,
        added_phases,
        removed_phases,
        modified_phases,
        diff_size,
        regeneration_recommended: regeneration_warranted(diff_size, threshold),
        semantic_similarity: None,
    })
}

/// True when the structural change between `old` and `new` reaches `threshold`.
pub fn regenerate_if_needed(
    old: &Workflow,
    new: &Workflow,
    threshold: AdaptiveThreshold,
) -> Result<bool, DiffError> {
    Ok(compute_diff_summary(old, new, threshold)?.regeneration_recommended)
}

fn regeneration_warranted(diff_size: usize, threshold: AdaptiveThreshold) -> bool {
    diff_size as f64 >= threshold.value()
}

fn phase_modified(old: &Workflow, before: &Phase, new: &Workflow, after: &Phase) -> bool {
    if before.title != after.title || before.tasks != after.tasks {
        return true;
    }
    after
        .tasks
        .iter()
        .any(|module_id| old.module(module_id) != new.module(module_id))
}

/// Diffing with the optional similarity capability attached.
pub struct DiffEngine<'h> {
    similarity: &'h dyn SimilarityHook,
}

impl<'h> DiffEngine<'h> {
    pub fn new(similarity: &'h dyn SimilarityHook) -> Self {
        Self { similarity }
    }

    pub fn diff(
        &self,
        old: &Workflow,
        new: &Workflow,
        threshold: AdaptiveThreshold,
    ) -> Result<DiffSummary, DiffError> {
        let mut summary = compute_diff_summary(old, new, threshold)?;
        summary.semantic_similarity = self.similarity.similarity(old, new);
        Ok(summary)
    }
}
