//! Extension points for capabilities the core does not implement itself.
//!
//! Each hook has a default that does nothing, so control flow never depends on
//! a concrete implementation being present.

use crate::core::diff::DiffSummary;
use crate::workflow::Workflow;

/// Semantic similarity between two snapshots, in `[0, 1]`.
pub trait SimilarityHook: Send + Sync {
    fn similarity(&self, _old: &Workflow, _new: &Workflow) -> Option<f64> {
        None
    }
}

/// Flags candidate variants whose change looks pathological.
pub trait AnomalyDetector: Send + Sync {
    fn is_anomalous(&self, _candidate: &Workflow, _diff: &DiffSummary) -> bool {
        false
    }
}

/// Default for every hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl SimilarityHook for NoopHooks {}

impl AnomalyDetector for NoopHooks {}
