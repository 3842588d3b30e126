//! Evaluator abstraction for workflow scoring.
//!
//! The [`Evaluator`] trait decouples the refinement loop from whatever scores
//! workflows (clarity, coverage, ...). The scoring heuristics themselves live
//! outside this crate; [`ScoreFileEvaluator`] replays scores recorded in a
//! JSON file, and tests use scripted evaluators.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::scores::{Metric, MetricWeights, ScoreVector};
use crate::workflow::Workflow;

pub trait Evaluator {
    /// Score `workflow`, combining metrics with `weights`.
    fn evaluate(&self, workflow: &Workflow, weights: &MetricWeights) -> Result<ScoreVector>;
}

/// Replays a JSON array of per-metric score maps, one per evaluation.
///
/// Once the array is exhausted the last entry repeats.
pub struct ScoreFileEvaluator {
    entries: Vec<BTreeMap<Metric, f64>>,
    cursor: RefCell<usize>,
}

impl ScoreFileEvaluator {
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read scores {}", path.display()))?;
        let entries: Vec<BTreeMap<Metric, f64>> = serde_json::from_str(&contents)
            .with_context(|| format!("parse scores {}", path.display()))?;
        Self::new(entries)
    }

    pub fn new(entries: Vec<BTreeMap<Metric, f64>>) -> Result<Self> {
        if entries.is_empty() {
            return Err(anyhow!("score file must contain at least one entry"));
        }
        Ok(Self {
            entries,
            cursor: RefCell::new(0),
        })
    }
}

impl Evaluator for ScoreFileEvaluator {
    fn evaluate(&self, workflow: &Workflow, weights: &MetricWeights) -> Result<ScoreVector> {
        let mut cursor = self.cursor.borrow_mut();
        let index = (*cursor).min(self.entries.len() - 1);
        *cursor += 1;
        let scores = ScoreVector::new(self.entries[index].clone(), weights)
            .with_context(|| format!("score entry {index}"))?;
        debug!(
            workflow_id = %workflow.workflow_id,
            version = %workflow.version,
            entry = index,
            overall_score = scores.overall_score,
            "evaluated workflow"
        );
        Ok(scores)
    }
}
