//! Test-only helpers for constructing workflows, scores and scripted
//! collaborators.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{Result, anyhow};
use serde_json::json;

use crate::core::diff::DiffSummary;
use crate::core::governor::TelemetryRecord;
use crate::core::scores::{Metric, MetricWeights, ScoreVector};
use crate::io::evaluator::Evaluator;
use crate::io::snapshot_store::SnapshotStore;
use crate::io::telemetry_log::TelemetrySink;
use crate::workflow::{Module, Phase, Workflow};

fn tags(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Module with explicit dependencies and no tags.
pub fn module(id: &str, phase: &str, dependencies: &[&str]) -> Module {
    module_io(id, phase, &[], &[], dependencies)
}

/// Module with explicit input/output tags and dependencies.
pub fn module_io(
    id: &str,
    phase: &str,
    inputs: &[&str],
    outputs: &[&str],
    dependencies: &[&str],
) -> Module {
    Module {
        module_id: id.to_string(),
        phase_id: phase.to_string(),
        name: format!("{} module", id),
        inputs: tags(inputs),
        outputs: tags(outputs),
        dependencies: tags(dependencies),
        ai_logic: format!("{} logic", id),
        human_actionable: String::new(),
        synthetic: false,
    }
}

/// Workflow whose phases are derived from the modules' phase ids (first-seen
/// order), each listing its modules in the given order.
pub fn workflow_with_modules(id: &str, modules: Vec<Module>) -> Workflow {
    let mut phases: Vec<Phase> = Vec::new();
    for module in &modules {
        match phases.iter_mut().find(|p| p.id == module.phase_id) {
            Some(phase) => phase.tasks.push(module.module_id.clone()),
            None => phases.push(Phase {
                id: module.phase_id.clone(),
                title: format!("{} title", module.phase_id),
                tasks: vec![module.module_id.clone()],
            }),
        }
    }
    Workflow {
        workflow_id: id.to_string(),
        version: "1.0".to_string(),
        phases,
        modules,
        metadata: BTreeMap::from([("goal".to_string(), json!("draft a launch plan"))]),
        evaluation: None,
    }
}

/// Valid three-module chain: `a -> b` in phase `p1`, `c` in phase `p2`.
pub fn linear_workflow() -> Workflow {
    workflow_with_modules(
        "launch-plan",
        vec![
            module_io("a", "p1", &[], &["brief"], &[]),
            module_io("b", "p1", &["brief"], &["plan"], &["a"]),
            module_io("c", "p2", &["plan"], &["report"], &["b"]),
        ],
    )
}

/// Diff summary whose only content is its size.
pub fn diff_of_size(size: usize) -> DiffSummary {
    DiffSummary {
        changed_fields: (0..size).map(|i| format!("field-{i}")).collect(),
        added_phases: BTreeSet::new(),
        removed_phases: BTreeSet::new(),
        modified_phases: BTreeSet::new(),
        diff_size: size,
        regeneration_recommended: false,
        semantic_similarity: None,
    }
}

/// Uniform score vector with per-metric overrides, equal weights.
pub fn score_vector(value: f64, overrides: &[(Metric, f64)]) -> ScoreVector {
    let mut scores: BTreeMap<Metric, f64> = Metric::ALL.iter().map(|m| (*m, value)).collect();
    for (metric, score) in overrides {
        scores.insert(*metric, *score);
    }
    ScoreVector::new(scores, &MetricWeights::default()).expect("valid scores")
}

/// Evaluator that replays a fixed queue of overall scores.
///
/// Each call pops the next score; the last one repeats once the queue drains.
pub struct ScriptedEvaluator {
    queue: RefCell<VecDeque<f64>>,
    last: RefCell<Option<f64>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedEvaluator {
    pub fn new(scores: Vec<f64>) -> Self {
        Self {
            queue: RefCell::new(scores.into()),
            last: RefCell::new(None),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Versions evaluated so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl Evaluator for ScriptedEvaluator {
    fn evaluate(&self, workflow: &Workflow, weights: &MetricWeights) -> Result<ScoreVector> {
        self.calls.borrow_mut().push(workflow.version.clone());
        let next = self.queue.borrow_mut().pop_front();
        let value = match next {
            Some(value) => {
                *self.last.borrow_mut() = Some(value);
                value
            }
            None => self
                .last
                .borrow()
                .ok_or_else(|| anyhow!("scripted evaluator has no scores"))?,
        };
        Ok(ScoreVector::uniform(value, weights)?)
    }
}

/// Telemetry sink that keeps records in memory.
#[derive(Default)]
pub struct MemorySink {
    records: RefCell<Vec<TelemetryRecord>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.borrow().clone()
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, record: &TelemetryRecord) -> Result<()> {
        self.records.borrow_mut().push(record.clone());
        Ok(())
    }
}

/// Snapshot store that remembers saved versions in memory.
#[derive(Default)]
pub struct MemorySnapshots {
    saved: RefCell<Vec<Workflow>>,
}

impl MemorySnapshots {
    /// Versions saved so far, in commit order.
    pub fn saved(&self) -> Vec<String> {
        self.saved.borrow().iter().map(|w| w.version.clone()).collect()
    }

    pub fn workflows(&self) -> Vec<Workflow> {
        self.saved.borrow().clone()
    }
}

impl SnapshotStore for MemorySnapshots {
    fn save(&self, workflow: &Workflow) -> Result<()> {
        self.saved.borrow_mut().push(workflow.clone());
        Ok(())
    }
}
