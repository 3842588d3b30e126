//! Recursive refinement loop for `refiner run`.
//!
//! Each cycle generates `k` variants of the current workflow, reviews them on
//! a worker pool sized to `k`, merges the ones worth regenerating from, scores
//! the result and asks the governor whether to commit it. A cycle either
//! commits completely (snapshot, ledger, benchmark, new base) or not at all.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rayon::ThreadPool;
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::core::benchmark::{BenchmarkLog, BenchmarkRecord};
use crate::core::diff::{AdaptiveThreshold, DiffEngine, DiffSummary};
use crate::core::feedback::{
    FeedbackLedger, LedgerEntry, MetaMetrics, PromotionDecision, evaluate_promotion,
};
use crate::core::governor::{EntropyGovernor, TerminationReason, VerityTensor};
use crate::core::graph::{repair, validate};
use crate::core::hooks::{AnomalyDetector, NoopHooks, SimilarityHook};
use crate::core::merge::merge;
use crate::core::scores::ScoreVector;
use crate::core::variants::generate_variants;
use crate::error::DiffError;
use crate::io::config::RefinerConfig;
use crate::io::evaluator::Evaluator;
use crate::io::snapshot_store::SnapshotStore;
use crate::io::telemetry_log::TelemetrySink;
use crate::workflow::Workflow;

/// Benchmark key recorded for every committed cycle.
pub const OVERALL_SCORE_KEY: &str = "overall_score";

/// Cooperative cancellation shared with the variant workers.
///
/// Workers check the flag before reviewing each variant; a cancelled cycle
/// commits nothing.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reason why `run_refinement` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineStop {
    /// The governor halted.
    Halted(TerminationReason),
    /// Refinement was turned off; the governor never stepped.
    Disabled,
    /// The cancel flag was raised.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RefineOptions {
    pub run_id: String,
    /// `false` forces zero recursion depth.
    pub refine: bool,
    pub cancel: CancelFlag,
}

impl RefineOptions {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            refine: true,
            cancel: CancelFlag::new(),
        }
    }
}

/// External collaborators the loop talks to.
pub struct Collaborators<'a> {
    pub evaluator: &'a dyn Evaluator,
    pub telemetry: &'a dyn TelemetrySink,
    pub snapshots: &'a dyn SnapshotStore,
    pub similarity: &'a dyn SimilarityHook,
    pub anomaly: &'a dyn AnomalyDetector,
}

impl<'a> Collaborators<'a> {
    /// Collaborators with no-op hooks.
    pub fn new(
        evaluator: &'a dyn Evaluator,
        telemetry: &'a dyn TelemetrySink,
        snapshots: &'a dyn SnapshotStore,
    ) -> Self {
        Self {
            evaluator,
            telemetry,
            snapshots,
            similarity: &NoopHooks,
            anomaly: &NoopHooks,
        }
    }
}

/// Summary of a refinement run.
#[derive(Debug, Clone)]
pub struct RefineOutcome {
    pub run_id: String,
    /// Last committed workflow (the repaired input if nothing committed).
    pub workflow: Workflow,
    pub scores: ScoreVector,
    pub stop: RefineStop,
    /// Governor steps taken, including the halting one.
    pub steps: usize,
    pub committed: usize,
    pub entropy_spent: f64,
    pub threshold: AdaptiveThreshold,
    pub ledger: Vec<LedgerEntry>,
    pub best: Option<BenchmarkRecord>,
    pub promotion: PromotionDecision,
    pub meta_metrics: MetaMetrics,
}

/// Refine `initial` until the governor halts, refinement is disabled, or the
/// cancel flag is raised.
///
/// The workflow is repaired first; an unrepairable graph aborts the run. The
/// final promotion decision compares the last committed scores against the
/// baseline recorded in `initial.evaluation`, if any.
pub fn run_refinement(
    initial: &Workflow,
    config: &RefinerConfig,
    options: &RefineOptions,
    collaborators: &Collaborators<'_>,
) -> Result<RefineOutcome> {
    config.validate()?;
    let baseline = initial.evaluation.clone();
    let mut current = repair(initial, &config.graph).context("repair initial workflow")?;
    let mut current_scores = collaborators
        .evaluator
        .evaluate(&current, &config.weights)
        .with_context(|| format!("evaluate {}", current.version))?;

    let mut ledger = FeedbackLedger::new(config.threshold.clone())?;
    let mut governor = EntropyGovernor::new(options.run_id.clone(), config.governor.clone())?;
    let mut benchmarks = BenchmarkLog::new();
    let engine = DiffEngine::new(collaborators.similarity);
    let k = config.variants.count;
    let pool = ThreadPoolBuilder::new()
        .num_threads(k)
        .build()
        .context("build variant worker pool")?;

    let mut steps = 0usize;
    let stop = if !options.refine {
        info!(run_id = %options.run_id, "refinement disabled");
        RefineStop::Disabled
    } else {
        loop {
            if options.cancel.is_cancelled() {
                break RefineStop::Cancelled;
            }
            let threshold = ledger.threshold();
            let seed = config.variants.seed.wrapping_add(steps as u64);
            let Some(candidate) = run_cycle(
                &pool,
                &engine,
                collaborators.anomaly,
                &current,
                threshold,
                k,
                seed,
                &options.cancel,
            )?
            else {
                break RefineStop::Cancelled;
            };

            let scores = collaborators
                .evaluator
                .evaluate(&candidate.workflow, &config.weights)
                .with_context(|| format!("evaluate {}", candidate.workflow.version))?;
            let tensor = VerityTensor::from_cycle(
                &scores,
                candidate.accepted,
                k,
                candidate.diff.diff_size,
                threshold,
            );
            let record = governor.step(tensor, config.governor.entropy_step)?;
            steps += 1;
            collaborators
                .telemetry
                .emit(&record)
                .context("emit telemetry record")?;
            if let Some(reason) = record.termination_reason {
                break RefineStop::Halted(reason);
            }

            let mut committed = candidate.workflow;
            committed.evaluation = Some(scores.clone());
            collaborators
                .snapshots
                .save(&committed)
                .with_context(|| format!("save snapshot {}", committed.version))?;
            ledger.record_cycle(&candidate.diff, &scores, candidate.regenerated);
            let next_threshold = ledger.recalculate_threshold();
            benchmarks.record(BenchmarkRecord {
                key: OVERALL_SCORE_KEY.to_string(),
                timestamp: timestamp(),
                score: scores.overall_score,
                workflow_id: committed.workflow_id.clone(),
                version: committed.version.clone(),
            });
            info!(
                run_id = %options.run_id,
                iteration = record.iteration,
                version = %committed.version,
                overall_score = scores.overall_score,
                diff_size = candidate.diff.diff_size,
                threshold = next_threshold.value(),
                "committed cycle"
            );
            current = committed;
            current_scores = scores;
        }
    };

    let mut promotion = evaluate_promotion(&current_scores, baseline.as_ref(), &config.promotion);
    if stop == RefineStop::Halted(TerminationReason::EntropyBudgetExceeded) {
        warn!(run_id = %options.run_id, "entropy budget exhausted; promotion denied");
        promotion.deny_for_entropy_budget();
    }
    let meta_metrics = MetaMetrics::new(
        timestamp(),
        &current_scores,
        baseline.as_ref(),
        &config.promotion,
        &promotion,
    );

    Ok(RefineOutcome {
        run_id: options.run_id.clone(),
        workflow: current,
        scores: current_scores,
        stop,
        steps,
        committed: governor.committed_iterations(),
        entropy_spent: governor.entropy_spent(),
        threshold: ledger.threshold(),
        ledger: ledger.entries().to_vec(),
        best: benchmarks.best(OVERALL_SCORE_KEY).cloned(),
        promotion,
        meta_metrics,
    })
}

struct Candidate {
    workflow: Workflow,
    /// Diff between the cycle's base and the merged candidate.
    diff: DiffSummary,
    accepted: usize,
    regenerated: bool,
}

enum Review {
    Accepted(DiffSummary),
    Rejected,
    Skipped,
}

/// Generate, review and merge one cycle's variants.
///
/// Returns `None` when the cycle was cancelled; nothing from it is kept.
#[allow(clippy::too_many_arguments)]
fn run_cycle(
    pool: &ThreadPool,
    engine: &DiffEngine<'_>,
    anomaly: &dyn AnomalyDetector,
    base: &Workflow,
    threshold: AdaptiveThreshold,
    k: usize,
    seed: u64,
    cancel: &CancelFlag,
) -> Result<Option<Candidate>> {
    let variants = generate_variants(base, k, seed)?;
    let reviews: Vec<Review> = pool.install(|| {
        variants
            .par_iter()
            .map(|variant| review_variant(engine, anomaly, base, variant, threshold, cancel))
            .collect::<Result<Vec<_>, DiffError>>()
    })?;
    if cancel.is_cancelled() {
        info!(workflow_id = %base.workflow_id, version = %base.version, "cycle cancelled");
        return Ok(None);
    }

    let mut accepted = 0usize;
    let mut regenerating = Vec::new();
    for (variant, review) in variants.iter().zip(&reviews) {
        match review {
            Review::Accepted(diff) => {
                accepted += 1;
                if diff.regeneration_recommended {
                    regenerating.push(variant.clone());
                }
            }
            Review::Rejected | Review::Skipped => {}
        }
    }

    let workflow = merge(base, &regenerating)?;
    let diff = engine.diff(base, &workflow, threshold)?;
    debug!(
        version = %workflow.version,
        generated = k,
        accepted,
        regenerating = regenerating.len(),
        diff_size = diff.diff_size,
        "cycle candidate ready"
    );
    Ok(Some(Candidate {
        workflow,
        diff,
        accepted,
        regenerated: !regenerating.is_empty(),
    }))
}

fn review_variant(
    engine: &DiffEngine<'_>,
    anomaly: &dyn AnomalyDetector,
    base: &Workflow,
    variant: &Workflow,
    threshold: AdaptiveThreshold,
    cancel: &CancelFlag,
) -> Result<Review, DiffError> {
    if cancel.is_cancelled() {
        return Ok(Review::Skipped);
    }
    if let Err(err) = validate(variant).into_result() {
        debug!(version = %variant.version, error = %err, "rejected invalid variant");
        return Ok(Review::Rejected);
    }
    let diff = engine.diff(base, variant, threshold)?;
    if anomaly.is_anomalous(variant, &diff) {
        warn!(version = %variant.version, diff_size = diff.diff_size, "rejected anomalous variant");
        return Ok(Review::Rejected);
    }
    Ok(Review::Accepted(diff))
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::feedback::BaselineStatus;
    use crate::core::governor::Decision;
    use crate::core::scores::MetricWeights;
    use crate::test_support::{
        MemorySink, MemorySnapshots, ScriptedEvaluator, linear_workflow, module,
        workflow_with_modules,
    };

    fn config() -> RefinerConfig {
        RefinerConfig::default()
    }

    struct AlwaysAnomalous;

    impl AnomalyDetector for AlwaysAnomalous {
        fn is_anomalous(&self, _candidate: &Workflow, _diff: &DiffSummary) -> bool {
            true
        }
    }

    struct CancelOnReview(CancelFlag);

    impl AnomalyDetector for CancelOnReview {
        fn is_anomalous(&self, _candidate: &Workflow, _diff: &DiffSummary) -> bool {
            self.0.cancel();
            false
        }
    }

    #[test]
    fn disabled_refinement_never_steps_the_governor() {
        let evaluator = ScriptedEvaluator::new(vec![0.5]);
        let sink = MemorySink::default();
        let snapshots = MemorySnapshots::default();
        let mut options = RefineOptions::new("run");
        options.refine = false;

        let outcome = run_refinement(
            &linear_workflow(),
            &config(),
            &options,
            &Collaborators::new(&evaluator, &sink, &snapshots),
        )
        .expect("run");

        assert_eq!(outcome.stop, RefineStop::Disabled);
        assert_eq!(outcome.steps, 0);
        assert!(sink.records().is_empty());
        assert!(snapshots.saved().is_empty());
        assert_eq!(evaluator.calls(), vec!["1.0".to_string()]);
        assert_eq!(outcome.workflow.version, "1.0");
    }

    #[test]
    fn zero_verity_halts_on_first_step_without_committing() {
        let evaluator = ScriptedEvaluator::new(vec![0.6, 0.0]);
        let sink = MemorySink::default();
        let snapshots = MemorySnapshots::default();

        let outcome = run_refinement(
            &linear_workflow(),
            &config(),
            &RefineOptions::new("run"),
            &Collaborators::new(&evaluator, &sink, &snapshots),
        )
        .expect("run");

        assert_eq!(
            outcome.stop,
            RefineStop::Halted(TerminationReason::DvDeNonpositive)
        );
        assert_eq!(outcome.committed, 0);
        assert_eq!(outcome.workflow.version, "1.0");
        assert!(snapshots.saved().is_empty());
        assert!(outcome.ledger.is_empty());
        assert!(outcome.best.is_none());
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decision, Decision::Halt);
    }

    #[test]
    fn iteration_cap_bounds_the_run() {
        let evaluator = ScriptedEvaluator::new(vec![0.5, 0.8]);
        let sink = MemorySink::default();
        let snapshots = MemorySnapshots::default();
        let mut cfg = config();
        cfg.governor.max_iterations = 1;

        let outcome = run_refinement(
            &linear_workflow(),
            &cfg,
            &RefineOptions::new("run"),
            &Collaborators::new(&evaluator, &sink, &snapshots),
        )
        .expect("run");

        assert_eq!(
            outcome.stop,
            RefineStop::Halted(TerminationReason::MaxIterationsReached)
        );
        assert_eq!(outcome.steps, 2);
        assert_eq!(outcome.committed, 1);
        assert_eq!(outcome.workflow.version, "1.1");
        assert_eq!(
            evaluator.calls(),
            vec!["1.0".to_string(), "1.1".to_string(), "1.2".to_string()]
        );
        assert_eq!(snapshots.saved(), vec!["1.1".to_string()]);
        assert!(snapshots.workflows()[0].evaluation.is_some());
        assert_eq!(outcome.ledger.len(), 1);
        assert!((outcome.entropy_spent - 0.1).abs() < 1e-9);
        let best = outcome.best.expect("benchmark");
        assert_eq!(best.version, "1.1");
        assert!(outcome.workflow.evaluation.is_some());
    }

    #[test]
    fn exhausted_budget_vetoes_promotion() {
        let evaluator = ScriptedEvaluator::new(vec![0.5, 0.9]);
        let sink = MemorySink::default();
        let snapshots = MemorySnapshots::default();
        let mut cfg = config();
        cfg.governor.entropy_budget = 0.0;

        let outcome = run_refinement(
            &linear_workflow(),
            &cfg,
            &RefineOptions::new("run"),
            &Collaborators::new(&evaluator, &sink, &snapshots),
        )
        .expect("run");

        assert_eq!(
            outcome.stop,
            RefineStop::Halted(TerminationReason::EntropyBudgetExceeded)
        );
        assert_eq!(outcome.promotion.baseline_status, BaselineStatus::Missing);
        assert!(!outcome.promotion.promotion_eligible);
        assert!(!outcome.promotion.entropy_budget_respected);
        assert!(!outcome.meta_metrics.decision.promotion_eligible);
    }

    #[test]
    fn rejected_variants_zero_the_determinism_axis() {
        let evaluator = ScriptedEvaluator::new(vec![0.5, 0.9]);
        let sink = MemorySink::default();
        let snapshots = MemorySnapshots::default();
        let mut collaborators = Collaborators::new(&evaluator, &sink, &snapshots);
        collaborators.anomaly = &AlwaysAnomalous;

        let outcome = run_refinement(
            &linear_workflow(),
            &config(),
            &RefineOptions::new("run"),
            &collaborators,
        )
        .expect("run");

        assert_eq!(
            outcome.stop,
            RefineStop::Halted(TerminationReason::DvDeNonpositive)
        );
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].determinism, 0.0);
    }

    #[test]
    fn cancellation_mid_cycle_commits_nothing() {
        let evaluator = ScriptedEvaluator::new(vec![0.5, 0.9]);
        let sink = MemorySink::default();
        let snapshots = MemorySnapshots::default();
        let options = RefineOptions::new("run");
        let detector = CancelOnReview(options.cancel.clone());
        let mut collaborators = Collaborators::new(&evaluator, &sink, &snapshots);
        collaborators.anomaly = &detector;

        let outcome =
            run_refinement(&linear_workflow(), &config(), &options, &collaborators).expect("run");

        assert_eq!(outcome.stop, RefineStop::Cancelled);
        assert_eq!(outcome.steps, 0);
        assert_eq!(outcome.workflow.version, "1.0");
        assert!(sink.records().is_empty());
        assert!(snapshots.saved().is_empty());
        assert_eq!(evaluator.calls().len(), 1);
    }

    #[test]
    fn broken_input_graph_is_repaired_before_refining() {
        let workflow = workflow_with_modules(
            "launch-plan",
            vec![module("a", "p1", &["ghost"]), module("b", "p1", &["a"])],
        );
        let evaluator = ScriptedEvaluator::new(vec![0.5]);
        let sink = MemorySink::default();
        let snapshots = MemorySnapshots::default();
        let mut options = RefineOptions::new("run");
        options.refine = false;

        let outcome = run_refinement(
            &workflow,
            &config(),
            &options,
            &Collaborators::new(&evaluator, &sink, &snapshots),
        )
        .expect("run");

        assert!(validate(&outcome.workflow).is_valid());
        assert!(outcome.workflow.module("ghost").is_some_and(|m| m.synthetic));
    }

    #[test]
    fn same_seed_replays_the_same_run() {
        let run = || {
            let evaluator = ScriptedEvaluator::new(vec![0.3, 0.5, 0.7, 0.8, 0.8]);
            let sink = MemorySink::default();
            let snapshots = MemorySnapshots::default();
            let outcome = run_refinement(
                &linear_workflow(),
                &config(),
                &RefineOptions::new("run"),
                &Collaborators::new(&evaluator, &sink, &snapshots),
            )
            .expect("run");
            (outcome.workflow, sink.records())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn baseline_from_snapshot_gates_promotion() {
        let mut workflow = linear_workflow();
        workflow.evaluation =
            Some(ScoreVector::uniform(0.9, &MetricWeights::default()).expect("scores"));
        let evaluator = ScriptedEvaluator::new(vec![0.5]);
        let sink = MemorySink::default();
        let snapshots = MemorySnapshots::default();
        let mut options = RefineOptions::new("run");
        options.refine = false;

        let outcome = run_refinement(
            &workflow,
            &config(),
            &options,
            &Collaborators::new(&evaluator, &sink, &snapshots),
        )
        .expect("run");

        assert_eq!(outcome.promotion.baseline_status, BaselineStatus::Present);
        assert!(!outcome.promotion.promotion_eligible);
        assert!(!outcome.promotion.regression_guard_passed);
        let recorded = outcome.meta_metrics.baseline.overall_score.expect("baseline score");
        assert!((recorded - 0.9).abs() < 1e-9);
    }
}
