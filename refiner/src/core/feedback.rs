//! Per-cycle feedback history, adaptive regeneration threshold and promotion
//! gating.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::diff::{AdaptiveThreshold, DiffSummary};
use crate::core::scores::{Metric, ScoreVector};
use crate::error::ThresholdError;

/// Tolerance for float comparisons against promotion thresholds.
const SCORE_EPSILON: f64 = 1e-9;

/// Bounds and shape of the adaptive regeneration threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Threshold used before any history exists.
    pub default: f64,
    pub min: f64,
    pub max: f64,
    /// `k` in `mean + k * stddev` over the recent diff sizes.
    pub stddev_factor: f64,
    /// Number of most recent cycles considered.
    pub window: usize,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            default: 2.0,
            min: 1.0,
            max: 25.0,
            stddev_factor: 1.0,
            window: 8,
        }
    }
}

impl ThresholdConfig {
    pub fn validate(&self) -> Result<(), ThresholdError> {
        if !self.min.is_finite() || self.min <= 0.0 {
            return Err(out_of_range("threshold.min", self.min, "finite and > 0"));
        }
        if !self.max.is_finite() || self.max < self.min {
            return Err(out_of_range("threshold.max", self.max, ">= threshold.min"));
        }
        if !(self.min..=self.max).contains(&self.default) {
            return Err(out_of_range(
                "threshold.default",
                self.default,
                "within [threshold.min, threshold.max]",
            ));
        }
        if !self.stddev_factor.is_finite() || self.stddev_factor < 0.0 {
            return Err(out_of_range(
                "threshold.stddev_factor",
                self.stddev_factor,
                "finite and >= 0",
            ));
        }
        if self.window == 0 {
            return Err(out_of_range("threshold.window", 0.0, "> 0"));
        }
        Ok(())
    }

    fn clamp(&self, value: f64) -> f64 {
        if value.is_finite() {
            value.clamp(self.min, self.max)
        } else {
            self.default
        }
    }
}

/// Promotion gate parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    /// Minimum `overall_score` improvement over the baseline.
    pub promotion_threshold: f64,
    /// Most negative per-metric delta tolerated on guarded metrics.
    pub regression_guard: f64,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            promotion_threshold: 0.02,
            regression_guard: -0.05,
        }
    }
}

impl PromotionConfig {
    pub fn validate(&self) -> Result<(), ThresholdError> {
        if !self.promotion_threshold.is_finite() || self.promotion_threshold < 0.0 {
            return Err(out_of_range(
                "promotion.promotion_threshold",
                self.promotion_threshold,
                "finite and >= 0",
            ));
        }
        if !self.regression_guard.is_finite() || self.regression_guard > 0.0 {
            return Err(out_of_range(
                "promotion.regression_guard",
                self.regression_guard,
                "finite and <= 0",
            ));
        }
        Ok(())
    }
}

fn out_of_range(field: &'static str, value: f64, expected: &str) -> ThresholdError {
    ThresholdError::OutOfRange {
        field,
        value,
        expected: expected.to_string(),
    }
}

/// One committed refinement cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub cycle: usize,
    pub diff_size: usize,
    pub overall_score: f64,
    pub regenerated: bool,
    /// Threshold in force when the cycle ran.
    pub threshold: f64,
}

/// Append-only cycle history that owns the adaptive threshold.
#[derive(Debug, Clone)]
pub struct FeedbackLedger {
    config: ThresholdConfig,
    entries: Vec<LedgerEntry>,
    threshold: AdaptiveThreshold,
}

impl FeedbackLedger {
    pub fn new(config: ThresholdConfig) -> Result<Self, ThresholdError> {
        config.validate()?;
        let threshold = AdaptiveThreshold::new(config.default)?;
        Ok(Self {
            config,
            entries: Vec::new(),
            threshold,
        })
    }

    pub fn threshold(&self) -> AdaptiveThreshold {
        self.threshold
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn record_cycle(&mut self, diff: &DiffSummary, scores: &ScoreVector, regenerated: bool) {
        let entry = LedgerEntry {
            cycle: self.entries.len() + 1,
            diff_size: diff.diff_size,
            overall_score: scores.overall_score,
            regenerated,
            threshold: self.threshold.value(),
        };
        debug!(
            cycle = entry.cycle,
            diff_size = entry.diff_size,
            overall_score = entry.overall_score,
            regenerated,
            "recorded cycle"
        );
        self.entries.push(entry);
    }

    /// Recompute the threshold as `mean + k * stddev` of recent diff sizes,
    /// clamped to the configured range. With no history, the configured
    /// default applies.
    pub fn recalculate_threshold(&mut self) -> AdaptiveThreshold {
        let start = self.entries.len().saturating_sub(self.config.window);
        let recent: Vec<f64> = self.entries[start..]
            .iter()
            .map(|e| e.diff_size as f64)
            .collect();

        let raw = if recent.is_empty() {
            self.config.default
        } else {
            let n = recent.len() as f64;
            let mean = recent.iter().sum::<f64>() / n;
            let variance = recent.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
            mean + self.config.stddev_factor * variance.sqrt()
        };

        let clamped = self.config.clamp(raw);
        // min > 0 is validated, so the clamped value is always a legal threshold.
        if let Ok(threshold) = AdaptiveThreshold::new(clamped) {
            self.threshold = threshold;
        }
        debug!(raw, threshold = self.threshold.value(), samples = recent.len(), "recalculated threshold");
        self.threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaselineStatus {
    Present,
    Missing,
}

/// Promotion verdict plus the evidence behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionDecision {
    pub baseline_status: BaselineStatus,
    pub overall_delta: Option<f64>,
    pub deltas: BTreeMap<Metric, f64>,
    /// Guarded metrics whose delta fell below the regression guard.
    pub regressed_metrics: Vec<Metric>,
    pub regression_guard_passed: bool,
    pub promotion_eligible: bool,
    pub entropy_budget_respected: bool,
}

impl PromotionDecision {
    /// An exhausted entropy budget vetoes promotion regardless of scores.
    pub fn deny_for_entropy_budget(&mut self) {
        self.entropy_budget_respected = false;
        self.promotion_eligible = false;
    }
}

/// Decide whether `current` may replace `baseline`.
///
/// Eligible when `overall_score` improved by at least the promotion threshold
/// and no guarded metric dropped below the regression guard. Without a
/// baseline, the candidate is eligible by default.
pub fn evaluate_promotion(
    current: &ScoreVector,
    baseline: Option<&ScoreVector>,
    config: &PromotionConfig,
) -> PromotionDecision {
    let Some(baseline) = baseline else {
        return PromotionDecision {
            baseline_status: BaselineStatus::Missing,
            overall_delta: None,
            deltas: BTreeMap::new(),
            regressed_metrics: Vec::new(),
            regression_guard_passed: true,
            promotion_eligible: true,
            entropy_budget_respected: true,
        };
    };

    let deltas: BTreeMap<Metric, f64> = Metric::ALL
        .iter()
        .map(|m| (*m, current.get(*m) - baseline.get(*m)))
        .collect();
    let regressed_metrics: Vec<Metric> = Metric::GUARDED
        .iter()
        .copied()
        .filter(|m| deltas[m] < config.regression_guard - SCORE_EPSILON)
        .collect();
    let overall_delta = current.overall_score - baseline.overall_score;
    let regression_guard_passed = regressed_metrics.is_empty();
    let promotion_eligible =
        regression_guard_passed && overall_delta >= config.promotion_threshold - SCORE_EPSILON;

    PromotionDecision {
        baseline_status: BaselineStatus::Present,
        overall_delta: Some(overall_delta),
        deltas,
        regressed_metrics,
        regression_guard_passed,
        promotion_eligible,
        entropy_budget_respected: true,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineSection {
    pub status: BaselineStatus,
    pub overall_score: Option<f64>,
    pub scores: Option<BTreeMap<Metric, f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSection {
    pub promotion_threshold: f64,
    pub regression_guard: f64,
    pub guard_metrics: Vec<Metric>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSection {
    pub promotion_eligible: bool,
    pub regression_guard_passed: bool,
    pub entropy_budget_respected: bool,
}

/// Serialized summary of a run's evaluation against its baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaMetrics {
    pub timestamp: String,
    pub scores: BTreeMap<Metric, f64>,
    pub overall_score: f64,
    pub baseline: BaselineSection,
    pub deltas: BTreeMap<Metric, f64>,
    pub thresholds: ThresholdSection,
    pub decision: DecisionSection,
}

impl MetaMetrics {
    pub fn new(
        timestamp: String,
        current: &ScoreVector,
        baseline: Option<&ScoreVector>,
        config: &PromotionConfig,
        decision: &PromotionDecision,
    ) -> Self {
        Self {
            timestamp,
            scores: current.scores.clone(),
            overall_score: current.overall_score,
            baseline: BaselineSection {
                status: decision.baseline_status,
                overall_score: baseline.map(|b| b.overall_score),
                scores: baseline.map(|b| b.scores.clone()),
            },
            deltas: decision.deltas.clone(),
            thresholds: ThresholdSection {
                promotion_threshold: config.promotion_threshold,
                regression_guard: config.regression_guard,
                guard_metrics: Metric::GUARDED.to_vec(),
            },
            decision: DecisionSection {
                promotion_eligible: decision.promotion_eligible,
                regression_guard_passed: decision.regression_guard_passed,
                entropy_budget_respected: decision.entropy_budget_respected,
            },
        }
    }
}
