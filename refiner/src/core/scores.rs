//! Evaluation score vectors produced by the external evaluator.
//!
//! The scoring heuristics live outside this crate; here a score vector is an
//! opaque, validated input with a weighted `overall_score`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ScoreError;

/// Fixed set of evaluation metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Clarity,
    Coverage,
    Coherence,
    Completeness,
    IntentAlignment,
    Specificity,
    Usability,
}

impl Metric {
    pub const ALL: [Metric; 7] = [
        Metric::Clarity,
        Metric::Coverage,
        Metric::Coherence,
        Metric::Completeness,
        Metric::IntentAlignment,
        Metric::Specificity,
        Metric::Usability,
    ];

    /// Metrics that block promotion when they regress.
    pub const GUARDED: [Metric; 5] = [
        Metric::Clarity,
        Metric::Coherence,
        Metric::Completeness,
        Metric::IntentAlignment,
        Metric::Usability,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Clarity => "clarity",
            Metric::Coverage => "coverage",
            Metric::Coherence => "coherence",
            Metric::Completeness => "completeness",
            Metric::IntentAlignment => "intent_alignment",
            Metric::Specificity => "specificity",
            Metric::Usability => "usability",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relative weight of each metric in `overall_score`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricWeights {
    pub clarity: f64,
    pub coverage: f64,
    pub coherence: f64,
    pub completeness: f64,
    pub intent_alignment: f64,
    pub specificity: f64,
    pub usability: f64,
}

impl Default for MetricWeights {
    fn default() -> Self {
        Self {
            clarity: 1.0,
            coverage: 1.0,
            coherence: 1.0,
            completeness: 1.0,
            intent_alignment: 1.0,
            specificity: 1.0,
            usability: 1.0,
        }
    }
}

impl MetricWeights {
    pub fn weight(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Clarity => self.clarity,
            Metric::Coverage => self.coverage,
            Metric::Coherence => self.coherence,
            Metric::Completeness => self.completeness,
            Metric::IntentAlignment => self.intent_alignment,
            Metric::Specificity => self.specificity,
            Metric::Usability => self.usability,
        }
    }

    pub fn validate(&self) -> Result<(), ScoreError> {
        let weights = Metric::ALL.map(|m| self.weight(m));
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) || weights.iter().sum::<f64>() <= 0.0
        {
            return Err(ScoreError::InvalidWeights);
        }
        Ok(())
    }
}

/// Per-metric scores in `[0, 1]` plus their weighted combination.
///
/// Deserialization enforces the same invariant as [`ScoreVector::new`]: all
/// seven metrics present and every value, `overall_score` included, in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawScoreVector")]
pub struct ScoreVector {
    pub scores: BTreeMap<Metric, f64>,
    pub overall_score: f64,
}

/// Unchecked wire form of [`ScoreVector`].
#[derive(Deserialize)]
struct RawScoreVector {
    scores: BTreeMap<Metric, f64>,
    overall_score: f64,
}

impl TryFrom<RawScoreVector> for ScoreVector {
    type Error = ScoreError;

    fn try_from(raw: RawScoreVector) -> Result<Self, Self::Error> {
        check_metrics(&raw.scores)?;
        if !(0.0..=1.0).contains(&raw.overall_score) {
            return Err(ScoreError::OverallOutOfRange(raw.overall_score));
        }
        Ok(Self {
            scores: raw.scores,
            overall_score: raw.overall_score,
        })
    }
}

fn check_metrics(scores: &BTreeMap<Metric, f64>) -> Result<(), ScoreError> {
    for metric in Metric::ALL {
        let value = *scores.get(&metric).ok_or(ScoreError::MissingMetric(metric))?;
        if !(0.0..=1.0).contains(&value) {
            return Err(ScoreError::OutOfRange { metric, value });
        }
    }
    Ok(())
}

impl ScoreVector {
    /// Validate `scores` (all seven metrics present, each in `[0, 1]`) and
    /// derive `overall_score` from `weights`.
    pub fn new(scores: BTreeMap<Metric, f64>, weights: &MetricWeights) -> Result<Self, ScoreError> {
        weights.validate()?;
        check_metrics(&scores)?;
        let (weighted, total) = Metric::ALL.iter().fold((0.0, 0.0), |(sum, total), m| {
            let weight = weights.weight(*m);
            (sum + weight * scores.get(m).copied().unwrap_or(0.0), total + weight)
        });
        Ok(Self {
            scores,
            overall_score: weighted / total,
        })
    }

    /// Every metric at the same value.
    pub fn uniform(value: f64, weights: &MetricWeights) -> Result<Self, ScoreError> {
        Self::new(Metric::ALL.iter().map(|m| (*m, value)).collect(), weights)
    }

    pub fn get(&self, metric: Metric) -> f64 {
        self.scores.get(&metric).copied().unwrap_or(0.0)
    }
}
