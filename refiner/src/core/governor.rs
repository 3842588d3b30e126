//! Entropy-bounded termination governor.
//!
//! Each refinement cycle is summarized as a [`VerityTensor`] and costs some
//! entropy. The governor keeps recursing only while the marginal verity gain
//! per unit of entropy stays positive, the budget is not overdrawn, and the
//! iteration cap has not been reached. `Halted` is absorbing.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::diff::AdaptiveThreshold;
use crate::core::scores::ScoreVector;
use crate::error::{GovernorError, ThresholdError};

/// Slack for accumulated float error when comparing spend against the budget.
const BUDGET_EPSILON: f64 = 1e-9;

/// Quality of one cycle along three axes, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerityTensor {
    pub semantic: f64,
    pub deterministic: f64,
    pub entropic: f64,
}

impl VerityTensor {
    /// Components are clamped into `[0, 1]`; NaN becomes 0.
    pub fn new(semantic: f64, deterministic: f64, entropic: f64) -> Self {
        Self {
            semantic: unit(semantic),
            deterministic: unit(deterministic),
            entropic: unit(entropic),
        }
    }

    /// Tensor whose composite verity equals `value`.
    pub fn scalar(value: f64) -> Self {
        Self::new(value, 1.0, 1.0)
    }

    /// Derive the tensor for a refinement cycle.
    ///
    /// - semantic: the evaluator's `overall_score`
    /// - deterministic: share of generated variants that were accepted
    /// - entropic: `1 / (1 + diff_size / threshold)`, shrinking with churn
    pub fn from_cycle(
        scores: &ScoreVector,
        accepted: usize,
        generated: usize,
        diff_size: usize,
        threshold: AdaptiveThreshold,
    ) -> Self {
        let deterministic = if generated == 0 {
            1.0
        } else {
            accepted as f64 / generated as f64
        };
        let entropic = 1.0 / (1.0 + diff_size as f64 / threshold.value());
        Self::new(scores.overall_score, deterministic, entropic)
    }

    pub fn verity(&self) -> f64 {
        self.semantic * self.deterministic * self.entropic
    }
}

fn unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub entropy_budget: f64,
    /// Entropy charged per refinement cycle.
    pub entropy_step: f64,
    pub max_iterations: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            entropy_budget: 1.0,
            entropy_step: 0.1,
            max_iterations: 10,
        }
    }
}

impl GovernorConfig {
    pub fn validate(&self) -> Result<(), ThresholdError> {
        if !self.entropy_budget.is_finite() || self.entropy_budget < 0.0 {
            return Err(ThresholdError::OutOfRange {
                field: "governor.entropy_budget",
                value: self.entropy_budget,
                expected: "finite and >= 0".to_string(),
            });
        }
        if !self.entropy_step.is_finite() || self.entropy_step < 0.0 {
            return Err(ThresholdError::OutOfRange {
                field: "governor.entropy_step",
                value: self.entropy_step,
                expected: "finite and >= 0".to_string(),
            });
        }
        if self.max_iterations == 0 {
            return Err(ThresholdError::OutOfRange {
                field: "governor.max_iterations",
                value: 0.0,
                expected: "> 0".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    #[serde(rename = "dV_dE_nonpositive")]
    DvDeNonpositive,
    #[serde(rename = "entropy_budget_exceeded")]
    EntropyBudgetExceeded,
    #[serde(rename = "max_iterations_reached")]
    MaxIterationsReached,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::DvDeNonpositive => "dV_dE_nonpositive",
            TerminationReason::EntropyBudgetExceeded => "entropy_budget_exceeded",
            TerminationReason::MaxIterationsReached => "max_iterations_reached",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorState {
    Running,
    Halted(TerminationReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Continue,
    Halt,
}

/// One governor step as emitted to the telemetry sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub telemetry_id: String,
    pub iteration: usize,
    pub determinism: f64,
    /// Entropy spent after this step.
    pub entropy: f64,
    pub verity_tensor: VerityTensor,
    pub entropy_budget: f64,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
}

#[derive(Debug, Clone)]
pub struct EntropyGovernor {
    run_id: String,
    config: GovernorConfig,
    state: GovernorState,
    entropy_spent: f64,
    steps: usize,
    committed: usize,
    previous_verity: f64,
}

impl EntropyGovernor {
    pub fn new(run_id: impl Into<String>, config: GovernorConfig) -> Result<Self, ThresholdError> {
        config.validate()?;
        Ok(Self {
            run_id: run_id.into(),
            config,
            state: GovernorState::Running,
            entropy_spent: 0.0,
            steps: 0,
            committed: 0,
            previous_verity: 0.0,
        })
    }

    pub fn state(&self) -> GovernorState {
        self.state
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.state, GovernorState::Halted(_))
    }

    pub fn entropy_spent(&self) -> f64 {
        self.entropy_spent
    }

    pub fn remaining_budget(&self) -> f64 {
        self.config.entropy_budget - self.entropy_spent
    }

    /// Number of steps that committed (decided `continue`).
    pub fn committed_iterations(&self) -> usize {
        self.committed
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Decide whether the cycle that produced `tensor` at `entropy_cost`
    /// commits (`continue`) or ends the run (`halt`).
    ///
    /// Checks, in order: iteration cap, marginal verity gain per entropy,
    /// budget. Nothing is charged unless the step continues.
    pub fn step(
        &mut self,
        tensor: VerityTensor,
        entropy_cost: f64,
    ) -> Result<TelemetryRecord, GovernorError> {
        if let GovernorState::Halted(reason) = self.state {
            return Err(GovernorError::ReenterTerminalState {
                reason: reason.to_string(),
            });
        }
        if !entropy_cost.is_finite() || entropy_cost < 0.0 {
            return Err(GovernorError::InvalidEntropyCost(entropy_cost));
        }

        self.steps += 1;
        let verity = tensor.verity();
        let dv = verity - self.previous_verity;

        let halt = if self.committed >= self.config.max_iterations {
            Some(TerminationReason::MaxIterationsReached)
        } else if marginal_gain(dv, entropy_cost) <= 0.0 {
            Some(TerminationReason::DvDeNonpositive)
        } else if self.entropy_spent + entropy_cost > self.config.entropy_budget + BUDGET_EPSILON {
            Some(TerminationReason::EntropyBudgetExceeded)
        } else {
            None
        };

        match halt {
            Some(reason) => {
                self.state = GovernorState::Halted(reason);
                info!(
                    run_id = %self.run_id,
                    iteration = self.steps,
                    verity,
                    dv,
                    entropy_spent = self.entropy_spent,
                    reason = %reason,
                    "governor halted"
                );
            }
            None => {
                self.entropy_spent = (self.entropy_spent + entropy_cost).min(self.config.entropy_budget);
                self.committed += 1;
                self.previous_verity = verity;
                debug!(
                    run_id = %self.run_id,
                    iteration = self.steps,
                    verity,
                    dv,
                    entropy_spent = self.entropy_spent,
                    "governor continues"
                );
            }
        }

        Ok(TelemetryRecord {
            telemetry_id: format!("{}-{:04}", self.run_id, self.steps),
            iteration: self.steps,
            determinism: tensor.deterministic,
            entropy: self.entropy_spent,
            verity_tensor: tensor,
            entropy_budget: self.config.entropy_budget,
            decision: if halt.is_some() {
                Decision::Halt
            } else {
                Decision::Continue
            },
            termination_reason: halt,
        })
    }
}

/// `dV / dE`, with zero-cost steps counting as infinitely profitable only
/// when verity strictly improved.
fn marginal_gain(dv: f64, de: f64) -> f64 {
    if de > 0.0 {
        dv / de
    } else if dv > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scores::MetricWeights;

    fn governor(budget: f64, step: f64, max_iterations: usize) -> EntropyGovernor {
        EntropyGovernor::new(
            "run-1",
            GovernorConfig {
                entropy_budget: budget,
                entropy_step: step,
                max_iterations,
            },
        )
        .expect("governor")
    }

    #[test]
    fn halts_when_verity_plateaus() {
        let mut gov = governor(1.0, 0.1, 10);
        let sequence = [0.42, 0.55, 0.66, 0.71, 0.74, 0.75, 0.75];
        let mut records = Vec::new();
        for verity in sequence {
            records.push(gov.step(VerityTensor::scalar(verity), 0.1).expect("step"));
        }

        assert!(records[..6].iter().all(|r| r.decision == Decision::Continue));
        let last = records.last().expect("record");
        assert_eq!(last.iteration, 7);
        assert_eq!(last.decision, Decision::Halt);
        assert_eq!(last.termination_reason, Some(TerminationReason::DvDeNonpositive));
        assert_eq!(gov.state(), GovernorState::Halted(TerminationReason::DvDeNonpositive));
        assert_eq!(gov.committed_iterations(), 6);
        assert!((gov.entropy_spent() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn halted_governor_rejects_further_steps() {
        let mut gov = governor(1.0, 0.1, 10);
        gov.step(VerityTensor::scalar(0.0), 0.1).expect("step");
        assert!(gov.is_halted());

        let err = gov
            .step(VerityTensor::scalar(0.9), 0.1)
            .expect_err("re-entry must fail");
        assert_eq!(
            err,
            GovernorError::ReenterTerminalState {
                reason: "dV_dE_nonpositive".to_string()
            }
        );
        assert_eq!(gov.state(), GovernorState::Halted(TerminationReason::DvDeNonpositive));
    }

    #[test]
    fn budget_overdraw_is_rejected_before_charging() {
        let mut gov = governor(0.25, 0.1, 10);
        for verity in [0.2, 0.4] {
            let record = gov.step(VerityTensor::scalar(verity), 0.1).expect("step");
            assert_eq!(record.decision, Decision::Continue);
        }
        let record = gov.step(VerityTensor::scalar(0.6), 0.1).expect("step");
        assert_eq!(
            record.termination_reason,
            Some(TerminationReason::EntropyBudgetExceeded)
        );
        assert!((gov.entropy_spent() - 0.2).abs() < 1e-9);
        assert!(gov.remaining_budget() >= 0.0);
    }

    #[test]
    fn exact_budget_is_usable() {
        let mut gov = governor(0.3, 0.1, 10);
        for verity in [0.2, 0.4, 0.6] {
            let record = gov.step(VerityTensor::scalar(verity), 0.1).expect("step");
            assert_eq!(record.decision, Decision::Continue);
        }
        assert!(gov.remaining_budget() >= 0.0);
    }

    #[test]
    fn iteration_cap_bounds_zero_cost_runs() {
        let mut gov = governor(1.0, 0.0, 3);
        let mut verity = 0.1;
        let mut last = None;
        while !gov.is_halted() {
            last = Some(gov.step(VerityTensor::scalar(verity), 0.0).expect("step"));
            verity += 0.1;
        }
        let last = last.expect("record");
        assert_eq!(last.iteration, 4);
        assert_eq!(
            last.termination_reason,
            Some(TerminationReason::MaxIterationsReached)
        );
        assert_eq!(gov.entropy_spent(), 0.0);
    }

    #[test]
    fn zero_cost_without_gain_halts() {
        let mut gov = governor(1.0, 0.0, 10);
        gov.step(VerityTensor::scalar(0.5), 0.0).expect("step");
        let record = gov.step(VerityTensor::scalar(0.5), 0.0).expect("step");
        assert_eq!(record.termination_reason, Some(TerminationReason::DvDeNonpositive));
    }

    #[test]
    fn invalid_cost_leaves_state_untouched() {
        let mut gov = governor(1.0, 0.1, 10);
        assert_eq!(
            gov.step(VerityTensor::scalar(0.5), -0.1),
            Err(GovernorError::InvalidEntropyCost(-0.1))
        );
        assert!(matches!(
            gov.step(VerityTensor::scalar(0.5), f64::NAN),
            Err(GovernorError::InvalidEntropyCost(_))
        ));
        assert_eq!(gov.state(), GovernorState::Running);
        assert_eq!(gov.entropy_spent(), 0.0);
    }

    #[test]
    fn telemetry_serializes_halt_reason() {
        let mut gov = governor(1.0, 0.1, 10);
        let record = gov.step(VerityTensor::new(0.0, 1.0, 1.0), 0.1).expect("step");
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["telemetry_id"], "run-1-0001");
        assert_eq!(json["decision"], "halt");
        assert_eq!(json["termination_reason"], "dV_dE_nonpositive");
        assert_eq!(json["verity_tensor"]["deterministic"], 1.0);

        let mut gov = governor(1.0, 0.1, 10);
        let record = gov.step(VerityTensor::scalar(0.3), 0.1).expect("step");
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["decision"], "continue");
        assert!(json.get("termination_reason").is_none());
    }

    #[test]
    fn cycle_tensor_combines_scores_acceptance_and_churn() {
        let scores = ScoreVector::uniform(0.8, &MetricWeights::default()).expect("scores");
        let threshold = AdaptiveThreshold::new(2.0).expect("threshold");
        let tensor = VerityTensor::from_cycle(&scores, 3, 4, 2, threshold);
        assert!((tensor.semantic - 0.8).abs() < 1e-12);
        assert!((tensor.deterministic - 0.75).abs() < 1e-12);
        assert!((tensor.entropic - 0.5).abs() < 1e-12);
        assert!((tensor.verity() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn components_are_clamped() {
        let tensor = VerityTensor::new(1.5, -0.2, f64::NAN);
        assert_eq!(tensor, VerityTensor::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn zero_max_iterations_is_rejected() {
        let config = GovernorConfig {
            max_iterations: 0,
            ..GovernorConfig::default()
        };
        assert!(EntropyGovernor::new("run", config).is_err());
    }
}
