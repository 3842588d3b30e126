//! Typed failures raised by the core engines.
//!
//! Orchestration code converts these into `anyhow::Error` with `?`; callers
//! that need to branch on a specific failure recover it with `downcast_ref`.

use thiserror::Error;

use crate::core::scores::Metric;

/// Coarse classification of a graph validity failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    MissingDependency,
    DuplicateOutput,
    DuplicateModule,
    UnknownPhase,
    Cycle,
}

/// Dependency-graph failures for one workflow snapshot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("module '{module}' depends on '{dependency}', which is not a module in this workflow")]
    MissingDependency { module: String, dependency: String },

    #[error("module '{module}' consumes input '{tag}', which no module produces")]
    MissingProducer { module: String, tag: String },

    #[error("output '{tag}' is claimed by more than one module: {}", modules.join(", "))]
    DuplicateOutput { tag: String, modules: Vec<String> },

    #[error("module id '{0}' is declared more than once")]
    DuplicateModule(String),

    #[error("module '{module}' references unknown phase '{phase}'")]
    UnknownPhase { module: String, phase: String },

    #[error("dependency cycle: {}", nodes.join(" -> "))]
    Cycle { nodes: Vec<String> },

    #[error(
        "dependency cycle could not be resolved after removing {} edge(s): {}",
        removed.len(),
        cycle.join(" -> ")
    )]
    CycleUnresolved {
        cycle: Vec<String>,
        removed: Vec<(String, String)>,
    },
}

impl GraphError {
    pub fn reason(&self) -> InvalidReason {
        match self {
            GraphError::MissingDependency { .. } | GraphError::MissingProducer { .. } => {
                InvalidReason::MissingDependency
            }
            GraphError::DuplicateOutput { .. } => InvalidReason::DuplicateOutput,
            GraphError::DuplicateModule(_) => InvalidReason::DuplicateModule,
            GraphError::UnknownPhase { .. } => InvalidReason::UnknownPhase,
            GraphError::Cycle { .. } | GraphError::CycleUnresolved { .. } => InvalidReason::Cycle,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiffError {
    #[error("cannot diff workflow '{old}' against workflow '{new}': different lineages")]
    IdentityMismatch { old: String, new: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VariantError {
    #[error("variant count must be > 0, got {0}")]
    InvalidVariantCount(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("variant of workflow '{variant}' cannot merge into workflow '{base}'")]
    IdentityMismatch { base: String, variant: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GovernorError {
    #[error("governor already halted ({reason}); no further steps are accepted")]
    ReenterTerminalState { reason: String },

    #[error("entropy cost must be finite and >= 0, got {0}")]
    InvalidEntropyCost(f64),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ThresholdError {
    #[error("{field} = {value} is out of range: {expected}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoreError {
    #[error("metric '{metric}' = {value} is outside [0, 1]")]
    OutOfRange { metric: Metric, value: f64 },

    #[error("metric '{0}' is missing from the score vector")]
    MissingMetric(Metric),

    #[error("overall_score = {0} is outside [0, 1]")]
    OverallOutOfRange(f64),

    #[error("metric weights must be finite, non-negative and not all zero")]
    InvalidWeights,
}
