//! Shared deterministic types for refiner core logic.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use serde::{Deserialize, Serialize};

/// How graph autocorrection treats a reference with nothing behind it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingDependencyPolicy {
    /// Add a placeholder module (flagged `synthetic`) that satisfies the reference.
    #[default]
    Synthesize,
    /// Drop the dangling dependency id or input tag.
    Prune,
}

/// Self-healing policy applied by [`crate::core::graph::repair`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphPolicy {
    pub missing_dependency_policy: MissingDependencyPolicy,
    /// Resolve contested output tags instead of failing validation.
    pub dedupe_outputs: bool,
}

impl Default for GraphPolicy {
    fn default() -> Self {
        Self {
            missing_dependency_policy: MissingDependencyPolicy::Synthesize,
            dedupe_outputs: true,
        }
    }
}
