//! Refiner configuration stored as TOML (default `refiner.toml`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::feedback::{PromotionConfig, ThresholdConfig};
use crate::core::governor::GovernorConfig;
use crate::core::scores::MetricWeights;
use crate::core::types::GraphPolicy;
use crate::error::VariantError;

/// Refiner configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields and sections
/// fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RefinerConfig {
    pub governor: GovernorConfig,
    pub variants: VariantConfig,
    pub threshold: ThresholdConfig,
    pub promotion: PromotionConfig,
    pub graph: GraphPolicy,
    pub weights: MetricWeights,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VariantConfig {
    /// Candidates generated per cycle (also the worker pool size).
    pub count: usize,
    /// Base seed; cycle `n` uses `seed + n`.
    pub seed: u64,
}

impl Default for VariantConfig {
    fn default() -> Self {
        Self { count: 3, seed: 0 }
    }
}

/// Command-line overrides applied on top of the loaded file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub entropy_budget: Option<f64>,
    pub variants: Option<usize>,
}

impl RefinerConfig {
    pub fn validate(&self) -> Result<()> {
        self.governor.validate()?;
        self.threshold.validate()?;
        self.promotion.validate()?;
        self.weights.validate()?;
        if self.variants.count == 0 {
            return Err(VariantError::InvalidVariantCount(self.variants.count).into());
        }
        Ok(())
    }

    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Result<Self> {
        if let Some(budget) = overrides.entropy_budget {
            self.governor.entropy_budget = budget;
        }
        if let Some(count) = overrides.variants {
            self.variants.count = count;
        }
        self.validate()?;
        Ok(self)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RefinerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RefinerConfig> {
    if !path.exists() {
        let cfg = RefinerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RefinerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}
