//! Seeded generation of candidate variants around a base snapshot.
//!
//! Variants only touch presentation-level fields (phase titles, metadata), so
//! a valid base always yields structurally valid candidates.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tracing::debug;

use crate::core::scores::Metric;
use crate::error::VariantError;
use crate::workflow::Workflow;

const QUALIFIERS: [&str; 4] = ["refined", "clarified", "expanded", "tightened"];

/// Produce exactly `k` perturbed copies of `base`.
///
/// The same `(base, k, seed)` always yields the same candidates.
pub fn generate_variants(base: &Workflow, k: usize, seed: u64) -> Result<Vec<Workflow>, VariantError> {
    if k == 0 {
        return Err(VariantError::InvalidVariantCount(k));
    }
    let variants = (0..k)
        .map(|index| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ index as u64);
            perturb(base, index, k, &mut rng)
        })
        .collect();
    debug!(workflow_id = %base.workflow_id, k, seed, "generated variants");
    Ok(variants)
}

fn perturb(base: &Workflow, index: usize, k: usize, rng: &mut StdRng) -> Workflow {
    let mut variant = base.clone();
    variant.version = format!("{}+variant.{}", base.version, index + 1);
    variant.evaluation = None;

    let focus = Metric::ALL
        .choose(rng)
        .copied()
        .unwrap_or(Metric::Clarity);
    variant
        .metadata
        .insert("refinement_focus".to_string(), Value::from(focus.as_str()));

    if rng.gen_bool(0.5) {
        variant.metadata.insert(
            "variant_summary".to_string(),
            Value::from(format!("variant {} of {} emphasising {}", index + 1, k, focus)),
        );
    }

    if rng.gen_bool(0.5) {
        let description = match variant.metadata.get("description").and_then(Value::as_str) {
            Some(existing) if !existing.is_empty() => format!("{existing} Emphasis: {focus}."),
            _ => format!("Emphasis: {focus}."),
        };
        variant
            .metadata
            .insert("description".to_string(), Value::from(description));
    }

    if !variant.phases.is_empty() && rng.gen_bool(0.5) {
        let target = rng.gen_range(0..variant.phases.len());
        let qualifier = QUALIFIERS.choose(rng).copied().unwrap_or("refined");
        let phase = &mut variant.phases[target];
        phase.title = format!("{} ({qualifier})", phase.title);
    }

    variant
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::validate;
    use crate::test_support::linear_workflow;

    #[test]
    fn produces_exactly_k_variants_of_the_same_lineage() {
        let base = linear_workflow();
        let variants = generate_variants(&base, 4, 7).expect("variants");
        assert_eq!(variants.len(), 4);
        for variant in &variants {
            assert_eq!(variant.workflow_id, base.workflow_id);
            assert_eq!(variant.modules, base.modules);
            assert!(variant.metadata.contains_key("refinement_focus"));
            assert!(validate(variant).is_valid());
        }
    }

    #[test]
    fn same_seed_same_variants() {
        let base = linear_workflow();
        let first = generate_variants(&base, 3, 42).expect("variants");
        let second = generate_variants(&base, 3, 42).expect("variants");
        assert_eq!(first, second);
    }

    #[test]
    fn zero_variants_is_rejected() {
        let base = linear_workflow();
        assert_eq!(
            generate_variants(&base, 0, 1),
            Err(VariantError::InvalidVariantCount(0))
        );
    }
}
