//! Entropy-bounded workflow refinement.
//!
//! This crate repeatedly refines a workflow document (a DAG of phases and
//! modules) and stops deterministically once further recursion no longer pays
//! for itself. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic engines (graph validation and repair,
//!   diffing, variant generation and merging, the feedback ledger, the entropy
//!   governor). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting collaborators (config, workflow snapshots,
//!   evaluators, telemetry). Isolated behind traits to enable test doubles.
//!
//! [`refine`] coordinates core logic with I/O to implement `refiner run`.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod refine;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
