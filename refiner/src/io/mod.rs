//! Side-effecting collaborators of the refinement loop.

pub mod config;
pub mod evaluator;
pub mod snapshot_store;
pub mod telemetry_log;
pub mod workflow_store;
