//! Stable exit codes for refiner CLI commands.

/// Command succeeded: the workflow is valid, the diff stays under the
/// threshold, or the run's result is eligible for promotion.
pub const OK: i32 = 0;
/// Command failed due to an invalid workflow, config, or other errors.
pub const INVALID: i32 = 1;
/// `refiner diff` found enough change to recommend regeneration.
pub const REGENERATE: i32 = 2;
/// `refiner run` finished but the result is not eligible for promotion.
pub const NOT_PROMOTED: i32 = 3;
