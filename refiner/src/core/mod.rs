//! Deterministic, pure logic shared by the refiner core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod benchmark;
pub mod diff;
pub mod feedback;
pub mod governor;
pub mod graph;
pub mod hooks;
pub mod merge;
pub mod scores;
pub mod types;
pub mod variants;
