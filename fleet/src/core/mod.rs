//! Deterministic, pure logic shared by the daemon and the CLI.
//!
//! Core modules are free of I/O side effects. They operate on in-memory
//! records and return deterministic outputs suitable for tests.

pub mod budget;
pub mod complexity;
pub mod decision;
pub mod graph;
pub mod invariants;
pub mod model_selector;
pub mod signature;
pub mod stuck;
