//! Autonomous worker fleet orchestration engine.
//!
//! Goals are decomposed into dependency-aware work items, which the
//! [`daemon::Daemon`] dispatches to executors under a concurrency bound and
//! per-goal budgets. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (dependency graph, budgets,
//!   complexity scoring, model selection, stuck detection, decisions).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting boundaries (config and snapshot files, the
//!   repository, external collaborators). Trait seams enable scripted
//!   implementations in tests.
//!
//! [`daemon`] coordinates core logic with I/O; [`inspect`] backs the
//! offline CLI reports.

pub mod core;
pub mod daemon;
pub mod events;
pub mod exit_codes;
pub mod inspect;
pub mod io;
pub mod logging;
pub mod model;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
