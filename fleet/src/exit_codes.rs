//! Stable exit codes for fleet CLI commands.

/// Command succeeded and found nothing to report.
pub const OK: i32 = 0;
/// Invalid config, unreadable snapshot, invariant violations or other errors.
pub const INVALID: i32 = 1;
/// `fleet stuck` found at least one stuck work item.
pub const STUCK: i32 = 3;
