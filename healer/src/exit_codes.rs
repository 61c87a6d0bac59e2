//! Stable exit codes for healer CLI commands.

/// Command succeeded; for `run`, the task was solved.
pub const OK: i32 = 0;
/// Invalid input, config or an unexpected error.
pub const INVALID: i32 = 1;
/// `healer run` or `healer bench` ended with at least one unsolved task.
pub const EXHAUSTED: i32 = 2;
/// The run was interrupted before reaching a verdict.
pub const CANCELLED: i32 = 3;
