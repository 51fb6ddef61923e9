//! Stable exit codes for `fractal` commands.

/// The command succeeded; for `run` and `status`, the root task completed.
pub const OK: i32 = 0;
/// Invalid config, missing run, store failure, or any other error.
pub const ERROR: i32 = 1;
/// Work remains that cannot progress without changes (fatal failures, interrupted run).
pub const INCOMPLETE: i32 = 2;
/// At least one task is waiting on `fractal resolve`.
pub const NEEDS_HUMAN: i32 = 3;
