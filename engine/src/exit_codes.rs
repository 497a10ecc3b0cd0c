//! Stable exit codes for engine CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid config, job files, or other errors.
pub const INVALID: i32 = 1;
/// Another engine instance holds the data directory lock.
pub const LOCKED: i32 = 2;
/// `engine serve --exit-when-idle` finished with at least one failed job.
pub const JOBS_FAILED: i32 = 3;
