//! Stable exit codes for `autoapply` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid config/state or any other error.
pub const ERROR: i32 = 1;
/// Nothing changed: the URL was already queued, or the job could not be aborted.
pub const NOOP: i32 = 2;
