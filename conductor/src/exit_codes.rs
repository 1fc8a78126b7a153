//! Stable exit codes for conductor CLI commands.

/// Command succeeded or the run completed.
pub const OK: i32 = 0;
/// Command failed due to invalid config, chain or arguments, or other errors.
pub const INVALID: i32 = 1;
/// `conductor run` terminated in the aborted phase.
pub const ABORTED: i32 = 2;
