//! Stable exit codes for sceneloop CLI commands.

/// Command succeeded; for `generate`, the session passed or exhausted its
/// iteration budget with a best-effort result.
pub const OK: i32 = 0;
/// Setup or configuration failure (engine unreachable, credentials missing,
/// invalid config) or an uncaught internal error.
pub const INVALID: i32 = 1;
/// The session itself ended in a failed state.
pub const SESSION_FAILED: i32 = 2;
