//! Stable exit codes for overseer CLI commands.

/// Turn resolved (success, expected failure, or plain chat).
pub const OK: i32 = 0;
/// Invalid configuration, layout, or other fatal error.
pub const INVALID: i32 = 1;
/// Turn ended with a contract failure after exhausting retries.
pub const CONTRACT_FAILED: i32 = 2;
/// Turn exceeded its wall-clock deadline.
pub const TIMED_OUT: i32 = 3;
