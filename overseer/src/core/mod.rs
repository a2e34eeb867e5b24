//! Pure, deterministic orchestration logic.
//!
//! Nothing in this module performs I/O. Routing, intent classification,
//! repair decisions, and contract checks are all plain functions over
//! [`state::TaskState`] and strings, fully testable in isolation.

pub mod contract;
pub mod critic;
pub mod intent;
pub mod router;
pub mod state;
