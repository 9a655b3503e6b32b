//! Stable exit codes for flowrunner CLI commands.

/// Command succeeded or a turn committed.
pub const OK: i32 = 0;
/// Flow failed to compile, or the command failed for any other reason.
pub const VALIDATION_ERROR: i32 = 1;
/// Primary goal is satisfied.
pub const COMPLETE: i32 = 2;
/// No eligible node while the goal is unmet.
pub const DEADLOCK: i32 = 3;
/// The run escalated to a human.
pub const HANDOFF: i32 = 4;
/// `flowrunner fork` targeted a node without a user message.
pub const FORK_REJECTED_NOT_USER_TURN: i32 = 5;
/// Execution history references a parent that does not exist.
pub const ORPHANED_NODE: i32 = 6;
