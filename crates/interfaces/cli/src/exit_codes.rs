//! Stable exit codes for the warden binary.

/// Task finished normally.
pub const OK: i32 = 0;
/// Configuration, I/O, or other setup failure.
pub const ERROR: i32 = 1;
/// Run aborted by user interrupt.
pub const ABORTED_USER: i32 = 2;
/// Run aborted by the step-limit safety bound.
pub const STEP_LIMIT: i32 = 3;
