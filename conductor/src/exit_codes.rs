//! Stable exit codes for `conductor` CLI commands.

/// Command succeeded; for `policy check`, the operation is allowed.
pub const OK: i32 = 0;
/// Invalid input, configuration or state, or any other error.
pub const INVALID: i32 = 1;
/// `policy check` denied the operation.
pub const DENIED: i32 = 2;
/// `policy check` requires human confirmation.
pub const NEEDS_CONFIRMATION: i32 = 3;
/// A merge stopped on conflicts; resolve, skip, finalize or abort it.
pub const CONFLICTS: i32 = 4;
/// The safety check blocked a branch operation.
pub const UNSAFE: i32 = 5;
