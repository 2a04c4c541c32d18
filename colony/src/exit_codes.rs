//! Stable exit codes for the CLI.

/// Clean stop, whatever the stop reason.
pub const OK: i32 = 0;
/// Fatal initialization or run error (unreadable config, missing effector
/// credentials, git failure).
pub const INVALID: i32 = 1;
/// A persistent store artifact was unreadable.
pub const CORRUPT: i32 = 2;
