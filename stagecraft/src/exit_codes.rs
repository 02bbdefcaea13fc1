//! Stable exit codes for stagecraft CLI commands.

/// Command succeeded; for `probe`, the container is healthy.
pub const OK: i32 = 0;
/// Invalid arguments, config, context or artifact.
pub const INVALID: i32 = 1;
/// A stage failed while building; no artifact was written.
pub const BUILD_FAILED: i32 = 2;
/// `stagecraft probe` ended with the container not healthy.
pub const UNHEALTHY: i32 = 3;
