//! Multi-stage image assembly for a network service.
//!
//! A build resolves dependencies in a builder stage, hands only the sealed
//! install prefix to a minimal runtime stage, provisions an unprivileged
//! identity, and writes a directory artifact whose `image.json` fixes the
//! launch command, liveness probe and provenance labels.
//!
//! - **[`core`]**: Pure logic (stage graph validation, manifest parsing, the
//!   health state machine, launch and metadata descriptors). No I/O.
//! - **[`io`]**: Side effects (stage execution, installers, filesystem
//!   composition, provisioning, probes, artifacts).
//!
//! Orchestration modules ([`build`], [`supervise`]) coordinate the two to
//! implement CLI commands.

pub mod build;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod supervise;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
