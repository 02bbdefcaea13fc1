//! Side-effecting operations: processes, filesystems and artifacts.

pub mod artifact;
pub mod composer;
pub mod config;
pub mod digest;
pub mod installer;
pub mod launcher;
pub mod probe;
pub mod process;
pub mod provision;
pub mod render;
pub mod stage_runner;
