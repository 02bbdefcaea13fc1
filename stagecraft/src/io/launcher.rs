//! Foreground process launch from an artifact's image config.

use std::env;
use std::ffi::OsString;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{info, instrument};

use crate::io::artifact::Artifact;

/// How the foreground process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Terminated {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl Terminated {
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    /// Exit code to propagate: the child's code, or 128 + signal.
    pub fn exit_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        }
    }
}

/// Build the launch command: fixed argv, rootfs workdir, image env, and the
/// switched identity's uid/gid.
pub fn launch_command(artifact: &Artifact) -> Result<Command> {
    let config = &artifact.config;
    let argv = config.launch.argv();
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("launch argv is empty"))?;

    let search_path = search_path(artifact)?;
    let program = resolve_program(artifact, program, &search_path)?;
    let workdir = artifact.host_path(&config.workdir)?;
    if !workdir.is_dir() {
        return Err(anyhow!("workdir {} is missing from the rootfs", config.workdir));
    }
    let home = artifact.host_path(&config.identity().home)?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&workdir)
        .envs(config.env.iter().filter(|(key, _)| key.as_str() != "PATH"))
        .env("PATH", env::join_paths(&search_path).context("compose PATH")?)
        .env("HOME", home)
        .uid(config.identity().uid)
        .gid(config.identity().gid);
    Ok(cmd)
}

/// Spawn the foreground process with inherited stdio.
#[instrument(skip_all, fields(artifact = %artifact.root().display()))]
pub fn spawn(artifact: &Artifact) -> Result<Child> {
    let mut cmd = launch_command(artifact)?;
    let child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", artifact.config.launch.executable))?;
    info!(
        pid = child.id(),
        user = artifact.config.user(),
        port = artifact.config.launch.port,
        workers = artifact.config.launch.workers,
        "process launched"
    );
    Ok(child)
}

/// Image PATH entries mapped into the rootfs, followed by the host PATH.
fn search_path(artifact: &Artifact) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    if let Some(image_path) = artifact.config.env.get("PATH") {
        for dir in image_path.split(':').filter(|dir| dir.starts_with('/')) {
            dirs.push(artifact.host_path(dir)?);
        }
    }
    let host = env::var_os("PATH").unwrap_or_else(OsString::new);
    dirs.extend(env::split_paths(&host));
    Ok(dirs)
}

fn resolve_program(artifact: &Artifact, program: &str, search_path: &[PathBuf]) -> Result<PathBuf> {
    if program.starts_with('/') {
        let inside = artifact.host_path(program)?;
        return Ok(if inside.is_file() {
            inside
        } else {
            PathBuf::from(program)
        });
    }
    if program.contains('/') {
        return artifact.host_path(&format!("{}/{program}", artifact.config.workdir));
    }
    Ok(search_path
        .iter()
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(program)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_prefers_code_then_signal() {
        assert_eq!(Terminated { code: Some(7), signal: None }.exit_code(), 7);
        assert_eq!(Terminated { code: None, signal: Some(15) }.exit_code(), 143);
        assert_eq!(Terminated { code: None, signal: None }.exit_code(), 1);
    }

    #[test]
    fn status_conversion_reads_signal() {
        let status = ExitStatus::from_raw(9);
        assert_eq!(
            Terminated::from_status(status),
            Terminated { code: None, signal: Some(9) }
        );
        let status = ExitStatus::from_raw(3 << 8);
        assert_eq!(Terminated::from_status(status).exit_code(), 3);
    }
}
