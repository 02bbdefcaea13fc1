//! Dependency installer adapter.
//!
//! The [`Installer`] trait decouples the stage runner from the real package
//! manager. The stock [`CommandInstaller`] runs the configured installer argv;
//! tests substitute a shell script.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

use crate::core::manifest::{Manifest, parse_manifest};
use crate::io::config::{MANIFEST_PLACEHOLDER, PREFIX_PLACEHOLDER};
use crate::io::process::run_bounded;

/// Parameters for one installer run.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// Host path of the manifest inside the build context.
    pub manifest_path: PathBuf,
    /// Host path of the install prefix inside the builder rootfs.
    pub prefix_path: PathBuf,
    /// Working directory for the installer (the builder rootfs).
    pub workdir: PathBuf,
    /// Installer argv with `{manifest}`/`{prefix}` placeholders.
    pub command: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Where to keep the installer's captured output.
    pub log_path: PathBuf,
}

/// A finished, sealed install prefix.
#[derive(Debug, Clone)]
pub struct InstallPrefix {
    pub path: PathBuf,
    pub manifest: Manifest,
    pub files: u64,
}

/// Abstraction over dependency installation backends.
pub trait Installer {
    /// Install every manifest entry into `request.prefix_path`.
    ///
    /// On error no prefix directory may remain.
    fn install(&self, request: &InstallRequest) -> Result<InstallPrefix>;
}

/// Installer that runs the configured command.
pub struct CommandInstaller;

impl Installer for CommandInstaller {
    #[instrument(skip_all, fields(manifest = %request.manifest_path.display()))]
    fn install(&self, request: &InstallRequest) -> Result<InstallPrefix> {
        let manifest = read_manifest(&request.manifest_path)?;
        info!(
            requirements = manifest.len(),
            prefix = %request.prefix_path.display(),
            "installing dependencies"
        );

        let staging = staging_path(&request.prefix_path);
        for stale in [&staging, &request.prefix_path] {
            if stale.exists() {
                fs::remove_dir_all(stale)
                    .with_context(|| format!("clear stale prefix {}", stale.display()))?;
            }
        }
        fs::create_dir_all(&staging)
            .with_context(|| format!("create prefix {}", staging.display()))?;

        if let Err(err) = run_installer(request, &staging) {
            discard_prefix(&staging);
            return Err(err);
        }
        fs::rename(&staging, &request.prefix_path).with_context(|| {
            format!(
                "seal prefix {} -> {}",
                staging.display(),
                request.prefix_path.display()
            )
        })?;

        let files = count_files(&request.prefix_path)?;
        info!(files, "dependencies installed");
        Ok(InstallPrefix {
            path: request.prefix_path.clone(),
            manifest,
            files,
        })
    }
}

/// Read and validate the manifest. Malformed manifests are resolution failures.
pub fn read_manifest(path: &Path) -> Result<Manifest> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("read manifest {}", path.display()))?;
    parse_manifest(&text).map_err(|errors| {
        anyhow!(
            "invalid manifest {}:\n- {}",
            path.display(),
            errors.join("\n- ")
        )
    })
}

/// Substitute placeholders in the installer argv.
pub fn installer_argv(command: &[String], manifest: &Path, prefix: &Path) -> Vec<String> {
    let manifest = manifest.to_string_lossy();
    let prefix = prefix.to_string_lossy();
    command
        .iter()
        .map(|arg| {
            arg.replace(MANIFEST_PLACEHOLDER, &manifest)
                .replace(PREFIX_PLACEHOLDER, &prefix)
        })
        .collect()
}

/// Sibling directory the installer writes into before the prefix is sealed.
pub fn staging_path(prefix: &Path) -> PathBuf {
    let mut name = prefix.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    prefix.with_file_name(name)
}

fn run_installer(request: &InstallRequest, staging: &Path) -> Result<()> {
    let argv = installer_argv(&request.command, &request.manifest_path, staging);
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("installer command is empty"))?;
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(&request.workdir);

    let output = run_bounded(cmd, request.timeout, request.output_limit_bytes)
        .with_context(|| format!("run installer {program}"))?;
    write_log(&request.log_path, &output.log_text())?;

    if output.timed_out {
        return Err(anyhow!(
            "installer timed out after {}s",
            request.timeout.as_secs()
        ));
    }
    if !output.status.success() {
        return Err(anyhow!(
            "installer exited with {}: {}",
            output.status,
            output.diagnostic_tail(2_000)
        ));
    }
    Ok(())
}

fn discard_prefix(prefix: &Path) {
    if let Err(err) = fs::remove_dir_all(prefix) {
        warn!(err = %err, prefix = %prefix.display(), "failed to discard partial prefix");
    }
}

fn write_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write installer log {}", path.display()))
}

fn count_files(root: &Path) -> Result<u64> {
    let mut files = 0;
    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_dir() {
            files += 1;
        }
    }
    Ok(files)
}
