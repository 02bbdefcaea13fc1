//! Pipeline configuration stored in `stagecraft.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::health::{ProbeDescriptor, resolve_probe_command};
use crate::core::identity::ExecutionIdentity;
use crate::core::launch::{LaunchDescriptor, LaunchFlags};
use crate::core::paths::{validate_container_path, validate_context_path};

/// Placeholder for the manifest path in the installer command.
pub const MANIFEST_PLACEHOLDER: &str = "{manifest}";
/// Placeholder for the install prefix in the installer command.
pub const PREFIX_PLACEHOLDER: &str = "{prefix}";

/// Pipeline configuration (TOML).
///
/// Every field has a default, so a missing file or section builds the stock
/// two-stage Python service image.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    pub builder: BuilderConfig,
    pub runtime: RuntimeConfig,
    pub identity: IdentityConfig,
    pub probe: ProbeConfig,
    pub launch: LaunchConfig,
    pub metadata: MetadataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuilderConfig {
    /// `scratch` or a directory (relative to the build context) seeding the builder rootfs.
    pub base: String,
    /// Image reference used when rendering a Containerfile.
    pub image: String,
    /// Commands run in the builder before installing (toolchain setup).
    pub setup: Vec<Vec<String>>,
    /// Dependency manifest, relative to the build context.
    pub manifest: String,
    /// Install root inside the builder, exported to the runtime stage.
    pub prefix: String,
    /// Installer argv; `{manifest}` and `{prefix}` are substituted.
    pub installer: Vec<String>,
    /// Per-command wall-clock budget for setup and install.
    pub timeout_secs: u64,
    /// Truncate captured installer output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            base: "scratch".to_string(),
            image: "python:3.11".to_string(),
            setup: Vec::new(),
            manifest: "requirements.txt".to_string(),
            prefix: "/install".to_string(),
            installer: [
                "pip",
                "install",
                "--no-cache-dir",
                "--prefix",
                PREFIX_PLACEHOLDER,
                "-r",
                MANIFEST_PLACEHOLDER,
            ]
            .map(String::from)
            .to_vec(),
            timeout_secs: 15 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// `scratch` or a directory (relative to the build context) seeding the runtime rootfs.
    pub base: String,
    /// Image reference used when rendering a Containerfile.
    pub image: String,
    /// Service source tree, relative to the build context.
    pub source: String,
    /// Fixed working directory the source tree lands in.
    pub workdir: String,
    /// Where the builder's install prefix is imported.
    pub prefix_dest: String,
    /// Entry names skipped when copying the source tree.
    pub ignore: Vec<String>,
    /// Rootfs-relative paths that must not exist after composition.
    pub forbidden: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let env = [
            ("PATH", "/usr/local/bin:/usr/bin:/bin"),
            ("PYTHONDONTWRITEBYTECODE", "1"),
            ("PYTHONUNBUFFERED", "1"),
            ("PYTHONPATH", "/app"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
        Self {
            base: "scratch".to_string(),
            image: "python:3.11-slim".to_string(),
            source: "src".to_string(),
            workdir: "/app".to_string(),
            prefix_dest: "/usr/local".to_string(),
            ignore: [".git", "__pycache__", ".pytest_cache", ".venv"]
                .map(String::from)
                .to_vec(),
            forbidden: [
                "root/.cache/pip",
                "usr/bin/gcc",
                "usr/bin/cc",
                "usr/bin/make",
                "usr/include",
            ]
            .map(String::from)
            .to_vec(),
            env,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IdentityConfig {
    pub user: String,
    pub group: String,
    pub uid: u32,
    pub gid: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user: "appuser".to_string(),
            group: "appgroup".to_string(),
            uid: 999,
            gid: 999,
        }
    }
}

/// Stock health check. `urlopen` raises on refused connections and 4xx/5xx answers.
pub const DEFAULT_PROBE_SCRIPT: &str =
    "import urllib.request; urllib.request.urlopen('http://{host}:{port}/health', timeout=5)";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProbeConfig {
    /// Probe argv; `{host}` and `{port}` come from `[launch]`.
    pub command: Vec<String>,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub start_period_secs: u64,
    pub retries: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            command: ["python3", "-c", DEFAULT_PROBE_SCRIPT]
                .map(String::from)
                .to_vec(),
            interval_secs: 30,
            timeout_secs: 10,
            start_period_secs: 5,
            retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LaunchConfig {
    pub executable: String,
    pub args: Vec<String>,
    pub host: String,
    pub port: u16,
    /// Fixed worker count passed to the process.
    pub workers: u32,
    pub flags: LaunchFlags,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            executable: "uvicorn".to_string(),
            args: vec!["bem_saude.api.main:app".to_string()],
            host: "0.0.0.0".to_string(),
            port: 8000,
            workers: 4,
            flags: LaunchFlags::default(),
        }
    }
}

pub const DEFAULT_MAINTAINER: &str = "platform@bem-saude.example";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetadataConfig {
    pub title: String,
    pub description: String,
    pub maintainer: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            title: "bem-saude-api".to_string(),
            description: "Clinic patient and scheduling HTTP API".to_string(),
            maintainer: DEFAULT_MAINTAINER.to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        let builder = &self.builder;
        validate_context_path(&builder.manifest).map_err(|err| anyhow!("builder.manifest: {err}"))?;
        validate_container_path(&builder.prefix).map_err(|err| anyhow!("builder.prefix: {err}"))?;
        if builder.installer.is_empty() || builder.installer[0].trim().is_empty() {
            return Err(anyhow!("builder.installer must be a non-empty array"));
        }
        for placeholder in [MANIFEST_PLACEHOLDER, PREFIX_PLACEHOLDER] {
            if !builder.installer.iter().any(|arg| arg.contains(placeholder)) {
                return Err(anyhow!("builder.installer must reference {placeholder}"));
            }
        }
        if builder
            .setup
            .iter()
            .any(|cmd| cmd.is_empty() || cmd[0].trim().is_empty())
        {
            return Err(anyhow!("builder.setup commands must be non-empty arrays"));
        }
        if builder.timeout_secs == 0 {
            return Err(anyhow!("builder.timeout_secs must be > 0"));
        }
        if builder.output_limit_bytes == 0 {
            return Err(anyhow!("builder.output_limit_bytes must be > 0"));
        }

        let runtime = &self.runtime;
        validate_context_path(&runtime.source).map_err(|err| anyhow!("runtime.source: {err}"))?;
        validate_container_path(&runtime.workdir).map_err(|err| anyhow!("runtime.workdir: {err}"))?;
        validate_container_path(&runtime.prefix_dest)
            .map_err(|err| anyhow!("runtime.prefix_dest: {err}"))?;
        if runtime.workdir == "/" {
            return Err(anyhow!("runtime.workdir must not be the filesystem root"));
        }
        for path in &runtime.forbidden {
            validate_context_path(path).map_err(|err| anyhow!("runtime.forbidden: {err}"))?;
        }

        if self.metadata.title.trim().is_empty() {
            return Err(anyhow!("metadata.title must not be empty"));
        }
        if self.metadata.maintainer.trim().is_empty() {
            return Err(anyhow!("metadata.maintainer must not be empty"));
        }

        self.identity()
            .validate()
            .map_err(|err| anyhow!("identity: {err}"))?;

        let launch = self.launch_descriptor();
        launch.validate().map_err(|err| anyhow!("launch: {err}"))?;

        let probe = self.probe_descriptor();
        probe.validate().map_err(|err| anyhow!("probe: {err}"))?;
        if !probe.targets_port(launch.port) {
            return Err(anyhow!(
                "probe.command must target the launch port {} (use {{port}})",
                launch.port
            ));
        }
        Ok(())
    }

    pub fn identity(&self) -> ExecutionIdentity {
        ExecutionIdentity {
            user: self.identity.user.clone(),
            group: self.identity.group.clone(),
            uid: self.identity.uid,
            gid: self.identity.gid,
            home: self.runtime.workdir.clone(),
        }
    }

    pub fn launch_descriptor(&self) -> LaunchDescriptor {
        LaunchDescriptor {
            executable: self.launch.executable.clone(),
            args: self.launch.args.clone(),
            host: self.launch.host.clone(),
            port: self.launch.port,
            workers: self.launch.workers,
            flags: self.launch.flags.clone(),
        }
    }

    /// Probe descriptor with `{host}`/`{port}` resolved against `[launch]`.
    pub fn probe_descriptor(&self) -> ProbeDescriptor {
        let launch = self.launch_descriptor();
        ProbeDescriptor {
            command: resolve_probe_command(&self.probe.command, &launch.probe_host(), launch.port),
            interval: Duration::from_secs(self.probe.interval_secs),
            timeout: Duration::from_secs(self.probe.timeout_secs),
            start_period: Duration::from_secs(self.probe.start_period_secs),
            retries: self.probe.retries,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
