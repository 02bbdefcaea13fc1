//! On-disk image artifact: `<out>/rootfs/` plus the write-once `image.json`.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::health::ProbeDescriptor;
use crate::core::identity::{ExecutionIdentity, ProvisionState};
use crate::core::launch::LaunchDescriptor;
use crate::core::metadata::MetadataRecord;
use crate::core::paths::host_path;
use crate::io::provision::SwitchedIdentity;

pub const IMAGE_CONFIG_FILE: &str = "image.json";
pub const ROOTFS_DIR: &str = "rootfs";

/// sha256 tree digests recorded at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digests {
    pub prefix: String,
    pub rootfs: String,
}

/// Build-time settings that go into the image config alongside the identity.
#[derive(Debug, Clone)]
pub struct ImageSettings {
    pub workdir: String,
    pub env: BTreeMap<String, String>,
    pub launch: LaunchDescriptor,
    pub healthcheck: ProbeDescriptor,
    pub labels: MetadataRecord,
    pub digests: Digests,
}

/// Image config stored as `image.json`.
///
/// The identity fields are private: outside deserialization, a config can only
/// be assembled from a [`SwitchedIdentity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub workdir: String,
    pub env: BTreeMap<String, String>,
    user: String,
    identity: ExecutionIdentity,
    provision: ProvisionState,
    pub exposed_port: u16,
    pub launch: LaunchDescriptor,
    pub healthcheck: ProbeDescriptor,
    pub labels: MetadataRecord,
    pub digests: Digests,
}

impl ImageConfig {
    pub fn assemble(identity: &SwitchedIdentity, settings: ImageSettings) -> Self {
        Self {
            workdir: settings.workdir,
            env: settings.env,
            user: identity.identity().user_spec(),
            identity: identity.identity().clone(),
            provision: identity.state(),
            exposed_port: settings.launch.port,
            launch: settings.launch,
            healthcheck: settings.healthcheck,
            labels: settings.labels,
            digests: settings.digests,
        }
    }

    /// `uid:gid` the launched process runs as.
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn identity(&self) -> &ExecutionIdentity {
        &self.identity
    }

    pub fn validate(&self) -> Result<()> {
        self.identity
            .validate()
            .map_err(|err| anyhow!("identity: {err}"))?;
        if self.provision != ProvisionState::IdentitySwitched {
            return Err(anyhow!("image identity was never switched"));
        }
        if self.user != self.identity.user_spec() {
            return Err(anyhow!(
                "user '{}' does not match identity {}",
                self.user,
                self.identity.user_spec()
            ));
        }
        self.launch.validate().map_err(|err| anyhow!("launch: {err}"))?;
        self.healthcheck
            .validate()
            .map_err(|err| anyhow!("healthcheck: {err}"))?;
        if self.exposed_port != self.launch.port {
            return Err(anyhow!(
                "exposed port {} differs from launch port {}",
                self.exposed_port,
                self.launch.port
            ));
        }
        Ok(())
    }
}

/// Inventory view printed by `stagecraft inspect`.
#[derive(Debug, Clone, Serialize)]
pub struct Inventory<'a> {
    pub labels: &'a MetadataRecord,
    pub digests: &'a Digests,
    pub user: &'a str,
    pub exposed_port: u16,
}

/// A loaded artifact directory.
#[derive(Debug, Clone)]
pub struct Artifact {
    root: PathBuf,
    pub config: ImageConfig,
}

impl Artifact {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rootfs(&self) -> PathBuf {
        self.root.join(ROOTFS_DIR)
    }

    /// Host path of a container path inside the artifact rootfs.
    pub fn host_path(&self, path: &str) -> Result<PathBuf> {
        host_path(&self.rootfs(), path).map_err(|err| anyhow!(err))
    }

    pub fn inventory(&self) -> Inventory<'_> {
        Inventory {
            labels: &self.config.labels,
            digests: &self.config.digests,
            user: self.config.user(),
            exposed_port: self.config.exposed_port,
        }
    }
}

/// Write `image.json` into `dir`. Fails if one already exists.
pub fn write_image_config(dir: &Path, config: &ImageConfig) -> Result<PathBuf> {
    config.validate()?;
    let path = dir.join(IMAGE_CONFIG_FILE);
    let mut json = serde_json::to_string_pretty(config).context("serialize image config")?;
    json.push('\n');
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .with_context(|| format!("create {} (image configs are write-once)", path.display()))?;
    file.write_all(json.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync {}", path.display()))?;
    Ok(path)
}

pub fn load_artifact(root: &Path) -> Result<Artifact> {
    let path = root.join(IMAGE_CONFIG_FILE);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let config: ImageConfig =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid image config {}", path.display()))?;
    let rootfs = root.join(ROOTFS_DIR);
    if !rootfs.is_dir() {
        return Err(anyhow!("artifact has no rootfs at {}", rootfs.display()));
    }
    Ok(Artifact {
        root: root.to_path_buf(),
        config,
    })
}
