//! Identity provisioning with an enforced privilege order.
//!
//! `Provisioner<Root>` creates the account entries. Only
//! [`Provisioner::assign_ownership`] produces a `Provisioner<OwnershipAssigned>`,
//! and only that can [`switch_identity`](Provisioner::switch_identity) into a
//! [`SwitchedIdentity`]. Nothing converts a `SwitchedIdentity` back, so a
//! switched filesystem cannot be re-escalated.

use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::os::unix::fs::lchown;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::core::identity::{
    EntryStatus, ExecutionIdentity, ProvisionState, check_group, check_passwd,
};
use crate::core::paths::host_path;

/// Still privileged; identity entries exist but nothing is owned yet.
#[derive(Debug)]
pub struct Root;

/// Ownership of at least one path has been handed to the identity.
#[derive(Debug)]
pub struct OwnershipAssigned;

#[derive(Debug)]
pub struct Provisioner<S> {
    rootfs: PathBuf,
    identity: ExecutionIdentity,
    owned: Vec<String>,
    _state: PhantomData<S>,
}

/// Terminal state: the identity the supervised process runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchedIdentity {
    identity: ExecutionIdentity,
    owned: Vec<String>,
}

impl SwitchedIdentity {
    pub fn identity(&self) -> &ExecutionIdentity {
        &self.identity
    }

    /// Container paths recursively owned by the identity.
    pub fn owned_paths(&self) -> &[String] {
        &self.owned
    }

    pub fn state(&self) -> ProvisionState {
        ProvisionState::IdentitySwitched
    }
}

impl<S> Provisioner<S> {
    pub fn identity(&self) -> &ExecutionIdentity {
        &self.identity
    }

    fn chown_recursive(&self, path: &str) -> Result<u64> {
        let host = host_path(&self.rootfs, path).map_err(|err| anyhow!(err))?;
        if !host.exists() {
            return Err(anyhow!("cannot assign ownership of {path}: path does not exist"));
        }
        let mut changed = 0u64;
        for entry in WalkDir::new(&host) {
            let entry = entry.with_context(|| format!("walk {}", host.display()))?;
            lchown(entry.path(), Some(self.identity.uid), Some(self.identity.gid)).with_context(
                || {
                    format!(
                        "chown {} to {}",
                        entry.path().display(),
                        self.identity.user_spec()
                    )
                },
            )?;
            changed += 1;
        }
        Ok(changed)
    }
}

impl Provisioner<Root> {
    /// Validate the identity and add its group and user entries to the rootfs.
    pub fn create_identity(rootfs: &Path, identity: ExecutionIdentity) -> Result<Self> {
        identity.validate().map_err(|err| anyhow!(err))?;
        let etc = rootfs.join("etc");
        fs::create_dir_all(&etc).with_context(|| format!("create {}", etc.display()))?;

        let group_path = etc.join("group");
        let group_contents = read_or_empty(&group_path)?;
        if check_group(&group_contents, &identity).map_err(|err| anyhow!(err))?
            == EntryStatus::Missing
        {
            append_line(&group_path, &group_contents, &identity.group_entry())?;
        }

        let passwd_path = etc.join("passwd");
        let passwd_contents = read_or_empty(&passwd_path)?;
        if check_passwd(&passwd_contents, &identity).map_err(|err| anyhow!(err))?
            == EntryStatus::Missing
        {
            append_line(&passwd_path, &passwd_contents, &identity.passwd_entry())?;
        }

        info!(
            user = %identity.user,
            group = %identity.group,
            uid = identity.uid,
            gid = identity.gid,
            "created system identity"
        );
        Ok(Self {
            rootfs: rootfs.to_path_buf(),
            identity,
            owned: Vec::new(),
            _state: PhantomData,
        })
    }

    pub fn state(&self) -> ProvisionState {
        ProvisionState::RootIdentity
    }

    /// Recursively hand `path` (a container path) to the identity.
    pub fn assign_ownership(self, path: &str) -> Result<Provisioner<OwnershipAssigned>> {
        let changed = self.chown_recursive(path)?;
        debug!(path, changed, "ownership assigned");
        let mut owned = self.owned;
        owned.push(path.to_string());
        Ok(Provisioner {
            rootfs: self.rootfs,
            identity: self.identity,
            owned,
            _state: PhantomData,
        })
    }
}

impl Provisioner<OwnershipAssigned> {
    pub fn state(&self) -> ProvisionState {
        ProvisionState::OwnershipAssigned
    }

    /// Hand an additional path to the identity before switching.
    pub fn assign_ownership(mut self, path: &str) -> Result<Self> {
        let changed = self.chown_recursive(path)?;
        debug!(path, changed, "ownership assigned");
        self.owned.push(path.to_string());
        Ok(self)
    }

    /// Drop privileges for the remainder of the filesystem's life.
    pub fn switch_identity(self) -> SwitchedIdentity {
        info!(user = %self.identity.user, "identity switched");
        SwitchedIdentity {
            identity: self.identity,
            owned: self.owned,
        }
    }
}

fn read_or_empty(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

fn append_line(path: &Path, existing: &str, line: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    let mut buf = String::new();
    if !existing.is_empty() && !existing.ends_with('\n') {
        buf.push('\n');
    }
    buf.push_str(line);
    buf.push('\n');
    file.write_all(buf.as_bytes())
        .with_context(|| format!("append to {}", path.display()))
}
