//! Unprivileged execution identity and account-database entries.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Login shell assigned to system users; refuses interactive logins.
pub const NOLOGIN_SHELL: &str = "/usr/sbin/nologin";

static ACCOUNT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("account regex is valid"));

/// User/group context the supervised process runs under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionIdentity {
    pub user: String,
    pub group: String,
    pub uid: u32,
    pub gid: u32,
    /// Home directory and ownership scope (the application workdir).
    pub home: String,
}

impl ExecutionIdentity {
    pub fn validate(&self) -> Result<(), String> {
        if !ACCOUNT_NAME_RE.is_match(&self.user) {
            return Err(format!("invalid user name '{}'", self.user));
        }
        if !ACCOUNT_NAME_RE.is_match(&self.group) {
            return Err(format!("invalid group name '{}'", self.group));
        }
        if self.uid == 0 || self.user == "root" {
            return Err("execution identity must not be the root user".to_string());
        }
        if self.gid == 0 || self.group == "root" {
            return Err("execution identity must not use the root group".to_string());
        }
        crate::core::paths::validate_container_path(&self.home)
            .map_err(|err| format!("home: {err}"))?;
        Ok(())
    }

    /// `uid:gid` form used in image configs.
    pub fn user_spec(&self) -> String {
        format!("{}:{}", self.uid, self.gid)
    }

    pub fn passwd_entry(&self) -> String {
        format!(
            "{}:x:{}:{}::{}:{}",
            self.user, self.uid, self.gid, self.home, NOLOGIN_SHELL
        )
    }

    pub fn group_entry(&self) -> String {
        format!("{}:x:{}:", self.group, self.gid)
    }
}

/// Privilege state of a runtime filesystem. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisionState {
    RootIdentity,
    OwnershipAssigned,
    IdentitySwitched,
}

/// Whether an account entry already exists in a database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Missing,
    Present,
}

/// Check `/etc/passwd` contents for the identity's user.
///
/// An identical-id entry is accepted; a name or uid clash is an error.
pub fn check_passwd(contents: &str, identity: &ExecutionIdentity) -> Result<EntryStatus, String> {
    check_entries(contents, &identity.user, identity.uid, |fields| {
        fields.get(3).copied() == Some(identity.gid.to_string().as_str())
    })
    .map_err(|err| format!("passwd: {err}"))
}

/// Check `/etc/group` contents for the identity's group.
pub fn check_group(contents: &str, identity: &ExecutionIdentity) -> Result<EntryStatus, String> {
    check_entries(contents, &identity.group, identity.gid, |_| true)
        .map_err(|err| format!("group: {err}"))
}

fn check_entries(
    contents: &str,
    name: &str,
    id: u32,
    extra_match: impl Fn(&[&str]) -> bool,
) -> Result<EntryStatus, String> {
    let id_str = id.to_string();
    let mut status = EntryStatus::Missing;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        let entry_name = fields.first().copied().unwrap_or_default();
        let entry_id = fields.get(2).copied().unwrap_or_default();
        match (entry_name == name, entry_id == id_str) {
            (true, true) if extra_match(fields.as_slice()) => status = EntryStatus::Present,
            (true, _) => {
                return Err(format!(
                    "'{name}' already exists with conflicting entry '{line}'"
                ));
            }
            (false, true) => {
                return Err(format!("id {id} already belongs to '{entry_name}'"));
            }
            (false, false) => {}
        }
    }
    Ok(status)
}
