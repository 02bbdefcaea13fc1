//! Write-once provenance labels attached to the artifact.

use std::collections::BTreeMap;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

pub const TITLE: &str = "org.opencontainers.image.title";
pub const DESCRIPTION: &str = "org.opencontainers.image.description";
pub const VERSION: &str = "org.opencontainers.image.version";
pub const CREATED: &str = "org.opencontainers.image.created";
pub const AUTHORS: &str = "org.opencontainers.image.authors";

/// Inputs for the fixed label set.
#[derive(Debug, Clone, Copy)]
pub struct ProvenanceInputs<'a> {
    pub title: &'a str,
    pub description: &'a str,
    pub maintainer: &'a str,
    /// Supplied externally at build time.
    pub version: &'a str,
    /// RFC 3339 build timestamp, supplied externally at build time.
    pub created: &'a str,
}

/// Key/value labels. A key can be written once and never replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataRecord {
    labels: BTreeMap<String, String>,
}

impl MetadataRecord {
    /// Build the fixed provenance label set from validated inputs.
    pub fn provenance(inputs: &ProvenanceInputs<'_>) -> Result<Self, String> {
        validate_version(inputs.version)?;
        validate_timestamp(inputs.created)?;
        if inputs.title.trim().is_empty() {
            return Err("metadata title must not be empty".to_string());
        }
        if inputs.maintainer.trim().is_empty() {
            return Err("metadata maintainer must not be empty".to_string());
        }

        let mut record = Self::default();
        record.insert(TITLE, inputs.title)?;
        record.insert(DESCRIPTION, inputs.description)?;
        record.insert(VERSION, inputs.version)?;
        record.insert(CREATED, inputs.created)?;
        record.insert(AUTHORS, inputs.maintainer)?;
        Ok(record)
    }

    pub fn insert(&mut self, key: &str, value: &str) -> Result<(), String> {
        if key.trim().is_empty() {
            return Err("label key must not be empty".to_string());
        }
        if self.labels.contains_key(key) {
            return Err(format!("label '{key}' is already set"));
        }
        self.labels.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
}

pub fn validate_version(version: &str) -> Result<(), String> {
    if version.is_empty() {
        return Err("version must not be empty".to_string());
    }
    if version.chars().any(char::is_whitespace) {
        return Err(format!("version '{version}' must not contain whitespace"));
    }
    Ok(())
}

pub fn validate_timestamp(created: &str) -> Result<(), String> {
    DateTime::parse_from_rfc3339(created)
        .map(|_| ())
        .map_err(|err| format!("build timestamp '{created}' is not RFC 3339: {err}"))
}
