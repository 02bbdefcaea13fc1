//! Shared types for build failures and descriptor serialization.

use std::fmt;

/// Build-time failure classes. Every class aborts the whole build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A declared dependency could not be installed.
    Resolution,
    /// An export, base or source path was missing or unreadable, or build
    /// residue leaked into the runtime filesystem.
    Composition,
    /// Identity creation or ownership assignment failed.
    Provisioning,
    /// A `Run` instruction exited unsuccessfully.
    Instruction,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Resolution => "resolution failure",
            FailureKind::Composition => "composition failure",
            FailureKind::Provisioning => "provisioning failure",
            FailureKind::Instruction => "instruction failure",
        };
        f.write_str(label)
    }
}

/// Fatal build failure attributed to a stage.
#[derive(Debug)]
pub struct BuildFailure {
    pub stage: String,
    pub kind: FailureKind,
    pub source: anyhow::Error,
}

impl BuildFailure {
    pub fn new(stage: &str, kind: FailureKind, source: anyhow::Error) -> Self {
        Self {
            stage: stage.to_string(),
            kind,
            source,
        }
    }
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in stage '{}'", self.kind, self.stage)
    }
}

impl std::error::Error for BuildFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source: &(dyn std::error::Error + 'static) = self.source.as_ref();
        Some(source)
    }
}

/// Attach a stage and failure class to an `anyhow` result.
pub trait FailAs<T> {
    fn fail_as(self, stage: &str, kind: FailureKind) -> Result<T, BuildFailure>;
}

impl<T> FailAs<T> for anyhow::Result<T> {
    fn fail_as(self, stage: &str, kind: FailureKind) -> Result<T, BuildFailure> {
        self.map_err(|err| BuildFailure::new(stage, kind, err))
    }
}

/// Serialize a `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
