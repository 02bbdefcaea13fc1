//! Ordered stage graph with explicit, named exports.
//!
//! A later stage can only see an earlier stage's filesystem through a
//! `CopyFrom` edge naming one of that stage's declared exports. Validation is
//! static and runs before any instruction executes.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::core::identity::ExecutionIdentity;
use crate::core::paths::{validate_container_path, validate_context_path};

/// Starting filesystem for a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseRef {
    /// Empty filesystem.
    Scratch,
    /// Host directory copied in as the stage's starting tree.
    Directory(PathBuf),
}

impl BaseRef {
    /// Parse a configured base: `scratch` or a host directory.
    pub fn parse(value: &str, resolve: impl FnOnce(&str) -> PathBuf) -> Self {
        if value.trim() == "scratch" {
            BaseRef::Scratch
        } else {
            BaseRef::Directory(resolve(value))
        }
    }
}

/// One step within a stage. Instructions run in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Run a command with the stage rootfs as working directory.
    Run { argv: Vec<String> },
    /// Install the manifest at `manifest` (context-relative) into `prefix`.
    Install { manifest: String, prefix: String },
    /// Copy `src` from the build context to `dest` in the stage rootfs.
    CopyContext { src: String, dest: String },
    /// Copy the sealed export `export` of an earlier `stage` to `dest`.
    CopyFrom {
        stage: String,
        export: String,
        dest: String,
    },
    /// Create the stage identity (once) and recursively hand `path` to it.
    AssignOwnership { path: String },
    /// Drop to the stage identity. Terminal for the stage.
    SwitchUser,
}

impl Instruction {
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::Run { .. } => "run",
            Instruction::Install { .. } => "install",
            Instruction::CopyContext { .. } => "copy",
            Instruction::CopyFrom { .. } => "copy-from",
            Instruction::AssignOwnership { .. } => "chown",
            Instruction::SwitchUser => "user",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub id: String,
    pub base: BaseRef,
    pub instructions: Vec<Instruction>,
    /// Absolute container paths later stages may import.
    pub exports: Vec<String>,
    /// Identity created by `AssignOwnership` and adopted by `SwitchUser`.
    pub user: Option<ExecutionIdentity>,
}

/// Validated, ordered stage list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageGraph {
    stages: Vec<Stage>,
}

impl StageGraph {
    pub fn new(stages: Vec<Stage>) -> Result<Self, Vec<String>> {
        let errors = validate_graph(&stages);
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.id == id)
    }

    /// The stage whose filesystem becomes the artifact. Never empty once validated.
    pub fn final_stage(&self) -> &Stage {
        &self.stages[self.stages.len() - 1]
    }

    pub fn is_final(&self, id: &str) -> bool {
        self.final_stage().id == id
    }
}

/// Check graph invariants:
/// - At least one stage, unique non-empty ids
/// - Exports are absolute container paths
/// - `CopyFrom` targets a stage declared earlier and one of its exports
/// - `AssignOwnership` needs a stage identity
/// - `SwitchUser` at most once, after an `AssignOwnership`, with nothing after it
pub fn validate_graph(stages: &[Stage]) -> Vec<String> {
    let mut errors = Vec::new();
    if stages.is_empty() {
        errors.push("graph has no stages".to_string());
        return errors;
    }

    let mut declared: HashMap<&str, usize> = HashMap::new();
    for (position, stage) in stages.iter().enumerate() {
        if stage.id.trim().is_empty() {
            errors.push(format!("stage #{position}: id must not be empty"));
        } else if declared.contains_key(stage.id.as_str()) {
            errors.push(format!("duplicate stage id '{}'", stage.id));
        }

        for export in &stage.exports {
            if let Err(err) = validate_container_path(export) {
                errors.push(format!("{}: export {}", stage.id, err));
            }
        }

        validate_instructions(stage, stages, &declared, &mut errors);

        declared.entry(stage.id.as_str()).or_insert(position);
    }
    errors
}

fn validate_instructions(
    stage: &Stage,
    stages: &[Stage],
    earlier: &HashMap<&str, usize>,
    errors: &mut Vec<String>,
) {
    let mut ownership_assigned = false;
    let mut switched_at: Option<usize> = None;

    for (idx, instruction) in stage.instructions.iter().enumerate() {
        let at = format!("{}[{}] {}", stage.id, idx, instruction.name());
        if let Some(switch_idx) = switched_at {
            errors.push(format!(
                "{at}: follows user switch at {}[{switch_idx}]; privilege cannot be re-escalated",
                stage.id
            ));
        }

        match instruction {
            Instruction::Run { argv } => {
                if argv.first().is_none_or(|program| program.trim().is_empty()) {
                    errors.push(format!("{at}: command must be a non-empty array"));
                }
            }
            Instruction::Install { manifest, prefix } => {
                if let Err(err) = validate_context_path(manifest) {
                    errors.push(format!("{at}: manifest {err}"));
                }
                if let Err(err) = validate_container_path(prefix) {
                    errors.push(format!("{at}: prefix {err}"));
                }
            }
            Instruction::CopyContext { src, dest } => {
                if let Err(err) = validate_context_path(src) {
                    errors.push(format!("{at}: source {err}"));
                }
                if let Err(err) = validate_container_path(dest) {
                    errors.push(format!("{at}: destination {err}"));
                }
            }
            Instruction::CopyFrom {
                stage: source,
                export,
                dest,
            } => {
                if let Err(err) = validate_container_path(dest) {
                    errors.push(format!("{at}: destination {err}"));
                }
                match earlier.get(source.as_str()) {
                    Some(&position) => {
                        if !stages[position].exports.iter().any(|e| e == export) {
                            errors.push(format!(
                                "{at}: stage '{source}' does not export '{export}'"
                            ));
                        }
                    }
                    None if *source == stage.id => {
                        errors.push(format!("{at}: stage cannot copy from itself"));
                    }
                    None => {
                        errors.push(format!(
                            "{at}: stage '{source}' is not declared before '{}'",
                            stage.id
                        ));
                    }
                }
            }
            Instruction::AssignOwnership { path } => {
                if stage.user.is_none() {
                    errors.push(format!("{at}: stage declares no user to own '{path}'"));
                }
                if let Err(err) = validate_container_path(path) {
                    errors.push(format!("{at}: {err}"));
                }
                ownership_assigned = true;
            }
            Instruction::SwitchUser => {
                if stage.user.is_none() {
                    errors.push(format!("{at}: stage declares no user to switch to"));
                }
                if !ownership_assigned {
                    errors.push(format!(
                        "{at}: ownership must be assigned before the user switch"
                    ));
                }
                if switched_at.is_none() {
                    switched_at = Some(idx);
                }
            }
        }
    }
}
