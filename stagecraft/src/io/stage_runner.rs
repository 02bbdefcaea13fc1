//! Sequential execution of a validated stage graph.
//!
//! Each stage gets a fresh rootfs under `<work>/stages/<id>/rootfs`. When a
//! non-final stage finishes, its declared exports are copied to
//! `<work>/exports/<id>/` and sealed in the [`ExportRegistry`]; the stage's
//! rootfs is then deleted. Later stages reach earlier output only through that
//! registry.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, anyhow};
use tracing::{debug, info, instrument};

use crate::core::paths::{context_path, host_path};
use crate::core::stage_graph::{Instruction, Stage, StageGraph};
use crate::core::types::{BuildFailure, FailAs, FailureKind};
use crate::io::composer::{copy_tree, seed_base};
use crate::io::installer::{InstallRequest, Installer};
use crate::io::process::run_bounded;
use crate::io::provision::{OwnershipAssigned, Provisioner, SwitchedIdentity};

/// Settings shared by every stage of one build.
#[derive(Debug, Clone)]
pub struct StageSettings {
    pub context: PathBuf,
    pub work_dir: PathBuf,
    pub command_timeout: Duration,
    pub output_limit_bytes: usize,
    pub installer_command: Vec<String>,
    /// Entry names skipped when copying from the build context.
    pub ignore: Vec<String>,
}

/// Sealed stage exports, keyed by `(stage id, export path)`.
#[derive(Debug, Clone, Default)]
pub struct ExportRegistry {
    sealed: BTreeMap<(String, String), PathBuf>,
}

impl ExportRegistry {
    pub fn get(&self, stage: &str, export: &str) -> Option<&Path> {
        self.sealed
            .get(&(stage.to_string(), export.to_string()))
            .map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.sealed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sealed.is_empty()
    }

    fn seal(&mut self, stage: &str, export: &str, path: PathBuf) {
        self.sealed
            .insert((stage.to_string(), export.to_string()), path);
    }
}

/// Result of running every stage.
#[derive(Debug)]
pub struct CompletedStages {
    /// Rootfs of the final stage.
    pub rootfs: PathBuf,
    /// Identity the final stage switched to, if any.
    pub identity: Option<SwitchedIdentity>,
    pub exports: ExportRegistry,
    /// Stage ids in execution order.
    pub executed: Vec<String>,
}

enum Privilege {
    Unprovisioned,
    Assigned(Provisioner<OwnershipAssigned>),
    Switched(SwitchedIdentity),
}

pub fn stage_rootfs(work_dir: &Path, stage_id: &str) -> PathBuf {
    work_dir.join("stages").join(stage_id).join("rootfs")
}

/// Run all stages in declared order. The first failing instruction aborts.
pub fn run_stages<I: Installer>(
    graph: &StageGraph,
    installer: &I,
    settings: &StageSettings,
) -> Result<CompletedStages, BuildFailure> {
    let mut exports = ExportRegistry::default();
    let mut executed = Vec::new();

    for stage in graph.stages() {
        let rootfs = stage_rootfs(&settings.work_dir, &stage.id);
        let privilege = run_stage(stage, &rootfs, installer, settings, &exports)?;
        executed.push(stage.id.clone());

        if graph.is_final(&stage.id) {
            let identity = match privilege {
                Privilege::Switched(identity) => Some(identity),
                Privilege::Assigned(_) => {
                    return Err(BuildFailure::new(
                        &stage.id,
                        FailureKind::Provisioning,
                        anyhow!("ownership was assigned but the identity was never switched"),
                    ));
                }
                Privilege::Unprovisioned => None,
            };
            info!(stages = executed.len(), "all stages complete");
            return Ok(CompletedStages {
                rootfs,
                identity,
                exports,
                executed,
            });
        }

        seal_exports(stage, &rootfs, &settings.work_dir, &mut exports)?;
        let stage_dir = settings.work_dir.join("stages").join(&stage.id);
        fs::remove_dir_all(&stage_dir)
            .with_context(|| format!("discard stage {}", stage_dir.display()))
            .fail_as(&stage.id, FailureKind::Composition)?;
        debug!(stage = %stage.id, "stage filesystem discarded");
    }

    Err(BuildFailure::new(
        "<none>",
        FailureKind::Composition,
        anyhow!("stage graph has no final stage"),
    ))
}

#[instrument(skip_all, fields(stage = %stage.id))]
fn run_stage<I: Installer>(
    stage: &Stage,
    rootfs: &Path,
    installer: &I,
    settings: &StageSettings,
    exports: &ExportRegistry,
) -> Result<Privilege, BuildFailure> {
    info!(instructions = stage.instructions.len(), "stage started");
    seed_base(&stage.base, rootfs)
        .context("seed stage base")
        .fail_as(&stage.id, FailureKind::Composition)?;

    let mut privilege = Privilege::Unprovisioned;
    for (idx, instruction) in stage.instructions.iter().enumerate() {
        debug!(idx, instruction = instruction.name(), "executing instruction");
        let fail = |kind: FailureKind, err: anyhow::Error| {
            BuildFailure::new(
                &stage.id,
                kind,
                err.context(format!("instruction {idx} ({})", instruction.name())),
            )
        };

        match instruction {
            Instruction::Run { argv } => {
                run_command(stage, idx, argv, rootfs, settings)
                    .map_err(|err| fail(FailureKind::Instruction, err))?;
            }
            Instruction::Install { manifest, prefix } => {
                let manifest_path = context_path(&settings.context, manifest)
                    .map_err(|err| fail(FailureKind::Resolution, anyhow!(err)))?;
                let prefix_path = host_path(rootfs, prefix)
                    .map_err(|err| fail(FailureKind::Resolution, anyhow!(err)))?;
                let request = InstallRequest {
                    manifest_path,
                    prefix_path,
                    workdir: rootfs.to_path_buf(),
                    command: settings.installer_command.clone(),
                    timeout: settings.command_timeout,
                    output_limit_bytes: settings.output_limit_bytes,
                    log_path: log_path(&settings.work_dir, &stage.id, idx),
                };
                installer
                    .install(&request)
                    .map_err(|err| fail(FailureKind::Resolution, err))?;
            }
            Instruction::CopyContext { src, dest } => {
                copy_from_context(src, dest, rootfs, settings)
                    .map_err(|err| fail(FailureKind::Composition, err))?;
            }
            Instruction::CopyFrom {
                stage: source,
                export,
                dest,
            } => {
                let sealed = exports.get(source, export).ok_or_else(|| {
                    fail(
                        FailureKind::Composition,
                        anyhow!("export '{export}' of stage '{source}' was never sealed"),
                    )
                })?;
                let target = host_path(rootfs, dest)
                    .map_err(|err| fail(FailureKind::Composition, anyhow!(err)))?;
                let stats = copy_tree(sealed, &target, &[])
                    .map_err(|err| fail(FailureKind::Composition, err))?;
                debug!(from = %source, export = %export, files = stats.files, "imported export");
            }
            Instruction::AssignOwnership { path } => {
                privilege = assign_ownership(stage, rootfs, privilege, path)
                    .map_err(|err| fail(FailureKind::Provisioning, err))?;
            }
            Instruction::SwitchUser => {
                privilege = match privilege {
                    Privilege::Assigned(provisioner) => {
                        Privilege::Switched(provisioner.switch_identity())
                    }
                    Privilege::Unprovisioned => {
                        return Err(fail(
                            FailureKind::Provisioning,
                            anyhow!("cannot switch identity before ownership is assigned"),
                        ));
                    }
                    Privilege::Switched(_) => {
                        return Err(fail(
                            FailureKind::Provisioning,
                            anyhow!("identity already switched"),
                        ));
                    }
                };
            }
        }
    }
    info!("stage finished");
    Ok(privilege)
}

fn assign_ownership(
    stage: &Stage,
    rootfs: &Path,
    privilege: Privilege,
    path: &str,
) -> anyhow::Result<Privilege> {
    match privilege {
        Privilege::Unprovisioned => {
            let identity = stage
                .user
                .clone()
                .ok_or_else(|| anyhow!("stage '{}' declares no user", stage.id))?;
            let provisioner = Provisioner::create_identity(rootfs, identity)?;
            Ok(Privilege::Assigned(provisioner.assign_ownership(path)?))
        }
        Privilege::Assigned(provisioner) => {
            Ok(Privilege::Assigned(provisioner.assign_ownership(path)?))
        }
        Privilege::Switched(_) => Err(anyhow!(
            "cannot change ownership of {path} after the identity switch"
        )),
    }
}

fn run_command(
    stage: &Stage,
    idx: usize,
    argv: &[String],
    rootfs: &Path,
    settings: &StageSettings,
) -> anyhow::Result<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command is empty"))?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(rootfs)
        .env("STAGECRAFT_ROOTFS", rootfs)
        .env("STAGECRAFT_CONTEXT", &settings.context);
    let output = run_bounded(cmd, settings.command_timeout, settings.output_limit_bytes)?;

    let log = log_path(&settings.work_dir, &stage.id, idx);
    if let Some(parent) = log.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    fs::write(&log, output.log_text()).with_context(|| format!("write {}", log.display()))?;

    if output.timed_out {
        return Err(anyhow!(
            "{program} timed out after {}s",
            settings.command_timeout.as_secs()
        ));
    }
    if !output.status.success() {
        return Err(anyhow!(
            "{program} exited with {}: {}",
            output.status,
            output.diagnostic_tail(2_000)
        ));
    }
    Ok(())
}

fn copy_from_context(
    src: &str,
    dest: &str,
    rootfs: &Path,
    settings: &StageSettings,
) -> anyhow::Result<()> {
    let source = context_path(&settings.context, src).map_err(|err| anyhow!(err))?;
    if !source.exists() {
        return Err(anyhow!("build context has no '{src}'"));
    }
    let mut target = host_path(rootfs, dest).map_err(|err| anyhow!(err))?;
    if source.is_file()
        && target.is_dir()
        && let Some(name) = source.file_name()
    {
        target = target.join(name);
    }
    let stats = copy_tree(&source, &target, &settings.ignore)?;
    debug!(src, dest, files = stats.files, "copied from build context");
    Ok(())
}

fn seal_exports(
    stage: &Stage,
    rootfs: &Path,
    work_dir: &Path,
    registry: &mut ExportRegistry,
) -> Result<(), BuildFailure> {
    let export_root = work_dir.join("exports").join(&stage.id);
    for export in &stage.exports {
        let produced = host_path(rootfs, export)
            .map_err(|err| anyhow!(err))
            .fail_as(&stage.id, FailureKind::Composition)?;
        if !produced.exists() {
            return Err(BuildFailure::new(
                &stage.id,
                FailureKind::Composition,
                anyhow!("stage did not produce its export '{export}'"),
            ));
        }
        let sealed = host_path(&export_root, export)
            .map_err(|err| anyhow!(err))
            .fail_as(&stage.id, FailureKind::Composition)?;
        copy_tree(&produced, &sealed, &[])
            .with_context(|| format!("seal export {export}"))
            .fail_as(&stage.id, FailureKind::Composition)?;
        info!(stage = %stage.id, export = %export, "export sealed");
        registry.seal(&stage.id, export, sealed);
    }
    Ok(())
}

fn log_path(work_dir: &Path, stage_id: &str, idx: usize) -> PathBuf {
    work_dir.join("logs").join(format!("{stage_id}-{idx}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stage_graph::BaseRef;
    use crate::io::installer::CommandInstaller;
    use crate::test_support::{shell_installer, test_identity};

    fn settings(root: &Path) -> StageSettings {
        let context = root.join("context");
        fs::create_dir_all(context.join("src/service")).expect("context");
        fs::write(context.join("requirements.txt"), "fastapi==0.110.0\n").expect("manifest");
        fs::write(context.join("src/service/main.py"), "app = None\n").expect("source");
        StageSettings {
            context,
            work_dir: root.join("work"),
            command_timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
            installer_command: shell_installer(),
            ignore: Vec::new(),
        }
    }

    fn run(argv: &[&str]) -> Instruction {
        Instruction::Run {
            argv: argv.iter().map(|arg| (*arg).to_string()).collect(),
        }
    }

    fn stage(id: &str, instructions: Vec<Instruction>, exports: &[&str]) -> Stage {
        Stage {
            id: id.to_string(),
            base: BaseRef::Scratch,
            instructions,
            exports: exports.iter().map(|e| (*e).to_string()).collect(),
            user: None,
        }
    }

    #[test]
    fn runs_instructions_in_order_and_hands_off_exports_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = settings(temp.path());
        let builder = stage(
            "builder",
            vec![
                run(&[
                    "sh",
                    "-c",
                    "mkdir -p out tools && echo first > out/value && echo gcc > tools/cc",
                ]),
                run(&["sh", "-c", "echo second > out/value"]),
            ],
            &["/out"],
        );
        let mut runtime = stage(
            "runtime",
            vec![
                Instruction::CopyFrom {
                    stage: "builder".to_string(),
                    export: "/out".to_string(),
                    dest: "/opt/out".to_string(),
                },
                Instruction::CopyContext {
                    src: "src".to_string(),
                    dest: "/app".to_string(),
                },
                Instruction::AssignOwnership {
                    path: "/app".to_string(),
                },
                Instruction::SwitchUser,
            ],
            &[],
        );
        runtime.user = Some(test_identity(temp.path()));
        let graph = StageGraph::new(vec![builder, runtime]).expect("graph");

        let done = run_stages(&graph, &CommandInstaller, &settings).expect("stages");
        assert_eq!(done.executed, vec!["builder", "runtime"]);
        assert_eq!(
            fs::read_to_string(done.rootfs.join("opt/out/value")).expect("value"),
            "second\n"
        );
        assert!(done.rootfs.join("app/service/main.py").is_file());
        assert!(!done.rootfs.join("tools").exists());
        assert!(!done.rootfs.join("opt/tools").exists());
        assert!(!stage_rootfs(&settings.work_dir, "builder").exists());
        assert!(done.exports.get("builder", "/out").is_some());
        assert!(done.identity.is_some());
    }

    #[test]
    fn failing_command_aborts_later_stages() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = settings(temp.path());
        let graph = StageGraph::new(vec![
            stage("first", vec![run(&["sh", "-c", "echo broken >&2; exit 4"])], &[]),
            stage("second", vec![run(&["sh", "-c", "touch ran"])], &[]),
        ])
        .expect("graph");

        let failure = run_stages(&graph, &CommandInstaller, &settings).expect_err("abort");
        assert_eq!(failure.kind, FailureKind::Instruction);
        assert_eq!(failure.stage, "first");
        assert!(format!("{:#}", failure.source).contains("broken"));
        assert!(!stage_rootfs(&settings.work_dir, "second").exists());
    }

    #[test]
    fn missing_export_is_composition_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = settings(temp.path());
        let graph = StageGraph::new(vec![
            stage("builder", Vec::new(), &["/install"]),
            stage("runtime", Vec::new(), &[]),
        ])
        .expect("graph");

        let failure = run_stages(&graph, &CommandInstaller, &settings).expect_err("missing");
        assert_eq!(failure.kind, FailureKind::Composition);
        assert!(failure.source.to_string().contains("did not produce its export '/install'"));
    }

    #[test]
    fn failed_install_is_resolution_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = settings(temp.path());
        fs::write(
            settings.context.join("requirements.txt"),
            "nonexistent-thing==1\n",
        )
        .expect("manifest");
        let graph = StageGraph::new(vec![
            stage(
                "builder",
                vec![Instruction::Install {
                    manifest: "requirements.txt".to_string(),
                    prefix: "/install".to_string(),
                }],
                &["/install"],
            ),
            stage("runtime", Vec::new(), &[]),
        ])
        .expect("graph");

        let failure = run_stages(&graph, &CommandInstaller, &settings).expect_err("resolve");
        assert_eq!(failure.kind, FailureKind::Resolution);
        assert_eq!(failure.stage, "builder");
        assert!(!stage_rootfs(&settings.work_dir, "runtime").exists());
    }

    #[test]
    fn missing_context_source_is_composition_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = settings(temp.path());
        let graph = StageGraph::new(vec![stage(
            "runtime",
            vec![Instruction::CopyContext {
                src: "does-not-exist".to_string(),
                dest: "/app".to_string(),
            }],
            &[],
        )])
        .expect("graph");
        let failure = run_stages(&graph, &CommandInstaller, &settings).expect_err("missing");
        assert_eq!(failure.kind, FailureKind::Composition);
    }
}
