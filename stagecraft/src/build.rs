//! Orchestration for `stagecraft build`.
//!
//! Plans the two-stage graph from config, runs it, verifies the runtime
//! filesystem and writes the artifact. The artifact only appears at `out`
//! once everything succeeded; failures leave nothing behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::identity::ExecutionIdentity;
use crate::core::metadata::{MetadataRecord, ProvenanceInputs};
use crate::core::stage_graph::{BaseRef, Instruction, Stage, StageGraph};
use crate::core::types::{BuildFailure, FailAs, FailureKind};
use crate::io::artifact::{
    Digests, ImageConfig, ImageSettings, ROOTFS_DIR, write_image_config,
};
use crate::io::composer::verify_no_residue;
use crate::io::config::PipelineConfig;
use crate::io::digest::tree_digest;
use crate::io::installer::Installer;
use crate::io::stage_runner::{StageSettings, run_stages};

pub const BUILDER_STAGE: &str = "builder";
pub const RUNTIME_STAGE: &str = "runtime";

/// Inputs for one build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub config: PipelineConfig,
    /// Build context holding the manifest and source tree.
    pub context: PathBuf,
    /// Artifact directory to create. Must not exist.
    pub out: PathBuf,
    pub version: String,
    /// RFC 3339 build timestamp.
    pub build_date: String,
    /// Scratch space for stage filesystems. Defaults to `<out>.work`, which is
    /// removed afterwards; an explicit directory is kept for inspection.
    pub work_dir: Option<PathBuf>,
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub artifact: PathBuf,
    pub stages: Vec<String>,
    pub digests: Digests,
    pub identity: ExecutionIdentity,
}

/// Translate the pipeline config into the builder -> runtime stage chain.
pub fn plan_stages(cfg: &PipelineConfig, context: &Path) -> Result<StageGraph> {
    let builder = &cfg.builder;
    let runtime = &cfg.runtime;

    let mut builder_steps: Vec<Instruction> = builder
        .setup
        .iter()
        .map(|argv| Instruction::Run { argv: argv.clone() })
        .collect();
    builder_steps.push(Instruction::Install {
        manifest: builder.manifest.clone(),
        prefix: builder.prefix.clone(),
    });

    let stages = vec![
        Stage {
            id: BUILDER_STAGE.to_string(),
            base: BaseRef::parse(&builder.base, |path| context.join(path)),
            instructions: builder_steps,
            exports: vec![builder.prefix.clone()],
            user: None,
        },
        Stage {
            id: RUNTIME_STAGE.to_string(),
            base: BaseRef::parse(&runtime.base, |path| context.join(path)),
            instructions: vec![
                Instruction::CopyFrom {
                    stage: BUILDER_STAGE.to_string(),
                    export: builder.prefix.clone(),
                    dest: runtime.prefix_dest.clone(),
                },
                Instruction::CopyContext {
                    src: runtime.source.clone(),
                    dest: runtime.workdir.clone(),
                },
                Instruction::AssignOwnership {
                    path: runtime.workdir.clone(),
                },
                Instruction::SwitchUser,
            ],
            exports: Vec::new(),
            user: Some(cfg.identity()),
        },
    ];

    StageGraph::new(stages)
        .map_err(|errors| anyhow!("invalid stage graph:\n- {}", errors.join("\n- ")))
}

/// Run a complete build.
///
/// Invalid inputs are plain errors. Failures while stages run carry a
/// [`BuildFailure`] that callers can downcast to report the failure class.
#[instrument(skip_all, fields(out = %request.out.display(), version = %request.version))]
pub fn run_build<I: Installer>(request: &BuildRequest, installer: &I) -> Result<BuildOutcome> {
    let cfg = &request.config;
    cfg.validate()?;
    let labels = MetadataRecord::provenance(&ProvenanceInputs {
        title: &cfg.metadata.title,
        description: &cfg.metadata.description,
        maintainer: &cfg.metadata.maintainer,
        version: &request.version,
        created: &request.build_date,
    })
    .map_err(|err| anyhow!("metadata: {err}"))?;

    if request.out.exists() {
        return Err(anyhow!(
            "output {} already exists; artifacts are never overwritten",
            request.out.display()
        ));
    }
    if !request.context.is_dir() {
        return Err(anyhow!(
            "build context {} is not a directory",
            request.context.display()
        ));
    }
    let graph = plan_stages(cfg, &request.context)?;

    let (work_dir, keep_work) = match &request.work_dir {
        Some(dir) => (dir.clone(), true),
        None => (sibling(&request.out, "work"), false),
    };
    let partial = sibling(&request.out, "partial");
    for stale in [&partial, &work_dir] {
        if stale.exists() {
            fs::remove_dir_all(stale)
                .with_context(|| format!("clear stale {}", stale.display()))?;
        }
    }

    let result = assemble(request, installer, &graph, labels, &work_dir, &partial);
    if !keep_work {
        discard(&work_dir);
    }
    match result {
        Ok(mut outcome) => {
            fs::rename(&partial, &request.out).with_context(|| {
                format!("publish {} -> {}", partial.display(), request.out.display())
            })?;
            outcome.artifact = request.out.clone();
            info!(artifact = %request.out.display(), "artifact written");
            Ok(outcome)
        }
        Err(err) => {
            discard(&partial);
            Err(err)
        }
    }
}

fn assemble<I: Installer>(
    request: &BuildRequest,
    installer: &I,
    graph: &StageGraph,
    labels: MetadataRecord,
    work_dir: &Path,
    partial: &Path,
) -> Result<BuildOutcome> {
    let cfg = &request.config;
    let settings = StageSettings {
        context: request.context.clone(),
        work_dir: work_dir.to_path_buf(),
        command_timeout: Duration::from_secs(cfg.builder.timeout_secs),
        output_limit_bytes: cfg.builder.output_limit_bytes,
        installer_command: cfg.builder.installer.clone(),
        ignore: cfg.runtime.ignore.clone(),
    };
    let completed = run_stages(graph, installer, &settings)?;

    verify_no_residue(&completed.rootfs, &cfg.runtime.forbidden)
        .fail_as(RUNTIME_STAGE, FailureKind::Composition)?;
    let identity = completed.identity.ok_or_else(|| {
        BuildFailure::new(
            RUNTIME_STAGE,
            FailureKind::Provisioning,
            anyhow!("runtime stage never switched to an unprivileged identity"),
        )
    })?;

    let prefix = completed
        .exports
        .get(BUILDER_STAGE, &cfg.builder.prefix)
        .ok_or_else(|| anyhow!("builder prefix export is missing"))?;
    let digests = Digests {
        prefix: tree_digest(prefix)?,
        rootfs: tree_digest(&completed.rootfs)?,
    };
    info!(prefix = %digests.prefix, rootfs = %digests.rootfs, "runtime filesystem digested");

    fs::create_dir_all(partial).with_context(|| format!("create {}", partial.display()))?;
    let rootfs = partial.join(ROOTFS_DIR);
    fs::rename(&completed.rootfs, &rootfs).with_context(|| {
        format!(
            "move {} -> {} (work dir must share a filesystem with the output)",
            completed.rootfs.display(),
            rootfs.display()
        )
    })?;

    let config = ImageConfig::assemble(
        &identity,
        ImageSettings {
            workdir: cfg.runtime.workdir.clone(),
            env: cfg.runtime.env.clone(),
            launch: cfg.launch_descriptor(),
            healthcheck: cfg.probe_descriptor(),
            labels,
            digests: digests.clone(),
        },
    );
    write_image_config(partial, &config)?;

    Ok(BuildOutcome {
        artifact: partial.to_path_buf(),
        stages: completed.executed,
        digests,
        identity: identity.identity().clone(),
    })
}

/// `<path>.<suffix>` next to `path`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn discard(path: &Path) {
    if path.exists()
        && let Err(err) = fs::remove_dir_all(path)
    {
        warn!(err = %err, path = %path.display(), "failed to remove build directory");
    }
}
