//! `stagecraft`: build, inspect and supervise directory image artifacts.

use std::path::{Path, PathBuf};
use std::sync::mpsc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stagecraft::build::{BuildRequest, run_build};
use stagecraft::core::health::HealthState;
use stagecraft::core::types::BuildFailure;
use stagecraft::exit_codes;
use stagecraft::io::artifact::load_artifact;
use stagecraft::io::config::load_config;
use stagecraft::io::installer::CommandInstaller;
use stagecraft::io::probe::CommandProbe;
use stagecraft::io::render::render_containerfile;
use stagecraft::logging;
use stagecraft::supervise::{ProbeLoopOptions, launch, run_probe_loop};

const DEFAULT_CONFIG: &str = "stagecraft.toml";

#[derive(Parser)]
#[command(
    name = "stagecraft",
    version,
    about = "Multi-stage runtime image builder and supervisor"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the builder and runtime stages and write an artifact directory.
    Build {
        /// Pipeline config. Defaults to `<context>/stagecraft.toml`.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Build context with the manifest and source tree.
        #[arg(long, default_value = ".")]
        context: PathBuf,
        /// Artifact directory to create.
        #[arg(long)]
        out: PathBuf,
        /// Version label recorded in the artifact.
        #[arg(long = "version", value_name = "VERSION")]
        image_version: String,
        /// RFC 3339 build timestamp.
        #[arg(long)]
        build_date: String,
        /// Keep stage filesystems and logs in this directory.
        #[arg(long)]
        work_dir: Option<PathBuf>,
    },
    /// Print an equivalent multi-stage Containerfile.
    Render {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Print an artifact's labels and digests as JSON.
    Inspect {
        #[arg(long)]
        artifact: PathBuf,
    },
    /// Run the artifact's liveness probe; exits 0 when healthy, 3 otherwise.
    Probe {
        #[arg(long)]
        artifact: PathBuf,
        /// Run a single probe.
        #[arg(long, conflicts_with = "max_checks")]
        once: bool,
        /// Stop after this many probes.
        #[arg(long)]
        max_checks: Option<u32>,
        /// Rewrite a JSON health report here after every probe.
        #[arg(long)]
        status_file: Option<PathBuf>,
    },
    /// Run the artifact's foreground process with health reporting.
    Launch {
        #[arg(long)]
        artifact: PathBuf,
        #[arg(long)]
        status_file: Option<PathBuf>,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            if err.downcast_ref::<BuildFailure>().is_some() {
                exit_codes::BUILD_FAILED
            } else {
                exit_codes::INVALID
            }
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Build {
            config,
            context,
            out,
            image_version,
            build_date,
            work_dir,
        } => {
            let config_path = config.unwrap_or_else(|| context.join(DEFAULT_CONFIG));
            cmd_build(BuildRequest {
                config: load_config(&config_path)?,
                context,
                out,
                version: image_version,
                build_date,
                work_dir,
            })
        }
        Command::Render { config } => cmd_render(&config),
        Command::Inspect { artifact } => cmd_inspect(&artifact),
        Command::Probe {
            artifact,
            once,
            max_checks,
            status_file,
        } => cmd_probe(
            &artifact,
            ProbeLoopOptions {
                max_checks: if once { Some(1) } else { max_checks },
                status_file,
                stop_when_unhealthy: true,
            },
        ),
        Command::Launch {
            artifact,
            status_file,
        } => cmd_launch(
            &artifact,
            ProbeLoopOptions {
                status_file,
                ..ProbeLoopOptions::default()
            },
        ),
    }
}

fn cmd_build(request: BuildRequest) -> Result<i32> {
    let outcome = run_build(&request, &CommandInstaller)?;
    println!("artifact: {}", outcome.artifact.display());
    println!("stages: {}", outcome.stages.join(" -> "));
    println!("user: {}", outcome.identity.user_spec());
    println!("prefix: {}", outcome.digests.prefix);
    println!("rootfs: {}", outcome.digests.rootfs);
    Ok(exit_codes::OK)
}

fn cmd_render(config: &Path) -> Result<i32> {
    let cfg = load_config(config)?;
    print!("{}", render_containerfile(&cfg)?);
    Ok(exit_codes::OK)
}

fn cmd_inspect(artifact: &Path) -> Result<i32> {
    let artifact = load_artifact(artifact)?;
    let json =
        serde_json::to_string_pretty(&artifact.inventory()).context("serialize inventory")?;
    println!("{json}");
    Ok(exit_codes::OK)
}

fn cmd_probe(artifact: &Path, options: ProbeLoopOptions) -> Result<i32> {
    let artifact = load_artifact(artifact)?;
    let (_stop, stop_rx) = mpsc::channel();
    let summary = run_probe_loop(
        &artifact.config.healthcheck,
        &CommandProbe,
        &options,
        &stop_rx,
        |_| {},
    )?;
    let json = serde_json::to_string_pretty(&summary.report).context("serialize health report")?;
    println!("{json}");
    Ok(match summary.state {
        HealthState::Healthy => exit_codes::OK,
        HealthState::Starting | HealthState::Unhealthy => exit_codes::UNHEALTHY,
    })
}

fn cmd_launch(artifact: &Path, options: ProbeLoopOptions) -> Result<i32> {
    let artifact = load_artifact(artifact)?;
    let outcome = launch(&artifact, &CommandProbe, &options)?;
    Ok(outcome.terminated.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_build() {
        let cli = Cli::parse_from([
            "stagecraft",
            "build",
            "--out",
            "dist/api",
            "--version",
            "1.0.0",
            "--build-date",
            "2026-10-14T00:00:00Z",
        ]);
        match cli.command {
            Command::Build {
                config,
                context,
                image_version,
                ..
            } => {
                assert_eq!(config, None);
                assert_eq!(context, PathBuf::from("."));
                assert_eq!(image_version, "1.0.0");
            }
            _ => panic!("expected build"),
        }
    }

    #[test]
    fn parse_probe_once() {
        let cli = Cli::parse_from(["stagecraft", "probe", "--artifact", "dist/api", "--once"]);
        assert!(matches!(
            cli.command,
            Command::Probe {
                once: true,
                max_checks: None,
                ..
            }
        ));
    }

    #[test]
    fn once_conflicts_with_max_checks() {
        let result = Cli::try_parse_from([
            "stagecraft",
            "probe",
            "--artifact",
            "a",
            "--once",
            "--max-checks",
            "3",
        ]);
        assert!(result.is_err());
    }
}
