//! Render the pipeline as an equivalent multi-stage Containerfile.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::identity::NOLOGIN_SHELL;
use crate::core::metadata::{AUTHORS, CREATED, DESCRIPTION, TITLE, VERSION};
use crate::io::config::PipelineConfig;
use crate::io::installer::installer_argv;

const CONTAINERFILE_TEMPLATE: &str = include_str!("templates/Containerfile.j2");

#[derive(Debug, Serialize)]
struct Pair {
    key: String,
    value: String,
}

impl Pair {
    fn quoted(key: &str, value: &str) -> Result<Self> {
        Ok(Self {
            key: key.to_string(),
            value: serde_json::to_string(value).context("quote value")?,
        })
    }
}

pub fn render_containerfile(cfg: &PipelineConfig) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("Containerfile", CONTAINERFILE_TEMPLATE)
        .context("load Containerfile template")?;
    let template = env.get_template("Containerfile")?;

    let manifest_path = format!("/build/{}", cfg.builder.manifest);
    let install = installer_argv(
        &cfg.builder.installer,
        Path::new(&manifest_path),
        Path::new(&cfg.builder.prefix),
    );
    let setup = cfg
        .builder
        .setup
        .iter()
        .map(|command| exec_form(command))
        .collect::<Result<Vec<_>>>()?;

    let labels = vec![
        Pair::quoted(TITLE, &cfg.metadata.title)?,
        Pair::quoted(DESCRIPTION, &cfg.metadata.description)?,
        Pair::quoted(VERSION, "${VERSION}")?,
        Pair::quoted(CREATED, "${BUILD_DATE}")?,
        Pair::quoted(AUTHORS, &cfg.metadata.maintainer)?,
    ];
    let env_vars = cfg
        .runtime
        .env
        .iter()
        .map(|(key, value)| Pair::quoted(key, value))
        .collect::<Result<Vec<_>>>()?;

    let identity = cfg.identity();
    let probe = cfg.probe_descriptor();
    let launch = cfg.launch_descriptor();

    let rendered = template.render(context! {
        builder => context! {
            image => &cfg.builder.image,
            setup => setup,
            manifest => &cfg.builder.manifest,
            manifest_path => manifest_path,
            install => exec_form(&install)?,
            prefix => &cfg.builder.prefix,
        },
        runtime => context! {
            image => &cfg.runtime.image,
            prefix_dest => &cfg.runtime.prefix_dest,
            source => &cfg.runtime.source,
            workdir => &cfg.runtime.workdir,
        },
        labels => labels,
        env => env_vars,
        identity => context! {
            user => identity.user,
            group => identity.group,
            uid => identity.uid,
            gid => identity.gid,
            home => identity.home,
            shell => NOLOGIN_SHELL,
        },
        port => launch.port,
        probe => context! {
            interval => format!("{}s", cfg.probe.interval_secs),
            timeout => format!("{}s", cfg.probe.timeout_secs),
            start_period => format!("{}s", cfg.probe.start_period_secs),
            retries => probe.retries,
            command => exec_form(&probe.command)?,
        },
        launch => exec_form(&launch.argv())?,
    })?;
    Ok(rendered)
}

/// JSON exec form, e.g. `["uvicorn", "app"]`.
fn exec_form(argv: &[String]) -> Result<String> {
    serde_json::to_string(argv).context("encode exec form")
}
