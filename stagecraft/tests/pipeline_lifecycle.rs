//! End-to-end pipeline tests driving the library: build an artifact from the
//! fixture context, then exercise health reporting and the launcher.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::sync::mpsc;
use std::time::Duration;

use stagecraft::build::{BUILDER_STAGE, RUNTIME_STAGE, run_build};
use stagecraft::core::health::{HealthState, ProbeDescriptor, ProbeOutcome};
use stagecraft::core::metadata::{AUTHORS, CREATED, TITLE, VERSION};
use stagecraft::core::types::{BuildFailure, FailureKind};
use stagecraft::io::artifact::load_artifact;
use stagecraft::io::installer::CommandInstaller;
use stagecraft::io::probe::CommandProbe;
use stagecraft::supervise::{ProbeLoopOptions, launch, run_probe_loop};
use stagecraft::test_support::{Fixture, ScriptedProbeRunner};

#[test]
fn resolvable_manifest_yields_minimal_runtime() {
    let fixture = Fixture::new();
    let request = fixture.request("api");
    run_build(&request, &CommandInstaller).expect("build");

    let artifact = load_artifact(&request.out).expect("load artifact");
    let rootfs = artifact.rootfs();
    assert!(rootfs.join("usr/local/lib/site-packages/fastapi/REQUESTED").is_file());
    assert!(rootfs.join("usr/local/lib/site-packages/uvicorn/REQUESTED").is_file());
    assert!(rootfs.join("app/service/main.py").is_file());
    assert!(!rootfs.join("app/service/__pycache__").exists());
    assert!(rootfs.join("usr/bin/python3").is_file());
    assert!(!rootfs.join("usr/bin/gcc").exists());
    assert!(!rootfs.join("install").exists());

    let identity = artifact.config.identity().clone();
    let meta = fs::metadata(rootfs.join("app/service/main.py")).expect("stat");
    assert_eq!((meta.uid(), meta.gid()), (identity.uid, identity.gid));
    let passwd = fs::read_to_string(rootfs.join("etc/passwd")).expect("passwd");
    assert!(passwd.starts_with("root:x:0:0:"));
    assert!(passwd.contains(&identity.passwd_entry()));
    assert!(passwd.ends_with(":/app:/usr/sbin/nologin\n"));

    let labels = &artifact.config.labels;
    assert_eq!(labels.get(TITLE), Some("bem-saude-api"));
    assert_eq!(labels.get(VERSION), Some("1.4.2"));
    assert_eq!(labels.get(CREATED), Some("2026-10-14T09:30:00Z"));
    assert_eq!(labels.get(AUTHORS), Some("platform@bem-saude.example"));
    assert_eq!(
        artifact.config.launch.argv()[3..],
        ["--host", "0.0.0.0", "--port", "8000", "--workers", "4"]
    );
    assert_eq!(artifact.config.user(), identity.user_spec());
}

#[test]
fn unresolvable_dependency_produces_no_artifact() {
    let fixture = Fixture::new();
    fixture.write_manifest("fastapi==0.110.0\nnonexistent-package>=1\n");
    let request = fixture.request("api");
    let err = run_build(&request, &CommandInstaller).expect_err("must fail");
    let failure = err.downcast_ref::<BuildFailure>().expect("classified failure");
    assert_eq!(failure.kind, FailureKind::Resolution);
    assert_eq!(failure.stage, BUILDER_STAGE);
    assert!(!request.out.exists());
    let leftovers: Vec<_> = fs::read_dir(fixture.root().join("out"))
        .map(|entries| entries.filter_map(Result::ok).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "left behind: {leftovers:?}");
}

#[test]
fn conflicting_runtime_account_is_a_provisioning_failure() {
    let fixture = Fixture::new();
    fixture.write_file(
        "bases/runtime/etc/passwd",
        "root:x:0:0:root:/root:/bin/sh\nappuser:x:4242:4242::/home/appuser:/bin/sh\n",
    );
    let request = fixture.request("api");
    let err = run_build(&request, &CommandInstaller).expect_err("must fail");
    let failure = err.downcast_ref::<BuildFailure>().expect("classified failure");
    assert_eq!(failure.kind, FailureKind::Provisioning);
    assert_eq!(failure.stage, RUNTIME_STAGE);
    assert!(!request.out.exists());
}

#[test]
fn identical_prefix_yields_identical_digest() {
    let fixture = Fixture::new();
    let first = run_build(&fixture.request("one"), &CommandInstaller).expect("first");
    fixture.write_file("src/service/main.py", "app = 'changed'\n");
    let second = run_build(&fixture.request("two"), &CommandInstaller).expect("second");
    assert_eq!(first.digests.prefix, second.digests.prefix);
    assert_ne!(first.digests.rootfs, second.digests.rootfs);
}

#[test]
fn three_failures_turn_unhealthy_only_after_the_third() {
    let descriptor = ProbeDescriptor {
        command: vec!["true".to_string()],
        interval: Duration::from_millis(20),
        timeout: Duration::from_millis(20),
        start_period: Duration::ZERO,
        retries: 3,
    };
    let runner = ScriptedProbeRunner::new([
        ProbeOutcome::Pass,
        ProbeOutcome::Fail,
        ProbeOutcome::Fail,
        ProbeOutcome::Fail,
    ]);
    let (_stop, stop_rx) = mpsc::channel();
    let mut states_after_failures = Vec::new();
    let options = ProbeLoopOptions {
        max_checks: Some(4),
        ..ProbeLoopOptions::default()
    };
    let summary = run_probe_loop(&descriptor, &runner, &options, &stop_rx, |transition| {
        states_after_failures.push((transition.to, transition.failing_streak));
    })
    .expect("probe loop");

    assert_eq!(
        states_after_failures,
        vec![(HealthState::Healthy, 0), (HealthState::Unhealthy, 3)]
    );
    assert_eq!(summary.state, HealthState::Unhealthy);
}

#[test]
fn failures_inside_grace_period_are_not_counted() {
    let descriptor = ProbeDescriptor {
        command: vec!["true".to_string()],
        interval: Duration::from_millis(10),
        timeout: Duration::from_millis(10),
        start_period: Duration::from_secs(60),
        retries: 1,
    };
    let runner = ScriptedProbeRunner::new([ProbeOutcome::Fail]);
    let (_stop, stop_rx) = mpsc::channel();
    let options = ProbeLoopOptions {
        max_checks: Some(3),
        ..ProbeLoopOptions::default()
    };
    let summary =
        run_probe_loop(&descriptor, &runner, &options, &stop_rx, |_| {}).expect("probe loop");
    assert_eq!(summary.state, HealthState::Starting);
    assert_eq!(summary.report.failing_streak, 0);
    assert!(summary.transitions.is_empty());
}

#[test]
fn process_exit_terminates_without_relaunch() {
    let fixture = Fixture::new();
    let mut request = fixture.request("api");
    request.config.launch.args = ["-c", r#"echo "$0 $*" >> runs.log; exit 7"#]
        .map(String::from)
        .to_vec();
    run_build(&request, &CommandInstaller).expect("build");
    let artifact = load_artifact(&request.out).expect("load artifact");

    let outcome = launch(&artifact, &CommandProbe, &ProbeLoopOptions::default()).expect("launch");
    assert_eq!(outcome.terminated.code, Some(7));
    assert_eq!(outcome.terminated.exit_code(), 7);
    let health = outcome.health.expect("probe summary");
    assert!(health.stopped || health.report.checks >= 1);

    let runs = fs::read_to_string(artifact.rootfs().join("app/runs.log")).expect("runs.log");
    assert_eq!(runs.lines().count(), 1);
    assert_eq!(runs.trim(), "--host 0.0.0.0 --port 8000 --workers 4");
}

#[test]
fn exit_code_survives_unwritable_status_file() {
    let fixture = Fixture::new();
    let mut request = fixture.request("api");
    request.config.launch.args = ["-c", "sleep 0.2; exit 5"].map(String::from).to_vec();
    run_build(&request, &CommandInstaller).expect("build");
    let artifact = load_artifact(&request.out).expect("load artifact");

    let blocker = fixture.root().join("status-blocker");
    fs::write(&blocker, "file").expect("write blocker");
    let options = ProbeLoopOptions {
        status_file: Some(blocker.join("health.json")),
        ..ProbeLoopOptions::default()
    };
    let outcome = launch(&artifact, &CommandProbe, &options).expect("launch");
    assert_eq!(outcome.terminated.exit_code(), 5);
    assert!(outcome.health.is_some());
}
