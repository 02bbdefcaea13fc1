//! Test-only helpers: identities, a shell installer, a scripted probe runner
//! and a build-context fixture.

use std::collections::VecDeque;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use tempfile::TempDir;

use crate::build::BuildRequest;
use crate::core::health::{ProbeDescriptor, ProbeOutcome};
use crate::core::identity::ExecutionIdentity;
use crate::io::config::{IdentityConfig, PipelineConfig, write_config};
use crate::io::probe::{ProbeResult, ProbeRunner};

/// Installer stand-in: records each requirement under
/// `<prefix>/lib/site-packages/<name>/REQUESTED` and fails like pip for any
/// name starting with `nonexistent-`.
const INSTALLER_SCRIPT: &str = r#"set -eu
manifest="$1"
prefix="$2"
while IFS= read -r line || [ -n "$line" ]; do
  line="${line%%#*}"
  name=$(printf '%s' "$line" | sed -e 's/[[:space:]]//g' -e 's/[^A-Za-z0-9._-].*//')
  [ -z "$name" ] && continue
  case "$name" in
    -*) continue ;;
    nonexistent-*)
      echo "ERROR: No matching distribution found for $name" >&2
      exit 1
      ;;
  esac
  mkdir -p "$prefix/lib/site-packages/$name"
  printf '%s\n' "$line" > "$prefix/lib/site-packages/$name/REQUESTED"
done < "$manifest"
"#;

/// Installer argv running [`INSTALLER_SCRIPT`].
pub fn shell_installer() -> Vec<String> {
    ["sh", "-c", INSTALLER_SCRIPT, "installer", "{manifest}", "{prefix}"]
        .map(String::from)
        .to_vec()
}

/// The stock identity (`appuser:appgroup`, 999:999, home `/app`).
pub fn sample_identity() -> ExecutionIdentity {
    ExecutionIdentity {
        user: "appuser".to_string(),
        group: "appgroup".to_string(),
        uid: 999,
        gid: 999,
        home: "/app".to_string(),
    }
}

/// Owner uid/gid of `path`.
pub fn current_ids(path: &Path) -> (u32, u32) {
    let meta = fs::metadata(path).expect("stat path for ids");
    (meta.uid(), meta.gid())
}

/// An identity the test process can `lchown` to: its own ids, or 999:999
/// when running as root.
pub fn test_identity(root: &Path) -> ExecutionIdentity {
    let (uid, gid) = current_ids(root);
    let mut identity = sample_identity();
    if uid != 0 {
        identity.uid = uid;
        identity.gid = if gid == 0 { uid } else { gid };
    }
    identity
}

/// Probe runner that replays a script of outcomes, repeating the last one.
pub struct ScriptedProbeRunner {
    script: Mutex<VecDeque<ProbeOutcome>>,
    last: Mutex<ProbeOutcome>,
    calls: Mutex<Vec<Instant>>,
}

impl ScriptedProbeRunner {
    pub fn new(outcomes: impl IntoIterator<Item = ProbeOutcome>) -> Self {
        let script: VecDeque<ProbeOutcome> = outcomes.into_iter().collect();
        let last = script.back().copied().unwrap_or(ProbeOutcome::Pass);
        Self {
            script: Mutex::new(script),
            last: Mutex::new(last),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl ProbeRunner for ScriptedProbeRunner {
    fn check(&self, _descriptor: &ProbeDescriptor) -> ProbeResult {
        self.calls.lock().expect("calls lock").push(Instant::now());
        let outcome = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| *self.last.lock().expect("last lock"));
        match outcome {
            ProbeOutcome::Pass => ProbeResult::passed("ok"),
            ProbeOutcome::Fail => ProbeResult::failed(Some(1), "connection refused"),
        }
    }
}

/// Temporary build context with a manifest, a service source tree and
/// directory bases for both stages.
///
/// Layout under `context/`:
/// - `requirements.txt`
/// - `src/service/main.py` (plus a `__pycache__` entry that must be skipped)
/// - `bases/builder/usr/bin/gcc`
/// - `bases/runtime/usr/bin/python3`, `bases/runtime/etc/passwd`
pub struct Fixture {
    temp: TempDir,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixture {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        // Dropped-privilege processes must traverse into the artifact.
        fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o755))
            .expect("chmod tempdir");
        let fixture = Self { temp };
        fixture.write_manifest("fastapi==0.110.0\nuvicorn[standard]>=0.29 # server\n");
        fixture.write_file("src/service/__init__.py", "");
        fixture.write_file("src/service/main.py", "app = object()\n");
        fixture.write_file("src/service/__pycache__/main.cpython-311.pyc", "junk");
        fixture.write_file("bases/builder/usr/bin/gcc", "#!/bin/sh\n");
        fixture.write_file("bases/runtime/usr/bin/python3", "#!/bin/sh\n");
        fixture.write_file("bases/runtime/etc/passwd", "root:x:0:0:root:/root:/bin/sh\n");
        fixture.write_file("bases/runtime/etc/group", "root:x:0:\n");
        fixture
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn context(&self) -> PathBuf {
        self.root().join("context")
    }

    /// Artifact path for `name`; not created.
    pub fn out(&self, name: &str) -> PathBuf {
        self.root().join("out").join(name)
    }

    pub fn write_file(&self, rel: &str, contents: &str) {
        let path = self.context().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create fixture dir");
        }
        fs::write(&path, contents).expect("write fixture file");
    }

    pub fn write_manifest(&self, contents: &str) {
        self.write_file("requirements.txt", contents);
    }

    /// Config wired to the fixture: directory bases, the shell installer, a
    /// chownable identity, a shell probe and a shell "server" that appends
    /// its argv to `runs.log` in the workdir.
    pub fn config(&self) -> PipelineConfig {
        let mut cfg = PipelineConfig::default();
        cfg.builder.base = "bases/builder".to_string();
        cfg.builder.installer = shell_installer();
        cfg.builder.timeout_secs = 30;
        cfg.runtime.base = "bases/runtime".to_string();
        let identity = test_identity(self.root());
        cfg.identity = IdentityConfig {
            user: identity.user,
            group: identity.group,
            uid: identity.uid,
            gid: identity.gid,
        };
        cfg.probe.command = ["sh", "-c", "exit 0", "probe-{port}"]
            .map(String::from)
            .to_vec();
        cfg.probe.interval_secs = 1;
        cfg.probe.timeout_secs = 1;
        cfg.probe.start_period_secs = 0;
        cfg.launch.executable = "sh".to_string();
        cfg.launch.args = ["-c", r#"echo "$0 $*" >> runs.log; exit 0"#]
            .map(String::from)
            .to_vec();
        cfg
    }

    /// Write [`Fixture::config`] as TOML and return its path.
    pub fn write_config(&self, cfg: &PipelineConfig) -> PathBuf {
        let path = self.root().join("stagecraft.toml");
        write_config(&path, cfg).expect("write fixture config");
        path
    }

    pub fn request(&self, name: &str) -> BuildRequest {
        BuildRequest {
            config: self.config(),
            context: self.context(),
            out: self.out(name),
            version: "1.4.2".to_string(),
            build_date: "2026-10-14T09:30:00Z".to_string(),
            work_dir: None,
        }
    }
}
