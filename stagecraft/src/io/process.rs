//! Child processes with a deadline and bounded captured output.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured result of a bounded command.
#[derive(Debug)]
pub struct BoundedOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes drained but not kept, across both streams.
    pub dropped_bytes: usize,
    pub timed_out: bool,
}

impl BoundedOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Last `max_bytes` of stderr (falling back to stdout), lossily decoded.
    pub fn diagnostic_tail(&self, max_bytes: usize) -> String {
        let source = if self.stderr.iter().any(|b| !b.is_ascii_whitespace()) {
            &self.stderr
        } else {
            &self.stdout
        };
        let start = source.len().saturating_sub(max_bytes);
        String::from_utf8_lossy(&source[start..]).trim().to_string()
    }

    /// Render both streams for a log file.
    pub fn log_text(&self) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.dropped_bytes > 0 {
            buf.push_str(&format!("\n[truncated {} bytes]\n", self.dropped_bytes));
        }
        if self.timed_out {
            buf.push_str("\n[timed out]\n");
        }
        buf
    }
}

/// Minimum wait for output readers once the child has exited or been killed.
const READER_GRACE: Duration = Duration::from_millis(500);

type Drained = Result<(Vec<u8>, usize)>;

/// Run `cmd` to completion or until `timeout`, killing it on expiry.
///
/// stdin is closed. stdout/stderr are drained on reader threads so a chatty
/// child cannot deadlock on a full pipe; only `limit_bytes` of each is kept.
/// The child leads its own process group; on expiry the whole group is killed,
/// and a descendant still holding the pipes open cannot extend the call.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, limit_bytes))]
pub fn run_bounded(
    mut cmd: Command,
    timeout: Duration,
    limit_bytes: usize,
) -> Result<BoundedOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let deadline = Instant::now() + timeout;
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(err = %err, program = ?cmd.get_program(), "failed to spawn command");
            return Err(err).with_context(|| format!("spawn {:?}", cmd.get_program()));
        }
    };
    let pgid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_rx = spawn_reader(stdout, limit_bytes);
    let stderr_rx = spawn_reader(stderr, limit_bytes);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, killing");
            timed_out = true;
            kill_group(pgid);
            child.wait().context("reap timed out command")?
        }
    };

    let collect_by = if timed_out {
        Instant::now() + READER_GRACE
    } else {
        deadline.max(Instant::now() + READER_GRACE)
    };
    let mut stdout = collect_reader(&stdout_rx, collect_by).context("collect stdout")?;
    let mut stderr = collect_reader(&stderr_rx, collect_by).context("collect stderr")?;
    if stdout.is_none() || stderr.is_none() {
        if !timed_out {
            warn!("descendant kept output open past the deadline, killing");
            timed_out = true;
            kill_group(pgid);
        }
        let collect_by = Instant::now() + READER_GRACE;
        if stdout.is_none() {
            stdout = collect_reader(&stdout_rx, collect_by).context("collect stdout")?;
        }
        if stderr.is_none() {
            stderr = collect_reader(&stderr_rx, collect_by).context("collect stderr")?;
        }
    }
    let (stdout, stdout_dropped) = stdout.unwrap_or_else(abandoned_reader);
    let (stderr, stderr_dropped) = stderr.unwrap_or_else(abandoned_reader);
    let dropped_bytes = stdout_dropped + stderr_dropped;
    if dropped_bytes > 0 {
        debug!(dropped_bytes, "command output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(BoundedOutput {
        status,
        stdout,
        stderr,
        dropped_bytes,
        timed_out,
    })
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> Receiver<Drained> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(drain_limited(reader, limit));
    });
    rx
}

/// `Ok(None)` when the reader is still blocked at `by`.
fn collect_reader(rx: &Receiver<Drained>, by: Instant) -> Result<Option<(Vec<u8>, usize)>> {
    match rx.recv_timeout(by.saturating_duration_since(Instant::now())) {
        Ok(result) => result.map(Some),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("output reader thread panicked")),
    }
}

fn abandoned_reader() -> (Vec<u8>, usize) {
    warn!("abandoning output reader held open by a surviving process");
    (Vec::new(), 0)
}

fn kill_group(pgid: u32) {
    let Ok(raw) = i32::try_from(pgid) else {
        warn!(pgid, "process group id out of range");
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(pgid, err = %err, "failed to kill process group"),
    }
}

fn drain_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read child output")?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        let keep = n.min(room);
        kept.extend_from_slice(&chunk[..keep]);
        dropped += n - keep;
    }
    Ok((kept, dropped))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_exit_status_and_streams() {
        let output = run_bounded(
            sh("echo out; echo err >&2; exit 3"),
            Duration::from_secs(5),
            1024,
        )
        .expect("run");
        assert!(!output.success());
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&output.stdout), "out\n");
        assert_eq!(output.diagnostic_tail(100), "err");
    }

    #[test]
    fn truncates_beyond_limit() {
        let output =
            run_bounded(sh("printf 'abcdefghij'"), Duration::from_secs(5), 4).expect("run");
        assert!(output.success());
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.dropped_bytes, 6);
        assert!(output.log_text().contains("[truncated 6 bytes]"));
    }

    #[test]
    fn kills_on_timeout() {
        let output =
            run_bounded(sh("exec sleep 5"), Duration::from_millis(100), 1024).expect("run");
        assert!(output.timed_out);
        assert!(!output.success());
    }

    #[test]
    fn timeout_kills_forked_descendants() {
        let started = Instant::now();
        let output = run_bounded(sh("sleep 3; echo late"), Duration::from_millis(200), 1024)
            .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!String::from_utf8_lossy(&output.stdout).contains("late"));
    }

    #[test]
    fn background_child_holding_pipes_cannot_extend_call() {
        let started = Instant::now();
        let output = run_bounded(sh("sleep 3 & echo quick"), Duration::from_millis(300), 1024)
            .expect("run");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(output.timed_out);
        assert_eq!(output.status.code(), Some(0));
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run_bounded(
            Command::new("stagecraft-definitely-missing-binary"),
            Duration::from_secs(1),
            16,
        )
        .expect_err("spawn should fail");
        assert!(err.to_string().contains("spawn"));
    }
}
