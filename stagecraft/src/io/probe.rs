//! Probe execution and the persisted health report.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::health::{HealthState, HealthTracker, ProbeDescriptor, ProbeOutcome};
use crate::io::process::run_bounded;

/// Results kept in the health report.
pub const HEALTH_LOG_LEN: usize = 5;
/// Captured probe output kept per result.
pub const PROBE_OUTPUT_LIMIT: usize = 4_096;

/// One probe invocation as reported to supervisors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub outcome: ProbeOutcome,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub output: String,
    /// RFC 3339 start time.
    pub started_at: String,
    pub duration_ms: u64,
}

impl ProbeResult {
    pub fn passed(output: &str) -> Self {
        Self::finished(ProbeOutcome::Pass, Some(0), false, output, now_rfc3339(), 0)
    }

    pub fn failed(exit_code: Option<i32>, output: &str) -> Self {
        Self::finished(ProbeOutcome::Fail, exit_code, false, output, now_rfc3339(), 0)
    }

    fn finished(
        outcome: ProbeOutcome,
        exit_code: Option<i32>,
        timed_out: bool,
        output: &str,
        started_at: String,
        duration_ms: u64,
    ) -> Self {
        Self {
            outcome,
            exit_code,
            timed_out,
            output: output.to_string(),
            started_at,
            duration_ms,
        }
    }
}

/// Runs one probe. Every failure mode is folded into the result.
pub trait ProbeRunner: Sync {
    fn check(&self, descriptor: &ProbeDescriptor) -> ProbeResult;
}

/// Runs the descriptor's command with its timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandProbe;

impl ProbeRunner for CommandProbe {
    fn check(&self, descriptor: &ProbeDescriptor) -> ProbeResult {
        let started_at = now_rfc3339();
        let clock = Instant::now();
        let elapsed_ms = || u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

        let Some((program, args)) = descriptor.command.split_first() else {
            return ProbeResult::finished(
                ProbeOutcome::Fail,
                None,
                false,
                "probe command is empty",
                started_at,
                0,
            );
        };
        let mut cmd = Command::new(program);
        cmd.args(args);

        match run_bounded(cmd, descriptor.timeout, PROBE_OUTPUT_LIMIT) {
            Ok(output) => {
                let outcome = if output.success() {
                    ProbeOutcome::Pass
                } else {
                    ProbeOutcome::Fail
                };
                let exit_code = if output.timed_out {
                    None
                } else {
                    output.status.code()
                };
                debug!(?outcome, ?exit_code, timed_out = output.timed_out, "probe finished");
                ProbeResult::finished(
                    outcome,
                    exit_code,
                    output.timed_out,
                    &output.diagnostic_tail(PROBE_OUTPUT_LIMIT),
                    started_at,
                    elapsed_ms(),
                )
            }
            Err(err) => ProbeResult::finished(
                ProbeOutcome::Fail,
                None,
                false,
                &format!("{err:#}"),
                started_at,
                elapsed_ms(),
            ),
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Health report written for external supervisors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub failing_streak: u32,
    pub checks: u32,
    /// Most recent results, oldest first.
    pub log: VecDeque<ProbeResult>,
}

impl Default for HealthReport {
    fn default() -> Self {
        Self {
            status: HealthState::Starting,
            failing_streak: 0,
            checks: 0,
            log: VecDeque::with_capacity(HEALTH_LOG_LEN),
        }
    }
}

impl HealthReport {
    /// Record a result together with the tracker state it produced.
    pub fn record(&mut self, result: ProbeResult, tracker: &HealthTracker) {
        if self.log.len() == HEALTH_LOG_LEN {
            self.log.pop_front();
        }
        self.log.push_back(result);
        self.checks = self.checks.saturating_add(1);
        self.status = tracker.state();
        self.failing_streak = tracker.failing_streak();
    }
}

/// Atomically replace the report at `path` (temp file + rename).
pub fn write_health_report(path: &Path, report: &HealthReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut json = serde_json::to_string_pretty(report).context("serialize health report")?;
    json.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json)
        .with_context(|| format!("write temp report {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace report {}", path.display()))?;
    Ok(())
}

pub fn read_health_report(path: &Path) -> Result<HealthReport> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn descriptor(script: &str, timeout: Duration) -> ProbeDescriptor {
        ProbeDescriptor {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            interval: Duration::from_millis(50),
            timeout,
            start_period: Duration::ZERO,
            retries: 3,
        }
    }

    #[test]
    fn zero_exit_passes() {
        let result = CommandProbe.check(&descriptor("echo ok", Duration::from_secs(5)));
        assert_eq!(result.outcome, ProbeOutcome::Pass);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.output, "ok");
    }

    #[test]
    fn non_zero_exit_fails() {
        let desc = descriptor("echo down >&2; exit 22", Duration::from_secs(5));
        let result = CommandProbe.check(&desc);
        assert_eq!(result.outcome, ProbeOutcome::Fail);
        assert_eq!(result.exit_code, Some(22));
        assert_eq!(result.output, "down");
    }

    #[test]
    fn timeout_fails_and_is_abandoned() {
        let result = CommandProbe.check(&descriptor("exec sleep 5", Duration::from_millis(100)));
        assert_eq!(result.outcome, ProbeOutcome::Fail);
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(result.duration_ms < 5_000);
    }

    #[test]
    fn forking_check_is_cut_off_at_timeout() {
        let started = std::time::Instant::now();
        let desc = descriptor("sleep 3; echo late", Duration::from_millis(200));
        let result = CommandProbe.check(&desc);
        assert_eq!(result.outcome, ProbeOutcome::Fail);
        assert!(result.timed_out);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn spawn_error_fails() {
        let mut desc = descriptor("", Duration::from_secs(1));
        desc.command = vec!["/nonexistent/probe-binary".to_string()];
        let result = CommandProbe.check(&desc);
        assert_eq!(result.outcome, ProbeOutcome::Fail);
        assert!(result.output.contains("spawn"));
    }

    #[test]
    fn report_keeps_last_results() {
        let desc = descriptor("true", Duration::from_secs(1));
        let mut tracker = HealthTracker::new(&desc);
        let mut report = HealthReport::default();
        for idx in 0..7 {
            tracker.record(ProbeOutcome::Pass, Duration::ZERO);
            report.record(ProbeResult::passed(&format!("check {idx}")), &tracker);
        }
        assert_eq!(report.checks, 7);
        assert_eq!(report.log.len(), HEALTH_LOG_LEN);
        assert_eq!(report.log.front().map(|r| r.output.as_str()), Some("check 2"));
        assert_eq!(report.status, HealthState::Healthy);

        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("health/status.json");
        write_health_report(&path, &report).expect("write");
        assert_eq!(read_health_report(&path).expect("read"), report);
    }
}
