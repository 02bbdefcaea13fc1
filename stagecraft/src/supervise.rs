//! Runtime supervision: the fixed-rate probe loop and `stagecraft launch`.
//!
//! The probe loop only reports. It runs beside the foreground process and is
//! stopped when that process exits; nothing here restarts anything.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::health::{HealthState, HealthTracker, ProbeDescriptor, Transition, next_due};
use crate::io::artifact::Artifact;
use crate::io::launcher::{Terminated, spawn};
use crate::io::probe::{HealthReport, ProbeRunner, write_health_report};

/// Knobs for one probe loop.
#[derive(Debug, Clone, Default)]
pub struct ProbeLoopOptions {
    /// Stop after this many calls.
    pub max_checks: Option<u32>,
    /// Rewrite this JSON report after every call.
    pub status_file: Option<PathBuf>,
    /// Return as soon as the state becomes `unhealthy`.
    pub stop_when_unhealthy: bool,
}

/// Why the loop ended and what it saw.
#[derive(Debug, Clone)]
pub struct ProbeSummary {
    pub state: HealthState,
    pub report: HealthReport,
    pub transitions: Vec<Transition>,
    /// True if the stop channel fired or closed.
    pub stopped: bool,
}

/// Run probes at `start + k * interval` until a limit is reached or `stop`
/// fires. The first call runs immediately.
#[instrument(skip_all, fields(interval_ms = descriptor.interval.as_millis() as u64))]
pub fn run_probe_loop<R: ProbeRunner>(
    descriptor: &ProbeDescriptor,
    runner: &R,
    options: &ProbeLoopOptions,
    stop: &Receiver<()>,
    mut on_transition: impl FnMut(&Transition),
) -> Result<ProbeSummary> {
    let started = Instant::now();
    let mut tracker = HealthTracker::new(descriptor);
    let mut report = HealthReport::default();
    let mut transitions = Vec::new();
    let mut stopped = false;

    loop {
        if options.max_checks.is_some_and(|max| report.checks >= max) {
            break;
        }
        if report.checks > 0 {
            let due = started + next_due(started.elapsed(), descriptor.interval);
            match stop.recv_timeout(due.saturating_duration_since(Instant::now())) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    stopped = true;
                    break;
                }
            }
        }

        let result = runner.check(descriptor);
        let outcome = result.outcome;
        let transition = tracker.record(outcome, started.elapsed());
        report.record(result, &tracker);
        if let Some(path) = &options.status_file
            && let Err(err) = write_health_report(path, &report)
        {
            warn!(path = %path.display(), err = %format!("{err:#}"), "status file not updated");
        }

        if let Some(transition) = transition {
            match transition.to {
                HealthState::Unhealthy => warn!(
                    from = ?transition.from,
                    failing_streak = transition.failing_streak,
                    "container unhealthy"
                ),
                _ => info!(from = ?transition.from, to = ?transition.to, "health changed"),
            }
            on_transition(&transition);
            transitions.push(transition);
            if options.stop_when_unhealthy && transition.to == HealthState::Unhealthy {
                break;
            }
        }
    }

    Ok(ProbeSummary {
        state: tracker.state(),
        report,
        transitions,
        stopped,
    })
}

/// Outcome of `stagecraft launch`.
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub terminated: Terminated,
    /// `None` if the probe thread failed; the exit status is kept regardless.
    pub health: Option<ProbeSummary>,
}

/// Run the artifact's foreground process with a probe thread beside it.
///
/// Returns when the process exits. The probe thread is stopped at that point;
/// the process is never relaunched.
pub fn launch<R: ProbeRunner>(
    artifact: &Artifact,
    runner: &R,
    options: &ProbeLoopOptions,
) -> Result<LaunchOutcome> {
    let descriptor = &artifact.config.healthcheck;
    let mut child = spawn(artifact)?;
    let (stop_tx, stop_rx) = mpsc::channel();

    thread::scope(|scope| {
        let probe =
            scope.spawn(move || run_probe_loop(descriptor, runner, options, &stop_rx, |_| {}));

        let status = child.wait().context("wait for foreground process");
        // The loop also stops if the receiver finds the channel closed.
        let _ = stop_tx.send(());
        let joined = probe
            .join()
            .unwrap_or_else(|_| Err(anyhow!("probe thread panicked")));
        let terminated = Terminated::from_status(status?);

        let health = match joined {
            Ok(summary) => Some(summary),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "probe loop failed; keeping exit status");
                None
            }
        };
        info!(
            code = ?terminated.code,
            signal = ?terminated.signal,
            health = ?health.as_ref().map(|summary| summary.state),
            "process exited; container terminated"
        );
        Ok(LaunchOutcome { terminated, health })
    })
}
