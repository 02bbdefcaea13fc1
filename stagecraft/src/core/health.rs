//! Health probe descriptor and the starting/healthy/unhealthy state machine.
//!
//! The tracker only reports state. It never touches the supervised process;
//! acting on `unhealthy` is left to whatever supervises the container.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::types::duration_ms;

/// Reported container health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
}

/// Result of one probe invocation. Exit zero is `Pass`; anything else,
/// including a timeout or spawn error, is `Fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeOutcome {
    Pass,
    Fail,
}

/// Fixed-at-build-time probe contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeDescriptor {
    pub command: Vec<String>,
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    #[serde(rename = "start_period_ms", with = "duration_ms")]
    pub start_period: Duration,
    pub retries: u32,
}

impl ProbeDescriptor {
    pub fn validate(&self) -> Result<(), String> {
        if self.command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err("probe command must be a non-empty array".to_string());
        }
        if self.interval.is_zero() {
            return Err("probe interval must be > 0".to_string());
        }
        if self.timeout.is_zero() {
            return Err("probe timeout must be > 0".to_string());
        }
        if self.retries == 0 {
            return Err("probe retries must be > 0".to_string());
        }
        Ok(())
    }

    /// True if any command argument references `port`.
    pub fn targets_port(&self, port: u16) -> bool {
        let needle = port.to_string();
        self.command.iter().any(|arg| contains_number(arg, &needle))
    }
}

/// Substitute `{host}` and `{port}` in a probe command.
pub fn resolve_probe_command(command: &[String], host: &str, port: u16) -> Vec<String> {
    let port = port.to_string();
    command
        .iter()
        .map(|arg| arg.replace("{host}", host).replace("{port}", &port))
        .collect()
}

/// A state change reported by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
    pub failing_streak: u32,
}

/// Health state machine driven by probe outcomes.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    state: HealthState,
    failing_streak: u32,
    retries: u32,
    start_period: Duration,
}

impl HealthTracker {
    pub fn new(descriptor: &ProbeDescriptor) -> Self {
        Self {
            state: HealthState::Starting,
            failing_streak: 0,
            retries: descriptor.retries.max(1),
            start_period: descriptor.start_period,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    /// Consecutive failures counted against the retry budget.
    pub fn failing_streak(&self) -> u32 {
        self.failing_streak
    }

    /// Apply one outcome observed `since_start` after the container started.
    ///
    /// - Any success moves to `Healthy` and clears the streak.
    /// - Failures while `Starting` inside the grace period are not counted.
    /// - `retries` consecutive counted failures move to `Unhealthy`.
    pub fn record(&mut self, outcome: ProbeOutcome, since_start: Duration) -> Option<Transition> {
        match outcome {
            ProbeOutcome::Pass => {
                self.failing_streak = 0;
                self.move_to(HealthState::Healthy)
            }
            ProbeOutcome::Fail => {
                if self.state == HealthState::Starting && since_start < self.start_period {
                    return None;
                }
                self.failing_streak = self.failing_streak.saturating_add(1);
                if self.failing_streak >= self.retries {
                    self.move_to(HealthState::Unhealthy)
                } else {
                    None
                }
            }
        }
    }

    fn move_to(&mut self, to: HealthState) -> Option<Transition> {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        Some(Transition {
            from,
            to,
            failing_streak: self.failing_streak,
        })
    }
}

/// Offset from loop start of the next scheduled call.
///
/// Calls are fixed-rate at `k * interval` (k >= 1). Slots that passed while a
/// slow call was running are skipped rather than replayed.
pub fn next_due(elapsed: Duration, interval: Duration) -> Duration {
    if interval.is_zero() {
        return elapsed;
    }
    let slots_passed = elapsed.as_nanos() / interval.as_nanos();
    let next_slot = u32::try_from(slots_passed + 1).unwrap_or(u32::MAX);
    interval.saturating_mul(next_slot)
}

fn contains_number(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(pos, _)| {
        let before = haystack[..pos].chars().next_back();
        let after = haystack[pos + needle.len()..].chars().next();
        !before.is_some_and(|c| c.is_ascii_digit()) && !after.is_some_and(|c| c.is_ascii_digit())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(start_period_ms: u64, retries: u32) -> ProbeDescriptor {
        ProbeDescriptor {
            command: vec!["true".to_string()],
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(50),
            start_period: Duration::from_millis(start_period_ms),
            retries,
        }
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn success_within_grace_is_healthy_immediately() {
        let mut tracker = HealthTracker::new(&descriptor(1_000, 3));
        assert_eq!(tracker.state(), HealthState::Starting);
        let transition = tracker.record(ProbeOutcome::Pass, ms(100));
        assert_eq!(
            transition,
            Some(Transition {
                from: HealthState::Starting,
                to: HealthState::Healthy,
                failing_streak: 0,
            })
        );
    }

    #[test]
    fn failures_within_grace_do_not_count() {
        let mut tracker = HealthTracker::new(&descriptor(1_000, 2));
        for at in [100, 200, 300, 400] {
            assert_eq!(tracker.record(ProbeOutcome::Fail, ms(at)), None);
        }
        assert_eq!(tracker.failing_streak(), 0);
        assert_eq!(tracker.state(), HealthState::Starting);
    }

    #[test]
    fn budget_failures_after_grace_mark_unhealthy() {
        let mut tracker = HealthTracker::new(&descriptor(100, 3));
        assert_eq!(tracker.record(ProbeOutcome::Fail, ms(200)), None);
        assert_eq!(tracker.record(ProbeOutcome::Fail, ms(300)), None);
        let transition = tracker
            .record(ProbeOutcome::Fail, ms(400))
            .expect("third failure transitions");
        assert_eq!(transition.from, HealthState::Starting);
        assert_eq!(transition.to, HealthState::Unhealthy);
        assert_eq!(transition.failing_streak, 3);
    }

    #[test]
    fn healthy_to_unhealthy_after_third_failure_not_before() {
        let mut tracker = HealthTracker::new(&descriptor(0, 3));
        tracker.record(ProbeOutcome::Pass, ms(100));
        assert_eq!(tracker.state(), HealthState::Healthy);

        assert_eq!(tracker.record(ProbeOutcome::Fail, ms(200)), None);
        assert_eq!(tracker.state(), HealthState::Healthy);
        assert_eq!(tracker.record(ProbeOutcome::Fail, ms(300)), None);
        assert_eq!(tracker.state(), HealthState::Healthy);
        let transition = tracker.record(ProbeOutcome::Fail, ms(400));
        assert_eq!(
            transition.map(|t| (t.from, t.to)),
            Some((HealthState::Healthy, HealthState::Unhealthy))
        );
        assert_eq!(tracker.record(ProbeOutcome::Fail, ms(500)), None);
        assert_eq!(tracker.failing_streak(), 4);
    }

    #[test]
    fn grace_does_not_shield_a_healthy_container() {
        let mut tracker = HealthTracker::new(&descriptor(10_000, 1));
        tracker.record(ProbeOutcome::Pass, ms(100));
        let transition = tracker.record(ProbeOutcome::Fail, ms(200));
        assert_eq!(transition.map(|t| t.to), Some(HealthState::Unhealthy));
    }

    #[test]
    fn single_success_restores_healthy() {
        let mut tracker = HealthTracker::new(&descriptor(0, 3));
        for at in [100, 200, 300] {
            tracker.record(ProbeOutcome::Fail, ms(at));
        }
        assert_eq!(tracker.state(), HealthState::Unhealthy);
        let transition = tracker.record(ProbeOutcome::Pass, ms(400));
        assert_eq!(
            transition.map(|t| (t.from, t.to)),
            Some((HealthState::Unhealthy, HealthState::Healthy))
        );
        assert_eq!(tracker.failing_streak(), 0);
    }

    #[test]
    fn interrupted_streak_starts_over() {
        let mut tracker = HealthTracker::new(&descriptor(0, 3));
        tracker.record(ProbeOutcome::Fail, ms(100));
        tracker.record(ProbeOutcome::Fail, ms(200));
        tracker.record(ProbeOutcome::Pass, ms(300));
        tracker.record(ProbeOutcome::Fail, ms(400));
        tracker.record(ProbeOutcome::Fail, ms(500));
        assert_eq!(tracker.state(), HealthState::Healthy);
        assert_eq!(tracker.failing_streak(), 2);
    }

    #[test]
    fn next_due_skips_missed_slots() {
        let interval = ms(100);
        assert_eq!(next_due(ms(0), interval), ms(100));
        assert_eq!(next_due(ms(99), interval), ms(100));
        assert_eq!(next_due(ms(100), interval), ms(200));
        assert_eq!(next_due(ms(350), interval), ms(400));
    }

    #[test]
    fn resolves_placeholders_and_checks_port() {
        let command = vec![
            "curl".to_string(),
            "-fsS".to_string(),
            "http://{host}:{port}/health".to_string(),
        ];
        let resolved = resolve_probe_command(&command, "127.0.0.1", 8000);
        assert_eq!(resolved[2], "http://127.0.0.1:8000/health");

        let probe = ProbeDescriptor {
            command: resolved,
            ..descriptor(0, 3)
        };
        assert!(probe.targets_port(8000));
        assert!(!probe.targets_port(800));
        assert!(!probe.targets_port(80));
    }

    #[test]
    fn validate_rejects_zero_budget() {
        assert!(descriptor(0, 0).validate().is_err());
        let mut probe = descriptor(0, 1);
        probe.interval = Duration::ZERO;
        assert!(probe.validate().is_err());
        assert!(descriptor(0, 1).validate().is_ok());
    }

    #[test]
    fn descriptor_serializes_millis() {
        let json = serde_json::to_value(descriptor(5_000, 3)).expect("serialize");
        assert_eq!(json["interval_ms"], 100);
        assert_eq!(json["start_period_ms"], 5000);
        let back: ProbeDescriptor = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, descriptor(5_000, 3));
    }
}
