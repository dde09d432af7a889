use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

use crate::config::HealthThresholds;

/// Degradation level of a source, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Critical,
    Offline,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Healthy => write!(f, "healthy"),
            Health::Degraded => write!(f, "degraded"),
            Health::Critical => write!(f, "critical"),
            Health::Offline => write!(f, "offline"),
        }
    }
}

impl Health {
    /// Level implied by a run of consecutive non-success outcomes.
    pub fn for_failures(consecutive: u32, t: &HealthThresholds) -> Health {
        if consecutive >= t.offline_after {
            Health::Offline
        } else if consecutive >= t.critical_after {
            Health::Critical
        } else if consecutive >= t.degraded_after {
            Health::Degraded
        } else {
            Health::Healthy
        }
    }

    /// One level better; recovery never skips levels.
    pub fn step_up(self) -> Health {
        match self {
            Health::Offline => Health::Critical,
            Health::Critical => Health::Degraded,
            Health::Degraded | Health::Healthy => Health::Healthy,
        }
    }
}

/// Result of a request against a source, as reported back to the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The source pushed back; `retry_after` is its hint, if it sent one.
    RateLimited { retry_after: Option<Duration> },
    Error,
}

/// Health state machine for one source.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    thresholds: HealthThresholds,
    health: Health,
    worst: Health,
    consecutive_failures: u32,
    offline_since: Option<Instant>,
    /// Ticket of the recovery request currently out, if any.
    probe_in_flight: Option<u64>,
    probes_issued: u64,
}

impl HealthTracker {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            health: Health::Healthy,
            worst: Health::Healthy,
            consecutive_failures: 0,
            offline_since: None,
            probe_in_flight: None,
            probes_issued: 0,
        }
    }

    pub fn health(&self) -> Health {
        self.health
    }

    /// Worst level reached since creation.
    pub fn worst(&self) -> Health {
        self.worst
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Apply an outcome, returning the new health.
    pub fn record(&mut self, outcome: Outcome, now: Instant) -> Health {
        match outcome {
            Outcome::Success => {
                self.consecutive_failures = 0;
                self.probe_in_flight = None;
                self.offline_since = None;
                self.health = self.health.step_up();
            }
            Outcome::RateLimited { .. } | Outcome::Error => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.health == Health::Offline {
                    // failed probe: restart the cooldown
                    self.probe_in_flight = None;
                    self.offline_since = Some(now);
                } else {
                    let target = Health::for_failures(self.consecutive_failures, &self.thresholds);
                    if target > self.health {
                        self.health = target;
                        if target == Health::Offline {
                            self.offline_since = Some(now);
                        }
                    }
                }
            }
        }
        self.worst = self.worst.max(self.health);
        self.health
    }

    /// Whether an offline source should still refuse requests at `now`.
    /// Always false for sources that are not offline.
    pub fn refuses(&self, now: Instant) -> bool {
        if self.health != Health::Offline {
            return false;
        }
        if self.probe_in_flight.is_some() {
            return true;
        }
        match self.offline_since {
            Some(since) => now < since + self.thresholds.cooldown(),
            None => false,
        }
    }

    /// Mark the admitted request as the single recovery probe, if offline,
    /// and hand out its ticket.
    pub fn begin_probe(&mut self) -> Option<u64> {
        if self.health != Health::Offline {
            return None;
        }
        self.probes_issued += 1;
        self.probe_in_flight = Some(self.probes_issued);
        self.probe_in_flight
    }

    /// Release a probe that ended without a recorded outcome. Returns
    /// whether `ticket` was still the one in flight.
    pub fn abandon_probe(&mut self, ticket: u64) -> bool {
        if self.probe_in_flight == Some(ticket) {
            self.probe_in_flight = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds(degraded: u32, critical: u32, offline: u32) -> HealthThresholds {
        HealthThresholds {
            degraded_after: degraded,
            critical_after: critical,
            offline_after: offline,
            cooldown_secs: 60,
        }
    }

    #[test]
    fn six_errors_walk_healthy_degraded_critical() {
        let now = Instant::now();
        let mut tracker = HealthTracker::new(thresholds(3, 5, 10));
        let mut seen = vec![tracker.health()];
        for _ in 0..6 {
            let h = tracker.record(Outcome::Error, now);
            if seen.last() != Some(&h) {
                seen.push(h);
            }
        }
        assert_eq!(seen, vec![Health::Healthy, Health::Degraded, Health::Critical]);
        assert_eq!(tracker.consecutive_failures(), 6);
    }

    #[test]
    fn rate_limited_counts_as_failure() {
        let now = Instant::now();
        let mut tracker = HealthTracker::new(thresholds(2, 3, 4));
        tracker.record(Outcome::RateLimited { retry_after: None }, now);
        tracker.record(Outcome::RateLimited { retry_after: None }, now);
        assert_eq!(tracker.health(), Health::Degraded);
    }

    #[test]
    fn recovery_steps_one_level_per_success() {
        let now = Instant::now();
        let mut tracker = HealthTracker::new(thresholds(1, 2, 3));
        for _ in 0..3 {
            tracker.record(Outcome::Error, now);
        }
        assert_eq!(tracker.health(), Health::Offline);
        assert_eq!(tracker.record(Outcome::Success, now), Health::Critical);
        assert_eq!(tracker.record(Outcome::Success, now), Health::Degraded);
        assert_eq!(tracker.record(Outcome::Success, now), Health::Healthy);
        assert_eq!(tracker.worst(), Health::Offline);
    }

    #[test]
    fn failure_never_improves_health() {
        let now = Instant::now();
        let mut tracker = HealthTracker::new(thresholds(1, 2, 5));
        tracker.record(Outcome::Error, now);
        tracker.record(Outcome::Error, now);
        tracker.record(Outcome::Success, now);
        assert_eq!(tracker.health(), Health::Degraded);
        // counter restarted, but health must not drop back to healthy
        assert_eq!(tracker.record(Outcome::Error, now), Health::Degraded);
    }

    #[test]
    fn offline_refuses_until_cooldown_then_admits_one_request() {
        let start = Instant::now();
        let mut tracker = HealthTracker::new(thresholds(1, 2, 3));
        for _ in 0..3 {
            tracker.record(Outcome::Error, start);
        }
        assert!(tracker.refuses(start + Duration::from_secs(59)));
        let later = start + Duration::from_secs(60);
        assert!(!tracker.refuses(later));
        assert_eq!(tracker.begin_probe(), Some(1));
        assert!(tracker.refuses(later), "second probe must be refused");

        // failed probe restarts the cooldown
        tracker.record(Outcome::Error, later);
        assert!(tracker.refuses(later + Duration::from_secs(30)));
        assert!(!tracker.refuses(later + Duration::from_secs(60)));
    }

    #[test]
    fn abandoned_recovery_request_reopens_the_gate() {
        let start = Instant::now();
        let mut tracker = HealthTracker::new(thresholds(1, 2, 3));
        for _ in 0..3 {
            tracker.record(Outcome::Error, start);
        }
        let later = start + Duration::from_secs(60);
        let first = tracker.begin_probe().unwrap();
        assert!(tracker.refuses(later));

        assert!(tracker.abandon_probe(first));
        assert!(!tracker.refuses(later));
        assert_eq!(tracker.health(), Health::Offline);

        // a stale ticket cannot release its successor
        let second = tracker.begin_probe().unwrap();
        assert!(!tracker.abandon_probe(first));
        assert!(tracker.refuses(later));

        // once an outcome is in, the ticket is spent
        tracker.record(Outcome::Success, later);
        assert!(!tracker.abandon_probe(second));
        assert_eq!(tracker.health(), Health::Critical);
    }

    #[test]
    fn healthy_source_never_refuses() {
        let tracker = HealthTracker::new(thresholds(3, 5, 8));
        assert!(!tracker.refuses(Instant::now()));
    }

    #[test]
    fn health_ordering() {
        assert!(Health::Healthy < Health::Degraded);
        assert!(Health::Critical < Health::Offline);
        assert_eq!(Health::Offline.to_string(), "offline");
    }
}
