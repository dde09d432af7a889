use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::health::{Health, HealthTracker, Outcome};
use super::window::SlidingWindow;
use crate::backoff::BackoffPolicy;
use crate::config::HarvestConfig;
use crate::error::{HarvestError, Result};
use crate::shutdown::ShutdownSignal;

/// Granted admission for one request.
///
/// Keep it alive until the outcome is recorded. Dropping a recovery
/// probe's admission without an outcome (an aborted task, say) frees the
/// source to admit the next one.
#[derive(Debug)]
pub struct Admission {
    /// Time spent waiting for budget or backoff.
    pub waited: Duration,
    /// This request is the single recovery probe for an offline source.
    pub probe: bool,
    _release: Option<ProbeRelease>,
}

struct ProbeRelease {
    source: String,
    ticket: u64,
    limiter: Arc<SourceLimiter>,
}

impl fmt::Debug for ProbeRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeRelease")
            .field("source", &self.source)
            .field("ticket", &self.ticket)
            .finish_non_exhaustive()
    }
}

impl Drop for ProbeRelease {
    fn drop(&mut self) {
        if self.limiter.state().health.abandon_probe(self.ticket) {
            warn!(source = %self.source, "recovery probe dropped without an outcome");
        }
    }
}

/// A change in a source's health level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub source: String,
    pub from: Health,
    pub to: Health,
}

struct SourceState {
    window: SlidingWindow,
    health: HealthTracker,
    backoff_until: Option<Instant>,
}

enum Decision {
    Ready { probe: Option<u64> },
    Wait(Duration),
    Refuse,
}

impl SourceState {
    fn decide(&mut self, now: Instant) -> Decision {
        if self.health.refuses(now) {
            return Decision::Refuse;
        }
        let mut wait = self.window.wait_time(now);
        if let Some(until) = self.backoff_until {
            wait = wait.max(until.saturating_duration_since(now));
        }
        if !wait.is_zero() {
            return Decision::Wait(wait);
        }
        if self.window.try_admit(now).is_err() {
            return Decision::Wait(self.window.wait_time(now));
        }
        Decision::Ready {
            probe: self.health.begin_probe(),
        }
    }
}

struct SourceLimiter {
    /// Fair async mutex: waiters are admitted in arrival order.
    queue: tokio::sync::Mutex<()>,
    state: Mutex<SourceState>,
    backoff: BackoffPolicy,
}

impl SourceLimiter {
    fn state(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-source admission control and health tracking.
///
/// Every source owns its own queue and counters; the outer map is only
/// written when an unknown source is first seen.
pub struct RateLimitManager {
    config: Arc<HarvestConfig>,
    limiters: RwLock<HashMap<String, Arc<SourceLimiter>>>,
}

impl RateLimitManager {
    /// Create a manager with limiters for every configured source.
    pub fn new(config: Arc<HarvestConfig>) -> Self {
        let limiters = config
            .sources
            .keys()
            .map(|name| (name.clone(), Arc::new(Self::build_limiter(&config, name))))
            .collect();
        Self {
            config,
            limiters: RwLock::new(limiters),
        }
    }

    fn build_limiter(config: &HarvestConfig, source: &str) -> SourceLimiter {
        let limits = config.limits_for(source);
        SourceLimiter {
            queue: tokio::sync::Mutex::new(()),
            state: Mutex::new(SourceState {
                window: SlidingWindow::new(limits.budget.max_requests, limits.budget.window()),
                health: HealthTracker::new(limits.health),
                backoff_until: None,
            }),
            backoff: limits.backoff,
        }
    }

    fn limiter(&self, source: &str) -> Arc<SourceLimiter> {
        if let Some(limiter) = self
            .limiters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source)
        {
            return Arc::clone(limiter);
        }
        let mut map = self.limiters.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(source.to_string()).or_insert_with(|| {
            debug!(source = %source, "registering limiter with default limits");
            Arc::new(Self::build_limiter(&self.config, source))
        }))
    }

    /// Wait until `source` may receive one more request.
    ///
    /// Fails fast with [`HarvestError::SourceOffline`] while the source is
    /// offline and cooling down, and with [`HarvestError::Cancelled`] if the
    /// shutdown signal fires while waiting.
    pub async fn acquire(&self, source: &str, shutdown: &ShutdownSignal) -> Result<Admission> {
        let limiter = self.limiter(source);
        let started = Instant::now();

        let _turn = tokio::select! {
            guard = limiter.queue.lock() => guard,
            _ = shutdown.cancelled() => return Err(HarvestError::Cancelled),
        };

        loop {
            if shutdown.is_cancelled() {
                return Err(HarvestError::Cancelled);
            }
            let decision = limiter.state().decide(Instant::now());
            match decision {
                Decision::Ready { probe } => {
                    if probe.is_some() {
                        info!(source = %source, "admitting recovery probe");
                    }
                    return Ok(Admission {
                        waited: started.elapsed(),
                        probe: probe.is_some(),
                        _release: probe.map(|ticket| ProbeRelease {
                            source: source.to_string(),
                            ticket,
                            limiter: Arc::clone(&limiter),
                        }),
                    });
                }
                Decision::Refuse => {
                    return Err(HarvestError::SourceOffline {
                        source_name: source.to_string(),
                    });
                }
                Decision::Wait(wait) => {
                    debug!(source = %source, wait_ms = wait.as_millis() as u64, "waiting for admission");
                    tokio::select! {
                        _ = sleep(wait) => {}
                        _ = shutdown.cancelled() => return Err(HarvestError::Cancelled),
                    }
                }
            }
        }
    }

    /// Report the outcome of an admitted request.
    pub fn record_outcome(&self, source: &str, outcome: Outcome) -> Option<HealthTransition> {
        let limiter = self.limiter(source);
        let now = Instant::now();
        let mut state = limiter.state();
        let from = state.health.health();
        let to = state.health.record(outcome, now);

        state.backoff_until = match outcome {
            Outcome::Success => None,
            Outcome::RateLimited { retry_after } => {
                let delay = limiter
                    .backoff
                    .jittered(state.health.consecutive_failures())
                    .max(retry_after.unwrap_or_default());
                Some(now + delay)
            }
            Outcome::Error => {
                Some(now + limiter.backoff.jittered(state.health.consecutive_failures()))
            }
        };

        if from == to {
            return None;
        }
        if to > from {
            warn!(
                source = %source,
                from = %from,
                to = %to,
                consecutive_failures = state.health.consecutive_failures(),
                "source health degraded"
            );
        } else {
            info!(source = %source, from = %from, to = %to, "source health recovering");
        }
        Some(HealthTransition {
            source: source.to_string(),
            from,
            to,
        })
    }

    pub fn get_health(&self, source: &str) -> Health {
        self.limiter(source).state().health.health()
    }

    /// Current health of every known source.
    pub fn snapshot(&self) -> BTreeMap<String, Health> {
        let limiters: Vec<(String, Arc<SourceLimiter>)> = self
            .limiters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, limiter)| (name.clone(), Arc::clone(limiter)))
            .collect();
        limiters
            .into_iter()
            .map(|(name, limiter)| {
                let health = limiter.state().health.health();
                (name, health)
            })
            .collect()
    }

    /// Sources whose health left `Healthy` at any point.
    pub fn degraded_sources(&self) -> Vec<String> {
        let map = self.limiters.read().unwrap_or_else(PoisonError::into_inner);
        let mut degraded: Vec<String> = map
            .iter()
            .filter(|(_, limiter)| limiter.state().health.worst() != Health::Healthy)
            .map(|(name, _)| name.clone())
            .collect();
        degraded.sort();
        degraded
    }
}
