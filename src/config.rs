//! Harvester configuration loaded from `harvest.toml`.
//!
//! [`HarvestConfig`] holds every tunable parameter. Values missing from the
//! file fall back to sensible defaults. The `HARVEST_STATE_DIR` and
//! `HARVEST_WORKERS` environment variables take precedence over the file.
//!
//! The loaded config is wrapped in an `Arc` and handed to each component at
//! construction; nothing reads it from global state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::HarvestError;

const DEFAULT_CONFIG_FILE: &str = "harvest.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// Directory holding session state, checkpoints and record logs.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Maximum number of work units collected concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Transient-failure retries per unit before it is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Time in-flight units get to finish after cancellation.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_max_results_per_query")]
    pub max_results_per_query: u32,

    #[serde(default)]
    pub backoff: BackoffPolicy,

    #[serde(default)]
    pub health: HealthThresholds,

    /// Limits applied to sources without an explicit `[sources.<name>]` entry.
    #[serde(default)]
    pub defaults: RateBudget,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub retention: RetentionPolicy,

    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

/// Request budget for one source: `max_requests` per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateBudget {
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl RateBudget {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateBudget {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}

/// Consecutive-failure thresholds driving the health state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthThresholds {
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
    #[serde(default = "default_critical_after")]
    pub critical_after: u32,
    #[serde(default = "default_offline_after")]
    pub offline_after: u32,
    /// Seconds an offline source waits before one probe request is let through.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl HealthThresholds {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_after: default_degraded_after(),
            critical_after: default_critical_after(),
            offline_after: default_offline_after(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Integrity score below which a session is unrecoverable.
    #[serde(default = "default_integrity_floor")]
    pub integrity_floor: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            integrity_floor: default_integrity_floor(),
        }
    }
}

/// Which old sessions `cleanup_old_sessions` may delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Delete sessions whose last update is older than this many days.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: Option<u32>,
    /// Always keep this many of the most recent sessions.
    #[serde(default = "default_keep_last")]
    pub keep_last: Option<usize>,
    /// Also delete paused/interrupted sessions. Active ones are never touched.
    #[serde(default)]
    pub include_incomplete: bool,
    /// A session stored as active but not owned by this process is treated as
    /// interrupted only once it has not been updated for this many hours.
    /// Until then another process may still be running it.
    #[serde(default = "default_active_grace_hours")]
    pub active_grace_hours: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            keep_last: default_keep_last(),
            include_incomplete: false,
            active_grace_hours: default_active_grace_hours(),
        }
    }
}

/// Per-source settings from `[sources.<name>]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    pub max_requests: Option<u32>,
    pub window_secs: Option<u64>,
    /// Higher rank wins field conflicts during dedup.
    #[serde(default)]
    pub trust_rank: u32,
    /// Sources tried, in order, when this one is offline.
    #[serde(default)]
    pub fallback: Vec<String>,
    pub backoff: Option<BackoffPolicy>,
    pub health: Option<HealthThresholds>,
    /// Search endpoint for the generic HTTP collector.
    pub base_url: Option<String>,
    /// Environment variable holding the API key, if the source needs one.
    pub api_key_env: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
}

/// Fully resolved limits for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLimits {
    pub budget: RateBudget,
    pub backoff: BackoffPolicy,
    pub health: HealthThresholds,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".harvest")
}

fn default_workers() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_max_results_per_query() -> u32 {
    100
}

fn default_max_requests() -> u32 {
    60
}

fn default_window_secs() -> u64 {
    60
}

fn default_degraded_after() -> u32 {
    3
}

fn default_critical_after() -> u32 {
    5
}

fn default_offline_after() -> u32 {
    8
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_integrity_floor() -> f64 {
    0.5
}

fn default_max_age_days() -> Option<u32> {
    Some(30)
}

fn default_keep_last() -> Option<usize> {
    Some(20)
}

fn default_active_grace_hours() -> u32 {
    24
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            workers: default_workers(),
            max_retries: default_max_retries(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            max_results_per_query: default_max_results_per_query(),
            backoff: BackoffPolicy::default(),
            health: HealthThresholds::default(),
            defaults: RateBudget::default(),
            recovery: RecoveryConfig::default(),
            retention: RetentionPolicy::default(),
            sources: BTreeMap::new(),
        }
    }
}

impl HarvestConfig {
    /// Load from `path`, or from `harvest.toml` in the current directory.
    /// A missing default file yields the defaults; a missing explicit path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };

        if let Ok(dir) = std::env::var("HARVEST_STATE_DIR")
            && !dir.is_empty()
        {
            config.state_dir = PathBuf::from(dir);
        }
        if let Ok(workers) = std::env::var("HARVEST_WORKERS")
            && let Ok(workers) = workers.parse::<usize>()
        {
            config.workers = workers;
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = toml::from_str::<HarvestConfig>(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Reject configurations the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), HarvestError> {
        if self.workers == 0 {
            return Err(HarvestError::Config("workers must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.recovery.integrity_floor) {
            return Err(HarvestError::Config(
                "recovery.integrity_floor must be within [0, 1]".into(),
            ));
        }
        check_thresholds("health", &self.health)?;
        check_budget("defaults", &self.defaults)?;

        for (name, source) in &self.sources {
            let limits = self.limits_for(name);
            check_budget(name, &limits.budget)?;
            check_thresholds(name, &limits.health)?;
            for fallback in &source.fallback {
                if fallback == name {
                    return Err(HarvestError::Config(format!(
                        "source {name} lists itself as a fallback"
                    )));
                }
                if !self.sources.contains_key(fallback) {
                    return Err(HarvestError::Config(format!(
                        "source {name} falls back to unknown source {fallback}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve budget, backoff and thresholds for `source`, applying defaults.
    pub fn limits_for(&self, source: &str) -> SourceLimits {
        let entry = self.sources.get(source);
        SourceLimits {
            budget: RateBudget {
                max_requests: entry
                    .and_then(|s| s.max_requests)
                    .unwrap_or(self.defaults.max_requests),
                window_secs: entry
                    .and_then(|s| s.window_secs)
                    .unwrap_or(self.defaults.window_secs),
            },
            backoff: entry
                .and_then(|s| s.backoff.clone())
                .unwrap_or_else(|| self.backoff.clone()),
            health: entry.and_then(|s| s.health).unwrap_or(self.health),
        }
    }

    pub fn trust_rank(&self, source: &str) -> u32 {
        self.sources.get(source).map_or(0, |s| s.trust_rank)
    }

    pub fn fallbacks_for(&self, source: &str) -> &[String] {
        self.sources
            .get(source)
            .map(|s| s.fallback.as_slice())
            .unwrap_or(&[])
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn check_budget(name: &str, budget: &RateBudget) -> Result<(), HarvestError> {
    if budget.max_requests == 0 || budget.window_secs == 0 {
        return Err(HarvestError::Config(format!(
            "{name}: max_requests and window_secs must be positive"
        )));
    }
    Ok(())
}

fn check_thresholds(name: &str, t: &HealthThresholds) -> Result<(), HarvestError> {
    if t.degraded_after == 0
        || t.degraded_after >= t.critical_after
        || t.critical_after >= t.offline_after
    {
        return Err(HarvestError::Config(format!(
            "{name}: health thresholds must satisfy 0 < degraded_after < critical_after < offline_after"
        )));
    }
    Ok(())
}
