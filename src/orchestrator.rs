//! Top-level collection driver.
//!
//! Pending work units run on a bounded worker pool. Each unit asks the
//! [`RateLimitManager`] for admission, queries its source (falling back to
//! the configured alternatives when the source is offline or rejects the
//! query) and is checkpointed through the [`SessionStateManager`] as soon as
//! it completes. Progress is published as [`CollectionEvent`]s.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::HarvestConfig;
use crate::dedup::{CollectedRecord, Deduplicator};
use crate::error::{HarvestError, Result};
use crate::rate_limit::{Health, HealthTransition, Outcome, RateLimitManager};
use crate::recovery::{Degradation, InterruptionRecoverySystem, RecoveryReport, UnitRef};
use crate::session::{FsStore, SessionStateManager, SessionStatus, StateStore, UnitCounts};
use crate::shutdown::{Shutdown, ShutdownSignal};
use crate::source::{CollectorAdapter, CollectorError, RawRecord};
use crate::work::{UnitStatus, WorkPlan, WorkUnit};

/// Progress notifications emitted while a session runs.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEvent {
    UnitStarted {
        unit_id: String,
        source: String,
    },
    UnitCompleted {
        unit_id: String,
        via: String,
        records: usize,
    },
    UnitFailed {
        unit_id: String,
        error: String,
    },
    UnitRequeued {
        unit_id: String,
        reason: String,
    },
    /// Validation of a resumed session, sent before any unit is dispatched.
    RecoveryValidated {
        report: Box<RecoveryReport>,
        recommendations: Vec<String>,
    },
    HealthChanged(HealthTransition),
    Checkpointed {
        sequence: u64,
        completed: usize,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionReport {
    pub session_id: String,
    pub status: SessionStatus,
    pub counts: UnitCounts,
    pub completed_this_run: usize,
    pub failed_this_run: usize,
    pub requeued: usize,
    pub failed_units: Vec<UnitRef>,
    pub degraded_sources: Vec<String>,
    pub corpus_records: usize,
    pub degradation: Degradation,
    /// Validation performed before a resumed run.
    pub recovery: Option<RecoveryReport>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub session_id: String,
    pub status: SessionStatus,
    pub counts: UnitCounts,
    pub health: BTreeMap<String, Health>,
    pub last_checkpoint: Option<String>,
    pub degraded_sources: Vec<String>,
}

enum UnitOutcome {
    Completed,
    Failed,
    Requeued,
}

#[derive(Default)]
struct Tally {
    completed: usize,
    failed: usize,
    requeued: usize,
    halted: Option<HarvestError>,
}

/// Everything a single unit task needs, cheap to clone into the pool.
struct UnitWorker<A, S: StateStore> {
    config: Arc<HarvestConfig>,
    adapters: Arc<HashMap<String, A>>,
    limiter: Arc<RateLimitManager>,
    sessions: Arc<SessionStateManager<S>>,
    events: Option<mpsc::UnboundedSender<CollectionEvent>>,
}

impl<A, S: StateStore> Clone for UnitWorker<A, S> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            adapters: Arc::clone(&self.adapters),
            limiter: Arc::clone(&self.limiter),
            sessions: Arc::clone(&self.sessions),
            events: self.events.clone(),
        }
    }
}

impl<A: CollectorAdapter, S: StateStore + 'static> UnitWorker<A, S> {
    fn emit(&self, event: CollectionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn observe(&self, source: &str, outcome: Outcome) {
        if let Some(transition) = self.limiter.record_outcome(source, outcome) {
            self.emit(CollectionEvent::HealthChanged(transition));
        }
    }

    /// Run one unit to completion, failure or re-queue. Errors returned here
    /// are session-level and stop further dispatch.
    async fn process(&self, session_id: &str, unit: WorkUnit, signal: &ShutdownSignal) -> Result<UnitOutcome> {
        self.sessions.mark_in_progress(session_id, &unit.id)?;
        self.emit(CollectionEvent::UnitStarted {
            unit_id: unit.id.clone(),
            source: unit.source.clone(),
        });

        let chain: Vec<&str> = std::iter::once(unit.source.as_str())
            .chain(self.config.fallbacks_for(&unit.source).iter().map(String::as_str))
            .collect();

        let mut last_error = String::new();
        for source in chain {
            let Some(adapter) = self.adapters.get(source) else {
                debug!(unit = %unit.id, source = %source, "no collector registered, skipping");
                last_error = format!("no collector registered for {source}");
                continue;
            };
            if source != unit.source {
                info!(unit = %unit.id, fallback = %source, "trying fallback source");
            }

            match self.collect(session_id, &unit, source, adapter, signal).await {
                Ok(raw) => {
                    let now = Utc::now();
                    let records: Vec<CollectedRecord> = raw
                        .into_iter()
                        .map(|r| CollectedRecord::from_raw(r, source, now))
                        .collect();
                    let checkpoint =
                        self.sessions
                            .checkpoint(session_id, &unit.id, &records, source)?;
                    self.emit(CollectionEvent::Checkpointed {
                        sequence: checkpoint.sequence,
                        completed: checkpoint.completed_work_unit_ids.len(),
                    });
                    self.emit(CollectionEvent::UnitCompleted {
                        unit_id: unit.id.clone(),
                        via: source.to_string(),
                        records: records.len(),
                    });
                    return Ok(UnitOutcome::Completed);
                }
                Err(HarvestError::Cancelled) => {
                    self.sessions.requeue(session_id, &unit.id)?;
                    self.emit(CollectionEvent::UnitRequeued {
                        unit_id: unit.id.clone(),
                        reason: "cancelled".into(),
                    });
                    return Ok(UnitOutcome::Requeued);
                }
                Err(
                    e @ (HarvestError::SourceOffline { .. } | HarvestError::SourceRejected { .. }),
                ) => {
                    warn!(unit = %unit.id, source = %source, error = %e, "source unavailable for unit");
                    last_error = e.to_string();
                }
                Err(e) if e.is_unit_level() => {
                    last_error = e.to_string();
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        warn!(unit = %unit.id, error = %last_error, "work unit failed");
        self.sessions.mark_failed(session_id, &unit.id, &last_error)?;
        self.emit(CollectionEvent::UnitFailed {
            unit_id: unit.id.clone(),
            error: last_error,
        });
        Ok(UnitOutcome::Failed)
    }

    /// Query one source for the unit, retrying transient failures.
    async fn collect(
        &self,
        session_id: &str,
        unit: &WorkUnit,
        source: &str,
        adapter: &A,
        signal: &ShutdownSignal,
    ) -> Result<Vec<RawRecord>> {
        let query = unit.query_for(source, self.config.max_results_per_query);
        let mut retries = 0;
        loop {
            let admission = self.limiter.acquire(source, signal).await?;
            if admission.probe {
                debug!(unit = %unit.id, source = %source, "request is a recovery probe");
            }

            let err = match adapter.search(&query).await {
                Ok(records) => {
                    self.observe(source, Outcome::Success);
                    debug!(unit = %unit.id, source = %source, records = records.len(), "search succeeded");
                    return Ok(records);
                }
                Err(err) => err,
            };

            let outcome = match &err {
                CollectorError::RateLimited { .. } => Outcome::RateLimited {
                    retry_after: err.retry_after(),
                },
                // the source answered; the query is at fault
                CollectorError::Rejected(_) => Outcome::Success,
                _ => Outcome::Error,
            };
            self.observe(source, outcome);

            match err.into_harvest_error(source) {
                HarvestError::RateLimitExceeded { retry_after_ms, .. } => {
                    debug!(unit = %unit.id, source = %source, ?retry_after_ms, "rate limited, retrying");
                }
                HarvestError::TransientSource { message, .. } if retries < self.config.max_retries => {
                    retries += 1;
                    warn!(
                        unit = %unit.id,
                        source = %source,
                        attempt = retries,
                        max = self.config.max_retries,
                        error = %message,
                        "transient failure, retrying"
                    );
                    self.sessions.record_retry(session_id, &unit.id, &message)?;
                }
                other => return Err(other),
            }
        }
    }
}

pub struct CollectionOrchestrator<A: CollectorAdapter, S: StateStore + 'static = FsStore> {
    worker: UnitWorker<A, S>,
    recovery: InterruptionRecoverySystem<S>,
    dedup: Deduplicator,
    shutdown: Shutdown,
}

impl<A: CollectorAdapter, S: StateStore + 'static> CollectionOrchestrator<A, S> {
    pub fn new(config: Arc<HarvestConfig>, adapters: HashMap<String, A>, store: S) -> Self {
        let sessions = Arc::new(SessionStateManager::new(store));
        Self {
            recovery: InterruptionRecoverySystem::new(Arc::clone(&sessions), &config),
            dedup: Deduplicator::from_config(&config),
            worker: UnitWorker {
                limiter: Arc::new(RateLimitManager::new(Arc::clone(&config))),
                adapters: Arc::new(adapters),
                sessions,
                events: None,
                config,
            },
            shutdown: Shutdown::new(),
        }
    }

    /// Publish progress on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<CollectionEvent>) -> Self {
        self.worker.events = Some(tx);
        self
    }

    /// Handle that stops this orchestrator's runs. Once triggered it stays
    /// triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn sessions(&self) -> &SessionStateManager<S> {
        &self.worker.sessions
    }

    pub fn recovery(&self) -> &InterruptionRecoverySystem<S> {
        &self.recovery
    }

    pub async fn start_collection(&self, plan: WorkPlan) -> Result<CollectionReport> {
        if let Some(unit) = plan
            .units()
            .iter()
            .find(|u| !self.worker.adapters.contains_key(&u.source))
        {
            return Err(HarvestError::InvalidPlan(format!(
                "no collector registered for source {}",
                unit.source
            )));
        }

        let session_id = self.worker.sessions.create_session(plan)?;
        let pending: Vec<WorkUnit> = self.worker.sessions.session(&session_id)?.work_plan;
        info!(session = %session_id, units = pending.len(), workers = self.worker.config.workers, "collection started");
        self.run(&session_id, pending, None).await
    }

    /// Validate an interrupted session and continue it.
    pub async fn resume_collection(&self, session_id: &str) -> Result<CollectionReport> {
        let report = self.recovery.validate_recovery(session_id)?;
        let recommendations = self.recovery.generate_recommendations(&report);
        if !report.success {
            return Err(HarvestError::DataIntegrity {
                session_id: session_id.to_string(),
                integrity_score: report.integrity_score,
                recommendations,
            });
        }
        self.worker.emit(CollectionEvent::RecoveryValidated {
            report: Box::new(report.clone()),
            recommendations,
        });

        let state = self.worker.sessions.resume_session(session_id)?;
        for unit_id in &state.in_doubt {
            self.worker.emit(CollectionEvent::UnitRequeued {
                unit_id: unit_id.clone(),
                reason: "in progress when the session stopped".into(),
            });
        }
        info!(
            session = %session_id,
            pending = state.pending.len(),
            completed = state.completed.len(),
            "collection resumed"
        );
        self.run(session_id, state.pending, Some(report)).await
    }

    pub fn get_status(&self, session_id: &str) -> Result<StatusReport> {
        let sessions = &self.worker.sessions;
        let session = sessions.session(session_id)?;
        let status = if session.status == SessionStatus::Active && !sessions.is_owned(session_id) {
            SessionStatus::Interrupted
        } else {
            session.status
        };
        Ok(StatusReport {
            session_id: session.session_id.clone(),
            status,
            counts: session.counts(),
            health: self.worker.limiter.snapshot(),
            last_checkpoint: session.last_checkpoint_ref.clone(),
            degraded_sources: session.degraded_sources,
        })
    }

    async fn run(
        &self,
        session_id: &str,
        pending: Vec<WorkUnit>,
        recovery: Option<RecoveryReport>,
    ) -> Result<CollectionReport> {
        let signal = self.shutdown.signal();
        let semaphore = Arc::new(Semaphore::new(self.worker.config.workers));
        let mut queue: VecDeque<WorkUnit> = pending
            .into_iter()
            .filter(|u| u.status == UnitStatus::Pending)
            .collect();
        let mut tasks: JoinSet<(String, Result<UnitOutcome>)> = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut tally = Tally::default();

        while let Some(unit) = queue.pop_front() {
            if signal.is_cancelled() || tally.halted.is_some() {
                queue.push_front(unit);
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = signal.cancelled() => {
                    queue.push_front(unit);
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            while let Some(joined) = tasks.try_join_next() {
                self.settle(session_id, joined, &mut in_flight, &mut tally);
            }
            if tally.halted.is_some() {
                queue.push_front(unit);
                break;
            }

            let worker = self.worker.clone();
            let unit_signal = signal.clone();
            let sid = session_id.to_string();
            in_flight.insert(unit.id.clone());
            tasks.spawn(async move {
                let _permit = permit;
                let unit_id = unit.id.clone();
                let outcome = worker.process(&sid, unit, &unit_signal).await;
                (unit_id, outcome)
            });
        }

        // everything is dispatched; a late cancellation still only gets the grace period
        while !signal.is_cancelled() {
            tokio::select! {
                biased;
                _ = signal.cancelled() => break,
                joined = tasks.join_next() => match joined {
                    Some(joined) => self.settle(session_id, joined, &mut in_flight, &mut tally),
                    None => break,
                },
            }
        }

        if signal.is_cancelled() && !tasks.is_empty() {
            let grace = self.worker.config.shutdown_grace();
            info!(
                session = %session_id,
                in_flight = tasks.len(),
                grace_secs = grace.as_secs(),
                "shutdown requested, waiting for in-flight units"
            );
            let drained = tokio::time::timeout(grace, async {
                while let Some(joined) = tasks.join_next().await {
                    self.settle(session_id, joined, &mut in_flight, &mut tally);
                }
            })
            .await;
            if drained.is_err() {
                warn!(session = %session_id, remaining = tasks.len(), "grace period elapsed, aborting units");
                tasks.abort_all();
            }
        }
        while let Some(joined) = tasks.join_next().await {
            self.settle(session_id, joined, &mut in_flight, &mut tally);
        }

        // whatever never reported back was aborted or panicked
        for unit_id in in_flight {
            match self.worker.sessions.requeue(session_id, &unit_id) {
                // aborted before it was marked in progress
                Ok(()) | Err(HarvestError::InvalidTransition { .. }) => {}
                Err(e) => {
                    tally.halted.get_or_insert(e);
                }
            }
            self.worker.emit(CollectionEvent::UnitRequeued {
                unit_id,
                reason: "aborted before finishing".into(),
            });
            tally.requeued += 1;
        }

        self.finish(session_id, tally, recovery)
    }

    fn settle(
        &self,
        session_id: &str,
        joined: std::result::Result<(String, Result<UnitOutcome>), JoinError>,
        in_flight: &mut HashSet<String>,
        tally: &mut Tally,
    ) {
        let (unit_id, outcome) = match joined {
            Ok(done) => done,
            Err(join_err) => {
                if join_err.is_panic() {
                    error!(session = %session_id, error = %join_err, "worker panicked");
                }
                return;
            }
        };
        in_flight.remove(&unit_id);
        match outcome {
            Ok(UnitOutcome::Completed) => tally.completed += 1,
            Ok(UnitOutcome::Failed) => tally.failed += 1,
            Ok(UnitOutcome::Requeued) => tally.requeued += 1,
            Err(e) => {
                error!(session = %session_id, unit = %unit_id, error = %e, "halting dispatch");
                tally.halted.get_or_insert(e);
            }
        }
    }

    fn finish(
        &self,
        session_id: &str,
        tally: Tally,
        recovery: Option<RecoveryReport>,
    ) -> Result<CollectionReport> {
        let sessions = &self.worker.sessions;
        let degraded_sources = self.worker.limiter.degraded_sources();

        if let Some(err) = tally.halted {
            match sessions.finalize(session_id, SessionStatus::Interrupted, degraded_sources) {
                Ok(checkpoint) => info!(session = %session_id, sequence = checkpoint.sequence, "final checkpoint written after halt"),
                Err(e) => error!(session = %session_id, error = %e, "final checkpoint failed"),
            }
            return Err(err);
        }

        let counts = sessions.session(session_id)?.counts();
        let status = if counts.pending + counts.in_progress > 0 {
            SessionStatus::Paused
        } else {
            SessionStatus::Completed
        };
        let checkpoint = sessions.finalize(session_id, status, degraded_sources.clone())?;
        self.worker.emit(CollectionEvent::Checkpointed {
            sequence: checkpoint.sequence,
            completed: checkpoint.completed_work_unit_ids.len(),
        });

        let records = sessions.load_records(session_id, None)?;
        let merged = self.dedup.merge(records);
        sessions.write_corpus(session_id, &merged)?;

        let session = sessions.session(session_id)?;
        let integrity = recovery.as_ref().map_or(1.0, |r| r.integrity_score);
        let recommendations = recovery
            .as_ref()
            .map(|r| self.recovery.generate_recommendations(r))
            .unwrap_or_default();
        let degradation = self
            .recovery
            .verify_graceful_degradation(&self.worker.limiter.snapshot(), integrity);

        info!(
            session = %session_id,
            %status,
            completed = tally.completed,
            failed = tally.failed,
            requeued = tally.requeued,
            corpus = merged.len(),
            %degradation,
            "collection finished"
        );

        Ok(CollectionReport {
            session_id: session_id.to_string(),
            status,
            counts: session.counts(),
            completed_this_run: tally.completed,
            failed_this_run: tally.failed,
            requeued: tally.requeued,
            failed_units: session
                .work_plan
                .iter()
                .filter(|u| u.status == UnitStatus::Failed)
                .map(UnitRef::from)
                .collect(),
            degraded_sources,
            corpus_records: merged.len(),
            degradation,
            recovery,
            recommendations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::work::SearchQuery;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Clone, Copy)]
    enum Mode {
        Records(usize),
        Offline,
        Transient,
        /// Fail transiently `n` times, then return one record.
        FlakyThenOk(u32),
        /// Push back with 429 `n` times, then return one record.
        RateLimitedThenOk(u32),
        Slow(Duration),
    }

    struct MockSource {
        mode: Mode,
        calls: AtomicU32,
    }

    impl MockSource {
        fn new(mode: Mode) -> Self {
            Self {
                mode,
                calls: AtomicU32::new(0),
            }
        }
    }

    fn titles(query: &SearchQuery, n: usize) -> Vec<RawRecord> {
        (0..n)
            .map(|i| {
                RawRecord::new(format!("{} {:?} paper {i}", query.terms, query.year))
                    .with_field("queried", serde_json::json!(query.source))
            })
            .collect()
    }

    impl CollectorAdapter for MockSource {
        async fn search(&self, query: &SearchQuery) -> std::result::Result<Vec<RawRecord>, CollectorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                Mode::Records(n) => Ok(titles(query, n)),
                Mode::Offline => Err(CollectorError::Offline("HTTP 403".into())),
                Mode::Transient => Err(CollectorError::Transient("HTTP 503".into())),
                Mode::FlakyThenOk(n) if call < n => Err(CollectorError::Transient("HTTP 502".into())),
                Mode::RateLimitedThenOk(n) if call < n => Err(CollectorError::RateLimited {
                    retry_after_ms: Some(500),
                }),
                Mode::FlakyThenOk(_) | Mode::RateLimitedThenOk(_) => Ok(titles(query, 1)),
                Mode::Slow(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(titles(query, 1))
                }
            }
        }
    }

    fn config(tweak: impl FnOnce(&mut HarvestConfig)) -> Arc<HarvestConfig> {
        let mut config = HarvestConfig::default();
        config.backoff.base_delay_ms = 100;
        config.backoff.max_delay_ms = 1_000;
        config.defaults.max_requests = 1_000;
        tweak(&mut config);
        Arc::new(config)
    }

    fn plan(sources: &[&str], years: &[u16]) -> WorkPlan {
        let sources: Vec<String> = sources.iter().map(|s| s.to_string()).collect();
        WorkPlan::grid(&sources, &["robotics".to_string()], years).unwrap()
    }

    fn orchestrator(
        dir: &TempDir,
        config: Arc<HarvestConfig>,
        sources: Vec<(&str, Mode)>,
    ) -> CollectionOrchestrator<MockSource> {
        let adapters = sources
            .into_iter()
            .map(|(name, mode)| (name.to_string(), MockSource::new(mode)))
            .collect();
        CollectionOrchestrator::new(config, adapters, FsStore::new(dir.path()))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<CollectionEvent>) -> Vec<CollectionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn completes_every_unit_and_writes_merged_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let orch = orchestrator(
            &dir,
            config(|_| {}),
            vec![("arxiv", Mode::Records(3)), ("crossref", Mode::Records(3))],
        )
        .with_events(tx);

        let report = orch
            .start_collection(plan(&["arxiv", "crossref"], &[2021, 2022]))
            .await
            .unwrap();

        assert_eq!(report.status, SessionStatus::Completed);
        assert_eq!(report.counts.completed, 4);
        assert_eq!(report.completed_this_run, 4);
        assert_eq!(report.failed_this_run, 0);
        // both sources return the same three titles per year
        assert_eq!(report.corpus_records, 6);
        assert_eq!(report.degradation, Degradation::Healthy);

        let corpus_path = dir
            .path()
            .join("sessions")
            .join(&report.session_id)
            .join("corpus.json");
        let corpus: Vec<CollectedRecord> =
            serde_json::from_slice(&std::fs::read(corpus_path).unwrap()).unwrap();
        assert_eq!(corpus.len(), 6);
        assert!(corpus.iter().all(|r| r.sources.len() == 2));

        let events = drain(&mut rx);
        let completed = events
            .iter()
            .filter(|e| matches!(e, CollectionEvent::UnitCompleted { .. }))
            .count();
        assert_eq!(completed, 4);
        assert!(events.iter().any(|e| matches!(e, CollectionEvent::Checkpointed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn offline_source_falls_back_for_every_unit() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(|c| {
            c.sources.insert(
                "scholar".into(),
                SourceConfig {
                    fallback: vec!["openalex".into()],
                    ..Default::default()
                },
            );
            c.sources.insert("openalex".into(), SourceConfig::default());
        });
        let orch = orchestrator(
            &dir,
            cfg,
            vec![("scholar", Mode::Offline), ("openalex", Mode::Records(2))],
        );

        let report = orch
            .start_collection(plan(&["scholar"], &[2018, 2019, 2020, 2021]))
            .await
            .unwrap();

        assert_eq!(report.counts.completed, 4);
        assert_eq!(report.counts.failed, 0);
        assert!(report.failed_units.is_empty());
        let session = orch.sessions().session(&report.session_id).unwrap();
        assert!(session
            .work_plan
            .iter()
            .all(|u| u.completed_via.as_deref() == Some("openalex")));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_retries_without_aborting_session() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            &dir,
            config(|c| c.max_retries = 2),
            vec![("dblp", Mode::Transient), ("arxiv", Mode::Records(1))],
        );

        let report = orch
            .start_collection(plan(&["dblp", "arxiv"], &[2020]))
            .await
            .unwrap();

        assert_eq!(report.status, SessionStatus::Completed);
        assert_eq!(report.counts.completed, 1);
        assert_eq!(report.counts.failed, 1);
        let failed = &report.failed_units[0];
        assert_eq!(failed.id, "dblp/robotics:2020");
        assert!(failed.last_error.as_deref().unwrap().contains("HTTP 503"));
        assert_eq!(orch.worker.adapters["dblp"].calls.load(Ordering::SeqCst), 3);

        let session = orch.sessions().session(&report.session_id).unwrap();
        assert_eq!(session.unit("dblp/robotics:2020").unwrap().retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_source_recovers_within_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            &dir,
            config(|c| c.max_retries = 3),
            vec![("crossref", Mode::FlakyThenOk(2))],
        );
        let report = orch
            .start_collection(plan(&["crossref"], &[2019]))
            .await
            .unwrap();
        assert_eq!(report.counts.completed, 1);
        assert_eq!(report.failed_this_run, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_do_not_consume_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            &dir,
            config(|c| c.max_retries = 0),
            vec![("arxiv", Mode::RateLimitedThenOk(2))],
        );
        let started = tokio::time::Instant::now();
        let report = orch
            .start_collection(plan(&["arxiv"], &[2023]))
            .await
            .unwrap();
        assert_eq!(report.counts.completed, 1);
        // each 429 asked for 500ms
        assert!(started.elapsed() >= Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_pauses_and_resume_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(|c| {
            c.workers = 1;
            c.shutdown_grace_secs = 1;
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let orch = orchestrator(
            &dir,
            Arc::clone(&cfg),
            vec![("arxiv", Mode::Slow(Duration::from_secs(10)))],
        )
        .with_events(tx);

        let shutdown = orch.shutdown_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            shutdown.trigger();
        });

        let report = orch
            .start_collection(plan(&["arxiv"], &[2001, 2002, 2003]))
            .await
            .unwrap();
        assert_eq!(report.status, SessionStatus::Paused);
        assert_eq!(report.counts.pending, 3);
        assert_eq!(report.counts.in_progress, 0);
        assert_eq!(report.requeued, 1);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, CollectionEvent::UnitRequeued { unit_id, .. } if unit_id == "arxiv/robotics:2001")));

        let resumed = orchestrator(&dir, cfg, vec![("arxiv", Mode::Records(1))]);
        let status = resumed.get_status(&report.session_id).unwrap();
        assert_eq!(status.status, SessionStatus::Paused);

        let report = resumed.resume_collection(&report.session_id).await.unwrap();
        assert_eq!(report.status, SessionStatus::Completed);
        assert_eq!(report.counts.completed, 3);
        let recovery = report.recovery.unwrap();
        assert_eq!(recovery.data_loss_percentage, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_cancellation_still_honours_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(|c| {
            c.workers = 4;
            c.shutdown_grace_secs = 1;
        });
        let orch = orchestrator(
            &dir,
            cfg,
            vec![("arxiv", Mode::Slow(Duration::from_secs(600)))],
        );

        let shutdown = orch.shutdown_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            shutdown.trigger();
        });

        let started = tokio::time::Instant::now();
        let report = orch.start_collection(plan(&["arxiv"], &[2020])).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(report.status, SessionStatus::Paused);
        assert_eq!(report.completed_this_run, 0);
        assert_eq!(report.requeued, 1);
        assert_eq!(report.counts.pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_after_kill_requeues_in_doubt_units() {
        let dir = tempfile::tempdir().unwrap();
        let p = plan(&["arxiv"], &[2010, 2011, 2012, 2013]);
        let ids: Vec<String> = p.units().iter().map(|u| u.id.clone()).collect();
        let session_id = {
            let sessions = SessionStateManager::new(FsStore::new(dir.path()));
            let id = sessions.create_session(p).unwrap();
            for unit in &ids[..2] {
                sessions.mark_in_progress(&id, unit).unwrap();
                let rec = CollectedRecord::from_raw(RawRecord::new(unit.as_str()), "arxiv", Utc::now());
                sessions.checkpoint(&id, unit, &[rec], "arxiv").unwrap();
            }
            sessions.mark_in_progress(&id, &ids[2]).unwrap();
            id
        };

        let orch = orchestrator(&dir, config(|_| {}), vec![("arxiv", Mode::Records(1))]);
        assert_eq!(
            orch.get_status(&session_id).unwrap().status,
            SessionStatus::Interrupted
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let orch = orch.with_events(tx);
        let report = orch.resume_collection(&session_id).await.unwrap();

        let recovery = report.recovery.as_ref().unwrap();
        assert_eq!(recovery.data_loss_percentage, 25.0);
        assert!(!report.recommendations.is_empty());
        // the validation is published before the first unit starts
        let events = drain(&mut rx);
        match &events[0] {
            CollectionEvent::RecoveryValidated {
                report: validated,
                recommendations,
            } => {
                assert_eq!(validated.as_ref(), recovery);
                assert_eq!(recommendations, &report.recommendations);
            }
            other => panic!("expected the recovery report first, got {other:?}"),
        }
        assert!(!events[1..]
            .iter()
            .any(|e| matches!(e, CollectionEvent::RecoveryValidated { .. })));
        assert_eq!(recovery.in_doubt_units[0].id, ids[2]);
        assert_eq!(report.completed_this_run, 2);
        assert_eq!(report.counts.completed, 4);
        assert_eq!(report.corpus_records, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecoverable_session_surfaces_recommendations() {
        let dir = tempfile::tempdir().unwrap();
        let p = plan(&["arxiv"], &[2015]);
        let unit = p.units()[0].id.clone();
        let session_id = {
            let sessions = SessionStateManager::new(FsStore::new(dir.path()));
            let id = sessions.create_session(p).unwrap();
            sessions.mark_in_progress(&id, &unit).unwrap();
            sessions.checkpoint(&id, &unit, &[], "arxiv").unwrap();
            id
        };
        std::fs::write(
            dir.path()
                .join("sessions")
                .join(&session_id)
                .join("checkpoints/checkpoint-000001.json"),
            b"not json",
        )
        .unwrap();

        let orch = orchestrator(&dir, config(|_| {}), vec![("arxiv", Mode::Records(1))]);
        match orch.resume_collection(&session_id).await {
            Err(HarvestError::DataIntegrity {
                recommendations, ..
            }) => assert!(!recommendations.is_empty()),
            other => panic!("expected DataIntegrity, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn plan_with_unknown_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir, config(|_| {}), vec![("arxiv", Mode::Records(1))]);
        let err = orch
            .start_collection(plan(&["pubmed"], &[2020]))
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::InvalidPlan(_)));
    }
}
