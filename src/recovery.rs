//! Post-interruption validation.
//!
//! Before a stopped session is resumed, [`InterruptionRecoverySystem`]
//! measures how much work is in doubt, checks the record log against the
//! newest valid checkpoint and decides whether resuming is safe.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::HarvestConfig;
use crate::dedup::CollectedRecord;
use crate::error::Result;
use crate::rate_limit::Health;
use crate::session::{CheckpointGap, SessionStateManager, StateStore};
use crate::work::WorkUnit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Resumable,
    /// Resume is possible but some work will be repeated or was lost.
    PartiallyResumable,
    /// Needs an operator before anything else runs.
    Unrecoverable,
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryState::Resumable => write!(f, "resumable"),
            RecoveryState::PartiallyResumable => write!(f, "partially resumable"),
            RecoveryState::Unrecoverable => write!(f, "unrecoverable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
    Healthy,
    Degraded,
    Failed,
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Degradation::Healthy => write!(f, "healthy"),
            Degradation::Degraded => write!(f, "degraded"),
            Degradation::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitRef {
    pub id: String,
    pub source: String,
    pub partition: String,
    pub last_error: Option<String>,
}

impl From<&WorkUnit> for UnitRef {
    fn from(unit: &WorkUnit) -> Self {
        Self {
            id: unit.id.clone(),
            source: unit.source.clone(),
            partition: unit.partition.key(),
            last_error: unit.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub session_id: String,
    pub success: bool,
    pub state: RecoveryState,
    /// Share of the plan, in percent, whose progress was lost.
    pub data_loss_percentage: f64,
    pub integrity_score: f64,
    pub total_units: usize,
    pub completed_units: usize,
    pub in_doubt_units: Vec<UnitRef>,
    pub failed_units: Vec<UnitRef>,
    pub gap: Option<CheckpointGap>,
    pub expected_records: u64,
    pub actual_records: u64,
    /// Why no checkpoint could be used, when none could.
    pub corrupt: Option<String>,
}

pub struct InterruptionRecoverySystem<S: StateStore> {
    sessions: Arc<SessionStateManager<S>>,
    integrity_floor: f64,
}

impl<S: StateStore> InterruptionRecoverySystem<S> {
    pub fn new(sessions: Arc<SessionStateManager<S>>, config: &HarvestConfig) -> Self {
        Self {
            sessions,
            integrity_floor: config.recovery.integrity_floor,
        }
    }

    pub fn validate_recovery(&self, session_id: &str) -> Result<RecoveryReport> {
        let view = self.sessions.inspect(session_id)?;
        let units_by_id: BTreeMap<&str, &WorkUnit> =
            view.units.iter().map(|u| (u.id.as_str(), u)).collect();

        let total_units = view.units.len();
        let data_loss_percentage = if total_units == 0 {
            0.0
        } else {
            100.0 * view.in_doubt.len() as f64 / total_units as f64
        };

        let expected_records = view.expected_records();
        let records = self
            .sessions
            .load_records(session_id, Some(expected_records))?;
        let integrity_score = Self::measure_data_integrity(expected_records, &records);

        let state = if view.corrupt.is_some() || integrity_score < self.integrity_floor {
            RecoveryState::Unrecoverable
        } else if view.gap.is_some() || !view.in_doubt.is_empty() || integrity_score < 1.0 {
            RecoveryState::PartiallyResumable
        } else {
            RecoveryState::Resumable
        };

        let report = RecoveryReport {
            session_id: session_id.to_string(),
            success: state != RecoveryState::Unrecoverable,
            state,
            data_loss_percentage,
            integrity_score,
            total_units,
            completed_units: view
                .checkpoint
                .as_ref()
                .map_or(0, |c| c.completed_work_unit_ids.len()),
            in_doubt_units: view
                .in_doubt
                .iter()
                .filter_map(|id| units_by_id.get(id.as_str()).map(|u| UnitRef::from(*u)))
                .collect(),
            failed_units: view.failed_units().into_iter().map(UnitRef::from).collect(),
            gap: view.gap.clone(),
            expected_records,
            actual_records: records.len() as u64,
            corrupt: view.corrupt.clone(),
        };

        if report.success {
            info!(
                session = %session_id,
                state = %report.state,
                data_loss = report.data_loss_percentage,
                integrity = report.integrity_score,
                "recovery validated"
            );
        } else {
            warn!(
                session = %session_id,
                integrity = report.integrity_score,
                corrupt = ?report.corrupt,
                "session is not recoverable"
            );
        }
        Ok(report)
    }

    /// Fraction of the expected records that are present with an intact
    /// fingerprint, capped at 1. An empty expectation is fully intact.
    pub fn measure_data_integrity(expected: u64, records: &[CollectedRecord]) -> f64 {
        if expected == 0 {
            return 1.0;
        }
        let valid = records.iter().filter(|r| r.is_intact()).count() as f64;
        (valid / expected as f64).min(1.0)
    }

    pub fn verify_graceful_degradation(
        &self,
        health: &BTreeMap<String, Health>,
        integrity_score: f64,
    ) -> Degradation {
        let offline = health.values().filter(|h| **h == Health::Offline).count();
        if integrity_score < self.integrity_floor || offline * 2 > health.len() {
            Degradation::Failed
        } else if integrity_score < 1.0 || health.values().any(|h| *h != Health::Healthy) {
            Degradation::Degraded
        } else {
            Degradation::Healthy
        }
    }

    pub fn generate_recommendations(&self, report: &RecoveryReport) -> Vec<String> {
        let id = &report.session_id;
        let mut out = Vec::new();

        if let Some(reason) = &report.corrupt {
            out.push(format!(
                "No usable checkpoint for session {id} ({reason}); restore the checkpoints directory from backup or start a new session"
            ));
        }
        if report.corrupt.is_none() && report.integrity_score < self.integrity_floor {
            out.push(format!(
                "Record log integrity is {:.0}% (floor {:.0}%); inspect records.jsonl before resuming or start a new session",
                report.integrity_score * 100.0,
                self.integrity_floor * 100.0
            ));
        }
        if let Some(gap) = &report.gap {
            out.push(format!(
                "Discarded checkpoint(s) {:?} ({}); {} unit(s) will be collected again",
                gap.discarded,
                gap.reason,
                gap.reprocessed_units.len()
            ));
        }
        if report.actual_records < report.expected_records {
            out.push(format!(
                "{} of {} checkpointed records are missing or unreadable",
                report.expected_records - report.actual_records,
                report.expected_records
            ));
        }
        for unit in &report.in_doubt_units {
            out.push(format!(
                "Re-run unit {} (source {}, partition {}); it was in progress when the session stopped",
                unit.id, unit.source, unit.partition
            ));
        }
        for unit in &report.failed_units {
            out.push(format!(
                "Unit {} (source {}, partition {}) failed: {}; fix the cause and run `harvest requeue {id}`",
                unit.id,
                unit.source,
                unit.partition,
                unit.last_error.as_deref().unwrap_or("unknown error")
            ));
        }
        if report.success {
            out.push(format!("Resume with `harvest resume {id}`"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{FsStore, SessionStatus};
    use crate::source::RawRecord;
    use crate::work::{Partition, WorkPlan};
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        ids: Vec<String>,
    }

    impl Fixture {
        fn new(units: u16) -> Self {
            let plan: Vec<WorkUnit> = (0..units)
                .map(|i| WorkUnit::new("crossref", Partition::new("physics", Some(1990 + i))))
                .collect();
            let ids = plan.iter().map(|u| u.id.clone()).collect();
            Self {
                dir: tempfile::tempdir().unwrap(),
                ids,
            }
        }

        fn plan(&self) -> WorkPlan {
            WorkPlan::new(
                (0..self.ids.len() as u16)
                    .map(|i| WorkUnit::new("crossref", Partition::new("physics", Some(1990 + i))))
                    .collect(),
            )
            .unwrap()
        }

        fn manager(&self) -> Arc<SessionStateManager> {
            Arc::new(SessionStateManager::new(FsStore::new(self.dir.path())))
        }

        fn recovery(&self) -> InterruptionRecoverySystem<FsStore> {
            InterruptionRecoverySystem::new(self.manager(), &HarvestConfig::default())
        }
    }

    fn complete(m: &SessionStateManager, id: &str, unit: &str, n: usize) {
        m.mark_in_progress(id, unit).unwrap();
        let records: Vec<CollectedRecord> = (0..n)
            .map(|i| {
                CollectedRecord::from_raw(
                    RawRecord::new(format!("{unit} result {i}")),
                    "crossref",
                    Utc::now(),
                )
            })
            .collect();
        m.checkpoint(id, unit, &records, "crossref").unwrap();
    }

    #[test]
    fn kill_between_checkpoints_reports_in_flight_fraction() {
        let fx = Fixture::new(10);
        let id = {
            let m = fx.manager();
            let id = m.create_session(fx.plan()).unwrap();
            for unit in &fx.ids[..4] {
                complete(&m, &id, unit, 2);
            }
            m.mark_in_progress(&id, &fx.ids[4]).unwrap();
            m.mark_in_progress(&id, &fx.ids[5]).unwrap();
            id
        };

        let report = fx.recovery().validate_recovery(&id).unwrap();
        assert!(report.success);
        assert_eq!(report.state, RecoveryState::PartiallyResumable);
        assert!((report.data_loss_percentage - 20.0).abs() < f64::EPSILON);
        assert_eq!(report.integrity_score, 1.0);
        assert_eq!(report.completed_units, 4);
        assert_eq!(report.expected_records, 8);
        assert_eq!(report.actual_records, 8);
        let in_doubt: Vec<&str> = report.in_doubt_units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(in_doubt, vec![fx.ids[4].as_str(), fx.ids[5].as_str()]);

        let recs = fx.recovery().generate_recommendations(&report);
        assert!(recs.iter().any(|r| r.contains(&fx.ids[4]) && r.contains("physics:1994")));
    }

    #[test]
    fn clean_session_is_resumable() {
        let fx = Fixture::new(2);
        let m = fx.manager();
        let id = m.create_session(fx.plan()).unwrap();
        complete(&m, &id, &fx.ids[0], 1);
        m.finalize(&id, SessionStatus::Paused, Vec::new()).unwrap();

        let recovery = fx.recovery();
        let report = recovery.validate_recovery(&id).unwrap();
        assert_eq!(report.state, RecoveryState::Resumable);
        assert_eq!(report.data_loss_percentage, 0.0);
        let recs = recovery.generate_recommendations(&report);
        assert_eq!(recs, vec![format!("Resume with `harvest resume {id}`")]);
    }

    #[test]
    fn missing_records_below_floor_are_unrecoverable() {
        let fx = Fixture::new(2);
        let id = {
            let m = fx.manager();
            let id = m.create_session(fx.plan()).unwrap();
            complete(&m, &id, &fx.ids[0], 4);
            id
        };
        let log = fx.dir.path().join("sessions").join(&id).join("records.jsonl");
        let content = std::fs::read_to_string(&log).unwrap();
        let first: String = content.lines().take(1).map(|l| format!("{l}\n")).collect();
        std::fs::write(&log, first).unwrap();

        let recovery = fx.recovery();
        let report = recovery.validate_recovery(&id).unwrap();
        assert!(!report.success);
        assert_eq!(report.state, RecoveryState::Unrecoverable);
        assert!((report.integrity_score - 0.25).abs() < 1e-9);
        let recs = recovery.generate_recommendations(&report);
        assert!(recs.iter().any(|r| r.contains("3 of 4")));
        assert!(!recs.iter().any(|r| r.starts_with("Resume with")));
    }

    #[test]
    fn corrupt_checkpoints_are_unrecoverable() {
        let fx = Fixture::new(1);
        let id = {
            let m = fx.manager();
            let id = m.create_session(fx.plan()).unwrap();
            complete(&m, &id, &fx.ids[0], 1);
            id
        };
        let cp = fx
            .dir
            .path()
            .join("sessions")
            .join(&id)
            .join("checkpoints/checkpoint-000001.json");
        std::fs::write(cp, b"[]").unwrap();

        let recovery = fx.recovery();
        let report = recovery.validate_recovery(&id).unwrap();
        assert_eq!(report.state, RecoveryState::Unrecoverable);
        assert!(report.corrupt.is_some());
        assert!(recovery.generate_recommendations(&report)[0].contains("No usable checkpoint"));
    }

    #[test]
    fn integrity_counts_only_intact_records() {
        let mut records: Vec<CollectedRecord> = (0..4)
            .map(|i| CollectedRecord::from_raw(RawRecord::new(format!("t{i}")), "a", Utc::now()))
            .collect();
        records[3].fingerprint = "0".repeat(64);
        type R = InterruptionRecoverySystem<FsStore>;
        assert_eq!(R::measure_data_integrity(0, &[]), 1.0);
        assert_eq!(R::measure_data_integrity(4, &records), 0.75);
        assert_eq!(R::measure_data_integrity(2, &records), 1.0);
    }

    #[test]
    fn degradation_levels() {
        let fx = Fixture::new(1);
        let recovery = fx.recovery();
        let snapshot = |levels: &[Health]| -> BTreeMap<String, Health> {
            levels
                .iter()
                .enumerate()
                .map(|(i, h)| (format!("s{i}"), *h))
                .collect()
        };

        let all_ok = snapshot(&[Health::Healthy, Health::Healthy]);
        assert_eq!(recovery.verify_graceful_degradation(&all_ok, 1.0), Degradation::Healthy);
        assert_eq!(recovery.verify_graceful_degradation(&all_ok, 0.9), Degradation::Degraded);
        assert_eq!(recovery.verify_graceful_degradation(&all_ok, 0.4), Degradation::Failed);

        let one_critical = snapshot(&[Health::Critical, Health::Healthy, Health::Offline]);
        assert_eq!(
            recovery.verify_graceful_degradation(&one_critical, 1.0),
            Degradation::Degraded
        );

        let mostly_offline = snapshot(&[Health::Offline, Health::Offline, Health::Healthy]);
        assert_eq!(
            recovery.verify_graceful_degradation(&mostly_offline, 1.0),
            Degradation::Failed
        );
    }
}
