use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::work::{UnitStatus, WorkUnit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Interrupted,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Paused => write!(f, "paused"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Interrupted => write!(f, "interrupted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub sequence: u64,
    pub file: String,
    pub timestamp: DateTime<Utc>,
}

/// Durable record of one collection run, stored as `session.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub work_plan: Vec<WorkUnit>,
    #[serde(default)]
    pub last_checkpoint_ref: Option<String>,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointRef>,
    #[serde(default)]
    pub degraded_sources: Vec<String>,
}

impl Session {
    pub fn counts(&self) -> UnitCounts {
        UnitCounts::of(&self.work_plan)
    }

    pub fn unit(&self, unit_id: &str) -> Option<&WorkUnit> {
        self.work_plan.iter().find(|u| u.id == unit_id)
    }
}

/// Immutable snapshot of completed work. Never rewritten once on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub completed_work_unit_ids: BTreeSet<String>,
    pub record_count_at_checkpoint: u64,
}

/// Checkpoints skipped while looking for a valid one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointGap {
    pub discarded: Vec<u64>,
    /// Units believed complete that the surviving checkpoint does not cover.
    pub reprocessed_units: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCounts {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl UnitCounts {
    pub fn of(units: &[WorkUnit]) -> Self {
        let mut counts = UnitCounts {
            total: units.len(),
            ..Default::default()
        };
        for unit in units {
            match unit.status {
                UnitStatus::Pending => counts.pending += 1,
                UnitStatus::InProgress => counts.in_progress += 1,
                UnitStatus::Completed => counts.completed += 1,
                UnitStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub counts: UnitCounts,
}

/// Read-only reconciliation of a session against its checkpoints.
#[derive(Debug, Clone)]
pub struct SessionView {
    /// `session.json` exactly as stored.
    pub session: Session,
    /// Stored status, with `active` reported as `interrupted` when no live
    /// manager owns the session.
    pub status: SessionStatus,
    pub checkpoint: Option<Checkpoint>,
    /// Unit states after applying the checkpoint and re-queueing in-doubt work.
    pub units: Vec<WorkUnit>,
    pub in_doubt: Vec<String>,
    pub gap: Option<CheckpointGap>,
    /// Set when checkpoints exist but none passes validation.
    pub corrupt: Option<String>,
}

impl SessionView {
    pub fn expected_records(&self) -> u64 {
        self.checkpoint
            .as_ref()
            .map_or(0, |c| c.record_count_at_checkpoint)
    }

    pub fn failed_units(&self) -> Vec<&WorkUnit> {
        self.units
            .iter()
            .filter(|u| u.status == UnitStatus::Failed)
            .collect()
    }
}

/// What a resumed run still has to do.
#[derive(Debug, Clone)]
pub struct ResumeState {
    pub session: Session,
    pub pending: Vec<WorkUnit>,
    pub completed: BTreeSet<String>,
    pub failed: Vec<WorkUnit>,
    pub in_doubt: Vec<String>,
    pub gap: Option<CheckpointGap>,
    pub checkpoint: Option<Checkpoint>,
    /// Record log lines dropped because no checkpoint covered them.
    pub records_dropped: usize,
}
