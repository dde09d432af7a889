//! Durable session and checkpoint management.
//!
//! One manager is the single writer for every session it owns. A session is
//! owned after `create_session` or `resume_session`; unit updates and
//! checkpoints are only accepted for owned sessions.
//!
//! A checkpoint runs in a fixed order: append the unit's records, extend the
//! completed set, write a new immutable checkpoint file, swap `CURRENT`, then
//! rewrite `session.json`. Every file replacement goes through
//! [`StateStore::write_atomic`], so a crash at any point leaves the previous
//! checkpoint intact.
//!
//! `CURRENT` names the checkpoint last committed. Recovery does not trust it
//! blindly: a crash between writing a checkpoint file and swapping `CURRENT`
//! leaves a newer checkpoint that is already durable, so candidates are
//! scanned newest-first and `CURRENT` is repointed at the one chosen.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{
    Checkpoint, CheckpointGap, CheckpointRef, ResumeState, Session, SessionStatus,
    SessionSummary, SessionView,
};
use super::store::{FsStore, StateStore};
use crate::config::{HarvestConfig, RetentionPolicy};
use crate::dedup::CollectedRecord;
use crate::error::{HarvestError, Result};
use crate::work::{UnitStatus, WorkPlan, WorkUnit};

const SESSIONS: &str = "sessions";

fn session_prefix(id: &str) -> String {
    format!("{SESSIONS}/{id}")
}

fn session_key(id: &str) -> String {
    format!("{SESSIONS}/{id}/session.json")
}

fn current_key(id: &str) -> String {
    format!("{SESSIONS}/{id}/CURRENT")
}

fn checkpoints_prefix(id: &str) -> String {
    format!("{SESSIONS}/{id}/checkpoints")
}

fn checkpoint_key(id: &str, file: &str) -> String {
    format!("{SESSIONS}/{id}/checkpoints/{file}")
}

fn records_key(id: &str) -> String {
    format!("{SESSIONS}/{id}/records.jsonl")
}

fn corpus_key(id: &str) -> String {
    format!("{SESSIONS}/{id}/corpus.json")
}

pub fn checkpoint_file(sequence: u64) -> String {
    format!("checkpoint-{sequence:06}.json")
}

fn parse_sequence(file: &str) -> Option<u64> {
    file.strip_prefix("checkpoint-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

fn new_session_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &suffix[..8])
}

fn check_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(HarvestError::SessionNotFound(id.to_string()))
    }
}

struct OwnedSession {
    session: Session,
    completed: BTreeSet<String>,
    sequence: u64,
    record_count: u64,
}

impl OwnedSession {
    fn unit_mut(&mut self, unit_id: &str) -> Result<&mut WorkUnit> {
        let session_id = &self.session.session_id;
        self.session
            .work_plan
            .iter_mut()
            .find(|u| u.id == unit_id)
            .ok_or_else(|| {
                HarvestError::InvalidPlan(format!(
                    "unit {unit_id} is not part of session {session_id}"
                ))
            })
    }
}

/// Outcome of searching the checkpoint history for the newest valid entry.
struct Reconciled {
    checkpoint: Option<Checkpoint>,
    discarded: Vec<u64>,
    highest_sequence: u64,
    reason: Option<String>,
}

pub struct SessionStateManager<S: StateStore = FsStore> {
    store: S,
    owned: Mutex<HashMap<String, OwnedSession>>,
}

impl SessionStateManager<FsStore> {
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self::new(FsStore::new(&config.state_dir))
    }
}

impl<S: StateStore> SessionStateManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            owned: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, OwnedSession>> {
        self.owned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_owned<T>(&self, id: &str, f: impl FnOnce(&mut OwnedSession) -> Result<T>) -> Result<T> {
        let mut owned = self.lock();
        let handle = owned
            .get_mut(id)
            .ok_or_else(|| HarvestError::SessionNotFound(id.to_string()))?;
        f(handle)
    }

    fn read_session(&self, id: &str) -> Result<Session> {
        check_id(id)?;
        let bytes = self
            .store
            .read(&session_key(id))?
            .ok_or_else(|| HarvestError::SessionNotFound(id.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| HarvestError::CorruptCheckpoint {
            session_id: id.to_string(),
            checkpoint: "session.json".into(),
            reason: e.to_string(),
        })
    }

    fn write_session(&self, session: &Session) -> Result<()> {
        let data = serde_json::to_vec_pretty(session)?;
        self.store.write_atomic(&session_key(&session.session_id), &data)
    }

    fn persist(&self, handle: &mut OwnedSession) -> Result<()> {
        handle.session.updated_at = Utc::now();
        self.write_session(&handle.session)
    }

    /// Start a new session for `plan`.
    pub fn create_session(&self, plan: WorkPlan) -> Result<String> {
        if plan.is_empty() {
            return Err(HarvestError::InvalidPlan("work plan is empty".into()));
        }
        let id = new_session_id();
        let now = Utc::now();
        let session = Session {
            session_id: id.clone(),
            created_at: now,
            updated_at: now,
            status: SessionStatus::Active,
            work_plan: plan.into_units(),
            last_checkpoint_ref: None,
            checkpoints: Vec::new(),
            degraded_sources: Vec::new(),
        };

        let mut owned = self.lock();
        self.write_session(&session)?;
        info!(session = %id, units = session.work_plan.len(), "session created");
        owned.insert(
            id.clone(),
            OwnedSession {
                session,
                completed: BTreeSet::new(),
                sequence: 0,
                record_count: 0,
            },
        );
        Ok(id)
    }

    pub fn mark_in_progress(&self, id: &str, unit_id: &str) -> Result<()> {
        self.with_owned(id, |h| {
            h.unit_mut(unit_id)?.transition(UnitStatus::InProgress)?;
            self.persist(h)
        })
    }

    pub fn mark_failed(&self, id: &str, unit_id: &str, error: &str) -> Result<()> {
        self.with_owned(id, |h| {
            let unit = h.unit_mut(unit_id)?;
            unit.transition(UnitStatus::Failed)?;
            unit.last_error = Some(error.to_string());
            self.persist(h)
        })
    }

    /// Count a retry against the unit. Persisted with the next write.
    pub fn record_retry(&self, id: &str, unit_id: &str, error: &str) -> Result<()> {
        self.with_owned(id, |h| {
            let unit = h.unit_mut(unit_id)?;
            unit.retry_count += 1;
            unit.last_error = Some(error.to_string());
            Ok(())
        })
    }

    /// Put an in-progress or failed unit back in the queue.
    pub fn requeue(&self, id: &str, unit_id: &str) -> Result<()> {
        self.with_owned(id, |h| {
            h.unit_mut(unit_id)?.transition(UnitStatus::Pending)?;
            self.persist(h)
        })
    }

    /// Record `unit_id` as completed together with its records.
    pub fn checkpoint(
        &self,
        id: &str,
        unit_id: &str,
        records: &[CollectedRecord],
        completed_via: &str,
    ) -> Result<Checkpoint> {
        self.with_owned(id, |h| {
            let unit = h.unit_mut(unit_id)?;
            if !unit.status.can_transition_to(UnitStatus::Completed) {
                return Err(HarvestError::InvalidTransition {
                    unit_id: unit_id.to_string(),
                    from: unit.status,
                    to: UnitStatus::Completed,
                });
            }

            if !records.is_empty() {
                let mut buf = Vec::new();
                for record in records {
                    serde_json::to_writer(&mut buf, record)?;
                    buf.push(b'\n');
                }
                self.store.append(&records_key(id), &buf)?;
            }

            let mut completed = h.completed.clone();
            completed.insert(unit_id.to_string());
            let checkpoint = Checkpoint {
                session_id: id.to_string(),
                sequence: h.sequence + 1,
                timestamp: Utc::now(),
                completed_work_unit_ids: completed,
                record_count_at_checkpoint: h.record_count + records.len() as u64,
            };

            if let Err(e) = self.commit_checkpoint(h, &checkpoint) {
                if !records.is_empty()
                    && let Err(rollback) = self.truncate_records(id, h.record_count)
                {
                    warn!(session = %id, error = %rollback, "could not roll back record log");
                }
                return Err(e);
            }

            h.completed = checkpoint.completed_work_unit_ids.clone();
            h.record_count = checkpoint.record_count_at_checkpoint;
            let unit = h.unit_mut(unit_id)?;
            unit.transition(UnitStatus::Completed)?;
            unit.completed_via = Some(completed_via.to_string());
            unit.last_error = None;
            self.persist(h)?;

            debug!(
                session = %id,
                unit = %unit_id,
                sequence = checkpoint.sequence,
                records = records.len(),
                "checkpointed"
            );
            Ok(checkpoint)
        })
    }

    /// Write the checkpoint file and swap `CURRENT` to it.
    fn commit_checkpoint(&self, h: &mut OwnedSession, checkpoint: &Checkpoint) -> Result<()> {
        let id = &checkpoint.session_id;
        let file = checkpoint_file(checkpoint.sequence);
        let data = serde_json::to_vec_pretty(checkpoint)?;
        self.store.write_atomic(&checkpoint_key(id, &file), &data)?;
        self.store.write_atomic(&current_key(id), file.as_bytes())?;

        h.sequence = checkpoint.sequence;
        h.session.last_checkpoint_ref = Some(file.clone());
        h.session.checkpoints.push(CheckpointRef {
            sequence: checkpoint.sequence,
            file,
            timestamp: checkpoint.timestamp,
        });
        Ok(())
    }

    /// Write the final checkpoint, persist `status` and release ownership.
    pub fn finalize(
        &self,
        id: &str,
        status: SessionStatus,
        degraded_sources: Vec<String>,
    ) -> Result<Checkpoint> {
        let checkpoint = self.with_owned(id, |h| {
            let checkpoint = Checkpoint {
                session_id: id.to_string(),
                sequence: h.sequence + 1,
                timestamp: Utc::now(),
                completed_work_unit_ids: h.completed.clone(),
                record_count_at_checkpoint: h.record_count,
            };
            self.commit_checkpoint(h, &checkpoint)?;
            h.session.status = status;
            h.session.degraded_sources = degraded_sources;
            self.persist(h)?;
            Ok(checkpoint)
        })?;
        if status != SessionStatus::Active {
            self.lock().remove(id);
        }
        info!(session = %id, %status, sequence = checkpoint.sequence, "session finalized");
        Ok(checkpoint)
    }

    pub fn is_owned(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Snapshot of a session: the live copy if owned, otherwise the stored one.
    pub fn session(&self, id: &str) -> Result<Session> {
        if let Some(h) = self.lock().get(id) {
            return Ok(h.session.clone());
        }
        self.read_session(id)
    }

    fn load_checkpoint(
        &self,
        id: &str,
        sequence: u64,
        plan: &HashSet<&str>,
    ) -> std::result::Result<Checkpoint, String> {
        let file = checkpoint_file(sequence);
        let bytes = match self.store.read(&checkpoint_key(id, &file)) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Err(format!("{file} is missing")),
            Err(e) => return Err(format!("{file} is unreadable: {e}")),
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| format!("{file} does not parse: {e}"))?;
        if checkpoint.session_id != id {
            return Err(format!(
                "{file} belongs to session {}",
                checkpoint.session_id
            ));
        }
        if checkpoint.sequence != sequence {
            return Err(format!(
                "{file} carries sequence {}",
                checkpoint.sequence
            ));
        }
        if let Some(unknown) = checkpoint
            .completed_work_unit_ids
            .iter()
            .find(|u| !plan.contains(u.as_str()))
        {
            return Err(format!("{file} references unknown unit {unknown}"));
        }
        Ok(checkpoint)
    }

    fn find_valid_checkpoint(&self, session: &Session) -> Result<Reconciled> {
        let id = &session.session_id;
        let plan: HashSet<&str> = session.work_plan.iter().map(|u| u.id.as_str()).collect();

        let current = self.read_current(id)?;
        let mut sequences: Vec<u64> = self
            .store
            .list(&checkpoints_prefix(id))?
            .iter()
            .filter_map(|name| parse_sequence(name))
            .chain(session.checkpoints.iter().map(|r| r.sequence))
            .chain(current)
            .collect();
        sequences.sort_unstable_by(|a, b| b.cmp(a));
        sequences.dedup();

        let mut discarded = Vec::new();
        let mut reason = None;
        let mut checkpoint = None;
        for (idx, &sequence) in sequences.iter().enumerate() {
            match self.load_checkpoint(id, sequence, &plan) {
                Ok(candidate) => {
                    let prior = sequences[idx + 1..]
                        .iter()
                        .find_map(|&s| self.load_checkpoint(id, s, &plan).ok());
                    if let Some(prior) = prior
                        && !candidate
                            .completed_work_unit_ids
                            .is_superset(&prior.completed_work_unit_ids)
                    {
                        discarded.push(sequence);
                        reason.get_or_insert(format!(
                            "{} drops units completed in {}",
                            checkpoint_file(sequence),
                            checkpoint_file(prior.sequence)
                        ));
                        continue;
                    }
                    checkpoint = Some(candidate);
                    break;
                }
                Err(why) => {
                    warn!(session = %id, sequence, reason = %why, "skipping invalid checkpoint");
                    discarded.push(sequence);
                    reason.get_or_insert(why);
                }
            }
        }

        Ok(Reconciled {
            checkpoint,
            discarded,
            highest_sequence: sequences.first().copied().unwrap_or(0),
            reason,
        })
    }

    /// Sequence named by `CURRENT`, if it exists and names a checkpoint file.
    fn read_current(&self, id: &str) -> Result<Option<u64>> {
        Ok(self
            .store
            .read(&current_key(id))?
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|name| parse_sequence(name.trim())))
    }

    fn build_view(&self, session: Session, owned: bool) -> Result<(SessionView, u64)> {
        let reconciled = self.find_valid_checkpoint(&session)?;
        let completed = reconciled
            .checkpoint
            .as_ref()
            .map(|c| c.completed_work_unit_ids.clone())
            .unwrap_or_default();

        let mut units = session.work_plan.clone();
        let mut in_doubt = Vec::new();
        let mut reprocessed = Vec::new();
        for unit in &mut units {
            if completed.contains(&unit.id) {
                unit.status = UnitStatus::Completed;
                continue;
            }
            match unit.status {
                UnitStatus::InProgress => {
                    in_doubt.push(unit.id.clone());
                    unit.status = UnitStatus::Pending;
                }
                UnitStatus::Completed => {
                    reprocessed.push(unit.id.clone());
                    unit.status = UnitStatus::Pending;
                    unit.completed_via = None;
                }
                UnitStatus::Pending | UnitStatus::Failed => {}
            }
        }

        let corrupt = if reconciled.checkpoint.is_none() && !reconciled.discarded.is_empty() {
            reconciled.reason.clone()
        } else {
            None
        };
        let gap = match (&reconciled.checkpoint, reconciled.reason) {
            (Some(_), Some(reason)) => Some(CheckpointGap {
                discarded: reconciled.discarded,
                reprocessed_units: reprocessed,
                reason,
            }),
            _ => None,
        };

        let status = if session.status == SessionStatus::Active && !owned {
            SessionStatus::Interrupted
        } else {
            session.status
        };

        Ok((
            SessionView {
                session,
                status,
                checkpoint: reconciled.checkpoint,
                units,
                in_doubt,
                gap,
                corrupt,
            },
            reconciled.highest_sequence,
        ))
    }

    /// Reconcile a session against its checkpoints without changing anything.
    pub fn inspect(&self, id: &str) -> Result<SessionView> {
        let owned = self.lock().contains_key(id);
        let session = self.read_session(id)?;
        Ok(self.build_view(session, owned)?.0)
    }

    /// Take ownership of a stored session and bring it back to a consistent
    /// state: apply the newest valid checkpoint, re-queue in-doubt units and
    /// cut the record log back to what the checkpoint covers.
    pub fn resume_session(&self, id: &str) -> Result<ResumeState> {
        let mut owned = self.lock();
        let session = self.read_session(id)?;
        let (view, highest_sequence) = self.build_view(session, false)?;

        if let Some(reason) = &view.corrupt {
            let checkpoint = view
                .session
                .last_checkpoint_ref
                .clone()
                .unwrap_or_else(|| checkpoint_file(highest_sequence));
            return Err(HarvestError::CorruptCheckpoint {
                session_id: id.to_string(),
                checkpoint,
                reason: reason.clone(),
            });
        }

        let sequence = view.checkpoint.as_ref().map_or(0, |c| c.sequence);
        if let Some(gap) = &view.gap {
            for &discarded in &gap.discarded {
                self.quarantine(id, discarded)?;
            }
            warn!(
                session = %id,
                discarded = ?gap.discarded,
                reprocessed = gap.reprocessed_units.len(),
                reason = %gap.reason,
                "resuming from an older checkpoint"
            );
        }
        if let Some(checkpoint) = &view.checkpoint {
            let current = self.read_current(id)?;
            if current != Some(checkpoint.sequence) {
                info!(
                    session = %id,
                    current = ?current,
                    chosen = checkpoint.sequence,
                    "repointing CURRENT"
                );
            }
            self.store
                .write_atomic(&current_key(id), checkpoint_file(checkpoint.sequence).as_bytes())?;
        }

        let expected_records = view.expected_records();
        let (kept, records_dropped) = self.truncate_records(id, expected_records)?;
        // the log can be shorter than the checkpoint claims; count what is really there
        let record_count = expected_records.min(kept);

        let mut session = view.session;
        session.work_plan = view.units;
        session.status = SessionStatus::Active;
        session.checkpoints.retain(|r| r.sequence <= sequence);
        session.last_checkpoint_ref = view.checkpoint.as_ref().map(|c| checkpoint_file(c.sequence));

        let completed = view
            .checkpoint
            .as_ref()
            .map(|c| c.completed_work_unit_ids.clone())
            .unwrap_or_default();
        let pending: Vec<WorkUnit> = session
            .work_plan
            .iter()
            .filter(|u| u.status == UnitStatus::Pending)
            .cloned()
            .collect();
        let failed: Vec<WorkUnit> = session
            .work_plan
            .iter()
            .filter(|u| u.status == UnitStatus::Failed)
            .cloned()
            .collect();

        info!(
            session = %id,
            checkpoint = sequence,
            pending = pending.len(),
            completed = completed.len(),
            in_doubt = view.in_doubt.len(),
            records_dropped,
            "session resumed"
        );

        let mut handle = OwnedSession {
            session,
            completed: completed.clone(),
            sequence,
            record_count,
        };
        let mut checkpoint = view.checkpoint;
        if record_count < expected_records {
            warn!(
                session = %id,
                expected = expected_records,
                found = record_count,
                "record log is short, writing a corrected checkpoint"
            );
            let corrected = Checkpoint {
                session_id: id.to_string(),
                sequence: sequence + 1,
                timestamp: Utc::now(),
                completed_work_unit_ids: completed.clone(),
                record_count_at_checkpoint: record_count,
            };
            self.commit_checkpoint(&mut handle, &corrected)?;
            checkpoint = Some(corrected);
        }
        self.persist(&mut handle)?;
        let session = handle.session.clone();
        owned.insert(id.to_string(), handle);

        Ok(ResumeState {
            session,
            pending,
            completed,
            failed,
            in_doubt: view.in_doubt,
            gap: view.gap,
            checkpoint,
            records_dropped,
        })
    }

    /// Move a rejected checkpoint aside so later validation ignores it.
    fn quarantine(&self, id: &str, sequence: u64) -> Result<()> {
        let file = checkpoint_file(sequence);
        let key = checkpoint_key(id, &file);
        if let Some(bytes) = self.store.read(&key)? {
            self.store
                .write_atomic(&checkpoint_key(id, &format!("{file}.corrupt")), &bytes)?;
        }
        self.store.remove_prefix(&key)
    }

    /// Keep the first `keep` complete lines of the record log. Returns how
    /// many lines survive and how many (including a torn tail) were dropped.
    fn truncate_records(&self, id: &str, keep: u64) -> Result<(u64, usize)> {
        let key = records_key(id);
        let Some(bytes) = self.store.read(&key)? else {
            return Ok((0, 0));
        };
        let lines: Vec<&[u8]> = bytes.split_inclusive(|b| *b == b'\n').collect();
        let kept: Vec<&[u8]> = lines
            .iter()
            .take_while(|line| line.ends_with(b"\n"))
            .take(usize::try_from(keep).unwrap_or(usize::MAX))
            .copied()
            .collect();
        let dropped = lines.len() - kept.len();
        if dropped > 0 {
            self.store.write_atomic(&key, &kept.concat())?;
            info!(session = %id, kept = kept.len(), dropped, "truncated record log");
        }
        Ok((kept.len() as u64, dropped))
    }

    /// Records from the session log, optionally only the first `limit` lines.
    /// Lines that do not parse are skipped.
    pub fn load_records(&self, id: &str, limit: Option<u64>) -> Result<Vec<CollectedRecord>> {
        check_id(id)?;
        let Some(bytes) = self.store.read(&records_key(id))? else {
            return Ok(Vec::new());
        };
        let limit = limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        let mut records = Vec::new();
        for (line_no, line) in bytes.split(|b| *b == b'\n').take(limit).enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<CollectedRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(session = %id, line = line_no + 1, error = %e, "skipping bad record line"),
            }
        }
        Ok(records)
    }

    pub fn write_corpus(&self, id: &str, records: &[CollectedRecord]) -> Result<()> {
        check_id(id)?;
        let data = serde_json::to_vec_pretty(records)?;
        self.store.write_atomic(&corpus_key(id), &data)?;
        info!(session = %id, records = records.len(), "corpus written");
        Ok(())
    }

    /// Operator re-queue of every failed unit. Returns how many moved.
    pub fn requeue_failed(&self, id: &str) -> Result<usize> {
        let mut owned = self.lock();
        if let Some(h) = owned.get_mut(id) {
            let count = requeue_failed_units(&mut h.session.work_plan)?;
            if count > 0 {
                self.persist(h)?;
            }
            return Ok(count);
        }

        let mut session = self.read_session(id)?;
        let count = requeue_failed_units(&mut session.work_plan)?;
        if count > 0 {
            session.updated_at = Utc::now();
            self.write_session(&session)?;
        }
        info!(session = %id, count, "re-queued failed units");
        Ok(count)
    }

    /// Every stored session, newest first. Unreadable sessions are skipped.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let owned: HashSet<String> = self.lock().keys().cloned().collect();
        let mut summaries = Vec::new();
        for id in self.store.list(SESSIONS)? {
            match self.read_session(&id) {
                Ok(session) => {
                    let status = if session.status == SessionStatus::Active && !owned.contains(&id)
                    {
                        SessionStatus::Interrupted
                    } else {
                        session.status
                    };
                    summaries.push(SessionSummary {
                        counts: session.counts(),
                        session_id: session.session_id,
                        status,
                        created_at: session.created_at,
                        updated_at: session.updated_at,
                    });
                }
                Err(e) => warn!(session = %id, error = %e, "skipping unreadable session"),
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// Delete sessions outside the retention policy. Sessions owned by this
    /// manager are never touched; paused and interrupted sessions only go
    /// when `include_incomplete` is set. A session stored as active that was
    /// updated within `active_grace_hours` may belong to another process and
    /// is kept as well.
    pub fn cleanup_old_sessions(&self, policy: &RetentionPolicy) -> Result<Vec<String>> {
        let now = Utc::now();
        let grace = chrono::Duration::hours(i64::from(policy.active_grace_hours));
        let mut removed = Vec::new();
        for (idx, summary) in self.list_sessions()?.into_iter().enumerate() {
            let beyond_keep = policy.keep_last.is_some_and(|keep| idx >= keep);
            let too_old = policy.max_age_days.is_some_and(|days| {
                now.signed_duration_since(summary.updated_at) > chrono::Duration::days(i64::from(days))
            });
            if !beyond_keep && !too_old {
                continue;
            }
            let deletable = match summary.status {
                SessionStatus::Active => false,
                SessionStatus::Completed => true,
                SessionStatus::Paused => policy.include_incomplete,
                SessionStatus::Interrupted => {
                    policy.include_incomplete
                        && !self.maybe_running_elsewhere(&summary.session_id, now, grace)?
                }
            };
            if !deletable {
                debug!(session = %summary.session_id, status = %summary.status, "retaining session");
                continue;
            }
            self.store.remove_prefix(&session_prefix(&summary.session_id))?;
            info!(session = %summary.session_id, status = %summary.status, "removed old session");
            removed.push(summary.session_id);
        }
        Ok(removed)
    }

    /// Stored as active and recently updated, though not owned here.
    fn maybe_running_elsewhere(
        &self,
        id: &str,
        now: chrono::DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Result<bool> {
        let session = self.read_session(id)?;
        Ok(session.status == SessionStatus::Active
            && now.signed_duration_since(session.updated_at) < grace)
    }
}

fn requeue_failed_units(units: &mut [WorkUnit]) -> Result<usize> {
    let mut count = 0;
    for unit in units.iter_mut().filter(|u| u.status == UnitStatus::Failed) {
        unit.transition(UnitStatus::Pending)?;
        unit.retry_count = 0;
        count += 1;
    }
    Ok(count)
}
