//! Enrollment / attempt ledger.
//!
//! Stores call [`resolve_attempt`] and [`apply_update`] inside one
//! transaction, so the rules below are shared by every backend:
//!
//! 1. one enrollment per (learner, content item), created on first report
//! 2. a session reports into its bound attempt; an unbound session resumes the
//!    latest unfinished attempt or opens a new one
//! 3. a report whose effective sequence is not past `last_sequence_number` is
//!    ignored without mutation
//! 4. completion is recorded once and propagated to the enrollment

pub mod cmi;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{
    Attempt, CommitLogEntry, ContentId, Enrollment, EnrollmentStatus, IngestOutcome, LearnerId,
    ProgressUpdate, ScormVersion, SessionBinding,
};
use crate::store::{LedgerStore, StoreError};
use cmi::{is_storable_key, mapper_for, str_at};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("invalid progress update: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The attempt a report lands in, plus what the store has to persist for it.
#[derive(Debug, Clone)]
pub struct ResolvedAttempt {
    pub attempt: Attempt,
    pub seq_offset: i64,
    /// Set when the session was not bound yet.
    pub new_binding: Option<SessionBinding>,
    pub created: bool,
}

/// Picks the attempt for `update`.
///
/// `bound` is the session's existing binding and its attempt; `latest` is the
/// enrollment's most recent attempt, only consulted when the session is unbound.
/// Opening a new attempt bumps `enrollment.total_attempts`.
pub fn resolve_attempt(
    enrollment: &mut Enrollment,
    bound: Option<(SessionBinding, Attempt)>,
    latest: Option<Attempt>,
    update: &ProgressUpdate,
    now: DateTime<Utc>,
) -> ResolvedAttempt {
    if let Some((binding, attempt)) = bound {
        return ResolvedAttempt {
            attempt,
            seq_offset: binding.seq_offset,
            new_binding: None,
            created: false,
        };
    }

    if let Some(mut attempt) = latest.filter(|a| !a.completed && !starts_fresh(update, a)) {
        debug!(
            attempt_id = %attempt.id,
            session_id = %update.session_id,
            "resuming unfinished attempt under a new session"
        );
        let seq_offset = attempt.last_sequence_number;
        attempt.session_id = update.session_id.clone();
        return ResolvedAttempt {
            new_binding: Some(SessionBinding {
                session_id: update.session_id.clone(),
                attempt_id: attempt.id,
                seq_offset,
            }),
            attempt,
            seq_offset,
            created: false,
        };
    }

    enrollment.total_attempts += 1;
    enrollment.updated_at = now;
    let attempt = Attempt::new(
        enrollment,
        enrollment.total_attempts,
        &update.session_id,
        update.scorm_version,
        now,
    );
    ResolvedAttempt {
        new_binding: Some(SessionBinding {
            session_id: update.session_id.clone(),
            attempt_id: attempt.id,
            seq_offset: 0,
        }),
        attempt,
        seq_offset: 0,
        created: true,
    }
}

// A runtime that reports entry "ab-initio" has started the content over.
fn starts_fresh(update: &ProgressUpdate, attempt: &Attempt) -> bool {
    let entry_key = mapper_for(attempt.scorm_version).paths().entry;
    str_at(&update.raw, entry_key).as_deref() == Some("ab-initio")
}

/// Applies one report to the attempt and its enrollment.
///
/// Returns `None` when the report is stale (nothing was touched), otherwise the
/// commit-log row describing the change. A sequence that overflows once the
/// session's offset is added is rejected.
pub fn apply_update(
    enrollment: &mut Enrollment,
    attempt: &mut Attempt,
    update: &ProgressUpdate,
    seq_offset: i64,
    now: DateTime<Utc>,
) -> Result<Option<CommitLogEntry>, StoreError> {
    let effective_seq = seq_offset.checked_add(update.seq).ok_or_else(|| {
        StoreError::Rejected(format!(
            "seq {} is out of range for session {}",
            update.seq, update.session_id
        ))
    })?;
    if effective_seq <= attempt.last_sequence_number {
        debug!(
            attempt_id = %attempt.id,
            seq = update.seq,
            last = attempt.last_sequence_number,
            "ignoring stale progress report"
        );
        return Ok(None);
    }

    let mapper = mapper_for(attempt.scorm_version);
    let previous = attempt.raw.clone();
    for (key, value) in &update.raw {
        if !is_storable_key(key) {
            debug!(key = %key, "dropping non-CMI key");
            continue;
        }
        if let Value::String(s) = value {
            if s.len() > mapper.max_len(key) {
                warn!(key = %key, len = s.len(), "dropping oversized CMI value");
                continue;
            }
        }
        attempt.raw.insert(key.clone(), value.clone());
    }

    let cmi = mapper.normalize(&attempt.raw);
    let is_complete = cmi.is_complete();
    attempt.score_raw = cmi.score_raw;
    attempt.score_min = cmi.score_min;
    attempt.score_max = cmi.score_max;
    attempt.score_scaled = cmi.score_scaled;
    attempt.completion_status = cmi.completion_status;
    attempt.success_status = cmi.success_status;
    attempt.total_time = cmi.total_time;
    attempt.total_time_seconds = cmi.total_time_seconds;
    attempt.session_time = cmi.session_time;
    attempt.session_time_seconds = cmi.session_time_seconds;
    attempt.lesson_location = cmi.location;
    attempt.suspend_data = cmi.suspend_data;
    attempt.entry_mode = cmi.entry;
    attempt.exit_mode = cmi.exit;
    attempt.interactions = cmi.interactions;
    attempt.objectives = cmi.objectives;
    attempt.learner_comments = cmi.learner_comments;

    settle_completion(enrollment, attempt, is_complete, now);

    attempt.last_sequence_number = effective_seq;
    attempt.commit_count += 1;
    attempt.updated_at = now;
    enrollment.updated_at = now;

    Ok(Some(CommitLogEntry {
        id: Uuid::new_v4(),
        attempt_id: attempt.id,
        sequence_number: effective_seq,
        diff: cmi::diff_trees(&previous, &attempt.raw),
        client_timestamp: update.client_timestamp,
        user_agent: update.user_agent.clone(),
        created_at: now,
    }))
}

/// Result of folding a cloud snapshot into the ledger.
#[derive(Debug, Clone)]
pub struct RemoteApplied {
    pub attempt: Attempt,
    pub created: bool,
    pub changed: bool,
}

/// Folds a cloud status snapshot (a SCORM 2004 tree) into the enrollment's
/// latest attempt.
///
/// The snapshot overlays the derived facts it carries (statuses, score,
/// total time, location, suspend data, objectives) and never touches
/// `last_sequence_number`, session bindings or the commit log, so browser
/// sessions reporting into the same attempt keep their ordering. An attempt is
/// only opened when the enrollment has none.
pub fn apply_remote_snapshot(
    enrollment: &mut Enrollment,
    latest: Option<Attempt>,
    snapshot: &Map<String, Value>,
    now: DateTime<Utc>,
) -> RemoteApplied {
    let remote = mapper_for(ScormVersion::Scorm2004).normalize(snapshot);

    let (mut attempt, created) = match latest {
        Some(attempt) => (attempt, false),
        None => {
            enrollment.total_attempts += 1;
            let mut attempt = Attempt::new(
                enrollment,
                enrollment.total_attempts,
                REMOTE_SESSION,
                ScormVersion::Scorm2004,
                now,
            );
            attempt.raw = snapshot
                .iter()
                .filter(|(k, _)| is_storable_key(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            (attempt, true)
        }
    };
    let before = attempt.clone();

    if remote.score_raw.is_some() {
        attempt.score_raw = remote.score_raw;
        attempt.score_min = remote.score_min;
        attempt.score_max = remote.score_max;
        attempt.score_scaled = remote.score_scaled;
    }
    if remote.completion_status.is_some() {
        attempt.completion_status = remote.completion_status.clone();
    }
    if remote.success_status.is_some() {
        attempt.success_status = remote.success_status.clone();
    }
    if remote.total_time.is_some() {
        attempt.total_time = remote.total_time.clone();
        attempt.total_time_seconds = remote.total_time_seconds;
    }
    if remote.location.is_some() {
        attempt.lesson_location = remote.location.clone();
    }
    if remote.suspend_data.is_some() {
        attempt.suspend_data = remote.suspend_data.clone();
    }
    if !remote.objectives.is_empty() {
        attempt.objectives = remote.objectives.clone();
    }

    let changed = created || attempt != before || (remote.is_complete() && !attempt.completed);
    if changed {
        settle_completion(enrollment, &mut attempt, remote.is_complete(), now);
        attempt.updated_at = now;
        enrollment.updated_at = now;
    }
    RemoteApplied {
        attempt,
        created,
        changed,
    }
}

// Session id recorded on attempts opened by a cloud snapshot.
const REMOTE_SESSION: &str = "cloud-sync";

fn settle_completion(
    enrollment: &mut Enrollment,
    attempt: &mut Attempt,
    is_complete: bool,
    now: DateTime<Utc>,
) {
    if is_complete && !attempt.completed {
        attempt.completed = true;
        attempt.completed_at = Some(now);
        record_completion(enrollment, attempt.score_raw, now);
        info!(
            enrollment_id = %enrollment.id,
            attempt = attempt.attempt_number,
            score = ?attempt.score_raw,
            "attempt completed"
        );
    } else if !enrollment.status.is_finished() {
        enrollment.status = match attempt.success_status.as_deref() {
            Some("failed") => EnrollmentStatus::Failed,
            _ => EnrollmentStatus::InProgress,
        };
    }
}

fn record_completion(enrollment: &mut Enrollment, score: Option<f64>, now: DateTime<Utc>) {
    if let Some(score) = score {
        if enrollment.best_score.map_or(true, |best| score > best) {
            enrollment.best_score = Some(score);
        }
    }
    enrollment.first_completion_date.get_or_insert(now);
    enrollment.last_completion_date = Some(now);
    enrollment.status = EnrollmentStatus::Completed;
}

/// Entry point for progress ingestion.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn ingest(&self, update: ProgressUpdate) -> Result<IngestOutcome, LedgerError> {
        if update.session_id.trim().is_empty() {
            return Err(LedgerError::Invalid("session_id is required".into()));
        }
        if update.seq < 1 {
            return Err(LedgerError::Invalid("seq must be a positive integer".into()));
        }
        let outcome = match self.store.ingest(&update, Utc::now()).await {
            Ok(outcome) => outcome,
            Err(StoreError::Rejected(reason)) => return Err(LedgerError::Invalid(reason)),
            Err(e) => return Err(e.into()),
        };
        if outcome.ignored {
            debug!(
                learner_id = update.learner_id,
                content_id = update.content_id,
                seq = update.seq,
                "progress report ignored"
            );
        }
        Ok(outcome)
    }

    /// Applies a cloud registration snapshot to the learner's enrollment.
    pub async fn apply_remote_snapshot(
        &self,
        learner_id: LearnerId,
        content_id: ContentId,
        snapshot: &Map<String, Value>,
    ) -> Result<IngestOutcome, LedgerError> {
        let outcome = self
            .store
            .apply_remote(learner_id, content_id, snapshot, Utc::now())
            .await?;
        debug!(
            learner_id,
            content_id,
            changed = !outcome.ignored,
            "cloud snapshot applied"
        );
        Ok(outcome)
    }

    pub async fn enrollment(
        &self,
        learner_id: LearnerId,
        content_id: ContentId,
    ) -> Result<Option<Enrollment>, LedgerError> {
        Ok(self.store.find_enrollment(learner_id, content_id).await?)
    }

    pub async fn attempts(&self, enrollment_id: Uuid) -> Result<Vec<Attempt>, LedgerError> {
        Ok(self.store.list_attempts(enrollment_id).await?)
    }

    pub async fn commit_log(&self, attempt_id: Uuid) -> Result<Vec<CommitLogEntry>, LedgerError> {
        Ok(self.store.commit_log(attempt_id).await?)
    }
}
