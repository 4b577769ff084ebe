//! Postgres-backed store.
//!
//! Ingestion runs in one transaction with the enrollment row locked
//! (`FOR UPDATE`), so a reader never sees an attempt without its aggregate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{CloudStore, LedgerStore, StoreError};
use crate::ledger::{apply_remote_snapshot, apply_update, resolve_attempt};
use crate::models::*;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Row types
// ============================================================================

#[derive(sqlx::FromRow)]
struct EnrollmentRow {
    id: Uuid,
    learner_id: i64,
    content_id: i64,
    total_attempts: i32,
    best_score: Option<f64>,
    first_completion_date: Option<DateTime<Utc>>,
    last_completion_date: Option<DateTime<Utc>>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EnrollmentRow> for Enrollment {
    type Error = StoreError;

    fn try_from(r: EnrollmentRow) -> Result<Self, Self::Error> {
        let status = EnrollmentStatus::parse(&r.status)
            .ok_or_else(|| StoreError::Corrupt(format!("enrollment status {}", r.status)))?;
        Ok(Enrollment {
            id: r.id,
            learner_id: r.learner_id,
            content_id: r.content_id,
            total_attempts: r.total_attempts,
            best_score: r.best_score,
            first_completion_date: r.first_completion_date,
            last_completion_date: r.last_completion_date,
            status,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

const ENROLLMENT_COLUMNS: &str = "id, learner_id, content_id, total_attempts, best_score, \
    first_completion_date, last_completion_date, status, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    enrollment_id: Uuid,
    attempt_number: i32,
    session_id: String,
    scorm_version: String,
    raw: Value,
    score_raw: Option<f64>,
    score_min: Option<f64>,
    score_max: Option<f64>,
    score_scaled: Option<f64>,
    completion_status: Option<String>,
    success_status: Option<String>,
    total_time: Option<String>,
    total_time_seconds: i64,
    session_time: Option<String>,
    session_time_seconds: i64,
    lesson_location: Option<String>,
    suspend_data: Option<String>,
    entry_mode: Option<String>,
    exit_mode: Option<String>,
    interactions: Value,
    objectives: Value,
    learner_comments: Value,
    completed: bool,
    completed_at: Option<DateTime<Utc>>,
    last_sequence_number: i64,
    commit_count: i32,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn json_list(v: Value, what: &str) -> Result<Vec<Value>, StoreError> {
    match v {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(StoreError::Corrupt(format!("{what}: expected array, got {other}"))),
    }
}

impl TryFrom<AttemptRow> for Attempt {
    type Error = StoreError;

    fn try_from(r: AttemptRow) -> Result<Self, Self::Error> {
        let scorm_version = r
            .scorm_version
            .parse::<ScormVersion>()
            .map_err(StoreError::Corrupt)?;
        let raw = match r.raw {
            Value::Object(m) => m,
            other => return Err(StoreError::Corrupt(format!("attempt raw tree: {other}"))),
        };
        Ok(Attempt {
            id: r.id,
            enrollment_id: r.enrollment_id,
            attempt_number: r.attempt_number,
            session_id: r.session_id,
            scorm_version,
            raw,
            score_raw: r.score_raw,
            score_min: r.score_min,
            score_max: r.score_max,
            score_scaled: r.score_scaled,
            completion_status: r.completion_status,
            success_status: r.success_status,
            total_time: r.total_time,
            total_time_seconds: r.total_time_seconds,
            session_time: r.session_time,
            session_time_seconds: r.session_time_seconds,
            lesson_location: r.lesson_location,
            suspend_data: r.suspend_data,
            entry_mode: r.entry_mode,
            exit_mode: r.exit_mode,
            interactions: json_list(r.interactions, "interactions")?,
            objectives: json_list(r.objectives, "objectives")?,
            learner_comments: json_list(r.learner_comments, "learner_comments")?,
            completed: r.completed,
            completed_at: r.completed_at,
            last_sequence_number: r.last_sequence_number,
            commit_count: r.commit_count,
            started_at: r.started_at,
            updated_at: r.updated_at,
        })
    }
}

const ATTEMPT_COLUMNS: &str = "id, enrollment_id, attempt_number, session_id, scorm_version, raw, \
    score_raw, score_min, score_max, score_scaled, completion_status, success_status, \
    total_time, total_time_seconds, session_time, session_time_seconds, lesson_location, \
    suspend_data, entry_mode, exit_mode, interactions, objectives, learner_comments, \
    completed, completed_at, last_sequence_number, commit_count, started_at, updated_at";

#[derive(sqlx::FromRow)]
struct BindingRow {
    session_id: String,
    attempt_id: Uuid,
    seq_offset: i64,
}

#[derive(sqlx::FromRow)]
struct CommitLogRow {
    id: Uuid,
    attempt_id: Uuid,
    sequence_number: i64,
    diff: Value,
    client_timestamp: Option<DateTime<Utc>>,
    user_agent: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct CourseRow {
    id: String,
    content_id: i64,
    title: String,
    launch_mode: String,
    launch_target: String,
    default_destination_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<CourseRow> for ExternalCourse {
    fn from(r: CourseRow) -> Self {
        ExternalCourse {
            id: r.id,
            content_id: r.content_id,
            title: r.title,
            launch_mode: LaunchMode::parse(&r.launch_mode),
            launch_target: r.launch_target,
            default_destination_id: r.default_destination_id,
            created_at: r.created_at,
        }
    }
}

const REGISTRATION_COLUMNS: &str = "id, learner_id, content_id, course_id, completion_status, \
    success_status, score, total_seconds, last_sync, last_synced_at, remote_created, created_at";

#[derive(sqlx::FromRow)]
struct RegistrationRow {
    id: String,
    learner_id: i64,
    content_id: i64,
    course_id: String,
    completion_status: Option<String>,
    success_status: Option<String>,
    score: Option<f64>,
    total_seconds: i64,
    last_sync: Option<Value>,
    last_synced_at: Option<DateTime<Utc>>,
    remote_created: bool,
    created_at: DateTime<Utc>,
}

impl From<RegistrationRow> for Registration {
    fn from(r: RegistrationRow) -> Self {
        Registration {
            id: r.id,
            learner_id: r.learner_id,
            content_id: r.content_id,
            course_id: r.course_id,
            completion_status: r.completion_status,
            success_status: r.success_status,
            score: r.score,
            total_seconds: r.total_seconds,
            last_sync: r.last_sync,
            last_synced_at: r.last_synced_at,
            remote_created: r.remote_created,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DispatchRow {
    id: String,
    course_id: String,
    destination_id: String,
    enabled: bool,
    registration_cap: i32,
    registration_count: i32,
    expiration_date: Option<DateTime<Utc>>,
    remote_created: bool,
    created_at: DateTime<Utc>,
}

impl From<DispatchRow> for Dispatch {
    fn from(r: DispatchRow) -> Self {
        Dispatch {
            id: r.id,
            course_id: r.course_id,
            destination_id: r.destination_id,
            enabled: r.enabled,
            registration_cap: r.registration_cap,
            registration_count: r.registration_count,
            expiration_date: r.expiration_date,
            remote_created: r.remote_created,
            created_at: r.created_at,
        }
    }
}

// ============================================================================
// Ledger helpers (run inside the ingestion transaction)
// ============================================================================

async fn lock_enrollment(
    conn: &mut PgConnection,
    learner_id: LearnerId,
    content_id: ContentId,
    now: DateTime<Utc>,
) -> Result<Enrollment, StoreError> {
    let fresh = Enrollment::new(learner_id, content_id, now);
    sqlx::query(
        r#"
        INSERT INTO enrollments (id, learner_id, content_id, total_attempts, status, created_at, updated_at)
        VALUES ($1, $2, $3, 0, $4, $5, $5)
        ON CONFLICT (learner_id, content_id) DO NOTHING
        "#,
    )
    .bind(fresh.id)
    .bind(fresh.learner_id)
    .bind(fresh.content_id)
    .bind(fresh.status.as_str())
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query_as::<_, EnrollmentRow>(&format!(
        "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE learner_id = $1 AND content_id = $2 FOR UPDATE"
    ))
    .bind(learner_id)
    .bind(content_id)
    .fetch_one(&mut *conn)
    .await?;
    row.try_into()
}

async fn bound_attempt(
    conn: &mut PgConnection,
    enrollment_id: Uuid,
    session_id: &str,
) -> Result<Option<(SessionBinding, Attempt)>, StoreError> {
    let binding = sqlx::query_as::<_, BindingRow>(
        "SELECT session_id, attempt_id, seq_offset FROM attempt_sessions \
         WHERE enrollment_id = $1 AND session_id = $2",
    )
    .bind(enrollment_id)
    .bind(session_id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(b) = binding else {
        return Ok(None);
    };

    let row = sqlx::query_as::<_, AttemptRow>(&format!(
        "SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE id = $1"
    ))
    .bind(b.attempt_id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let binding = SessionBinding {
        session_id: b.session_id,
        attempt_id: b.attempt_id,
        seq_offset: b.seq_offset,
    };
    Ok(Some((binding, row.try_into()?)))
}

async fn latest_attempt(
    conn: &mut PgConnection,
    enrollment_id: Uuid,
) -> Result<Option<Attempt>, StoreError> {
    let row = sqlx::query_as::<_, AttemptRow>(&format!(
        "SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE enrollment_id = $1 \
         ORDER BY attempt_number DESC LIMIT 1"
    ))
    .bind(enrollment_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(Attempt::try_from).transpose()
}

async fn save_enrollment(conn: &mut PgConnection, e: &Enrollment) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE enrollments
        SET total_attempts = $2, best_score = $3, first_completion_date = $4,
            last_completion_date = $5, status = $6, updated_at = $7
        WHERE id = $1
        "#,
    )
    .bind(e.id)
    .bind(e.total_attempts)
    .bind(e.best_score)
    .bind(e.first_completion_date)
    .bind(e.last_completion_date)
    .bind(e.status.as_str())
    .bind(e.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn save_attempt(conn: &mut PgConnection, a: &Attempt) -> Result<(), StoreError> {
    sqlx::query(&format!(
        r#"
        INSERT INTO attempts ({ATTEMPT_COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29)
        ON CONFLICT (id) DO UPDATE SET
            session_id = EXCLUDED.session_id,
            raw = EXCLUDED.raw,
            score_raw = EXCLUDED.score_raw,
            score_min = EXCLUDED.score_min,
            score_max = EXCLUDED.score_max,
            score_scaled = EXCLUDED.score_scaled,
            completion_status = EXCLUDED.completion_status,
            success_status = EXCLUDED.success_status,
            total_time = EXCLUDED.total_time,
            total_time_seconds = EXCLUDED.total_time_seconds,
            session_time = EXCLUDED.session_time,
            session_time_seconds = EXCLUDED.session_time_seconds,
            lesson_location = EXCLUDED.lesson_location,
            suspend_data = EXCLUDED.suspend_data,
            entry_mode = EXCLUDED.entry_mode,
            exit_mode = EXCLUDED.exit_mode,
            interactions = EXCLUDED.interactions,
            objectives = EXCLUDED.objectives,
            learner_comments = EXCLUDED.learner_comments,
            completed = EXCLUDED.completed,
            completed_at = EXCLUDED.completed_at,
            last_sequence_number = EXCLUDED.last_sequence_number,
            commit_count = EXCLUDED.commit_count,
            updated_at = EXCLUDED.updated_at
        "#
    ))
    .bind(a.id)
    .bind(a.enrollment_id)
    .bind(a.attempt_number)
    .bind(&a.session_id)
    .bind(a.scorm_version.to_string())
    .bind(Value::Object(a.raw.clone()))
    .bind(a.score_raw)
    .bind(a.score_min)
    .bind(a.score_max)
    .bind(a.score_scaled)
    .bind(&a.completion_status)
    .bind(&a.success_status)
    .bind(&a.total_time)
    .bind(a.total_time_seconds)
    .bind(&a.session_time)
    .bind(a.session_time_seconds)
    .bind(&a.lesson_location)
    .bind(&a.suspend_data)
    .bind(&a.entry_mode)
    .bind(&a.exit_mode)
    .bind(Value::Array(a.interactions.clone()))
    .bind(Value::Array(a.objectives.clone()))
    .bind(Value::Array(a.learner_comments.clone()))
    .bind(a.completed)
    .bind(a.completed_at)
    .bind(a.last_sequence_number)
    .bind(a.commit_count)
    .bind(a.started_at)
    .bind(a.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn ingest(
        &self,
        update: &ProgressUpdate,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut enrollment =
            lock_enrollment(&mut tx, update.learner_id, update.content_id, now).await?;
        let loaded = enrollment.clone();
        let bound = bound_attempt(&mut tx, enrollment.id, &update.session_id).await?;
        let latest = if bound.is_none() {
            latest_attempt(&mut tx, enrollment.id).await?
        } else {
            None
        };

        let mut resolved = resolve_attempt(&mut enrollment, bound, latest, update, now);
        let Some(entry) = apply_update(
            &mut enrollment,
            &mut resolved.attempt,
            update,
            resolved.seq_offset,
            now,
        )?
        else {
            tx.commit().await?;
            return Ok(IngestOutcome {
                enrollment: loaded,
                attempt: resolved.attempt,
                ignored: true,
            });
        };

        save_enrollment(&mut tx, &enrollment).await?;
        save_attempt(&mut tx, &resolved.attempt).await?;
        if let Some(b) = &resolved.new_binding {
            sqlx::query(
                "INSERT INTO attempt_sessions (enrollment_id, session_id, attempt_id, seq_offset) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT (enrollment_id, session_id) DO NOTHING",
            )
            .bind(enrollment.id)
            .bind(&b.session_id)
            .bind(b.attempt_id)
            .bind(b.seq_offset)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "INSERT INTO commit_log (id, attempt_id, sequence_number, diff, client_timestamp, user_agent, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(entry.id)
        .bind(entry.attempt_id)
        .bind(entry.sequence_number)
        .bind(&entry.diff)
        .bind(entry.client_timestamp)
        .bind(&entry.user_agent)
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(IngestOutcome {
            enrollment,
            attempt: resolved.attempt,
            ignored: false,
        })
    }

    async fn apply_remote(
        &self,
        learner_id: LearnerId,
        content_id: ContentId,
        snapshot: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut enrollment = lock_enrollment(&mut tx, learner_id, content_id, now).await?;
        let latest = latest_attempt(&mut tx, enrollment.id).await?;
        let applied = apply_remote_snapshot(&mut enrollment, latest, snapshot, now);
        if applied.changed {
            save_enrollment(&mut tx, &enrollment).await?;
            save_attempt(&mut tx, &applied.attempt).await?;
        }

        tx.commit().await?;
        Ok(IngestOutcome {
            enrollment,
            attempt: applied.attempt,
            ignored: !applied.changed,
        })
    }

    async fn find_enrollment(
        &self,
        learner_id: LearnerId,
        content_id: ContentId,
    ) -> Result<Option<Enrollment>, StoreError> {
        let row = sqlx::query_as::<_, EnrollmentRow>(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE learner_id = $1 AND content_id = $2"
        ))
        .bind(learner_id)
        .bind(content_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Enrollment::try_from).transpose()
    }

    async fn list_attempts(&self, enrollment_id: Uuid) -> Result<Vec<Attempt>, StoreError> {
        let rows = sqlx::query_as::<_, AttemptRow>(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE enrollment_id = $1 ORDER BY attempt_number"
        ))
        .bind(enrollment_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Attempt::try_from).collect()
    }

    async fn commit_log(&self, attempt_id: Uuid) -> Result<Vec<CommitLogEntry>, StoreError> {
        let rows = sqlx::query_as::<_, CommitLogRow>(
            "SELECT id, attempt_id, sequence_number, diff, client_timestamp, user_agent, created_at \
             FROM commit_log WHERE attempt_id = $1 ORDER BY sequence_number",
        )
        .bind(attempt_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| CommitLogEntry {
                id: r.id,
                attempt_id: r.attempt_id,
                sequence_number: r.sequence_number,
                diff: r.diff,
                client_timestamp: r.client_timestamp,
                user_agent: r.user_agent,
                created_at: r.created_at,
            })
            .collect())
    }
}

#[async_trait]
impl CloudStore for PgStore {
    async fn content_item(&self, id: ContentId) -> Result<Option<ContentItem>, StoreError> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT id, title FROM content_items WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, title)| ContentItem { id, title }))
    }

    async fn learner(&self, id: LearnerId) -> Result<Option<Learner>, StoreError> {
        let row: Option<(i64, String, String)> =
            sqlx::query_as("SELECT id, display_name, email FROM learners WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, display_name, email)| Learner { id, display_name, email }))
    }

    async fn course_for_content(
        &self,
        content_id: ContentId,
    ) -> Result<Option<ExternalCourse>, StoreError> {
        let row = sqlx::query_as::<_, CourseRow>(
            "SELECT id, content_id, title, launch_mode, launch_target, default_destination_id, created_at \
             FROM external_courses WHERE content_id = $1",
        )
        .bind(content_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_course(&self, course_id: &str) -> Result<Option<ExternalCourse>, StoreError> {
        let row = sqlx::query_as::<_, CourseRow>(
            "SELECT id, content_id, title, launch_mode, launch_target, default_destination_id, created_at \
             FROM external_courses WHERE id = $1",
        )
        .bind(course_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn link_course(&self, course: &ExternalCourse) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM external_courses WHERE content_id = $1 AND id <> $2")
            .bind(course.content_id)
            .bind(&course.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO external_courses
                (id, content_id, title, launch_mode, launch_target, default_destination_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                launch_mode = EXCLUDED.launch_mode,
                launch_target = EXCLUDED.launch_target,
                default_destination_id = EXCLUDED.default_destination_id
            "#,
        )
        .bind(&course.id)
        .bind(course.content_id)
        .bind(&course.title)
        .bind(course.launch_mode.as_str())
        .bind(&course.launch_target)
        .bind(&course.default_destination_id)
        .bind(course.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_or_create_destination(
        &self,
        id: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Destination, StoreError> {
        sqlx::query(
            "INSERT INTO destinations (id, name, remote_created, created_at) VALUES ($1, $2, FALSE, $3) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(name)
        .bind(now)
        .execute(&self.pool)
        .await?;
        let (id, name, remote_created, created_at): (String, String, bool, DateTime<Utc>) =
            sqlx::query_as("SELECT id, name, remote_created, created_at FROM destinations WHERE id = $1")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(Destination { id, name, remote_created, created_at })
    }

    async fn mark_destination_remote(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE destinations SET remote_created = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_or_create_dispatch(
        &self,
        course_id: &str,
        destination_id: &str,
        candidate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Dispatch, StoreError> {
        sqlx::query(
            "INSERT INTO dispatches (id, course_id, destination_id, created_at) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (course_id, destination_id) DO NOTHING",
        )
        .bind(candidate_id)
        .bind(course_id)
        .bind(destination_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        let row = sqlx::query_as::<_, DispatchRow>(
            "SELECT id, course_id, destination_id, enabled, registration_cap, registration_count, \
             expiration_date, remote_created, created_at \
             FROM dispatches WHERE course_id = $1 AND destination_id = $2",
        )
        .bind(course_id)
        .bind(destination_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn mark_dispatch_remote(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE dispatches SET remote_created = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_dispatch_registrations(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE dispatches SET registration_count = registration_count + 1 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_registration(
        &self,
        learner_id: LearnerId,
        course_id: &str,
    ) -> Result<Option<Registration>, StoreError> {
        let row = sqlx::query_as::<_, RegistrationRow>(&format!(
            "SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE learner_id = $1 AND course_id = $2"
        ))
        .bind(learner_id)
        .bind(course_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_registration(&self, id: &str) -> Result<Option<Registration>, StoreError> {
        let row = sqlx::query_as::<_, RegistrationRow>(&format!(
            "SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn insert_registration(&self, reg: &Registration) -> Result<Registration, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO registrations (id, learner_id, content_id, course_id, remote_created, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (learner_id, course_id) DO NOTHING
            "#,
        )
        .bind(&reg.id)
        .bind(reg.learner_id)
        .bind(reg.content_id)
        .bind(&reg.course_id)
        .bind(reg.remote_created)
        .bind(reg.created_at)
        .execute(&self.pool)
        .await?;
        self.find_registration(reg.learner_id, &reg.course_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("registration {}", reg.id)))
    }

    async fn mark_registration_remote(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE registrations SET remote_created = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_registration_sync(&self, reg: &Registration) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE registrations
            SET completion_status = $2, success_status = $3, score = $4, total_seconds = $5,
                last_sync = $6, last_synced_at = $7
            WHERE id = $1
            "#,
        )
        .bind(&reg.id)
        .bind(&reg.completion_status)
        .bind(&reg.success_status)
        .bind(reg.score)
        .bind(reg.total_seconds)
        .bind(&reg.last_sync)
        .bind(reg.last_synced_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("registration {}", reg.id)));
        }
        Ok(())
    }
}
