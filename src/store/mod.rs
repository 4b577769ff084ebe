//! Persistence seams.
//!
//! Every get-or-create below follows the same race policy: the first write
//! wins and the loser re-reads the winner's row.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Attempt, CommitLogEntry, ContentId, ContentItem, Destination, Dispatch, Enrollment,
    ExternalCourse, IngestOutcome, Learner, LearnerId, ProgressUpdate, Registration,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    /// The input cannot be applied; nothing was written.
    #[error("rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Resolves, applies and persists one progress report atomically.
    async fn ingest(
        &self,
        update: &ProgressUpdate,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, StoreError>;

    /// Folds a cloud snapshot into the enrollment's latest attempt, creating the
    /// enrollment (and its first attempt) when missing. `ignored` means the
    /// snapshot changed nothing.
    async fn apply_remote(
        &self,
        learner_id: LearnerId,
        content_id: ContentId,
        snapshot: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, StoreError>;

    async fn find_enrollment(
        &self,
        learner_id: LearnerId,
        content_id: ContentId,
    ) -> Result<Option<Enrollment>, StoreError>;

    /// Attempts ordered by attempt number.
    async fn list_attempts(&self, enrollment_id: Uuid) -> Result<Vec<Attempt>, StoreError>;

    /// Commit-log rows ordered by sequence number.
    async fn commit_log(&self, attempt_id: Uuid) -> Result<Vec<CommitLogEntry>, StoreError>;
}

/// Local records of the cloud-side objects, plus the read-only collaborators
/// (content catalogue, learner directory) the integration consults.
#[async_trait]
pub trait CloudStore: Send + Sync {
    async fn content_item(&self, id: ContentId) -> Result<Option<ContentItem>, StoreError>;

    async fn learner(&self, id: LearnerId) -> Result<Option<Learner>, StoreError>;

    async fn course_for_content(
        &self,
        content_id: ContentId,
    ) -> Result<Option<ExternalCourse>, StoreError>;

    async fn get_course(&self, course_id: &str) -> Result<Option<ExternalCourse>, StoreError>;

    /// Links an uploaded course to its content item, replacing any earlier link.
    async fn link_course(&self, course: &ExternalCourse) -> Result<(), StoreError>;

    async fn get_or_create_destination(
        &self,
        id: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Destination, StoreError>;

    async fn mark_destination_remote(&self, id: &str) -> Result<(), StoreError>;

    /// Returns the dispatch for (course, destination), creating it under
    /// `candidate_id` when none exists.
    async fn get_or_create_dispatch(
        &self,
        course_id: &str,
        destination_id: &str,
        candidate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Dispatch, StoreError>;

    async fn mark_dispatch_remote(&self, id: &str) -> Result<(), StoreError>;

    async fn increment_dispatch_registrations(&self, id: &str) -> Result<(), StoreError>;

    async fn find_registration(
        &self,
        learner_id: LearnerId,
        course_id: &str,
    ) -> Result<Option<Registration>, StoreError>;

    async fn get_registration(&self, id: &str) -> Result<Option<Registration>, StoreError>;

    /// Inserts `reg` unless (learner, course) already has one; returns the stored row.
    async fn insert_registration(&self, reg: &Registration) -> Result<Registration, StoreError>;

    async fn mark_registration_remote(&self, id: &str) -> Result<(), StoreError>;

    /// Writes the status fields and snapshot of a synced registration.
    async fn save_registration_sync(&self, reg: &Registration) -> Result<(), StoreError>;
}
