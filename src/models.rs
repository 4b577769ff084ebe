use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type ContentId = i64;
pub type LearnerId = i64;

/// Read-only view of a content item owned by the course catalogue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ContentItem {
    pub id: ContentId,
    pub title: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Learner {
    pub id: LearnerId,
    pub display_name: String,
    pub email: String,
}

impl Learner {
    /// Splits the display name into (first, last) the way the cloud expects it.
    pub fn name_parts(&self) -> (String, String) {
        let mut parts = self.display_name.split_whitespace();
        let first = parts.next().unwrap_or("Learner").to_string();
        let last = parts.collect::<Vec<_>>().join(" ");
        (first, last)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    #[default]
    Frameset,
    Iframe,
}

impl LaunchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchMode::Frameset => "frameset",
            LaunchMode::Iframe => "iframe",
        }
    }

    pub fn parse(v: &str) -> Self {
        match v {
            "iframe" => LaunchMode::Iframe,
            _ => LaunchMode::Frameset,
        }
    }
}

/// A package registered with the cloud under an immutable external id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExternalCourse {
    pub id: String,
    pub content_id: ContentId,
    pub title: String,
    pub launch_mode: LaunchMode,
    pub launch_target: String,
    pub default_destination_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Destination {
    pub id: String,
    pub name: String,
    /// false while the remote create has not been confirmed
    pub remote_created: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub id: String,
    pub course_id: String,
    pub destination_id: String,
    pub enabled: bool,
    /// 0 means uncapped
    pub registration_cap: i32,
    pub registration_count: i32,
    pub expiration_date: Option<DateTime<Utc>>,
    pub remote_created: bool,
    pub created_at: DateTime<Utc>,
}

/// One learner's execution session against a package on the cloud.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Registration {
    pub id: String,
    pub learner_id: LearnerId,
    pub content_id: ContentId,
    pub course_id: String,
    pub completion_status: Option<String>,
    pub success_status: Option<String>,
    pub score: Option<f64>,
    pub total_seconds: i64,
    pub last_sync: Option<Value>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub remote_created: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Enrolled,
    InProgress,
    Completed,
    Passed,
    Failed,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Enrolled => "enrolled",
            EnrollmentStatus::InProgress => "in_progress",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Passed => "passed",
            EnrollmentStatus::Failed => "failed",
        }
    }

    pub fn parse(v: &str) -> Option<Self> {
        match v {
            "enrolled" => Some(EnrollmentStatus::Enrolled),
            "in_progress" => Some(EnrollmentStatus::InProgress),
            "completed" => Some(EnrollmentStatus::Completed),
            "passed" => Some(EnrollmentStatus::Passed),
            "failed" => Some(EnrollmentStatus::Failed),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, EnrollmentStatus::Completed | EnrollmentStatus::Passed)
    }
}

/// Local aggregate of a learner's history with one content item.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub id: Uuid,
    pub learner_id: LearnerId,
    pub content_id: ContentId,
    pub total_attempts: i32,
    pub best_score: Option<f64>,
    pub first_completion_date: Option<DateTime<Utc>>,
    pub last_completion_date: Option<DateTime<Utc>>,
    pub status: EnrollmentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn new(learner_id: LearnerId, content_id: ContentId, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            learner_id,
            content_id,
            total_attempts: 0,
            best_score: None,
            first_completion_date: None,
            last_completion_date: None,
            status: EnrollmentStatus::Enrolled,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, DeserializeFromStr, SerializeDisplay)]
pub enum ScormVersion {
    Scorm12,
    Scorm2004,
}

impl fmt::Display for ScormVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScormVersion::Scorm12 => f.write_str("1.2"),
            ScormVersion::Scorm2004 => f.write_str("2004"),
        }
    }
}

impl FromStr for ScormVersion {
    type Err = String;

    // Accepts "1.2", "2004", "2004 4th Edition", "CAM 1.3" and similar manifest spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let v = s.trim().to_ascii_lowercase();
        if v == "1.2" || v == "scorm_12" || v == "scorm12" {
            Ok(ScormVersion::Scorm12)
        } else if v.contains("2004") || v.contains("1.3") || v == "scorm_2004" {
            Ok(ScormVersion::Scorm2004)
        } else {
            Err(format!("unsupported SCORM version: {s}"))
        }
    }
}

/// One learner session's complete progress record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Attempt {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub attempt_number: i32,
    pub session_id: String,
    pub scorm_version: ScormVersion,
    pub raw: Map<String, Value>,
    pub score_raw: Option<f64>,
    pub score_min: Option<f64>,
    pub score_max: Option<f64>,
    pub score_scaled: Option<f64>,
    pub completion_status: Option<String>,
    pub success_status: Option<String>,
    pub total_time: Option<String>,
    pub total_time_seconds: i64,
    pub session_time: Option<String>,
    pub session_time_seconds: i64,
    pub lesson_location: Option<String>,
    pub suspend_data: Option<String>,
    pub entry_mode: Option<String>,
    pub exit_mode: Option<String>,
    pub interactions: Vec<Value>,
    pub objectives: Vec<Value>,
    pub learner_comments: Vec<Value>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_sequence_number: i64,
    pub commit_count: i32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Attempt {
    pub fn new(
        enrollment: &Enrollment,
        attempt_number: i32,
        session_id: &str,
        scorm_version: ScormVersion,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            enrollment_id: enrollment.id,
            attempt_number,
            session_id: session_id.to_string(),
            scorm_version,
            raw: Map::new(),
            score_raw: None,
            score_min: None,
            score_max: None,
            score_scaled: None,
            completion_status: None,
            success_status: None,
            total_time: None,
            total_time_seconds: 0,
            session_time: None,
            session_time_seconds: 0,
            lesson_location: None,
            suspend_data: None,
            entry_mode: None,
            exit_mode: None,
            interactions: Vec::new(),
            objectives: Vec::new(),
            learner_comments: Vec::new(),
            completed: false,
            completed_at: None,
            last_sequence_number: 0,
            commit_count: 0,
            started_at: now,
            updated_at: now,
        }
    }
}

/// Maps a session id onto the attempt it reports into.
///
/// `seq_offset` is added to every sequence number the session sends, so a
/// resumed attempt keeps a non-decreasing `last_sequence_number`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionBinding {
    pub session_id: String,
    pub attempt_id: Uuid,
    pub seq_offset: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommitLogEntry {
    pub id: Uuid,
    pub attempt_id: Uuid,
    pub sequence_number: i64,
    pub diff: Value,
    pub client_timestamp: Option<DateTime<Utc>>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A progress report pushed by the in-browser runtime (or derived from a cloud sync).
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub learner_id: LearnerId,
    pub content_id: ContentId,
    pub session_id: String,
    pub seq: i64,
    pub client_timestamp: Option<DateTime<Utc>>,
    pub scorm_version: ScormVersion,
    pub raw: Map<String, Value>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub enrollment: Enrollment,
    pub attempt: Attempt,
    pub ignored: bool,
}

// --- wire types for the progress endpoint ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProgressReq {
    pub session_id: String,
    pub seq: i64,
    pub client_timestamp: Option<DateTime<Utc>>,
    pub scorm_version: ScormVersion,
    #[serde(default)]
    pub raw: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EnrollmentView {
    pub id: Uuid,
    pub status: EnrollmentStatus,
    pub total_attempts: i32,
    pub best_score: Option<f64>,
    pub first_completion_date: Option<DateTime<Utc>>,
    pub last_completion_date: Option<DateTime<Utc>>,
}

impl From<&Enrollment> for EnrollmentView {
    fn from(e: &Enrollment) -> Self {
        Self {
            id: e.id,
            status: e.status,
            total_attempts: e.total_attempts,
            best_score: e.best_score,
            first_completion_date: e.first_completion_date,
            last_completion_date: e.last_completion_date,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AttemptView {
    pub id: Uuid,
    pub number: i32,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub score_raw: Option<f64>,
    pub score_scaled: Option<f64>,
    pub completion_status: Option<String>,
    pub success_status: Option<String>,
    pub total_time_seconds: i64,
    pub lesson_location: Option<String>,
    pub last_sequence_number: i64,
    pub commit_count: i32,
}

impl From<&Attempt> for AttemptView {
    fn from(a: &Attempt) -> Self {
        Self {
            id: a.id,
            number: a.attempt_number,
            completed: a.completed,
            completed_at: a.completed_at,
            score_raw: a.score_raw,
            score_scaled: a.score_scaled,
            completion_status: a.completion_status.clone(),
            success_status: a.success_status.clone(),
            total_time_seconds: a.total_time_seconds,
            lesson_location: a.lesson_location.clone(),
            last_sequence_number: a.last_sequence_number,
            commit_count: a.commit_count,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProgressResp {
    pub ok: bool,
    pub ignored: bool,
    pub enrollment: EnrollmentView,
    pub attempt: AttemptView,
}

impl From<&IngestOutcome> for ProgressResp {
    fn from(o: &IngestOutcome) -> Self {
        Self {
            ok: true,
            ignored: o.ignored,
            enrollment: EnrollmentView::from(&o.enrollment),
            attempt: AttemptView::from(&o.attempt),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct LaunchReq {
    pub redirect_url: Option<String>,
    #[serde(default)]
    pub settings: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LaunchResp {
    pub registration_id: String,
    pub url: String,
}
