//! Per-learner registrations against the cloud, and pulling their status
//! back into the local records.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cloud::{CloudApi, CloudError, LaunchRequest, NewRegistration, RegistrationStatus};
use crate::ledger::cmi::{format_duration_2004, normalize_status, parse_duration_2004};
use crate::ledger::Ledger;
use crate::models::{ContentId, ExternalCourse, Learner, LearnerId, Registration};
use crate::store::{CloudStore, StoreError};

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("content item {0} has no uploaded course")]
    NoCourse(ContentId),
    #[error("learner {0} not found")]
    UnknownLearner(LearnerId),
    #[error("registration {0} not found")]
    UnknownRegistration(String),
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Vendor-initiated completion notice for one registration.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionWebhook {
    #[serde(default)]
    pub completion_status: Option<String>,
    #[serde(default)]
    pub success_status: Option<String>,
    /// Percentage.
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub score: Option<f64>,
    /// Seconds, or an ISO-8601 duration.
    #[serde(default)]
    pub total_time: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CompletionWebhook {
    fn into_status(self, registration_id: &str) -> RegistrationStatus {
        let total_seconds = match &self.total_time {
            Some(Value::Number(n)) => n.as_f64().map(|s| s as i64).unwrap_or(0),
            Some(Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(|s| s as i64)
                .unwrap_or_else(|_| parse_duration_2004(s)),
            _ => 0,
        };
        let mut raw = self.extra;
        raw.insert("completionStatus".into(), json!(self.completion_status));
        raw.insert("successStatus".into(), json!(self.success_status));
        raw.insert("score".into(), json!(self.score));
        raw.insert("totalTime".into(), self.total_time.clone().unwrap_or(Value::Null));
        RegistrationStatus {
            registration_id: registration_id.to_string(),
            completion_status: self.completion_status,
            success_status: self.success_status,
            score: self.score,
            total_seconds,
            raw: Value::Object(raw),
            ..RegistrationStatus::default()
        }
    }
}

pub struct RegistrationService {
    cloud: Arc<dyn CloudApi>,
    store: Arc<dyn CloudStore>,
    ledger: Ledger,
    default_destination: String,
}

impl RegistrationService {
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        store: Arc<dyn CloudStore>,
        ledger: Ledger,
        default_destination: impl Into<String>,
    ) -> Self {
        Self {
            cloud,
            store,
            ledger,
            default_destination: default_destination.into(),
        }
    }

    /// Returns the learner's registration for `course`, creating it locally
    /// and remotely on first use. A failed remote step is logged and left for
    /// the next call; the local row is returned either way.
    pub async fn get_or_create_registration(
        &self,
        course: &ExternalCourse,
        learner: &Learner,
    ) -> Result<Registration, RegistrationError> {
        if let Some(existing) = self.store.find_registration(learner.id, &course.id).await? {
            if existing.remote_created {
                return Ok(existing);
            }
            self.ensure_dispatch(course, Utc::now()).await?;
            return Ok(self.push_remote(existing, learner).await);
        }

        let now = Utc::now();
        let dispatch_id = self.ensure_dispatch(course, now).await?;

        let candidate = Registration {
            id: Uuid::new_v4().to_string(),
            learner_id: learner.id,
            content_id: course.content_id,
            course_id: course.id.clone(),
            completion_status: None,
            success_status: None,
            score: None,
            total_seconds: 0,
            last_sync: None,
            last_synced_at: None,
            remote_created: false,
            created_at: now,
        };
        let stored = self.store.insert_registration(&candidate).await?;
        if stored.id != candidate.id {
            debug!(registration_id = %stored.id, "registration created concurrently, reusing");
        } else if let Err(e) = self.store.increment_dispatch_registrations(&dispatch_id).await {
            warn!(dispatch_id = %dispatch_id, error = %e, "could not bump dispatch registration count");
        }

        if stored.remote_created {
            return Ok(stored);
        }
        Ok(self.push_remote(stored, learner).await)
    }

    /// Destination then dispatch, locally first and remotely when not yet
    /// created there. Returns the dispatch id.
    async fn ensure_dispatch(
        &self,
        course: &ExternalCourse,
        now: DateTime<Utc>,
    ) -> Result<String, RegistrationError> {
        let destination_id = course
            .default_destination_id
            .clone()
            .unwrap_or_else(|| self.default_destination.clone());
        let destination = self
            .store
            .get_or_create_destination(&destination_id, &destination_id, now)
            .await?;
        if !destination.remote_created {
            match self.cloud.ensure_destination(&destination.id, &destination.name).await {
                Ok(_) => self.store.mark_destination_remote(&destination.id).await?,
                Err(e) => {
                    warn!(destination_id = %destination.id, error = %e, "destination not created remotely, continuing with local record")
                }
            }
        }

        let candidate = format!("{}-{}", course.id, destination.id);
        let dispatch = self
            .store
            .get_or_create_dispatch(&course.id, &destination.id, &candidate, now)
            .await?;
        if !dispatch.remote_created {
            match self
                .cloud
                .ensure_dispatch(&dispatch.id, &course.id, &destination.id)
                .await
            {
                Ok(_) => self.store.mark_dispatch_remote(&dispatch.id).await?,
                Err(e) => {
                    warn!(dispatch_id = %dispatch.id, error = %e, "dispatch not created remotely, continuing with local record")
                }
            }
        }
        Ok(dispatch.id)
    }

    async fn push_remote(&self, mut reg: Registration, learner: &Learner) -> Registration {
        let request = NewRegistration {
            registration_id: reg.id.clone(),
            course_id: reg.course_id.clone(),
            learner: learner.clone(),
        };
        match self.cloud.create_registration(&request).await {
            Ok(()) => match self.store.mark_registration_remote(&reg.id).await {
                Ok(()) => reg.remote_created = true,
                Err(e) => {
                    warn!(registration_id = %reg.id, error = %e, "registration created remotely but not marked locally")
                }
            },
            Err(e) => {
                warn!(registration_id = %reg.id, error = %e, "registration not created remotely, will retry on next launch")
            }
        }
        reg
    }

    /// Resolves the registration for (content, learner) and builds its launch URL.
    pub async fn launch(
        &self,
        content_id: ContentId,
        learner_id: LearnerId,
        redirect_url: &str,
        settings: Option<Value>,
    ) -> Result<(Registration, String), RegistrationError> {
        let course = self
            .store
            .course_for_content(content_id)
            .await?
            .ok_or(RegistrationError::NoCourse(content_id))?;
        let learner = self
            .store
            .learner(learner_id)
            .await?
            .ok_or(RegistrationError::UnknownLearner(learner_id))?;

        let reg = self.get_or_create_registration(&course, &learner).await?;
        let url = self
            .cloud
            .build_launch_link(&LaunchRequest {
                registration_id: reg.id.clone(),
                course_id: Some(course.id.clone()),
                redirect_url: redirect_url.to_string(),
                settings,
            })
            .await?;
        info!(registration_id = %reg.id, content_id, learner_id, "launch link issued");
        Ok((reg, url))
    }

    /// Pulls the cloud's snapshot for a registration. True when any tracked
    /// field changed.
    pub async fn sync_status(&self, registration_id: &str) -> Result<bool, RegistrationError> {
        let reg = self.registration(registration_id).await?;
        let status = self.cloud.get_registration_status(registration_id).await?;
        self.apply_status(reg, status).await
    }

    pub async fn apply_webhook(
        &self,
        registration_id: &str,
        hook: CompletionWebhook,
    ) -> Result<bool, RegistrationError> {
        let reg = self.registration(registration_id).await?;
        self.apply_status(reg, hook.into_status(registration_id)).await
    }

    async fn registration(&self, id: &str) -> Result<Registration, RegistrationError> {
        self.store
            .get_registration(id)
            .await?
            .ok_or_else(|| RegistrationError::UnknownRegistration(id.to_string()))
    }

    async fn apply_status(
        &self,
        mut reg: Registration,
        status: RegistrationStatus,
    ) -> Result<bool, RegistrationError> {
        let now = Utc::now();
        let completion = status.completion_status.as_deref().and_then(normalize_status);
        let success = status.success_status.as_deref().and_then(normalize_status);

        let updated = reg.completion_status != completion
            || reg.success_status != success
            || reg.score != status.score
            || reg.total_seconds != status.total_seconds;

        reg.completion_status = completion;
        reg.success_status = success;
        reg.score = status.score;
        reg.total_seconds = status.total_seconds;
        reg.last_sync = Some(status.raw.clone());
        reg.last_synced_at = Some(now);
        self.store.save_registration_sync(&reg).await?;
        info!(registration_id = %reg.id, updated, "registration synced");

        // The registration update stands even if the ledger rejects the copy.
        let snapshot = cmi_tree(&reg, &status);
        if let Err(e) = self
            .ledger
            .apply_remote_snapshot(reg.learner_id, reg.content_id, &snapshot)
            .await
        {
            warn!(registration_id = %reg.id, error = %e, "synced status not forwarded to ledger");
        }
        Ok(updated)
    }
}

/// Renders a cloud snapshot as a SCORM 2004 runtime tree.
fn cmi_tree(reg: &Registration, status: &RegistrationStatus) -> Map<String, Value> {
    let mut raw = Map::new();
    if let Some(c) = &reg.completion_status {
        raw.insert("cmi.completion_status".into(), json!(c));
    }
    if let Some(s) = &reg.success_status {
        raw.insert("cmi.success_status".into(), json!(s));
    }
    if let Some(score) = status.score {
        raw.insert("cmi.score.raw".into(), json!(score));
        raw.insert("cmi.score.min".into(), json!(0));
        raw.insert("cmi.score.max".into(), json!(100));
        raw.insert("cmi.score.scaled".into(), json!(score / 100.0));
    }
    if status.total_seconds > 0 {
        raw.insert(
            "cmi.total_time".into(),
            json!(format_duration_2004(status.total_seconds)),
        );
    }
    if let Some(l) = &status.location {
        raw.insert("cmi.location".into(), json!(l));
    }
    if let Some(d) = &status.suspend_data {
        raw.insert("cmi.suspend_data".into(), json!(d));
    }
    for (n, objective) in status.objectives.iter().enumerate() {
        let Some(obj) = objective.as_object() else { continue };
        let prefix = format!("cmi.objectives.{n}");
        for (from, to) in [
            ("id", "id"),
            ("runtimeObjectiveSuccessStatus", "success_status"),
            ("runtimeObjectiveCompletionStatus", "completion_status"),
            ("runtimeObjectiveScoreScaled", "score.scaled"),
        ] {
            if let Some(v) = obj.get(from).filter(|v| !v.is_null()) {
                let v = match v.as_str().and_then(normalize_status) {
                    Some(s) if to.ends_with("status") => json!(s),
                    _ => v.clone(),
                };
                raw.insert(format!("{prefix}.{to}"), v);
            }
        }
    }
    raw
}
