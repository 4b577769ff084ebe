//! Wire shapes for the cloud's v2 REST API and the values the client returns.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DisplayFromStr, PickFirst};

use crate::models::Learner;

#[derive(Debug, Clone, PartialEq)]
pub struct UploadedCourse {
    pub course_id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDestination {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDispatch {
    pub id: String,
    pub course_id: String,
    pub destination_id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct NewRegistration {
    pub registration_id: String,
    pub course_id: String,
    pub learner: Learner,
}

#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub registration_id: String,
    /// Needed for the signed preview fallback.
    pub course_id: Option<String>,
    pub redirect_url: String,
    /// Caller overrides, deep-merged over the default launch settings.
    pub settings: Option<Value>,
}

/// Normalised snapshot of a registration as the cloud reports it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegistrationStatus {
    pub registration_id: String,
    pub completion_status: Option<String>,
    pub success_status: Option<String>,
    /// Percentage, 0..=100.
    pub score: Option<f64>,
    pub total_seconds: i64,
    pub location: Option<String>,
    pub suspend_data: Option<String>,
    pub objectives: Vec<Value>,
    pub raw: Value,
}

// --- import jobs ---

#[derive(Debug, Deserialize)]
pub(crate) struct StringResult {
    pub result: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ImportJob {
    #[serde(default)]
    pub job_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub import_result: Option<ImportResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ImportResult {
    #[serde(default)]
    pub course: Option<ImportedCourse>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImportedCourse {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
}

// --- dispatch ---

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DestinationSchema {
    #[serde(default)]
    pub id: String,
    pub data: DestinationData,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DestinationData {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct DestinationList<'a> {
    pub destinations: Vec<&'a DestinationSchema>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DispatchSchema {
    #[serde(default)]
    pub id: String,
    pub data: DispatchData,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DispatchData {
    pub destination_id: String,
    pub course_id: String,
    #[serde(default = "yes")]
    pub allow_new_registrations: bool,
    #[serde(default)]
    pub instanced: bool,
    #[serde(default)]
    pub registration_cap: i32,
    #[serde(default = "yes")]
    pub enabled: bool,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub(crate) struct DispatchList<'a> {
    pub dispatches: Vec<&'a DispatchSchema>,
}

// --- registrations ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateRegistrationBody {
    pub course_id: String,
    pub registration_id: String,
    pub learner: LearnerSchema,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LearnerSchema {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl From<&Learner> for LearnerSchema {
    fn from(l: &Learner) -> Self {
        let (first_name, last_name) = l.name_parts();
        Self {
            id: l.id.to_string(),
            first_name,
            last_name,
            email: l.email.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LaunchLinkResponse {
    pub launch_link: String,
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegistrationSchema {
    pub id: String,
    #[serde(default)]
    pub registration_completion: Option<String>,
    #[serde(default)]
    pub registration_success: Option<String>,
    #[serde(default)]
    pub score: Option<ScoreSchema>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub total_seconds_tracked: Option<f64>,
    #[serde(default)]
    pub activity_details: Option<ActivitySchema>,
}

#[serde_as]
#[derive(Debug, Deserialize)]
pub(crate) struct ScoreSchema {
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub scaled: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ActivitySchema {
    #[serde(default)]
    pub runtime: Option<RuntimeSchema>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RuntimeSchema {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub suspend_data: Option<String>,
    #[serde(default)]
    pub runtime_objectives: Vec<Value>,
}

impl RegistrationSchema {
    pub fn into_status(self, raw: Value) -> RegistrationStatus {
        let runtime = self.activity_details.and_then(|a| a.runtime);
        let (location, suspend_data, objectives) = match runtime {
            Some(r) => (r.location, r.suspend_data, r.runtime_objectives),
            None => (None, None, Vec::new()),
        };
        RegistrationStatus {
            registration_id: self.id,
            completion_status: self.registration_completion,
            success_status: self.registration_success,
            score: self.score.and_then(|s| s.scaled),
            total_seconds: self.total_seconds_tracked.map(|s| s as i64).unwrap_or(0),
            location,
            suspend_data,
            objectives,
            raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registration_schema_accepts_stringly_numbers() {
        let raw = json!({
            "id": "r1",
            "registrationCompletion": "COMPLETED",
            "registrationSuccess": "PASSED",
            "score": {"scaled": "85"},
            "totalSecondsTracked": 3723.4,
            "activityDetails": {"runtime": {"location": "p3", "runtimeObjectives": [{"id": "o1"}]}}
        });
        let schema: RegistrationSchema = serde_json::from_value(raw.clone()).unwrap();
        let status = schema.into_status(raw);
        assert_eq!(status.score, Some(85.0));
        assert_eq!(status.total_seconds, 3723);
        assert_eq!(status.location.as_deref(), Some("p3"));
        assert_eq!(status.objectives.len(), 1);
        assert_eq!(status.completion_status.as_deref(), Some("COMPLETED"));
    }

    #[test]
    fn registration_schema_tolerates_missing_sections() {
        let raw = json!({"id": "r2"});
        let schema: RegistrationSchema = serde_json::from_value(raw.clone()).unwrap();
        let status = schema.into_status(raw);
        assert_eq!(status.score, None);
        assert_eq!(status.total_seconds, 0);
        assert!(status.objectives.is_empty());
    }
}
