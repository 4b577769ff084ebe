use axum::{
    extract::{Multipart, Path, State},
    routing::{get, post},
    Json, Router,
};
use axum_extra::{
    headers::{authorization::Basic, Authorization},
    TypedHeader,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use http::{header::USER_AGENT, HeaderMap, StatusCode};
use serde_json::{json, Value};
use sha2::Sha256;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::ledger::Ledger;
use crate::manifest;
use crate::models::*;
use crate::registration::{CompletionWebhook, RegistrationService};
use crate::store::CloudStore;
use crate::upload::{Submitted, UploadQueue, UploadTask};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Ledger,
    pub store: Arc<dyn CloudStore>,
    pub registrations: Arc<RegistrationService>,
    pub uploads: Arc<UploadQueue>,
    pub packages_dir: PathBuf,
    pub max_package_bytes: u64,
    /// Basic-auth credentials the vendor webhook must present.
    pub webhook_auth: Option<(String, String)>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        // runtime progress + launch
        .route("/api/content/:content_id/progress", post(post_progress))
        .route("/api/content/:content_id/launch", post(launch))
        .route("/api/content/:content_id/enrollment", get(get_enrollment))
        // packages
        .route("/api/content/:content_id/package", post(upload_package))
        .route("/api/uploads/status", get(upload_status))
        // cloud reconciliation
        .route("/api/registrations/:id/sync", post(sync_registration))
        .route("/api/webhooks/registrations/:id", post(registration_webhook))
        .with_state(state)
}

fn learner_id(headers: &HeaderMap) -> ApiResult<LearnerId> {
    headers
        .get("x-learner-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| ApiError::Unauthorized("x-learner-id header required".into()))
}

async fn require_content(state: &AppState, content_id: ContentId) -> ApiResult<ContentItem> {
    state
        .store
        .content_item(content_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("content item {content_id} not found")))
}

async fn post_progress(
    State(state): State<AppState>,
    Path(content_id): Path<ContentId>,
    headers: HeaderMap,
    Json(req): Json<ProgressReq>,
) -> ApiResult<Json<ProgressResp>> {
    let learner_id = learner_id(&headers)?;
    require_content(&state, content_id).await?;

    let outcome = state
        .ledger
        .ingest(ProgressUpdate {
            learner_id,
            content_id,
            session_id: req.session_id,
            seq: req.seq,
            client_timestamp: req.client_timestamp,
            scorm_version: req.scorm_version,
            raw: req.raw,
            user_agent: headers
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        })
        .await?;
    Ok(Json(ProgressResp::from(&outcome)))
}

async fn launch(
    State(state): State<AppState>,
    Path(content_id): Path<ContentId>,
    headers: HeaderMap,
    Json(req): Json<LaunchReq>,
) -> ApiResult<Json<LaunchResp>> {
    let learner_id = learner_id(&headers)?;
    let redirect_url = req.redirect_url.unwrap_or_else(|| "blank".into());
    let (reg, url) = state
        .registrations
        .launch(content_id, learner_id, &redirect_url, req.settings)
        .await?;
    Ok(Json(LaunchResp {
        registration_id: reg.id,
        url,
    }))
}

async fn get_enrollment(
    State(state): State<AppState>,
    Path(content_id): Path<ContentId>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let learner_id = learner_id(&headers)?;
    let enrollment = state
        .ledger
        .enrollment(learner_id, content_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("no enrollment for this content".into()))?;
    let attempts = state.ledger.attempts(enrollment.id).await?;
    let attempts: Vec<AttemptView> = attempts.iter().map(AttemptView::from).collect();
    Ok(Json(json!({
        "enrollment": EnrollmentView::from(&enrollment),
        "attempts": attempts,
    })))
}

async fn upload_package(
    State(state): State<AppState>,
    Path(content_id): Path<ContentId>,
    mut mp: Multipart,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_content(&state, content_id).await?;

    let mut title = None;
    let mut zip_bytes: Option<Vec<u8>> = None;
    while let Some(field) = mp
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        if name == "title" {
            title = Some(field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?);
        } else if name == "file" {
            zip_bytes = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?
                    .to_vec(),
            );
        }
    }
    let bytes = zip_bytes.ok_or_else(|| ApiError::BadRequest("file is required".into()))?;
    let info = manifest::inspect_package(&bytes, state.max_package_bytes)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    tokio::fs::create_dir_all(&state.packages_dir).await?;
    let path = state
        .packages_dir
        .join(format!("{content_id}-{}.zip", Uuid::new_v4().simple()));
    tokio::fs::write(&path, &bytes).await?;

    let mut task = UploadTask::new(path.clone(), content_id);
    if let Some(t) = title.filter(|t| !t.trim().is_empty()).or(info.manifest.title) {
        task = task.with_title(t);
    }

    match state.uploads.submit(task).await? {
        Submitted::Queued => {
            info!(content_id, size = info.size, "package accepted");
            Ok((StatusCode::ACCEPTED, Json(json!({"status": "queued"}))))
        }
        Submitted::Duplicate => {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "could not remove duplicate package");
            }
            Err(ApiError::Conflict(format!(
                "an upload for content item {content_id} is already pending"
            )))
        }
        Submitted::Uploaded(course) => Ok((
            StatusCode::OK,
            Json(json!({"status": "uploaded", "course_id": course.course_id, "title": course.title})),
        )),
    }
}

async fn upload_status(State(state): State<AppState>) -> Json<Value> {
    let status = state.uploads.status().await;
    let failed = state.uploads.failed_tasks().await;
    Json(json!({ "status": status, "failed": failed }))
}

async fn sync_registration(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let updated = state.registrations.sync_status(&id).await?;
    Ok(Json(json!({ "updated": updated })))
}

async fn registration_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    auth: Option<TypedHeader<Authorization<Basic>>>,
    Json(hook): Json<CompletionWebhook>,
) -> ApiResult<Json<Value>> {
    let Some((user, password)) = state.webhook_auth.as_ref() else {
        return Err(ApiError::Unavailable("webhook authentication not configured".into()));
    };
    let authorized = auth
        .map(|TypedHeader(Authorization(basic))| {
            // both halves are always compared
            credentials_match(basic.username(), user) & credentials_match(basic.password(), password)
        })
        .unwrap_or(false);
    if !authorized {
        return Err(ApiError::Unauthorized("invalid webhook credentials".into()));
    }

    let updated = state.registrations.apply_webhook(&id, hook).await?;
    info!(registration_id = %id, updated, received_at = %Utc::now(), "completion webhook applied");
    Ok(Json(json!({ "updated": updated })))
}

/// Equality through HMAC tags, so timing does not depend on where the
/// first differing byte is.
fn credentials_match(presented: &str, expected: &str) -> bool {
    let tag = |value: &str| {
        HmacSha256::new_from_slice(CREDENTIAL_TAG_KEY).map(|mut mac| {
            mac.update(value.as_bytes());
            mac
        })
    };
    match (tag(presented), tag(expected)) {
        (Ok(presented), Ok(expected)) => presented
            .verify_slice(&expected.finalize().into_bytes())
            .is_ok(),
        _ => false,
    }
}

const CREDENTIAL_TAG_KEY: &[u8] = b"rustiscorm-webhook-credentials";

type HmacSha256 = Hmac<Sha256>;
