use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{looks_like_duplicate, CloudError, ErrorClass};
use super::launch::{self, encode};
use super::types::*;
use super::{CloudApi, ClientSettings};
use crate::manifest::inspect_package;

/// reqwest-backed [`CloudApi`]. Cheap to share behind an `Arc`; the inner
/// `reqwest::Client` pools connections.
#[derive(Clone)]
pub struct CloudClient {
    http: reqwest::Client,
    settings: ClientSettings,
}

impl CloudClient {
    pub fn new(settings: ClientSettings) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .connect_timeout(settings.timeouts.connect)
            .user_agent(concat!("rustiscorm-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CloudError::Network(e.to_string()))?;
        Ok(Self { http, settings })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    fn ensure_configured(&self) -> Result<(), CloudError> {
        if self.settings.has_credentials() {
            Ok(())
        } else {
            Err(CloudError::NotConfigured)
        }
    }

    fn request(&self, method: Method, path: &str, timeout: Duration) -> RequestBuilder {
        let url = format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path);
        self.http
            .request(method, url)
            .basic_auth(&self.settings.app_id, Some(&self.settings.secret_key))
            .timeout(timeout)
    }

    /// Sends one logical call. With `retry` set, transient failures are
    /// retried with backoff up to the policy's ceiling.
    async fn send<F>(&self, op: &'static str, retry: bool, build: F) -> Result<Response, CloudError>
    where
        F: Fn() -> Result<RequestBuilder, CloudError>,
    {
        let policy = &self.settings.retry;
        let mut retries = 0;
        loop {
            let err = match build()?.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => error_from_response(resp).await,
                Err(e) => CloudError::from(e),
            };
            if !retry || !policy.should_retry(&err, retries) {
                return Err(err);
            }
            let delay = policy.delay_for(&err, retries);
            warn!(op, retry = retries + 1, ?delay, error = %err, "transient cloud failure, retrying");
            tokio::time::sleep(delay).await;
            retries += 1;
        }
    }

    async fn get_json(&self, op: &'static str, path: &str) -> Result<Value, CloudError> {
        let read = self.settings.timeouts.read;
        let resp = self
            .send(op, true, || Ok(self.request(Method::GET, path, read)))
            .await?;
        Ok(resp.json().await?)
    }

    async fn post_json(&self, op: &'static str, path: &str, body: &Value) -> Result<Response, CloudError> {
        let read = self.settings.timeouts.read;
        self.send(op, false, || Ok(self.request(Method::POST, path, read).json(body)))
            .await
    }

    async fn start_import(
        &self,
        bytes: &[u8],
        file_name: &str,
        course_id: &str,
        title: &str,
    ) -> Result<String, CloudError> {
        let timeout = self.settings.timeouts.upload_read(bytes.len() as u64);
        let resp = self
            .send("upload", true, || {
                let part = reqwest::multipart::Part::bytes(bytes.to_vec())
                    .file_name(file_name.to_string())
                    .mime_str("application/zip")
                    .map_err(|e| CloudError::Decode(e.to_string()))?;
                let form = reqwest::multipart::Form::new().part("file", part);
                Ok(self
                    .request(Method::POST, "courses/importJobs/upload", timeout)
                    .query(&[
                        ("courseId", course_id),
                        ("mayCreateNewVersion", "false"),
                        ("title", title),
                    ])
                    .multipart(form))
            })
            .await?;
        let job: StringResult = resp.json().await?;
        Ok(job.result)
    }

    async fn import_status(&self, job_id: &str) -> Result<ImportJob, CloudError> {
        let path = format!("courses/importJobs/{}", encode(job_id));
        let raw = self.get_json("import_status", &path).await?;
        serde_json::from_value(raw).map_err(|e| CloudError::Decode(e.to_string()))
    }

    /// Polls an import job with growing intervals until it settles or the
    /// size-scaled budget runs out, then checks one last time.
    async fn wait_for_import(
        &self,
        job_id: &str,
        course_id: &str,
        title: &str,
        size: u64,
    ) -> Result<UploadedCourse, CloudError> {
        let timeouts = &self.settings.timeouts;
        let deadline = Instant::now() + timeouts.import_wait(size);
        let mut interval = timeouts.poll_initial;

        loop {
            let job = self.import_status(job_id).await?;
            debug!(job_id, status = %job.status, "import job polled");
            if let Some(done) = settle(job_id, job, course_id, title) {
                return done;
            }
            if Instant::now() + interval >= deadline {
                break;
            }
            tokio::time::sleep(interval).await;
            interval = timeouts.next_poll(interval);
        }

        let job = self.import_status(job_id).await?;
        settle(job_id, job, course_id, title)
            .unwrap_or_else(|| Err(CloudError::ImportTimedOut(job_id.to_string())))
    }

    async fn import_once(
        &self,
        bytes: &[u8],
        file_name: &str,
        course_id: &str,
        title: &str,
    ) -> Result<UploadedCourse, CloudError> {
        let job_id = self.start_import(bytes, file_name, course_id, title).await?;
        info!(course_id, job_id = %job_id, "import job started");
        self.wait_for_import(&job_id, course_id, title, bytes.len() as u64)
            .await
    }

    async fn session_link(
        &self,
        registration_id: &str,
        body: &Value,
        configuration: Option<&Value>,
    ) -> Result<String, CloudError> {
        let reg = encode(registration_id);
        if let Some(config) = configuration {
            let path = format!("registrations/{reg}/configuration");
            if let Err(e) = self.post_json("registration_configuration", &path, config).await {
                if e.class() == ErrorClass::Configuration {
                    return Err(e);
                }
                warn!(registration_id, error = %e, "could not apply launch configuration");
            }
        }
        let path = format!("registrations/{reg}/launchLink");
        let resp = self.post_json("launch_link", &path, body).await?;
        let link: LaunchLinkResponse = resp.json().await?;
        Ok(link.launch_link)
    }
}

async fn error_from_response(resp: Response) -> CloudError {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = resp.text().await.unwrap_or_default();
    CloudError::from_status(status, &body, retry_after)
}

/// Maps a finished import job onto its outcome; `None` while still running.
fn settle(
    job_id: &str,
    job: ImportJob,
    course_id: &str,
    title: &str,
) -> Option<Result<UploadedCourse, CloudError>> {
    match job.status.to_ascii_uppercase().as_str() {
        "COMPLETE" => {
            let course = job.import_result.and_then(|r| r.course);
            Some(Ok(UploadedCourse {
                course_id: course
                    .as_ref()
                    .map(|c| c.id.clone())
                    .unwrap_or_else(|| course_id.to_string()),
                title: course
                    .and_then(|c| c.title)
                    .unwrap_or_else(|| title.to_string()),
            }))
        }
        status @ ("ERROR" | "CANCELLED") => {
            let message = job
                .message
                .or_else(|| job.import_result.and_then(|r| r.message))
                .unwrap_or_default();
            if looks_like_duplicate(&message) {
                return Some(Err(CloudError::DuplicateId(message)));
            }
            Some(Err(CloudError::ImportFailed {
                job_id: job_id.to_string(),
                status: status.to_string(),
                message,
            }))
        }
        _ => None,
    }
}

/// `{slug}-{8 hex}`; a previous random suffix is replaced, not stacked.
pub(crate) fn fresh_course_id(base: &str) -> String {
    let mut slug: String = base
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let mut slug = slug.trim_matches('-').to_string();

    if let Some((head, tail)) = slug.rsplit_once('-') {
        if tail.len() == 8 && tail.chars().all(|c| c.is_ascii_hexdigit()) {
            slug = head.to_string();
        }
    }
    if slug.is_empty() {
        slug = "course".into();
    }
    slug.truncate(64);

    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", slug.trim_end_matches('-'), &suffix[..8])
}

#[async_trait]
impl CloudApi for CloudClient {
    fn is_configured(&self) -> bool {
        self.settings.has_credentials()
    }

    async fn upload_package(
        &self,
        path: &Path,
        desired_course_id: Option<&str>,
        title: Option<&str>,
    ) -> Result<UploadedCourse, CloudError> {
        self.ensure_configured()?;
        let bytes = tokio::fs::read(path).await?;
        let info = inspect_package(&bytes, self.settings.max_package_bytes)?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("package.zip")
            .to_string();
        let title = title
            .map(str::to_string)
            .or(info.manifest.title)
            .unwrap_or_else(|| file_name.trim_end_matches(".zip").to_string());
        let mut course_id = desired_course_id
            .map(str::to_string)
            .unwrap_or_else(|| fresh_course_id(&title));

        let mut conflicts = 0;
        loop {
            match self.import_once(&bytes, &file_name, &course_id, &title).await {
                Ok(course) => {
                    info!(course_id = %course.course_id, size = info.size, "package imported");
                    return Ok(course);
                }
                Err(CloudError::DuplicateId(_)) if conflicts < self.settings.duplicate_id_retries => {
                    conflicts += 1;
                    let next = fresh_course_id(&course_id);
                    warn!(taken = %course_id, next = %next, "course id already exists, retrying");
                    course_id = next;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn ensure_destination(
        &self,
        id: &str,
        name: &str,
    ) -> Result<RemoteDestination, CloudError> {
        self.ensure_configured()?;
        let path = format!("dispatch/destinations/{}", encode(id));
        match self.get_json("get_destination", &path).await {
            Ok(raw) => {
                let found: DestinationSchema =
                    serde_json::from_value(raw).map_err(|e| CloudError::Decode(e.to_string()))?;
                return Ok(RemoteDestination {
                    id: id.to_string(),
                    name: found.data.name,
                });
            }
            Err(CloudError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let schema = DestinationSchema {
            id: id.to_string(),
            data: DestinationData { name: name.to_string() },
        };
        let body = serde_json::to_value(DestinationList { destinations: vec![&schema] })
            .map_err(|e| CloudError::Decode(e.to_string()))?;
        match self.post_json("create_destination", "dispatch/destinations", &body).await {
            Ok(_) | Err(CloudError::DuplicateId(_)) => {}
            Err(e) => return Err(e),
        }
        info!(destination_id = id, "destination created");
        Ok(RemoteDestination {
            id: id.to_string(),
            name: name.to_string(),
        })
    }

    async fn ensure_dispatch(
        &self,
        id: &str,
        course_id: &str,
        destination_id: &str,
    ) -> Result<RemoteDispatch, CloudError> {
        self.ensure_configured()?;
        let path = format!("dispatch/dispatches/{}", encode(id));
        match self.get_json("get_dispatch", &path).await {
            Ok(raw) => {
                let found: DispatchSchema =
                    serde_json::from_value(raw).map_err(|e| CloudError::Decode(e.to_string()))?;
                return Ok(RemoteDispatch {
                    id: id.to_string(),
                    course_id: found.data.course_id,
                    destination_id: found.data.destination_id,
                    enabled: found.data.enabled,
                });
            }
            Err(CloudError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let schema = DispatchSchema {
            id: id.to_string(),
            data: DispatchData {
                destination_id: destination_id.to_string(),
                course_id: course_id.to_string(),
                allow_new_registrations: true,
                instanced: false,
                registration_cap: 0,
                enabled: true,
            },
        };
        let body = serde_json::to_value(DispatchList { dispatches: vec![&schema] })
            .map_err(|e| CloudError::Decode(e.to_string()))?;
        match self.post_json("create_dispatch", "dispatch/dispatches", &body).await {
            Ok(_) | Err(CloudError::DuplicateId(_)) => {}
            Err(e) => return Err(e),
        }
        info!(dispatch_id = id, course_id, destination_id, "dispatch created");
        Ok(RemoteDispatch {
            id: id.to_string(),
            course_id: course_id.to_string(),
            destination_id: destination_id.to_string(),
            enabled: true,
        })
    }

    async fn create_registration(&self, reg: &NewRegistration) -> Result<(), CloudError> {
        self.ensure_configured()?;
        let body = serde_json::to_value(CreateRegistrationBody {
            course_id: reg.course_id.clone(),
            registration_id: reg.registration_id.clone(),
            learner: (&reg.learner).into(),
        })
        .map_err(|e| CloudError::Decode(e.to_string()))?;
        match self.post_json("create_registration", "registrations", &body).await {
            Ok(_) => {
                info!(registration_id = %reg.registration_id, "registration created");
                Ok(())
            }
            Err(CloudError::DuplicateId(_)) => {
                debug!(registration_id = %reg.registration_id, "registration already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn build_launch_link(&self, req: &LaunchRequest) -> Result<String, CloudError> {
        self.ensure_configured()?;
        let settings = launch::merged_settings(req.settings.as_ref());
        let (body, configuration) = launch::split_settings(settings, &req.redirect_url);

        let err = match self
            .session_link(&req.registration_id, &body, configuration.as_ref())
            .await
        {
            Ok(url) => return Ok(url),
            Err(e) if e.class() == ErrorClass::Configuration => return Err(e),
            Err(e) => e,
        };
        let Some(course_id) = req.course_id.as_deref() else {
            return Err(err);
        };

        warn!(
            registration_id = %req.registration_id,
            error = %err,
            "session launch link unavailable, falling back to signed preview"
        );
        let ttl = chrono::Duration::from_std(self.settings.launch_link_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        launch::signed_preview_url(
            &self.settings.base_url,
            &self.settings.app_id,
            &self.settings.secret_key,
            course_id,
            &req.registration_id,
            &req.redirect_url,
            Utc::now() + ttl,
        )
    }

    async fn get_registration_status(
        &self,
        registration_id: &str,
    ) -> Result<RegistrationStatus, CloudError> {
        self.ensure_configured()?;
        let path = format!(
            "registrations/{}?includeRuntime=true&includeInteractionsAndObjectives=true",
            encode(registration_id)
        );
        let raw = self.get_json("registration_status", &path).await?;
        let schema: RegistrationSchema =
            serde_json::from_value(raw.clone()).map_err(|e| CloudError::Decode(e.to_string()))?;
        Ok(schema.into_status(raw))
    }

    async fn delete_course(&self, course_id: &str) -> Result<(), CloudError> {
        self.ensure_configured()?;
        let path = format!("courses/{}", encode(course_id));
        let read = self.settings.timeouts.read;
        match self
            .send("delete_course", true, || Ok(self.request(Method::DELETE, &path, read)))
            .await
        {
            Ok(_) => {
                info!(course_id, "course deleted");
                Ok(())
            }
            Err(CloudError::NotFound(_)) => {
                debug!(course_id, "course already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{RetryPolicy, TimeoutPolicy};
    use crate::manifest::fixtures::scorm12_package;
    use crate::models::Learner;
    use serde_json::json;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(server: &MockServer) -> ClientSettings {
        ClientSettings {
            base_url: server.uri(),
            app_id: "app".into(),
            secret_key: "secret".into(),
            retry: RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                backoff_multiplier: 2.0,
            },
            timeouts: TimeoutPolicy {
                poll_initial: Duration::from_millis(5),
                poll_max: Duration::from_millis(10),
                ..TimeoutPolicy::default()
            },
            ..ClientSettings::default()
        }
    }

    fn package_file(dir: &tempfile::TempDir, bytes: &[u8]) -> std::path::PathBuf {
        let p = dir.path().join("fire-safety.zip");
        std::fs::write(&p, bytes).unwrap();
        p
    }

    #[tokio::test]
    async fn unconfigured_client_fails_fast() {
        let client = CloudClient::new(ClientSettings::default()).unwrap();
        assert!(!client.is_configured());
        let err = client.get_registration_status("r1").await.unwrap_err();
        assert!(matches!(err, CloudError::NotConfigured));
        assert_eq!(err.class(), ErrorClass::Configuration);
    }

    #[tokio::test]
    async fn get_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/registrations/r1"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/registrations/r1"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "r1",
                "registrationCompletion": "COMPLETED",
                "score": {"scaled": 90}
            })))
            .mount(&server)
            .await;

        let client = CloudClient::new(settings(&server)).unwrap();
        let status = client.get_registration_status("r1").await.unwrap();
        assert_eq!(status.completion_status.as_deref(), Some("COMPLETED"));
        assert_eq!(status.score, Some(90.0));
    }

    #[tokio::test]
    async fn rate_limit_exhausts_retry_ceiling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/registrations/r1"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .expect(3)
            .mount(&server)
            .await;

        let client = CloudClient::new(settings(&server)).unwrap();
        let err = client.get_registration_status("r1").await.unwrap_err();
        assert!(matches!(err, CloudError::RateLimited { retry_after: Some(d) } if d.is_zero()));
    }

    #[tokio::test]
    async fn registration_post_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/registrations"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let client = CloudClient::new(settings(&server)).unwrap();
        let err = client
            .create_registration(&NewRegistration {
                registration_id: "r1".into(),
                course_id: "c1".into(),
                learner: Learner { id: 7, display_name: "Ada Lovelace".into(), email: "ada@example.com".into() },
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Server { status: 500, .. }));
    }

    #[tokio::test]
    async fn existing_registration_counts_as_created() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/registrations"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Registration r1 already exists"))
            .mount(&server)
            .await;

        let client = CloudClient::new(settings(&server)).unwrap();
        client
            .create_registration(&NewRegistration {
                registration_id: "r1".into(),
                course_id: "c1".into(),
                learner: Learner { id: 7, display_name: "Ada".into(), email: "ada@example.com".into() },
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn upload_polls_import_until_complete() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/courses/importJobs/upload"))
            .and(query_param("courseId", "fire-safety"))
            .and(query_param("mayCreateNewVersion", "false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "job-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/courses/importJobs/job-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jobId": "job-1", "status": "RUNNING"})))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/courses/importJobs/job-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobId": "job-1",
                "status": "COMPLETE",
                "importResult": {"course": {"id": "fire-safety", "title": "Fire Safety"}}
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file = package_file(&dir, &scorm12_package());
        let client = CloudClient::new(settings(&server)).unwrap();
        let course = client
            .upload_package(&file, Some("fire-safety"), None)
            .await
            .unwrap();
        assert_eq!(course.course_id, "fire-safety");
        assert_eq!(course.title, "Fire Safety");
    }

    #[tokio::test]
    async fn duplicate_course_id_is_regenerated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/courses/importJobs/upload"))
            .and(query_param("courseId", "dup"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Course dup already exists"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/courses/importJobs/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "job-2"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/courses/importJobs/job-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "COMPLETE"})))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file = package_file(&dir, &scorm12_package());
        let client = CloudClient::new(settings(&server)).unwrap();
        let course = client.upload_package(&file, Some("dup"), Some("Dup")).await.unwrap();
        assert!(course.course_id.starts_with("dup-"));
        assert_eq!(course.course_id.len(), "dup-".len() + 8);
        assert_eq!(course.title, "Dup");
    }

    #[tokio::test]
    async fn import_error_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/courses/importJobs/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "job-3"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/courses/importJobs/job-3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ERROR",
                "message": "manifest references missing file"
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file = package_file(&dir, &scorm12_package());
        let client = CloudClient::new(settings(&server)).unwrap();
        let err = client.upload_package(&file, Some("c3"), None).await.unwrap_err();
        assert!(matches!(err, CloudError::ImportFailed { ref status, .. } if status == "ERROR"));
        assert!(!err.is_requeueable());
    }

    #[tokio::test]
    async fn invalid_archive_never_reaches_the_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file = package_file(&dir, b"definitely not a zip");
        let client = CloudClient::new(settings(&server)).unwrap();
        let err = client.upload_package(&file, None, None).await.unwrap_err();
        assert!(matches!(err, CloudError::InvalidPackage(_)));
    }

    #[tokio::test]
    async fn ensure_destination_creates_when_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dispatch/destinations/default"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/dispatch/destinations"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = CloudClient::new(settings(&server)).unwrap();
        let d = client.ensure_destination("default", "Default").await.unwrap();
        assert_eq!(d, RemoteDestination { id: "default".into(), name: "Default".into() });
    }

    #[tokio::test]
    async fn ensure_dispatch_reuses_existing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dispatch/dispatches/d1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "d1",
                "data": {"destinationId": "default", "courseId": "c1", "enabled": false}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/dispatch/dispatches"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let client = CloudClient::new(settings(&server)).unwrap();
        let d = client.ensure_dispatch("d1", "c1", "default").await.unwrap();
        assert_eq!(d.course_id, "c1");
        assert!(!d.enabled);
    }

    #[tokio::test]
    async fn launch_link_applies_configuration_first() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/registrations/r1/configuration"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/registrations/r1/launchLink"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"launchLink": "https://cloud/launch/abc"})))
            .mount(&server)
            .await;

        let client = CloudClient::new(settings(&server)).unwrap();
        let url = client
            .build_launch_link(&LaunchRequest {
                registration_id: "r1".into(),
                redirect_url: "https://lms/back".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(url, "https://cloud/launch/abc");
    }

    #[tokio::test]
    async fn orphaned_registration_falls_back_to_signed_preview() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("registration not found"))
            .mount(&server)
            .await;

        let client = CloudClient::new(settings(&server)).unwrap();
        let url = client
            .build_launch_link(&LaunchRequest {
                registration_id: "r1".into(),
                course_id: Some("c1".into()),
                redirect_url: "https://lms/back".into(),
                settings: None,
            })
            .await
            .unwrap();
        assert!(url.starts_with(&format!("{}/courses/c1/preview?", server.uri())));
        assert!(url.contains("signature="));

        let err = client
            .build_launch_link(&LaunchRequest {
                registration_id: "r1".into(),
                redirect_url: "https://lms/back".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::NotFound(_)));
    }

    #[tokio::test]
    async fn deleting_missing_course_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/courses/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = CloudClient::new(settings(&server)).unwrap();
        client.delete_course("gone").await.unwrap();
    }

    #[test]
    fn fresh_ids_replace_previous_suffix() {
        let a = fresh_course_id("Fire Safety 101!");
        assert!(a.starts_with("fire-safety-101-"));
        let b = fresh_course_id(&a);
        assert_eq!(b.len(), a.len());
        assert!(b.starts_with("fire-safety-101-"));
        assert!(fresh_course_id("***").starts_with("course-"));
    }
}
