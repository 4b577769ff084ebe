//! Client for the SCORM Cloud v2 REST API.
//!
//! [`CloudApi`] is the seam the upload worker and registration service talk
//! through; [`CloudClient`] is the reqwest-backed implementation.

mod client;
pub mod error;
pub mod launch;
pub mod policy;
pub mod types;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

pub use client::CloudClient;
pub use error::{CloudError, ErrorClass};
pub use policy::{RetryPolicy, TimeoutPolicy};
pub use types::{
    LaunchRequest, NewRegistration, RegistrationStatus, RemoteDestination, RemoteDispatch,
    UploadedCourse,
};

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub app_id: String,
    pub secret_key: String,
    pub timeouts: TimeoutPolicy,
    pub retry: RetryPolicy,
    pub max_package_bytes: u64,
    /// How many fresh course ids to try after a duplicate-id rejection.
    pub duplicate_id_retries: u32,
    /// Lifetime of the signed preview links built when no session link is available.
    pub launch_link_ttl: Duration,
}

impl ClientSettings {
    /// False when either credential is missing or still a template placeholder.
    pub fn has_credentials(&self) -> bool {
        !is_placeholder(&self.app_id) && !is_placeholder(&self.secret_key)
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: "https://cloud.scorm.com/api/v2".into(),
            app_id: String::new(),
            secret_key: String::new(),
            timeouts: TimeoutPolicy::default(),
            retry: RetryPolicy::default(),
            max_package_bytes: 500 * 1024 * 1024,
            duplicate_id_retries: 3,
            launch_link_ttl: Duration::from_secs(3600),
        }
    }
}

fn is_placeholder(value: &str) -> bool {
    let v = value.trim().to_ascii_lowercase();
    v.is_empty()
        || v.starts_with("your")
        || v.starts_with("changeme")
        || v.starts_with("change_me")
        || v.contains("placeholder")
        || v.starts_with('<')
        || v == "xxx"
}

#[async_trait]
pub trait CloudApi: Send + Sync {
    fn is_configured(&self) -> bool;

    /// Validates, uploads and imports a package, returning the course id the
    /// cloud settled on (which differs from `desired_course_id` after a
    /// duplicate-id retry).
    async fn upload_package(
        &self,
        path: &Path,
        desired_course_id: Option<&str>,
        title: Option<&str>,
    ) -> Result<UploadedCourse, CloudError>;

    async fn ensure_destination(&self, id: &str, name: &str)
        -> Result<RemoteDestination, CloudError>;

    async fn ensure_dispatch(
        &self,
        id: &str,
        course_id: &str,
        destination_id: &str,
    ) -> Result<RemoteDispatch, CloudError>;

    /// An already existing registration with the same id counts as created.
    async fn create_registration(&self, reg: &NewRegistration) -> Result<(), CloudError>;

    async fn build_launch_link(&self, req: &LaunchRequest) -> Result<String, CloudError>;

    async fn get_registration_status(
        &self,
        registration_id: &str,
    ) -> Result<RegistrationStatus, CloudError>;

    /// A course that is already gone counts as deleted.
    async fn delete_course(&self, course_id: &str) -> Result<(), CloudError>;
}
