use std::time::Duration;
use thiserror::Error;

use crate::manifest::PackageError;

/// How the caller should react to a failed cloud call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Missing or rejected credentials. Never retried.
    Configuration,
    /// Timeouts, refused connections, 429 and 5xx. Retried with backoff.
    Transient,
    /// The external id is already taken. Resolved by picking a new id.
    Conflict,
    /// Everything else: bad input, bad archive, failed import.
    Permanent,
}

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("integration not configured for this account")]
    NotConfigured,

    #[error("cloud credentials rejected ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by cloud service")]
    RateLimited { retry_after: Option<Duration> },

    #[error("cloud service error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("external id already exists: {0}")]
    DuplicateId(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid package: {0}")]
    InvalidPackage(#[from] PackageError),

    #[error("import job {job_id} ended with {status}: {message}")]
    ImportFailed {
        job_id: String,
        status: String,
        message: String,
    },

    #[error("import job {0} did not finish in time")]
    ImportTimedOut(String),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CloudError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CloudError::NotConfigured | CloudError::Unauthorized { .. } => ErrorClass::Configuration,
            CloudError::Timeout(_)
            | CloudError::Network(_)
            | CloudError::RateLimited { .. }
            | CloudError::Server { .. }
            | CloudError::ImportTimedOut(_) => ErrorClass::Transient,
            CloudError::DuplicateId(_) => ErrorClass::Conflict,
            CloudError::NotFound(_)
            | CloudError::Rejected { .. }
            | CloudError::InvalidPackage(_)
            | CloudError::ImportFailed { .. }
            | CloudError::Decode(_)
            | CloudError::Io(_) => ErrorClass::Permanent,
        }
    }

    /// Whether a queued task hitting this error is worth another go.
    pub fn is_requeueable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Conflict)
    }

    /// Maps a non-success HTTP status and body onto the taxonomy.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let message = truncate(body, 512);
        match status {
            401 | 403 => CloudError::Unauthorized { status, message },
            404 => CloudError::NotFound(message),
            409 => CloudError::DuplicateId(message),
            429 => CloudError::RateLimited { retry_after },
            400 if looks_like_duplicate(body) => CloudError::DuplicateId(message),
            s if s >= 500 => CloudError::Server { status, message },
            _ => CloudError::Rejected { status, message },
        }
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CloudError::Timeout(e.to_string())
        } else if e.is_decode() {
            CloudError::Decode(e.to_string())
        } else {
            CloudError::Network(e.to_string())
        }
    }
}

pub(crate) fn looks_like_duplicate(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("already exists") || m.contains("duplicate")
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(CloudError::from_status(429, "", None).class(), ErrorClass::Transient);
        assert_eq!(CloudError::from_status(503, "down", None).class(), ErrorClass::Transient);
        assert_eq!(CloudError::from_status(401, "", None).class(), ErrorClass::Configuration);
        assert_eq!(CloudError::from_status(409, "", None).class(), ErrorClass::Conflict);
        assert_eq!(
            CloudError::from_status(400, "Course ID already exists", None).class(),
            ErrorClass::Conflict
        );
        assert_eq!(CloudError::from_status(400, "bad title", None).class(), ErrorClass::Permanent);
        assert!(matches!(CloudError::from_status(404, "", None), CloudError::NotFound(_)));
    }

    #[test]
    fn requeue_only_transient_and_conflict() {
        assert!(CloudError::Timeout("t".into()).is_requeueable());
        assert!(CloudError::DuplicateId("x".into()).is_requeueable());
        assert!(!CloudError::NotConfigured.is_requeueable());
        assert!(!CloudError::InvalidPackage(PackageError::NotZip).is_requeueable());
    }

    #[test]
    fn not_configured_message_is_actionable() {
        assert_eq!(
            CloudError::NotConfigured.to_string(),
            "integration not configured for this account"
        );
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundary() {
        let body = "é".repeat(400);
        match CloudError::from_status(500, &body, None) {
            CloudError::Server { message, .. } => assert!(message.len() <= 512 + '…'.len_utf8()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
