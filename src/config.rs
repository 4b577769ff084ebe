//! Environment-driven settings.
//!
//! `.env` is loaded by `main` through dotenvy; everything here reads plain
//! variables so tests can feed a lookup closure instead of the process env.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::cloud::{ClientSettings, RetryPolicy, TimeoutPolicy};
use crate::upload::WorkerSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub cloud: ClientSettings,
    pub default_destination: String,
    pub webhook_user: Option<String>,
    pub webhook_password: Option<String>,
    pub worker: WorkerSettings,
    pub health_interval: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let timeouts = TimeoutPolicy {
            connect: Duration::from_secs(parse_or(&get, "HTTP_CONNECT_TIMEOUT_SECS", 10)?),
            read: Duration::from_secs(parse_or(&get, "HTTP_READ_TIMEOUT_SECS", 60)?),
            ..TimeoutPolicy::default()
        };
        let retry = RetryPolicy {
            max_retries: parse_or(&get, "HTTP_MAX_RETRIES", 3)?,
            ..RetryPolicy::default()
        };
        let cloud = ClientSettings {
            base_url: get("SCORM_CLOUD_BASE_URL")
                .unwrap_or_else(|| "https://cloud.scorm.com/api/v2".into()),
            app_id: get("SCORM_CLOUD_APP_ID").unwrap_or_default(),
            secret_key: get("SCORM_CLOUD_SECRET_KEY").unwrap_or_default(),
            max_package_bytes: parse_or::<u64, _>(&get, "UPLOAD_MAX_PACKAGE_MB", 500)? * 1024 * 1024,
            launch_link_ttl: Duration::from_secs(parse_or(&get, "LAUNCH_LINK_TTL_SECS", 3600)?),
            timeouts,
            retry,
            ..ClientSettings::default()
        };

        let worker = WorkerSettings {
            max_retries: parse_or(&get, "UPLOAD_MAX_RETRIES", 3)?,
            ..WorkerSettings::default()
        };

        Ok(Settings {
            database_url,
            port: parse_or(&get, "PORT", 8081)?,
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".into())),
            cloud,
            default_destination: get("SCORM_CLOUD_DEFAULT_DESTINATION")
                .unwrap_or_else(|| "default".into()),
            webhook_user: get("SCORM_CLOUD_WEBHOOK_USER").filter(|s| !s.is_empty()),
            webhook_password: get("SCORM_CLOUD_WEBHOOK_PASSWORD").filter(|s| !s.is_empty()),
            worker,
            health_interval: Duration::from_secs(parse_or(&get, "WORKER_HEALTH_INTERVAL_SECS", 30)?),
        })
    }
}

fn parse_or<T, F>(get: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: v }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_apply() {
        let s = Settings::from_lookup(lookup(&[("DATABASE_URL", "postgres://x")])).unwrap();
        assert_eq!(s.port, 8081);
        assert_eq!(s.data_dir, PathBuf::from("./data"));
        assert_eq!(s.cloud.base_url, "https://cloud.scorm.com/api/v2");
        assert_eq!(s.cloud.max_package_bytes, 500 * 1024 * 1024);
        assert_eq!(s.worker.max_retries, 3);
        assert_eq!(s.default_destination, "default");
        assert!(s.webhook_user.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let s = Settings::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("PORT", "9000"),
            ("SCORM_CLOUD_APP_ID", "app"),
            ("HTTP_MAX_RETRIES", "5"),
            ("UPLOAD_MAX_RETRIES", "1"),
            ("HTTP_READ_TIMEOUT_SECS", "120"),
        ]))
        .unwrap();
        assert_eq!(s.port, 9000);
        assert_eq!(s.cloud.app_id, "app");
        assert_eq!(s.cloud.retry.max_retries, 5);
        assert_eq!(s.worker.max_retries, 1);
        assert_eq!(s.cloud.timeouts.read, Duration::from_secs(120));
    }

    #[test]
    fn missing_database_url_is_an_error() {
        assert!(matches!(
            Settings::from_lookup(lookup(&[])),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
    }

    #[test]
    fn invalid_number_is_reported() {
        let err = Settings::from_lookup(lookup(&[("DATABASE_URL", "x"), ("PORT", "eighty")]))
            .unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }
}
