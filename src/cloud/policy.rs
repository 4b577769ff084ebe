//! Retry and timeout policies for cloud calls.

use std::time::Duration;

use super::error::{CloudError, ErrorClass};

const HUNDRED_MB: u64 = 100 * 1024 * 1024;

/// Exponential backoff for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first try; 3 means at most 4 requests.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    /// Cap for exponential growth and for server-sent Retry-After.
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// `initial_backoff * multiplier^retry`, capped at `max_backoff`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(retry as i32);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }

    pub fn should_retry(&self, error: &CloudError, retry: u32) -> bool {
        error.class() == ErrorClass::Transient && retry < self.max_retries
    }

    /// Delay before the next try, preferring a server-sent Retry-After.
    pub fn delay_for(&self, error: &CloudError, retry: u32) -> Duration {
        match error {
            CloudError::RateLimited { retry_after: Some(d) } => (*d).min(self.max_backoff),
            _ => self.backoff(retry),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            backoff_multiplier: 2.0,
        }
    }
}

/// Connect/read timeouts, with size-scaled budgets for uploads and import polling.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    pub connect: Duration,
    pub read: Duration,
    pub upload_base: Duration,
    pub upload_per_100mb: Duration,
    pub upload_max: Duration,
    pub import_base: Duration,
    pub import_per_100mb: Duration,
    pub import_max: Duration,
    pub poll_initial: Duration,
    pub poll_max: Duration,
}

impl TimeoutPolicy {
    pub fn upload_read(&self, size_bytes: u64) -> Duration {
        scaled(self.upload_base, self.upload_per_100mb, self.upload_max, size_bytes)
    }

    pub fn import_wait(&self, size_bytes: u64) -> Duration {
        scaled(self.import_base, self.import_per_100mb, self.import_max, size_bytes)
    }

    /// Next poll interval: grows by half, capped at `poll_max`.
    pub fn next_poll(&self, current: Duration) -> Duration {
        current.mul_f64(1.5).min(self.poll_max)
    }
}

fn scaled(base: Duration, step: Duration, max: Duration, size_bytes: u64) -> Duration {
    let steps = size_bytes.div_ceil(HUNDRED_MB) as u32;
    (base + step * steps).min(max)
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(60),
            upload_base: Duration::from_secs(120),
            upload_per_100mb: Duration::from_secs(120),
            upload_max: Duration::from_secs(1800),
            import_base: Duration::from_secs(300),
            import_per_100mb: Duration::from_secs(120),
            import_max: Duration::from_secs(3600),
            poll_initial: Duration::from_secs(1),
            poll_max: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let p = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        };
        assert_eq!(p.backoff(0), Duration::from_secs(1));
        assert_eq!(p.backoff(1), Duration::from_secs(2));
        assert_eq!(p.backoff(2), Duration::from_secs(4));
        assert_eq!(p.backoff(3), Duration::from_secs(5));
        assert_eq!(p.backoff(10), Duration::from_secs(5));
    }

    #[test]
    fn retry_after_is_capped() {
        let p = RetryPolicy::default();
        let err = CloudError::RateLimited { retry_after: Some(Duration::from_secs(600)) };
        assert_eq!(p.delay_for(&err, 0), p.max_backoff);
        let err = CloudError::RateLimited { retry_after: Some(Duration::from_secs(1)) };
        assert_eq!(p.delay_for(&err, 0), Duration::from_secs(1));
    }

    #[test]
    fn only_transient_errors_retry_within_ceiling() {
        let p = RetryPolicy { max_retries: 2, ..Default::default() };
        let transient = CloudError::Server { status: 502, message: String::new() };
        assert!(p.should_retry(&transient, 0));
        assert!(p.should_retry(&transient, 1));
        assert!(!p.should_retry(&transient, 2));
        assert!(!p.should_retry(&CloudError::NotConfigured, 0));
        assert!(!p.should_retry(&CloudError::DuplicateId("x".into()), 0));
    }

    #[test]
    fn upload_timeout_scales_with_size() {
        let t = TimeoutPolicy::default();
        assert_eq!(t.upload_read(0), Duration::from_secs(120));
        assert_eq!(t.upload_read(1), Duration::from_secs(240));
        assert_eq!(t.upload_read(HUNDRED_MB), Duration::from_secs(240));
        assert_eq!(t.upload_read(HUNDRED_MB + 1), Duration::from_secs(360));
        assert_eq!(t.upload_read(50 * HUNDRED_MB), Duration::from_secs(1800));
    }

    #[test]
    fn poll_interval_grows_to_cap() {
        let t = TimeoutPolicy::default();
        assert_eq!(t.next_poll(Duration::from_secs(2)), Duration::from_secs(3));
        assert_eq!(t.next_poll(Duration::from_secs(9)), Duration::from_secs(10));
    }
}
