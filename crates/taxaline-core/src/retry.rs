//! Retry with exponential backoff for provider transfers

use std::time::Duration;

use indicatif::ProgressBar;

use crate::stream::{StreamError, http_config};

/// Exponential backoff: 2^attempt seconds (2s, 4s, 8s, ...)
pub const fn backoff_duration(attempt: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempt))
}

/// Retry a fallible transfer with exponential backoff.
///
/// Retries only errors whose [`StreamError::is_retryable`] is true, up to
/// `max_retries` from the installed [`HttpConfig`](crate::stream::HttpConfig).
pub fn retry_with_backoff<T>(
    label: &str,
    pb: &ProgressBar,
    attempt_fn: impl FnMut() -> Result<T, StreamError>,
) -> Result<T, StreamError> {
    retry_with_policy(label, pb, http_config().max_retries, backoff_duration, attempt_fn)
}

/// Same as [`retry_with_backoff`] with an explicit retry budget and delay curve.
pub fn retry_with_policy<T>(
    label: &str,
    pb: &ProgressBar,
    max_retries: u32,
    delay: impl Fn(u32) -> Duration,
    mut attempt_fn: impl FnMut() -> Result<T, StreamError>,
) -> Result<T, StreamError> {
    let mut attempt = 0u32;
    loop {
        match attempt_fn() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries && e.is_retryable() => {
                attempt += 1;
                pb.set_message(format!("retry {attempt}/{max_retries}..."));
                log::debug!("{label}: attempt {attempt}/{max_retries} failed: {e}, retrying...");
                std::thread::sleep(delay(attempt));
            }
            Err(e) => {
                log::warn!("{label}: giving up ({}): {e}", e.category());
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_err(status: u16) -> StreamError {
        StreamError::Http {
            status: Some(status),
            message: "test".to_string(),
        }
    }

    #[test]
    fn backoff_exponential() {
        assert_eq!(backoff_duration(1), Duration::from_secs(2));
        assert_eq!(backoff_duration(2), Duration::from_secs(4));
        assert_eq!(backoff_duration(3), Duration::from_secs(8));
    }

    #[test]
    fn retries_until_success() {
        let pb = ProgressBar::hidden();
        let mut calls = 0;
        let result = retry_with_policy("t", &pb, 3, |_| Duration::ZERO, || {
            calls += 1;
            if calls < 3 { Err(http_err(503)) } else { Ok(calls) }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn not_found_is_not_retried() {
        let pb = ProgressBar::hidden();
        let mut calls = 0;
        let result: Result<(), _> = retry_with_policy("t", &pb, 5, |_| Duration::ZERO, || {
            calls += 1;
            Err(http_err(404))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn budget_exhausted() {
        let pb = ProgressBar::hidden();
        let mut calls = 0;
        let result: Result<(), _> = retry_with_policy("t", &pb, 2, |_| Duration::ZERO, || {
            calls += 1;
            Err(http_err(500))
        });
        assert_eq!(result.unwrap_err().status(), Some(500));
        assert_eq!(calls, 3);
    }
}
