//! Exponential backoff with jitter and transport retry eligibility.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Relative jitter applied around the computed delay, in `[0, 1]`.
    pub jitter_factor: f64,
    pub max_retries: u32,
    pub retryable_status_codes: Vec<u16>,
    pub retryable_methods: Vec<HttpMethod>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            max_retries: 3,
            retryable_status_codes: (500..=599).chain([429]).collect(),
            retryable_methods: vec![HttpMethod::Get, HttpMethod::Put, HttpMethod::Delete],
        }
    }
}

impl BackoffConfig {
    /// Doubling backoff between `initial_delay_ms` and `max_delay_ms`, no jitter.
    pub fn exponential(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            jitter_factor: 0.0,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Delay before retry number `attempt` (1-based).
///
/// `min(max, initial * multiplier^(attempt - 1)) * (1 ± jitter)`, with the
/// jitter drawn uniformly. Attempt 0 yields no delay.
pub fn compute_delay(attempt: u32, config: &BackoffConfig) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
    let raw = config.initial_delay_ms as f64 * config.backoff_multiplier.powi(exponent);
    let capped = raw.min(config.max_delay_ms as f64);

    let jitter = config.jitter_factor.clamp(0.0, 1.0);
    let delay = if jitter > 0.0 {
        capped * (1.0 + rand::thread_rng().gen_range(-jitter..=jitter))
    } else {
        capped
    };

    Duration::from_millis(delay.max(0.0).round() as u64)
}

/// Failure surface inspected by retry decisions.
///
/// Errors without a status code are not transport errors and never retried.
pub trait TransportError {
    fn status_code(&self) -> Option<u16>;

    /// Raw `Retry-After` value, seconds or an HTTP-date.
    fn retry_after(&self) -> Option<&str> {
        None
    }
}

/// Status and method both allow a retry, regardless of attempts used.
pub fn is_retryable<E: TransportError + ?Sized>(
    error: &E,
    method: HttpMethod,
    config: &BackoffConfig,
) -> bool {
    error
        .status_code()
        .is_some_and(|status| config.retryable_status_codes.contains(&status))
        && config.retryable_methods.contains(&method)
}

pub fn should_retry<E: TransportError + ?Sized>(
    error: &E,
    method: HttpMethod,
    attempt_count: u32,
    config: &BackoffConfig,
) -> bool {
    is_retryable(error, method, config) && attempt_count < config.max_retries
}

/// Delay dictated by a `Retry-After` value, capped at `max_delay_ms`.
///
/// Past or unparseable dates yield no override.
pub fn retry_after_delay(
    value: &str,
    config: &BackoffConfig,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let value = value.trim();
    let requested = if let Ok(seconds) = value.parse::<u64>() {
        Duration::from_secs(seconds)
    } else {
        let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
        if at <= now {
            return None;
        }
        (at - now).to_std().ok()?
    };
    Some(requested.min(config.max_delay()))
}

/// Backoff delay for `attempt`, overridden by the error's `Retry-After` when present.
pub fn delay_for<E: TransportError + ?Sized>(
    error: &E,
    attempt: u32,
    config: &BackoffConfig,
) -> Duration {
    error
        .retry_after()
        .and_then(|value| retry_after_delay(value, config, Utc::now()))
        .unwrap_or_else(|| compute_delay(attempt, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Status(Option<u16>);

    impl TransportError for Status {
        fn status_code(&self) -> Option<u16> {
            self.0
        }
    }

    fn deterministic() -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: 10,
            max_delay_ms: 30,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            ..BackoffConfig::default()
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let config = BackoffConfig {
            max_delay_ms: 1_000,
            ..deterministic()
        };
        let delays: Vec<u128> = (1..=3).map(|a| compute_delay(a, &config).as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 40]);

        let capped = deterministic();
        assert_eq!(compute_delay(3, &capped), Duration::from_millis(30));
        assert_eq!(compute_delay(0, &capped), Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = BackoffConfig {
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            jitter_factor: 0.2,
            ..BackoffConfig::default()
        };
        for _ in 0..100 {
            let ms = compute_delay(1, &config).as_millis();
            assert!((800..=1_200).contains(&ms), "delay {ms} outside jitter band");
        }
    }

    #[test]
    fn test_should_retry_rules() {
        let config = deterministic();
        assert!(should_retry(&Status(Some(503)), HttpMethod::Get, 1, &config));
        assert!(should_retry(&Status(Some(429)), HttpMethod::Delete, 2, &config));
        assert!(!should_retry(&Status(Some(503)), HttpMethod::Get, 3, &config));
        assert!(!should_retry(&Status(Some(503)), HttpMethod::Post, 1, &config));
        assert!(!should_retry(&Status(Some(400)), HttpMethod::Get, 1, &config));
        assert!(!should_retry(&Status(None), HttpMethod::Get, 1, &config));

        let post_allowed = BackoffConfig {
            retryable_methods: vec![HttpMethod::Post],
            ..deterministic()
        };
        assert!(should_retry(&Status(Some(502)), HttpMethod::Post, 1, &post_allowed));
    }

    #[test]
    fn test_retry_after_seconds_capped() {
        let config = deterministic();
        let now = Utc::now();
        assert_eq!(
            retry_after_delay("0", &config, now),
            Some(Duration::ZERO)
        );
        assert_eq!(
            retry_after_delay("120", &config, now),
            Some(Duration::from_millis(30))
        );
    }

    #[test]
    fn test_retry_after_http_date() {
        let config = BackoffConfig {
            max_delay_ms: 60_000,
            ..deterministic()
        };
        let now = Utc::now();
        let future = (now + chrono::Duration::seconds(20)).to_rfc2822();
        let delay = retry_after_delay(&future, &config, now).unwrap();
        assert!(delay <= Duration::from_secs(20) && delay >= Duration::from_secs(19));

        let past = (now - chrono::Duration::seconds(20)).to_rfc2822();
        assert_eq!(retry_after_delay(&past, &config, now), None);
        assert_eq!(retry_after_delay("soon", &config, now), None);
    }
}
