//! Retry and hedging policies and their executors.
//!
//! A method config attaches at most one of [`RetryPolicy`] or
//! [`HedgingPolicy`] to a set of method names. Both are validated on
//! construction so a bad service config fails at channel build time, not
//! mid-call.

mod buffer;
mod executor;
mod throttle;

use std::time::Duration;

use http::HeaderMap;

use grpc_hyper_core::Code;
use grpc_hyper_core::protocol::GRPC_RETRY_PUSHBACK_MS;

pub(crate) use buffer::WriteBuffer;
pub(crate) use executor::RetryableCall;
pub use throttle::RetryThrottle;

/// Errors produced while validating retry configuration.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(&'static str),
    #[error("invalid hedging policy: {0}")]
    InvalidHedgingPolicy(&'static str),
    #[error("invalid retry throttling: {0}")]
    InvalidThrottling(&'static str),
}

/// Retry-with-backoff configuration for a method.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff_multiplier: f64,
    retryable_status_codes: Vec<Code>,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
        retryable_status_codes: Vec<Code>,
    ) -> Result<Self, PolicyError> {
        if max_attempts < 2 {
            return Err(PolicyError::InvalidRetryPolicy("max_attempts must be >= 2"));
        }
        if initial_backoff.is_zero() {
            return Err(PolicyError::InvalidRetryPolicy(
                "initial_backoff must be greater than zero",
            ));
        }
        if max_backoff.is_zero() {
            return Err(PolicyError::InvalidRetryPolicy(
                "max_backoff must be greater than zero",
            ));
        }
        if backoff_multiplier <= 0.0 {
            return Err(PolicyError::InvalidRetryPolicy(
                "backoff_multiplier must be greater than zero",
            ));
        }
        if retryable_status_codes.is_empty() {
            return Err(PolicyError::InvalidRetryPolicy(
                "retryable_status_codes must not be empty",
            ));
        }
        Ok(RetryPolicy {
            max_attempts,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            retryable_status_codes,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub(crate) fn is_retryable(&self, code: Code) -> bool {
        self.retryable_status_codes.contains(&code)
    }

    /// Backoff before attempt `n + 1`:
    /// `min(max_backoff, initial_backoff * multiplier^(n-1))` scaled by a
    /// random factor in `[0, 1)`.
    pub(crate) fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = scaled.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped * rand::random::<f64>())
    }
}

/// Hedging configuration for a method: concurrent attempts spawned on a
/// fixed delay.
#[derive(Debug, Clone)]
pub struct HedgingPolicy {
    max_attempts: u32,
    hedging_delay: Duration,
    non_fatal_status_codes: Vec<Code>,
}

impl HedgingPolicy {
    pub fn new(
        max_attempts: u32,
        hedging_delay: Duration,
        non_fatal_status_codes: Vec<Code>,
    ) -> Result<Self, PolicyError> {
        if max_attempts < 2 {
            return Err(PolicyError::InvalidHedgingPolicy(
                "max_attempts must be >= 2",
            ));
        }
        Ok(HedgingPolicy {
            max_attempts,
            hedging_delay,
            non_fatal_status_codes,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn hedging_delay(&self) -> Duration {
        self.hedging_delay
    }

    /// A status outside the non-fatal set commits the whole call.
    pub(crate) fn is_fatal(&self, code: Code) -> bool {
        !self.non_fatal_status_codes.contains(&code)
    }
}

/// The policy attached to a method config.
#[derive(Debug, Clone)]
pub enum RetryKind {
    Retry(RetryPolicy),
    Hedging(HedgingPolicy),
}

/// A method name filter: a bare service matches every method of the
/// service, an empty service matches everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodName {
    service: String,
    method: Option<String>,
}

impl MethodName {
    /// Match one specific method.
    pub fn method(service: impl Into<String>, method: impl Into<String>) -> Self {
        MethodName {
            service: service.into(),
            method: Some(method.into()),
        }
    }

    /// Match every method of a service.
    pub fn service(service: impl Into<String>) -> Self {
        MethodName {
            service: service.into(),
            method: None,
        }
    }

    /// Match every method on the channel.
    pub fn all() -> Self {
        MethodName {
            service: String::new(),
            method: None,
        }
    }
}

/// A set of method names and the retry or hedging policy they share.
#[derive(Debug, Clone)]
pub struct MethodConfig {
    names: Vec<MethodName>,
    kind: RetryKind,
}

impl MethodConfig {
    pub fn retry(names: Vec<MethodName>, policy: RetryPolicy) -> Self {
        MethodConfig {
            names,
            kind: RetryKind::Retry(policy),
        }
    }

    pub fn hedging(names: Vec<MethodName>, policy: HedgingPolicy) -> Self {
        MethodConfig {
            names,
            kind: RetryKind::Hedging(policy),
        }
    }

    pub(crate) fn kind(&self) -> &RetryKind {
        &self.kind
    }

    pub(crate) fn matches_method(&self, service: &str, method: &str) -> bool {
        self.names
            .iter()
            .any(|name| name.service == service && name.method.as_deref() == Some(method))
    }

    pub(crate) fn matches_service(&self, service: &str) -> bool {
        self.names
            .iter()
            .any(|name| name.service == service && name.method.is_none())
    }

    pub(crate) fn is_catch_all(&self) -> bool {
        self.names
            .iter()
            .any(|name| name.service.is_empty() && name.method.is_none())
    }
}

/// Server retry pushback, from `grpc-retry-pushback-ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pushback {
    /// Retry or hedge after exactly this delay.
    Delay(Duration),
    /// Negative pushback: stop retrying.
    Stop,
}

/// Parse server pushback from a header block. Unparsable values are
/// ignored.
pub(crate) fn parse_pushback(headers: &HeaderMap) -> Option<Pushback> {
    let raw = headers.get(&GRPC_RETRY_PUSHBACK_MS)?;
    let value: i64 = std::str::from_utf8(raw.as_bytes()).ok()?.parse().ok()?;
    if value < 0 {
        Some(Pushback::Stop)
    } else {
        Some(Pushback::Delay(Duration::from_millis(value as u64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn retry_policy_validation() {
        let ok = RetryPolicy::new(
            3,
            Duration::from_millis(10),
            Duration::from_secs(1),
            2.0,
            vec![Code::Unavailable],
        );
        assert!(ok.is_ok());

        assert!(
            RetryPolicy::new(
                1,
                Duration::from_millis(10),
                Duration::from_secs(1),
                2.0,
                vec![Code::Unavailable]
            )
            .is_err()
        );
        assert!(
            RetryPolicy::new(
                3,
                Duration::ZERO,
                Duration::from_secs(1),
                2.0,
                vec![Code::Unavailable]
            )
            .is_err()
        );
        assert!(
            RetryPolicy::new(
                3,
                Duration::from_millis(10),
                Duration::from_secs(1),
                0.0,
                vec![Code::Unavailable]
            )
            .is_err()
        );
        assert!(
            RetryPolicy::new(
                3,
                Duration::from_millis(10),
                Duration::from_secs(1),
                2.0,
                vec![]
            )
            .is_err()
        );
    }

    #[test]
    fn hedging_policy_validation() {
        assert!(HedgingPolicy::new(2, Duration::ZERO, vec![]).is_ok());
        assert!(HedgingPolicy::new(1, Duration::ZERO, vec![]).is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_millis(100),
            Duration::from_millis(250),
            2.0,
            vec![Code::Unavailable],
        )
        .unwrap();

        // Jitter scales into [0, backoff); check against the un-jittered cap.
        for attempt in 1..=4 {
            let exponent = (attempt - 1) as i32;
            let cap = (0.1f64 * 2.0f64.powi(exponent)).min(0.25);
            let delay = policy.backoff_for_attempt(attempt);
            assert!(delay.as_secs_f64() < cap + f64::EPSILON, "attempt {attempt}");
        }
    }

    #[test]
    fn fatal_is_complement_of_non_fatal() {
        let policy =
            HedgingPolicy::new(3, Duration::ZERO, vec![Code::Unavailable, Code::Aborted]).unwrap();
        assert!(!policy.is_fatal(Code::Unavailable));
        assert!(!policy.is_fatal(Code::Aborted));
        assert!(policy.is_fatal(Code::InvalidArgument));
    }

    #[test]
    fn method_name_matching() {
        let config = MethodConfig::retry(
            vec![MethodName::method("svc", "A"), MethodName::service("other")],
            RetryPolicy::new(
                2,
                Duration::from_millis(1),
                Duration::from_millis(1),
                1.0,
                vec![Code::Unavailable],
            )
            .unwrap(),
        );
        assert!(config.matches_method("svc", "A"));
        assert!(!config.matches_method("svc", "B"));
        assert!(config.matches_service("other"));
        assert!(!config.matches_service("svc"));
        assert!(!config.is_catch_all());

        let catch_all = MethodConfig::retry(
            vec![MethodName::all()],
            RetryPolicy::new(
                2,
                Duration::from_millis(1),
                Duration::from_millis(1),
                1.0,
                vec![Code::Unavailable],
            )
            .unwrap(),
        );
        assert!(catch_all.is_catch_all());
    }

    #[test]
    fn pushback_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_pushback(&headers), None);

        headers.insert("grpc-retry-pushback-ms", HeaderValue::from_static("250"));
        assert_eq!(
            parse_pushback(&headers),
            Some(Pushback::Delay(Duration::from_millis(250)))
        );

        headers.insert("grpc-retry-pushback-ms", HeaderValue::from_static("-1"));
        assert_eq!(parse_pushback(&headers), Some(Pushback::Stop));

        headers.insert("grpc-retry-pushback-ms", HeaderValue::from_static("soon"));
        assert_eq!(parse_pushback(&headers), None);
    }
}
