//! Channel-wide retry throttling token bucket.

use std::sync::Mutex;

use super::PolicyError;

/// Token bucket shared by every retrying and hedging call on a channel.
///
/// The bucket starts full at `max_tokens`. Each failed attempt costs one
/// token; each success refunds `token_ratio`. While the level sits at or
/// below `max_tokens / 2`, no further retries or hedged attempts are
/// scheduled.
#[derive(Debug)]
pub struct RetryThrottle {
    max_tokens: f64,
    token_ratio: f64,
    tokens: Mutex<f64>,
}

impl RetryThrottle {
    pub fn new(max_tokens: u32, token_ratio: f64) -> Result<Self, PolicyError> {
        if max_tokens == 0 {
            return Err(PolicyError::InvalidThrottling(
                "max_tokens must be greater than zero",
            ));
        }
        if token_ratio <= 0.0 {
            return Err(PolicyError::InvalidThrottling(
                "token_ratio must be greater than zero",
            ));
        }
        let max_tokens = max_tokens as f64;
        Ok(RetryThrottle {
            max_tokens,
            token_ratio,
            tokens: Mutex::new(max_tokens),
        })
    }

    pub(crate) fn call_failure(&self) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        *tokens = (*tokens - 1.0).max(0.0);
    }

    pub(crate) fn call_success(&self) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        *tokens = (*tokens + self.token_ratio).min(self.max_tokens);
    }

    /// Whether retries and hedged attempts are currently suppressed.
    pub fn is_retry_throttled(&self) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        *tokens <= self.max_tokens / 2.0
    }

    #[cfg(test)]
    pub(crate) fn token_count(&self) -> f64 {
        *self.tokens.lock().unwrap()
    }
}
