use std::time::Duration;

use reqwest::StatusCode;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_SERVER_ERROR_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_AUTH_REFRESHES: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Hand the response to the caller as-is.
    Return,
    /// Force a credential refresh, then resend without delay.
    RefreshAuth,
    RetryAfter(Duration),
}

/// Uniform policy applied to every gateway call.
///
/// 401/403 trigger a forced refresh and an immediate resend, 500/503 are
/// retried after a fixed delay. Both are bounded by `max_attempts`; refreshes
/// are additionally bounded by `max_auth_refreshes` per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    server_error_delay: Duration,
    max_auth_refreshes: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            server_error_delay: DEFAULT_SERVER_ERROR_DELAY,
            max_auth_refreshes: DEFAULT_MAX_AUTH_REFRESHES,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, server_error_delay: Duration, max_auth_refreshes: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            server_error_delay,
            max_auth_refreshes,
        }
    }

    pub fn with_server_error_delay(mut self, delay: Duration) -> Self {
        self.server_error_delay = delay;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `attempt` is 1-based and counts the request that produced `status`.
    pub fn decide(&self, status: StatusCode, attempt: u32, refreshes: u32) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::Return;
        }
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                if refreshes < self.max_auth_refreshes =>
            {
                RetryDecision::RefreshAuth
            }
            StatusCode::INTERNAL_SERVER_ERROR | StatusCode::SERVICE_UNAVAILABLE => {
                RetryDecision::RetryAfter(self.server_error_delay)
            }
            _ => RetryDecision::Return,
        }
    }
}
