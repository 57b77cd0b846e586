//! Connect retry loop.
//!
//! # Responsibilities
//! - Classify each establishment attempt as established, retryable or fatal
//! - Retry connect timeouts up to a fixed attempt budget, with optional backoff
//! - Surface every other establishment failure immediately
//!
//! # Design Decisions
//! - The transient/fatal decision is made here, once, from the error kind
//! - The budget counts attempts, not retries: `max_attempts = 10` means at
//!   most ten handshakes
//! - Exhausting the budget surfaces the last `ConnectTimeout` unchanged
//! - Nothing that was already sent is ever retried here; this loop only runs
//!   before a connection exists

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{ErrorKind, RpcError, RpcResult};
use crate::observability::metrics;
use crate::resilience::backoff::connect_backoff;

/// Outcome of one establishment attempt, tagged for the retry decision.
#[derive(Debug)]
pub enum ConnectAttempt<C> {
    Established(C),
    RetryableConnectTimeout(RpcError),
    FatalConnectFailure(RpcError),
}

impl<C> ConnectAttempt<C> {
    /// Tag the result of a raw establishment attempt.
    pub fn classify(result: RpcResult<C>) -> Self {
        match result {
            Ok(conn) => ConnectAttempt::Established(conn),
            Err(e) if e.kind() == ErrorKind::ConnectTimeout => {
                ConnectAttempt::RetryableConnectTimeout(e)
            }
            Err(e) => ConnectAttempt::FatalConnectFailure(e),
        }
    }
}

/// Attempt budget and pacing for the connect retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl ConnectRetryPolicy {
    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

impl Default for ConnectRetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for ConnectRetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.connect_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }
}

/// Run `attempt` until it establishes, fails fatally, or the budget is spent.
pub async fn connect_with_retry<C, F, Fut>(
    policy: ConnectRetryPolicy,
    endpoint: &str,
    mut attempt: F,
) -> RpcResult<C>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = RpcResult<C>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt_no = 0;

    loop {
        attempt_no += 1;

        match ConnectAttempt::classify(attempt(attempt_no).await) {
            ConnectAttempt::Established(conn) => {
                metrics::record_connect_attempt("established");
                if attempt_no > 1 {
                    tracing::info!(endpoint = %endpoint, attempts = attempt_no, "Connection established after retries");
                }
                return Ok(conn);
            }
            ConnectAttempt::FatalConnectFailure(e) => {
                metrics::record_connect_attempt("failed");
                tracing::warn!(endpoint = %endpoint, attempt = attempt_no, error = %e, "Connection establishment failed");
                return Err(e);
            }
            ConnectAttempt::RetryableConnectTimeout(e) => {
                metrics::record_connect_attempt("timeout");
                metrics::record_timeout(ErrorKind::ConnectTimeout);

                if attempt_no >= max_attempts {
                    tracing::warn!(
                        endpoint = %endpoint,
                        attempts = attempt_no,
                        error = %e,
                        "Connect retry budget exhausted"
                    );
                    return Err(e);
                }

                let delay = connect_backoff(
                    attempt_no + 1,
                    Duration::from_millis(policy.base_delay_ms),
                    Duration::from_millis(policy.max_delay_ms),
                );
                tracing::debug!(endpoint = %endpoint, attempt = attempt_no, delay = ?delay, "Connect timed out, retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
