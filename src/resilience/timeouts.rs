//! Timeout values and the per-proxy deadline policy.
//!
//! # Responsibilities
//! - Represent a single timeout that may be infinite
//! - Bundle the connect, idle and invocation timeouts into an immutable policy
//! - Wrap futures with a timeout only when one is configured
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - `-1` means infinite at every boundary (config files, CLI, `from_millis`)
//! - The three axes never influence each other

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::error::Elapsed;

use crate::error::{RpcError, RpcResult};

/// A timeout that is either disabled or a strictly positive duration.
///
/// `After(Duration::ZERO)` behaves as `Infinite` everywhere it is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Timeout {
    Infinite,
    After(Duration),
}

impl Timeout {
    /// Parse a millisecond value: `-1` is infinite, anything else must be > 0.
    pub fn from_millis(ms: i64) -> RpcResult<Self> {
        match ms {
            -1 => Ok(Timeout::Infinite),
            ms if ms > 0 => Ok(Timeout::After(Duration::from_millis(ms as u64))),
            other => Err(RpcError::InvalidTimeout(other)),
        }
    }

    /// Finite timeout of `ms` milliseconds; `0` is treated as infinite.
    pub fn millis(ms: u64) -> Self {
        if ms == 0 {
            Timeout::Infinite
        } else {
            Timeout::After(Duration::from_millis(ms))
        }
    }

    pub fn is_infinite(&self) -> bool {
        self.duration().is_none()
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            Timeout::After(d) if !d.is_zero() => Some(*d),
            _ => None,
        }
    }

    /// `Infinite` for every timeout that never fires, otherwise `self`.
    pub fn normalized(self) -> Self {
        if self.is_infinite() {
            Timeout::Infinite
        } else {
            self
        }
    }

    /// Milliseconds for error reports; 0 when infinite.
    pub fn as_millis(&self) -> u64 {
        self.duration().map(|d| d.as_millis() as u64).unwrap_or(0)
    }

    /// Run `fut`, failing with `Elapsed` only if this timeout is finite and fires first.
    pub async fn run<F: Future>(self, fut: F) -> Result<F::Output, Elapsed> {
        match self.duration() {
            None => Ok(fut.await),
            Some(d) => tokio::time::timeout(d, fut).await,
        }
    }
}

impl TryFrom<i64> for Timeout {
    type Error = RpcError;

    fn try_from(ms: i64) -> Result<Self, Self::Error> {
        Timeout::from_millis(ms)
    }
}

impl From<Timeout> for i64 {
    fn from(t: Timeout) -> Self {
        match t.duration() {
            None => -1,
            Some(d) => d.as_millis() as i64,
        }
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.duration() {
            None => write!(f, "infinite"),
            Some(d) => write!(f, "{}ms", d.as_millis()),
        }
    }
}

/// The three independent deadlines attached to a proxy.
///
/// Immutable: the `with_*` methods return a new policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeadlinePolicy {
    /// Bound on TCP connect plus connection validation.
    pub connect: Timeout,
    /// Bound on stalled progress of a single read or write on an open connection.
    pub idle: Timeout,
    /// Bound on waiting for the reply of one call.
    pub invocation: Timeout,
}

impl DeadlinePolicy {
    pub const fn new(connect: Timeout, idle: Timeout, invocation: Timeout) -> Self {
        Self {
            connect,
            idle,
            invocation,
        }
    }

    /// No deadline on any axis.
    pub const fn infinite() -> Self {
        Self::new(Timeout::Infinite, Timeout::Infinite, Timeout::Infinite)
    }

    pub fn with_connect(self, connect: Timeout) -> Self {
        Self { connect, ..self }
    }

    pub fn with_idle(self, idle: Timeout) -> Self {
        Self { idle, ..self }
    }

    pub fn with_invocation(self, invocation: Timeout) -> Self {
        Self { invocation, ..self }
    }
}

impl Default for DeadlinePolicy {
    fn default() -> Self {
        Self::infinite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_millis() {
        assert_eq!(Timeout::from_millis(-1).unwrap(), Timeout::Infinite);
        assert_eq!(
            Timeout::from_millis(250).unwrap(),
            Timeout::After(Duration::from_millis(250))
        );
        assert_eq!(Timeout::from_millis(0), Err(RpcError::InvalidTimeout(0)));
        assert_eq!(Timeout::from_millis(-2), Err(RpcError::InvalidTimeout(-2)));
    }

    #[test]
    fn test_policy_axes_are_independent() {
        let base = DeadlinePolicy::new(
            Timeout::millis(500),
            Timeout::millis(2000),
            Timeout::Infinite,
        );
        let derived = base.with_invocation(Timeout::millis(100));

        assert_eq!(derived.connect, base.connect);
        assert_eq!(derived.idle, base.idle);
        assert_eq!(derived.invocation, Timeout::millis(100));
        // The original is untouched.
        assert!(base.invocation.is_infinite());
    }

    #[test]
    fn test_serde_uses_minus_one_for_infinite() {
        #[derive(Deserialize)]
        struct Wrapper {
            t: Timeout,
        }
        let w: Wrapper = toml::from_str("t = -1").unwrap();
        assert!(w.t.is_infinite());
        let w: Wrapper = toml::from_str("t = 250").unwrap();
        assert_eq!(w.t.as_millis(), 250);
        assert!(toml::from_str::<Wrapper>("t = 0").is_err());
        assert_eq!(i64::from(Timeout::Infinite), -1);
    }

    #[tokio::test]
    async fn test_run_respects_deadline() {
        let fast = Timeout::millis(500).run(async { 7 }).await;
        assert_eq!(fast.unwrap(), 7);

        let slow = Timeout::millis(20)
            .run(tokio::time::sleep(Duration::from_millis(500)))
            .await;
        assert!(slow.is_err());

        let unbounded = Timeout::Infinite
            .run(tokio::time::sleep(Duration::from_millis(10)))
            .await;
        assert!(unbounded.is_ok());
    }

    #[tokio::test]
    async fn test_zero_duration_never_fires() {
        let zero = Timeout::After(Duration::ZERO);
        assert!(zero.is_infinite());
        assert_eq!(zero.duration(), None);
        assert_eq!(i64::from(zero), -1);
        assert_eq!(zero.to_string(), "infinite");

        let result = zero.run(tokio::time::sleep(Duration::from_millis(20))).await;
        assert!(result.is_ok());
    }
}
