//! Client runtime root.
//!
//! # Responsibilities
//! - Hold the client configuration and default deadline policy
//! - Own the connection pool shared by every proxy it creates
//! - Turn proxy strings into proxies
//! - Tear everything down on destroy

use std::sync::Arc;

use crate::config::ClientConfig;
use crate::error::{RpcError, RpcResult};
use crate::net::connection::ConnectionClose;
use crate::net::endpoint::Endpoint;
use crate::resilience::{ConnectRetryPolicy, DeadlinePolicy, Timeout};

use super::pool::ConnectionPool;
use super::proxy::Proxy;

#[derive(Debug)]
pub(crate) struct CommunicatorInner {
    pub(crate) default_policy: DeadlinePolicy,
    pub(crate) pool: ConnectionPool,
}

/// Entry point of the client runtime. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Communicator {
    inner: Arc<CommunicatorInner>,
}

impl Communicator {
    /// Build a communicator; fails if a configured timeout is invalid.
    pub fn new(config: ClientConfig) -> RpcResult<Self> {
        let default_policy = config.timeouts.to_policy()?;
        let retry = ConnectRetryPolicy::from(&config.retries);

        tracing::debug!(
            connect_timeout = %default_policy.connect,
            idle_timeout = %default_policy.idle,
            invocation_timeout = %default_policy.invocation,
            connect_attempts = config.retries.connect_attempts,
            "Communicator created"
        );

        Ok(Self {
            inner: Arc::new(CommunicatorInner {
                default_policy,
                pool: ConnectionPool::new(config.transport, retry),
            }),
        })
    }

    /// Policy given to proxies that do not override it.
    pub fn default_policy(&self) -> DeadlinePolicy {
        self.inner.default_policy
    }

    /// Parse `<identity>:<endpoint>`, e.g. `timeout:tcp://127.0.0.1:12010?timeout=250`.
    ///
    /// A `timeout` endpoint option overrides the default idle timeout.
    pub fn string_to_proxy(&self, input: &str) -> RpcResult<Proxy> {
        let (identity, endpoint) = input.split_once(':').ok_or_else(|| RpcError::InvalidProxy {
            input: input.to_string(),
            reason: "expected <identity>:<endpoint>".into(),
        })?;
        if identity.is_empty() {
            return Err(RpcError::InvalidProxy {
                input: input.to_string(),
                reason: "empty identity".into(),
            });
        }

        let (endpoint, idle_ms) = Endpoint::parse_with_timeout(endpoint)?;
        let mut policy = self.inner.default_policy;
        if let Some(ms) = idle_ms {
            policy = policy.with_idle(Timeout::from_millis(ms)?);
        }
        Ok(Proxy::new(self.inner.clone(), identity, endpoint, policy))
    }

    /// Proxy for `identity` at `endpoint` with the default policy.
    pub fn proxy(&self, identity: &str, endpoint: Endpoint) -> Proxy {
        Proxy::new(self.inner.clone(), identity, endpoint, self.inner.default_policy)
    }

    /// Number of pooled connections that are still open.
    pub fn open_connections(&self) -> usize {
        self.inner.pool.open_count()
    }

    /// Close every connection. Later calls through any proxy fail with
    /// `CommunicatorDestroyed`.
    pub async fn destroy(&self) {
        self.inner.pool.close_all(ConnectionClose::Forcefully).await;
        tracing::debug!("Communicator destroyed");
    }
}
