//! Proxies: an identity at an endpoint with an immutable deadline policy.
//!
//! # Responsibilities
//! - Derive new proxies with different deadlines (the original is untouched)
//! - Resolve the shared connection for the proxy's endpoint and idle timeout
//! - Run synchronous and asynchronous invocations under the invocation timeout

use std::fmt;
use std::sync::Arc;

use crate::error::RpcResult;
use crate::net::connection::Connection;
use crate::net::endpoint::Endpoint;
use crate::net::frame::Request;
use crate::resilience::{DeadlinePolicy, Timeout};

use super::communicator::CommunicatorInner;
use super::invocation::{self, InvocationHandle};

/// Operation every servant answers.
pub const PING_OPERATION: &str = "ice_ping";

/// A handle to a remote object. Cheap to clone; never mutated after creation.
#[derive(Clone)]
pub struct Proxy {
    communicator: Arc<CommunicatorInner>,
    identity: Arc<str>,
    endpoint: Endpoint,
    policy: DeadlinePolicy,
}

impl Proxy {
    pub(crate) fn new(
        communicator: Arc<CommunicatorInner>,
        identity: &str,
        endpoint: Endpoint,
        policy: DeadlinePolicy,
    ) -> Self {
        Self {
            communicator,
            identity: Arc::from(identity),
            endpoint,
            policy,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn policy(&self) -> DeadlinePolicy {
        self.policy
    }

    pub fn with_policy(&self, policy: DeadlinePolicy) -> Proxy {
        Proxy {
            policy,
            ..self.clone()
        }
    }

    /// Copy of this proxy with a different connect timeout.
    pub fn with_connect_timeout(&self, timeout: Timeout) -> Proxy {
        self.with_policy(self.policy.with_connect(timeout))
    }

    /// Copy of this proxy with a different idle timeout.
    ///
    /// Connections are shared per idle timeout, so the copy may use a
    /// different connection than the original.
    pub fn with_idle_timeout(&self, timeout: Timeout) -> Proxy {
        self.with_policy(self.policy.with_idle(timeout))
    }

    /// Copy of this proxy with a different invocation timeout.
    pub fn with_invocation_timeout(&self, timeout: Timeout) -> Proxy {
        self.with_policy(self.policy.with_invocation(timeout))
    }

    /// The open connection for this proxy, establishing one if needed.
    pub async fn connection(&self) -> RpcResult<Arc<Connection>> {
        self.communicator.pool.get_or_connect(&self.endpoint, &self.policy).await
    }

    /// The open connection for this proxy, if one already exists.
    pub fn cached_connection(&self) -> Option<Arc<Connection>> {
        self.communicator.pool.cached(&self.endpoint, self.policy.idle)
    }

    /// Invoke `operation` and wait for its reply.
    ///
    /// Connection acquisition is bounded by the connect timeout (per attempt);
    /// the invocation timeout starts once the request is queued.
    pub async fn invoke(&self, operation: &str, payload: Vec<u8>) -> RpcResult<Vec<u8>> {
        let connection = self.connection().await?;
        let request = Request {
            identity: self.identity.to_string(),
            operation: operation.to_string(),
            payload,
        };
        invocation::invoke(&connection, request, self.policy.invocation).await
    }

    /// Start `operation` in the background; await the handle for the result.
    pub fn begin_invoke(&self, operation: &str, payload: Vec<u8>) -> InvocationHandle {
        let proxy = self.clone();
        let operation = operation.to_string();
        InvocationHandle::spawn(async move { proxy.invoke(&operation, payload).await })
    }

    /// Check that the object exists and the server responds.
    pub async fn ping(&self) -> RpcResult<()> {
        self.invoke(PING_OPERATION, Vec::new()).await.map(|_| ())
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity && self.endpoint == other.endpoint && self.policy == other.policy
    }
}

impl Eq for Proxy {}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("identity", &self.identity)
            .field("endpoint", &self.endpoint.to_string())
            .field("policy", &self.policy)
            .finish()
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.identity, self.endpoint)
    }
}
