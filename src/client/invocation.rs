//! Invocation tracking under the invocation timeout.
//!
//! # Responsibilities
//! - Register a request on a connection and send it
//! - Wait for the reply until the invocation deadline
//! - On expiry, abandon the request without touching the connection
//!
//! # Design Decisions
//! - The pending entry is the claim token: whoever removes it (reader,
//!   closer, or the expiring caller) decides the outcome, so each
//!   invocation completes exactly once
//! - The waiter holds a weak reference; dropping it mid-wait cleans up
//! - The deadline clock starts when the request is queued

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::error::{ErrorKind, RpcError, RpcResult};
use crate::net::connection::Connection;
use crate::net::frame::{check_body_len, Reply, Request};
use crate::observability::{metrics, tracing::invocation_span};
use crate::resilience::Timeout;

/// A request waiting for its reply.
struct PendingInvocation {
    request_id: u32,
    operation: String,
    connection: Weak<Connection>,
    reply: oneshot::Receiver<RpcResult<Reply>>,
    deadline: Option<Instant>,
    timeout: Timeout,
    armed: bool,
}

impl PendingInvocation {
    fn register(connection: &Arc<Connection>, operation: &str, timeout: Timeout) -> RpcResult<Self> {
        let (request_id, reply) = connection.register_pending()?;
        Ok(Self {
            request_id,
            operation: operation.to_string(),
            connection: Arc::downgrade(connection),
            reply,
            deadline: timeout.duration().map(|d| Instant::now() + d),
            timeout,
            armed: true,
        })
    }

    async fn wait(mut self) -> RpcResult<Reply> {
        let outcome = match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, &mut self.reply).await.ok(),
            None => Some((&mut self.reply).await),
        };

        match outcome {
            Some(received) => {
                self.armed = false;
                received.unwrap_or_else(|_| Err(RpcError::Unknown("reply channel dropped".into())))
            }
            None => self.expire(),
        }
    }

    /// The deadline passed. Claim the entry, or take the outcome that beat us to it.
    fn expire(&mut self) -> RpcResult<Reply> {
        self.armed = false;
        let claimed = self
            .connection
            .upgrade()
            .map(|conn| conn.abandon_pending(self.request_id))
            .unwrap_or(true);

        if !claimed {
            // A producer removed the entry first and sent under the same lock.
            if let Ok(received) = self.reply.try_recv() {
                return received;
            }
        }

        metrics::record_timeout(ErrorKind::InvocationTimeout);
        tracing::warn!(
            request_id = self.request_id,
            operation = %self.operation,
            timeout_ms = self.timeout.as_millis(),
            "Invocation timed out"
        );
        Err(RpcError::InvocationTimeout {
            operation: self.operation.clone(),
            timeout_ms: self.timeout.as_millis(),
        })
    }
}

impl Drop for PendingInvocation {
    fn drop(&mut self) {
        if self.armed {
            if let Some(conn) = self.connection.upgrade() {
                conn.abandon_pending(self.request_id);
            }
        }
    }
}

/// Send `request` on `connection` and wait for the reply under `timeout`.
///
/// Invocation expiry leaves the connection open; connection failures
/// arrive as the connection's close reason. A request that cannot be
/// framed fails with `Protocol` before anything is sent.
pub async fn invoke(connection: &Arc<Connection>, request: Request, timeout: Timeout) -> RpcResult<Vec<u8>> {
    let body = request
        .encode_body()
        .and_then(|body| check_body_len(body.len(), connection.max_message_size()).map(|()| body))
        .inspect_err(|e| {
            metrics::record_invocation("failed");
            tracing::warn!(
                connection_id = %connection.id(),
                operation = %request.operation,
                error = %e,
                "Request rejected before sending"
            );
        })?;
    let pending = PendingInvocation::register(connection, &request.operation, timeout)?;
    let span = invocation_span(connection.id(), pending.request_id, &request.operation);

    async move {
        tracing::trace!(payload_len = request.payload.len(), timeout = %timeout, "Sending request");
        connection.send_request(pending.request_id, &body)?;

        let outcome = pending
            .wait()
            .await
            .and_then(|reply| reply.into_result(&request.identity, &request.operation));

        metrics::record_invocation(match &outcome {
            Ok(_) => "ok",
            Err(e) if e.is_timeout() => "timeout",
            Err(RpcError::UserException(_)) => "user_exception",
            Err(_) => "failed",
        });
        outcome
    }
    .instrument(span)
    .await
}

/// A spawned invocation whose result can be awaited later.
#[derive(Debug)]
pub struct InvocationHandle {
    task: JoinHandle<RpcResult<Vec<u8>>>,
}

impl InvocationHandle {
    pub(crate) fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = RpcResult<Vec<u8>>> + Send + 'static,
    {
        Self {
            task: tokio::spawn(fut),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Future for InvocationHandle {
    type Output = RpcResult<Vec<u8>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task)
            .poll(cx)
            .map(|joined| joined.unwrap_or_else(|e| Err(RpcError::Unknown(e.to_string()))))
    }
}
