//! Connection pool management.
//!
//! # Responsibilities
//! - Share one open connection per (endpoint, idle timeout) pair
//! - Replace closed connections on next use
//! - Run the connect retry loop when no usable connection exists
//!
//! # Design Decisions
//! - The idle timeout is a transport parameter, so it is part of the key;
//!   connect and invocation timeouts are not
//! - Concurrent callers for the same key wait on one establishment instead
//!   of racing to open several connections
//! - Waiting behind another caller's establishment counts against the
//!   waiter's own connect timeout and attempt budget
//! - Destroying the pool never waits for an establishment; one still in
//!   flight is abandoned and its connection closed

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::config::TransportConfig;
use crate::error::{RpcError, RpcResult};
use crate::net::connection::{Connection, ConnectionClose};
use crate::net::endpoint::Endpoint;
use crate::resilience::{connect_with_retry, ConnectRetryPolicy, DeadlinePolicy, Timeout};

/// What makes two connections interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub endpoint: Endpoint,
    pub idle: Timeout,
}

impl ConnectionKey {
    pub fn new(endpoint: &Endpoint, idle: Timeout) -> Self {
        Self {
            endpoint: endpoint.clone(),
            idle: idle.normalized(),
        }
    }
}

type Slot = Arc<Mutex<Option<Arc<Connection>>>>;

/// Pool of client connections keyed by [`ConnectionKey`].
#[derive(Debug)]
pub struct ConnectionPool {
    slots: DashMap<ConnectionKey, Slot>,
    transport: TransportConfig,
    retry: ConnectRetryPolicy,
    destroyed: watch::Sender<bool>,
}

impl ConnectionPool {
    pub fn new(transport: TransportConfig, retry: ConnectRetryPolicy) -> Self {
        Self {
            slots: DashMap::new(),
            transport,
            retry,
            destroyed: watch::channel(false).0,
        }
    }

    fn is_destroyed(&self) -> bool {
        *self.destroyed.borrow()
    }

    /// Return the open connection for this endpoint and policy, establishing one if needed.
    pub async fn get_or_connect(&self, endpoint: &Endpoint, policy: &DeadlinePolicy) -> RpcResult<Arc<Connection>> {
        if self.is_destroyed() {
            return Err(RpcError::CommunicatorDestroyed);
        }

        // Clone the slot out so no map shard lock is held across the await.
        let slot = self
            .slots
            .entry(ConnectionKey::new(endpoint, policy.idle))
            .or_default()
            .clone();

        let endpoint_name = endpoint.to_string();
        let (connect, idle) = (policy.connect, policy.idle);
        let slot = &slot;
        connect_with_retry(self.retry, &endpoint_name, move |_attempt| {
            self.attempt(slot, endpoint, connect, idle)
        })
        .await
    }

    /// One establishment attempt: take the slot, reuse what is there or
    /// connect, all within a single connect deadline.
    async fn attempt(
        &self,
        slot: &Slot,
        endpoint: &Endpoint,
        connect: Timeout,
        idle: Timeout,
    ) -> RpcResult<Arc<Connection>> {
        let deadline = connect.duration().map(|d| Instant::now() + d);
        let timed_out = || RpcError::ConnectTimeout {
            endpoint: endpoint.to_string(),
            timeout_ms: connect.as_millis(),
        };
        let mut destroyed = self.destroyed.subscribe();

        let mut current = tokio::select! {
            guard = until(deadline, slot.lock()) => guard.ok_or_else(timed_out)?,
            _ = destroyed.wait_for(|d| *d) => return Err(RpcError::CommunicatorDestroyed),
        };
        if self.is_destroyed() {
            return Err(RpcError::CommunicatorDestroyed);
        }

        if let Some(conn) = current.as_ref() {
            if conn.is_open() {
                return Ok(conn.clone());
            }
            tracing::debug!(connection_id = %conn.id(), "Replacing closed connection");
        }

        let remaining = match deadline {
            Some(at) => {
                let left = at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(timed_out());
                }
                Timeout::After(left)
            }
            None => Timeout::Infinite,
        };

        let conn = tokio::select! {
            result = Connection::establish(endpoint, remaining, idle, &self.transport) => {
                result.map_err(|e| match e {
                    RpcError::ConnectTimeout { .. } => timed_out(),
                    other => other,
                })?
            }
            _ = destroyed.wait_for(|d| *d) => return Err(RpcError::CommunicatorDestroyed),
        };

        *current = Some(conn.clone());
        drop(current);

        // `close_all` skips slots it cannot lock, so re-check after publishing.
        if self.is_destroyed() {
            conn.close(ConnectionClose::Forcefully).await;
            return Err(RpcError::CommunicatorDestroyed);
        }
        Ok(conn)
    }

    /// The open connection for this key, without connecting.
    ///
    /// Returns `None` while another caller is establishing one.
    pub fn cached(&self, endpoint: &Endpoint, idle: Timeout) -> Option<Arc<Connection>> {
        let slot = self.slots.get(&ConnectionKey::new(endpoint, idle))?.clone();
        let current = slot.try_lock().ok()?;
        current.as_ref().filter(|conn| conn.is_open()).cloned()
    }

    /// Number of pooled connections that are still open.
    pub fn open_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_lock()
                    .map(|current| current.as_ref().is_some_and(|conn| conn.is_open()))
                    .unwrap_or(false)
            })
            .count()
    }

    /// Refuse new connections and close every pooled one.
    pub async fn close_all(&self, mode: ConnectionClose) {
        self.destroyed.send_replace(true);

        let slots: Vec<Slot> = self.slots.iter().map(|entry| entry.value().clone()).collect();
        self.slots.clear();

        for slot in slots {
            // A locked slot belongs to an establishment that will see the flag.
            let conn = match slot.try_lock() {
                Ok(mut current) => current.take(),
                Err(_) => None,
            };
            if let Some(conn) = conn {
                conn.close(mode).await;
            }
        }
    }
}

/// Await `fut`, giving up at `deadline` when there is one.
async fn until<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}
