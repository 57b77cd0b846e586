//! Servants: objects that execute dispatched operations.
//!
//! The test servant exposes the operations used to exercise deadlines:
//! `op` returns at once, `sendData` accepts an arbitrary payload, `sleep`
//! delays its reply by a big-endian u32 number of milliseconds, and `raise`
//! always answers with a user exception carrying the payload as its message.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use crate::net::frame::{Reply, ReplyStatus};

pub type DispatchFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, DispatchError>> + Send>>;

/// How a servant can fail an operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("{0}")]
    User(String),

    #[error("operation `{0}` does not exist")]
    OperationNotExist(String),

    #[error("{0}")]
    Unknown(String),
}

impl DispatchError {
    pub fn into_reply(self) -> Reply {
        match self {
            DispatchError::User(msg) => Reply::failure(ReplyStatus::UserException, msg),
            DispatchError::OperationNotExist(op) => Reply::failure(ReplyStatus::OperationNotExist, op),
            DispatchError::Unknown(msg) => Reply::failure(ReplyStatus::Unknown, msg),
        }
    }
}

pub trait Servant: Send + Sync + 'static {
    fn dispatch(&self, operation: &str, payload: Vec<u8>) -> DispatchFuture;
}

/// The servant registered as `timeout` by the test server.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutServant;

impl Servant for TimeoutServant {
    fn dispatch(&self, operation: &str, payload: Vec<u8>) -> DispatchFuture {
        match operation {
            "op" => Box::pin(async { Ok(Vec::new()) }),
            "sendData" => {
                tracing::trace!(len = payload.len(), "sendData received");
                Box::pin(async { Ok(Vec::new()) })
            }
            "sleep" => Box::pin(async move {
                let raw: [u8; 4] = payload
                    .as_slice()
                    .try_into()
                    .map_err(|_| DispatchError::Unknown("sleep expects a 4-byte duration".into()))?;
                tokio::time::sleep(Duration::from_millis(u64::from(u32::from_be_bytes(raw)))).await;
                Ok(Vec::new())
            }),
            "raise" => {
                let message = if payload.is_empty() {
                    "raised on request".to_string()
                } else {
                    String::from_utf8_lossy(&payload).into_owned()
                };
                Box::pin(async move { Err(DispatchError::User(message)) })
            }
            other => {
                let op = other.to_string();
                Box::pin(async move { Err(DispatchError::OperationNotExist(op)) })
            }
        }
    }
}

/// Encode a `sleep` payload.
pub fn sleep_payload(ms: u32) -> Vec<u8> {
    ms.to_be_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_servant_operations() {
        let servant = TimeoutServant;
        assert_eq!(servant.dispatch("op", vec![]).await, Ok(vec![]));
        assert_eq!(servant.dispatch("sendData", vec![7; 1024]).await, Ok(vec![]));
        assert_eq!(servant.dispatch("sleep", sleep_payload(5)).await, Ok(vec![]));
        assert!(matches!(servant.dispatch("raise", vec![]).await, Err(DispatchError::User(_))));
        assert_eq!(
            servant.dispatch("raise", b"boom".to_vec()).await,
            Err(DispatchError::User("boom".into()))
        );
        assert_eq!(
            servant.dispatch("nope", vec![]).await,
            Err(DispatchError::OperationNotExist("nope".into()))
        );
        assert!(matches!(servant.dispatch("sleep", vec![1]).await, Err(DispatchError::Unknown(_))));
    }

    #[tokio::test]
    async fn test_sleep_waits() {
        let start = tokio::time::Instant::now();
        TimeoutServant.dispatch("sleep", sleep_payload(50)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
