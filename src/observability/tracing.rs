//! Span constructors shared by the client and server.
//!
//! Every invocation runs inside an `invocation` span so deadline events carry
//! the connection, request id and operation without repeating them.

use tracing::Span;

use crate::net::connection::ConnectionId;

pub fn invocation_span(connection: ConnectionId, request_id: u32, operation: &str) -> Span {
    tracing::debug_span!(
        "invocation",
        connection_id = %connection,
        request_id,
        operation = %operation
    )
}

pub fn dispatch_span(connection: ConnectionId, request_id: u32, identity: &str, operation: &str) -> Span {
    tracing::debug_span!(
        "dispatch",
        connection_id = %connection,
        request_id,
        identity = %identity,
        operation = %operation
    )
}
