//! Metrics collection and exposition.
//!
//! # Metrics
//! - `rpc_connect_attempts_total` (counter): establishment attempts by outcome
//! - `rpc_timeouts_total` (counter): deadline expiries by kind
//! - `rpc_connections_closed_total` (counter): closed connections by reason
//! - `rpc_open_connections` (gauge): currently open client connections
//! - `rpc_invocations_total` (counter): completed invocations by outcome
//! - `rpc_late_replies_discarded_total` (counter): replies that arrived after the caller gave up
//!
//! Recording is a no-op until a recorder is installed.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::ErrorKind;

/// Install the Prometheus exporter with an HTTP listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connect_attempt(outcome: &'static str) {
    counter!("rpc_connect_attempts_total", "outcome" => outcome).increment(1);
}

pub fn record_timeout(kind: ErrorKind) {
    counter!("rpc_timeouts_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_connection_opened() {
    gauge!("rpc_open_connections").increment(1.0);
}

pub fn record_connection_closed(reason: ErrorKind) {
    gauge!("rpc_open_connections").decrement(1.0);
    counter!("rpc_connections_closed_total", "reason" => reason.as_str()).increment(1);
}

pub fn record_invocation(outcome: &'static str) {
    counter!("rpc_invocations_total", "outcome" => outcome).increment(1);
}

pub fn record_late_reply() {
    counter!("rpc_late_replies_discarded_total").increment(1);
}
