//! HTTP controller for the test server.
//!
//! Lets a test driver hold, resume and stop the object adapter from outside
//! the process.
//!
//! ```text
//! POST /controller/hold?ms=<n>   hold the adapter; n < 0 holds until resume
//! POST /controller/resume        activate the adapter
//! POST /controller/shutdown      deactivate and stop the server
//! GET  /controller/status        adapter state and open connections
//! ```

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::lifecycle::Shutdown;

use super::adapter::{AdapterState, ObjectAdapter};

#[derive(Clone)]
pub struct ControllerState {
    pub adapter: ObjectAdapter,
    pub shutdown: Shutdown,
}

#[derive(Debug, Deserialize)]
pub struct HoldParams {
    /// Defaults to an indefinite hold.
    #[serde(default = "indefinite")]
    pub ms: i64,
}

fn indefinite() -> i64 {
    -1
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerStatus {
    pub version: String,
    pub state: AdapterState,
    pub address: String,
    pub open_connections: u64,
}

pub fn controller_router(state: ControllerState) -> Router {
    Router::new()
        .route("/controller/hold", post(hold))
        .route("/controller/resume", post(resume))
        .route("/controller/shutdown", post(shutdown))
        .route("/controller/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the controller until `stop` fires.
pub async fn serve(
    listener: TcpListener,
    state: ControllerState,
    mut stop: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Controller listening");

    axum::serve(listener, controller_router(state))
        .with_graceful_shutdown(async move {
            let _ = stop.recv().await;
        })
        .await
}

async fn hold(State(state): State<ControllerState>, Query(params): Query<HoldParams>) -> StatusCode {
    if state.adapter.state() == AdapterState::Deactivated {
        return StatusCode::CONFLICT;
    }
    state.adapter.hold_for(params.ms);
    tracing::info!(ms = params.ms, "Hold requested");
    StatusCode::NO_CONTENT
}

async fn resume(State(state): State<ControllerState>) -> StatusCode {
    if state.adapter.state() == AdapterState::Deactivated {
        return StatusCode::CONFLICT;
    }
    state.adapter.activate();
    StatusCode::NO_CONTENT
}

async fn shutdown(State(state): State<ControllerState>) -> StatusCode {
    tracing::info!("Shutdown requested");
    state.adapter.deactivate();
    state.shutdown.trigger();
    StatusCode::ACCEPTED
}

async fn status(State(state): State<ControllerState>) -> Json<ControllerStatus> {
    Json(ControllerStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        state: state.adapter.state(),
        address: state.adapter.local_addr().to_string(),
        open_connections: state.adapter.open_connections(),
    })
}
