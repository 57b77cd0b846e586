//! Controller HTTP API.

use std::time::Duration;

use reqwest::StatusCode;

use rpc_deadlines::server::controller::ControllerStatus;
use rpc_deadlines::server::AdapterState;

mod common;

async fn status(client: &reqwest::Client, base: &str) -> ControllerStatus {
    client
        .get(format!("{}/controller/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_hold_and_resume() {
    let server = common::start_server().await;
    let base = server.controller_url();
    let client = reqwest::Client::new();

    assert_eq!(status(&client, &base).await.state, AdapterState::Active);

    let res = client
        .post(format!("{}/controller/hold", base))
        .query(&[("ms", -1)])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(status(&client, &base).await.state, AdapterState::Held);

    let res = client.post(format!("{}/controller/resume", base)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(status(&client, &base).await.state, AdapterState::Active);
}

#[tokio::test]
async fn test_timed_hold_resumes() {
    let server = common::start_server().await;
    let base = server.controller_url();
    let client = reqwest::Client::new();

    client
        .post(format!("{}/controller/hold?ms=50", base))
        .send()
        .await
        .unwrap();
    assert_eq!(status(&client, &base).await.state, AdapterState::Held);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(status(&client, &base).await.state, AdapterState::Active);
}

#[tokio::test]
async fn test_status_counts_connections() {
    let server = common::start_server().await;
    let base = server.controller_url();
    let client = reqwest::Client::new();

    let communicator = common::communicator();
    let proxy = communicator.string_to_proxy(&server.proxy_string()).unwrap();
    proxy.ping().await.unwrap();

    let current = status(&client, &base).await;
    assert_eq!(current.open_connections, 1);
    assert_eq!(current.address, server.adapter().local_addr().to_string());
}

#[tokio::test]
async fn test_shutdown_deactivates_adapter() {
    let server = common::start_server().await;
    let base = server.controller_url();
    let client = reqwest::Client::new();

    let res = client.post(format!("{}/controller/shutdown", base)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    tokio::time::timeout(Duration::from_secs(2), server.wait()).await.unwrap();
    assert_eq!(server.adapter().state(), AdapterState::Deactivated);
}
