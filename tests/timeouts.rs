//! Idle and invocation deadline behavior against the test server.

use std::time::Duration;

use rpc_deadlines::net::connection::{ConnectionClose, ConnectionState};
use rpc_deadlines::server::servant::sleep_payload;
use rpc_deadlines::{ErrorKind, RpcError, Timeout};

mod common;

const TEN_MB: usize = 10 * 1024 * 1024;

#[tokio::test]
async fn test_idle_timeout_closes_stalled_connection() {
    let server = common::start_server().await;
    let communicator = common::communicator();
    let base = communicator.string_to_proxy(&server.proxy_string()).unwrap();
    base.invoke("op", Vec::new()).await.unwrap();

    let short_idle = base.with_idle_timeout(Timeout::millis(250));
    let stalled = short_idle.connection().await.unwrap();
    assert_ne!(stalled.id(), base.connection().await.unwrap().id());

    server.adapter().hold_for(-1);
    let err = short_idle.invoke("sendData", vec![0u8; TEN_MB]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionTimeout);
    assert_eq!(stalled.state(), ConnectionState::Closed);
    assert_eq!(stalled.close_reason().map(|r| r.kind()), Some(ErrorKind::ConnectionTimeout));

    server.adapter().activate();
    base.invoke("op", Vec::new()).await.unwrap();

    // The dead connection is replaced, never reused.
    let fresh = short_idle.connection().await.unwrap();
    assert_ne!(fresh.id(), stalled.id());
    short_idle.ping().await.unwrap();
}

#[tokio::test]
async fn test_short_hold_within_idle_timeout_succeeds() {
    let server = common::start_server().await;
    let communicator = common::communicator();
    let proxy = communicator
        .string_to_proxy(&server.proxy_string())
        .unwrap()
        .with_idle_timeout(Timeout::millis(2000));
    proxy.ping().await.unwrap();
    let conn = proxy.connection().await.unwrap();

    server.adapter().hold_for(100);
    proxy.invoke("sendData", vec![0u8; 1024 * 1024]).await.unwrap();
    assert!(conn.is_open());
}

#[tokio::test]
async fn test_idle_timeout_from_endpoint_option() {
    let server = common::start_server().await;
    let communicator = common::communicator();
    let proxy = communicator
        .string_to_proxy(&format!("{}?timeout=250", server.proxy_string()))
        .unwrap();
    assert_eq!(proxy.policy().idle, Timeout::millis(250));
    proxy.ping().await.unwrap();

    server.adapter().hold_for(-1);
    let err = proxy.invoke("sendData", vec![0u8; TEN_MB]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionTimeout);
    server.adapter().activate();
}

#[tokio::test]
async fn test_invocation_timeout_keeps_connection_open() {
    let server = common::start_server().await;
    let communicator = common::communicator();
    let base = communicator.string_to_proxy(&server.proxy_string()).unwrap();
    let short = base.with_invocation_timeout(Timeout::millis(100));

    let conn = short.connection().await.unwrap();
    let err = short.invoke("sleep", sleep_payload(1000)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvocationTimeout);
    assert!(conn.is_open());

    // Same connection serves later calls, for this proxy and the base one.
    short.ping().await.unwrap();
    base.invoke("op", Vec::new()).await.unwrap();
    assert_eq!(short.connection().await.unwrap(), conn);
    assert_eq!(base.connection().await.unwrap(), conn);
}

#[tokio::test]
async fn test_call_inside_invocation_timeout_succeeds() {
    let server = common::start_server().await;
    let communicator = common::communicator();
    let proxy = communicator
        .string_to_proxy(&server.proxy_string())
        .unwrap()
        .with_invocation_timeout(Timeout::millis(1000));
    let conn = proxy.connection().await.unwrap();

    proxy.invoke("sleep", sleep_payload(100)).await.unwrap();
    assert_eq!(proxy.connection().await.unwrap(), conn);

    let handle = proxy.begin_invoke("sleep", sleep_payload(100));
    handle.await.unwrap();
}

#[tokio::test]
async fn test_async_invocation_timeout() {
    let server = common::start_server().await;
    let communicator = common::communicator();
    let proxy = communicator
        .string_to_proxy(&server.proxy_string())
        .unwrap()
        .with_invocation_timeout(Timeout::millis(100));

    let err = proxy.begin_invoke("sleep", sleep_payload(500)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvocationTimeout);
}

#[tokio::test]
async fn test_late_reply_is_discarded() {
    let server = common::start_server().await;
    let communicator = common::communicator();
    let proxy = communicator
        .string_to_proxy(&server.proxy_string())
        .unwrap()
        .with_invocation_timeout(Timeout::millis(100));
    let conn = proxy.connection().await.unwrap();

    let err = proxy.invoke("sleep", sleep_payload(300)).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(conn.pending_count(), 0);

    // The reply arrives with nobody waiting; the connection shrugs it off.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(conn.is_open());
    proxy.ping().await.unwrap();
}

#[tokio::test]
async fn test_connection_timeout_fails_every_pending_call() {
    let server = common::start_server().await;
    let communicator = common::communicator();
    let proxy = communicator
        .string_to_proxy(&server.proxy_string())
        .unwrap()
        .with_idle_timeout(Timeout::millis(250));
    let conn = proxy.connection().await.unwrap();

    let bystander = proxy.begin_invoke("sleep", sleep_payload(3000));
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.adapter().hold_for(-1);
    let err = proxy.invoke("sendData", vec![0u8; TEN_MB]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionTimeout);

    let collateral = bystander.await.unwrap_err();
    assert_eq!(collateral, conn.close_reason().unwrap());
    server.adapter().activate();
}

#[tokio::test]
async fn test_concurrent_first_calls_share_one_connection() {
    let server = common::start_server().await;
    let communicator = common::communicator();

    let calls: Vec<_> = (0..8)
        .map(|_| {
            communicator
                .string_to_proxy(&server.proxy_string())
                .unwrap()
                .begin_invoke("op", Vec::new())
        })
        .collect();
    for call in calls {
        call.await.unwrap();
    }

    let proxy = communicator.string_to_proxy(&server.proxy_string()).unwrap();
    let conn = proxy.cached_connection().unwrap();
    assert_eq!(proxy.connection().await.unwrap().id(), conn.id());
    assert_eq!(communicator.open_connections(), 1);
    assert_eq!(server.adapter().open_connections(), 1);
}

#[tokio::test]
async fn test_oversized_request_is_rejected_before_sending() {
    let server = common::start_server().await;
    let communicator = common::communicator();
    let proxy = communicator.string_to_proxy(&server.proxy_string()).unwrap();
    let conn = proxy.connection().await.unwrap();

    let bystander = proxy.begin_invoke("sleep", sleep_payload(200));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let oversized = vec![0u8; conn.max_message_size() + 1];
    let err = proxy.invoke("sendData", oversized).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);

    let long_operation = "x".repeat(usize::from(u16::MAX) + 1);
    let err = proxy.invoke(&long_operation, Vec::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);

    bystander.await.unwrap();
    assert!(conn.is_open());
    assert_eq!(proxy.connection().await.unwrap(), conn);
}

#[tokio::test]
async fn test_application_errors_do_not_close_connection() {
    let server = common::start_server().await;
    let communicator = common::communicator();
    let proxy = communicator.string_to_proxy(&server.proxy_string()).unwrap();
    let conn = proxy.connection().await.unwrap();

    let short = proxy.with_invocation_timeout(Timeout::millis(1000));
    assert_eq!(
        short.invoke("raise", b"expected failure".to_vec()).await.unwrap_err(),
        RpcError::UserException("expected failure".into())
    );
    assert_eq!(
        proxy.invoke("noSuchOperation", Vec::new()).await.unwrap_err().kind(),
        ErrorKind::OperationNotExist
    );

    let missing = communicator
        .string_to_proxy(&format!("missing:{}", server.endpoint()))
        .unwrap();
    assert_eq!(missing.ping().await.unwrap_err().kind(), ErrorKind::ObjectNotExist);

    assert!(conn.is_open());
    proxy.ping().await.unwrap();
}

#[tokio::test]
async fn test_graceful_close_with_wait_lets_calls_finish() {
    let server = common::start_server().await;
    let communicator = common::communicator();
    let proxy = communicator.string_to_proxy(&server.proxy_string()).unwrap();
    let conn = proxy.connection().await.unwrap();

    let call = proxy.begin_invoke("sleep", sleep_payload(200));
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.close(ConnectionClose::GracefullyWithWait).await;

    call.await.unwrap();
    assert_eq!(conn.close_reason().map(|r| r.kind()), Some(ErrorKind::ConnectionClosed));
    proxy.ping().await.unwrap();
    assert_ne!(proxy.connection().await.unwrap(), conn);
}

#[tokio::test]
async fn test_destroyed_communicator_refuses_calls() {
    let server = common::start_server().await;
    let communicator = common::communicator();
    let proxy = communicator.string_to_proxy(&server.proxy_string()).unwrap();
    let conn = proxy.connection().await.unwrap();

    communicator.destroy().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(
        proxy.ping().await.unwrap_err().kind(),
        ErrorKind::CommunicatorDestroyed
    );
}
