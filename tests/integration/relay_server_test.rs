//! End-to-end tests for the relay server
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use coyote_relay::MessageType;

use crate::app_client::AppClient;
use crate::relay_harness::{fixed_random_strength, RelayTestEnvironment};

/// Full session: bind, strength report, randomized output
#[tokio::test]
async fn test_app_binds_and_receives_output() -> Result<()> {
    let env = RelayTestEnvironment::start(Some(fixed_random_strength())).await?;

    let mut app = AppClient::connect(env.addr, "/dglab_ws/relay-abc").await?;
    app.bind("app-xyz").await?;
    assert_eq!(app.client_id, "relay-abc");

    assert_eq!(app.recv_msg().await?, "clear-A");
    assert_eq!(app.recv_msg().await?, "clear-B");
    // Report limits while the relay is still settling
    app.report_strength(0, 0, 20, 20).await?;

    assert_eq!(app.recv_msg().await?, "strength-1+2+5");
    assert_eq!(app.recv_msg().await?, r#"pulse-A:["0A0A0A0A00000000"]"#);

    assert!(
        env.wait_until(|r| r.client_for_target("app-xyz").as_deref() == Some("relay-abc"))
            .await
    );
    assert_eq!(env.registry.target_for_client("relay-abc").as_deref(), Some("app-xyz"));
    assert_eq!(env.registry.client_ids(), vec!["relay-abc".to_string()]);

    let clients = env.registry.clients();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].target_id, "app-xyz");

    env.cleanup().await
}

#[tokio::test]
async fn test_heartbeats_are_sent() -> Result<()> {
    let env = RelayTestEnvironment::start(None).await?;

    let mut app = AppClient::connect(env.addr, "/dglab_ws/beat").await?;
    app.bind("app-beat").await?;

    let mut saw_heartbeat = false;
    for _ in 0..5 {
        match app.recv().await? {
            Some(message) if message.kind == MessageType::Heartbeat => {
                assert_eq!(message.message, "200");
                saw_heartbeat = true;
                break;
            }
            Some(_) => continue,
            None => break,
        }
    }
    assert!(saw_heartbeat);

    env.cleanup().await
}

#[tokio::test]
async fn test_duplicate_client_id_is_rejected() -> Result<()> {
    let env = RelayTestEnvironment::start(None).await?;

    let mut first = AppClient::connect(env.addr, "/dglab_ws/dup").await?;
    first.bind("app-1").await?;
    assert!(env.wait_until(|r| r.len() == 1).await);

    let rejected = AppClient::connect_rejected(env.addr, "/dglab_ws/dup").await?;
    assert_eq!(rejected.status, 400);
    assert_eq!(env.registry.len(), 1);

    env.cleanup().await
}

#[tokio::test]
async fn test_missing_client_id_is_rejected() -> Result<()> {
    let env = RelayTestEnvironment::start(None).await?;

    let rejected = AppClient::connect_rejected(env.addr, "/dglab_ws/").await?;
    assert_eq!(rejected.status, 400);

    let unknown = AppClient::connect_rejected(env.addr, "/somewhere/else").await?;
    assert_eq!(unknown.status, 404);

    assert!(env.registry.is_empty());
    env.cleanup().await
}

#[tokio::test]
async fn test_plain_http_request_is_not_served() -> Result<()> {
    let env = RelayTestEnvironment::start(None).await?;

    let mut stream = TcpStream::connect(env.addr).await?;
    stream
        .write_all(b"GET /dglab_ws/plain HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await?;

    // Whatever comes back, the socket must end without a session
    let mut buf = Vec::new();
    let _ = timeout(Duration::from_secs(6), stream.read_to_end(&mut buf)).await;

    assert!(env.registry.is_empty());
    assert!(env.registry.client_for_target("plain").is_none());

    env.cleanup().await
}

#[tokio::test]
async fn test_destroy_all_closes_clients() -> Result<()> {
    let env = RelayTestEnvironment::start(None).await?;

    let mut app = AppClient::connect(env.addr, "/dglab_ws/doomed").await?;
    app.bind("app-doomed").await?;
    assert!(env.wait_until(|r| r.len() == 1).await);

    env.registry.destroy_all().await;
    assert!(env.registry.is_empty());
    assert!(env.registry.client_for_target("app-doomed").is_none());

    // The app sees a break and then the socket closing
    let mut saw_break = false;
    while let Some(message) = app.recv().await? {
        if message.kind == MessageType::Break {
            assert_eq!(message.message, "209");
            saw_break = true;
        }
    }
    assert!(saw_break);

    env.cleanup().await
}

#[tokio::test]
async fn test_app_disconnect_removes_mappings() -> Result<()> {
    let env = RelayTestEnvironment::start(None).await?;

    let mut app = AppClient::connect(env.addr, "/dglab_ws/leaver").await?;
    app.bind("app-leaver").await?;
    assert!(env.wait_until(|r| r.len() == 1).await);

    app.close().await?;

    assert!(env.wait_until(|r| r.is_empty()).await);
    assert!(env.registry.target_for_client("leaver").is_none());

    // The id is free again
    let mut again = AppClient::connect(env.addr, "/dglab_ws/leaver").await?;
    again.bind("app-leaver-2").await?;
    assert!(env.wait_until(|r| r.client_for_target("app-leaver-2").is_some()).await);

    env.cleanup().await
}

#[tokio::test]
async fn test_bind_timeout_drops_connection() -> Result<()> {
    let env = RelayTestEnvironment::start(None).await?;

    let mut app = AppClient::connect(env.addr, "/dglab_ws/silent").await?;
    let request = app.recv().await?.expect("bind request");
    assert_eq!(request.kind, MessageType::Bind);

    // Stay silent past the two second bind timeout
    let farewell = app.recv().await?.expect("break before close");
    assert_eq!(farewell.kind, MessageType::Break);
    assert_eq!(farewell.message, "211");
    assert!(app.recv().await?.is_none());
    assert!(env.registry.is_empty());

    // A new attempt with the same id is admitted
    let mut retry = AppClient::connect(env.addr, "/dglab_ws/silent").await?;
    retry.bind("app-retry").await?;
    assert!(env.wait_until(|r| r.len() == 1).await);

    env.cleanup().await
}
