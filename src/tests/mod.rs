//! Unit tests for the relay modules
//!
//! Connection-level tests talk to a fake DG-Lab app over an in-memory
//! duplex pipe, so no sockets are opened.

pub mod waveform_test;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{duplex, DuplexStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::connection::{Connection, ConnectionSettings};
use crate::protocol::{decode, encode, MessageType, WireMessage};
use crate::scheduler::Scheduler;

/// How long a helper waits for a frame before giving up
pub const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// App side of an in-memory WebSocket
pub struct FakeApp {
    pub ws: WebSocketStream<DuplexStream>,
    pub client_id: String,
    pub target_id: String,
}

/// Relay-side stream plus the fake app connected to it
pub async fn socket_pair() -> (WebSocketStream<DuplexStream>, FakeApp) {
    let (relay_io, app_io) = duplex(64 * 1024);
    let relay = WebSocketStream::from_raw_socket(relay_io, Role::Server, None).await;
    let app = WebSocketStream::from_raw_socket(app_io, Role::Client, None).await;
    (
        relay,
        FakeApp {
            ws: app,
            client_id: String::new(),
            target_id: String::new(),
        },
    )
}

impl FakeApp {
    /// Next decoded frame, `None` once the relay closed the socket
    pub async fn recv(&mut self) -> Option<WireMessage> {
        loop {
            let frame = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a frame")?;
            match frame {
                Ok(Message::Text(text)) => {
                    return Some(decode(text.as_str()).expect("relay sent a malformed frame"))
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Next frame that is not a heartbeat
    pub async fn recv_non_heartbeat(&mut self) -> Option<WireMessage> {
        loop {
            let message = self.recv().await?;
            if message.kind != MessageType::Heartbeat {
                return Some(message);
            }
        }
    }

    /// Body of the next `msg` frame, skipping heartbeats
    pub async fn recv_msg(&mut self) -> String {
        let message = self
            .recv_non_heartbeat()
            .await
            .expect("socket closed while waiting for msg");
        assert_eq!(message.kind, MessageType::Msg, "unexpected frame: {:?}", message);
        message.message
    }

    pub async fn send(&mut self, kind: MessageType, message: &str) {
        let frame = WireMessage::new(kind, self.client_id.clone(), self.target_id.clone(), message);
        self.send_raw(&encode(&frame).unwrap()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::text(text.to_string())).await.unwrap();
    }

    /// Answer the relay's bind request and consume its confirmation
    pub async fn bind(&mut self, target_id: &str) {
        let request = self.recv().await.expect("no bind request");
        assert_eq!(request.kind, MessageType::Bind);
        assert_eq!(request.message, "targetId");

        self.client_id = request.client_id;
        self.target_id = target_id.to_string();
        self.send(MessageType::Bind, "DGLAB").await;

        let confirmation = self.recv().await.expect("no bind confirmation");
        assert_eq!(confirmation.kind, MessageType::Bind);
        assert_eq!(confirmation.message, "200");
        assert_eq!(confirmation.target_id, target_id);
    }

    /// Report strengths the way the app does after every change
    pub async fn report_strength(&mut self, a: u32, b: u32, limit_a: u32, limit_b: u32) {
        let body = format!("strength-{a}+{b}+{limit_a}+{limit_b}");
        self.send(MessageType::Msg, &body).await;
    }
}

/// Connection that finished its handshake with a fake app
pub async fn bound_connection(scheduler: &Scheduler) -> (Arc<Connection>, FakeApp) {
    let (relay, mut app) = socket_pair().await;
    let connection = Connection::new(
        relay,
        Some("relay-1".to_string()),
        scheduler.clone(),
        ConnectionSettings::default(),
    );

    let init = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move { connection.initialize().await }
    });

    app.bind("app-1").await;
    assert_eq!(app.recv_msg().await, "clear-A");
    assert_eq!(app.recv_msg().await, "clear-B");
    init.await.unwrap().unwrap();

    (connection, app)
}
