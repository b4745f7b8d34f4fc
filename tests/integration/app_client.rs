//! Fake DG-Lab app speaking to the relay over a real socket
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use coyote_relay::protocol::{decode, encode};
use coyote_relay::{MessageType, WireMessage};

/// How long to wait for any single frame
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AppClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Id the relay announced for itself
    pub client_id: String,
    pub target_id: String,
}

/// Outcome of an upgrade attempt the relay refused
#[derive(Debug)]
pub struct Rejected {
    pub status: u16,
}

impl AppClient {
    /// Connect to `ws://{addr}{path}`
    pub async fn connect(addr: std::net::SocketAddr, path: &str) -> Result<Self> {
        let url = format!("ws://{}{}", addr, path);
        let (ws, _) = timeout(FRAME_TIMEOUT, connect_async(&url)).await??;
        Ok(Self {
            ws,
            client_id: String::new(),
            target_id: String::new(),
        })
    }

    /// Attempt a connection that is expected to be refused
    pub async fn connect_rejected(addr: std::net::SocketAddr, path: &str) -> Result<Rejected> {
        let url = format!("ws://{}{}", addr, path);
        match timeout(FRAME_TIMEOUT, connect_async(&url)).await? {
            Ok(_) => Err(anyhow!("connection to {} was accepted", path)),
            Err(tungstenite::Error::Http(response)) => Ok(Rejected {
                status: response.status().as_u16(),
            }),
            Err(e) => Err(anyhow!("unexpected error: {}", e)),
        }
    }

    /// Next decoded frame, `None` once the relay hung up
    pub async fn recv(&mut self) -> Result<Option<WireMessage>> {
        loop {
            let frame = match timeout(FRAME_TIMEOUT, self.ws.next()).await? {
                Some(frame) => frame,
                None => return Ok(None),
            };
            match frame {
                Ok(Message::Text(text)) => return Ok(Some(decode(text.as_str())?)),
                Ok(Message::Close(_)) | Err(_) => return Ok(None),
                Ok(_) => continue,
            }
        }
    }

    /// Next `msg` body, skipping heartbeats
    pub async fn recv_msg(&mut self) -> Result<String> {
        loop {
            let message = self
                .recv()
                .await?
                .ok_or_else(|| anyhow!("relay closed the socket"))?;
            match message.kind {
                MessageType::Heartbeat => continue,
                MessageType::Msg => return Ok(message.message),
                other => return Err(anyhow!("unexpected {:?} frame: {}", other, message.message)),
            }
        }
    }

    pub async fn send(&mut self, kind: MessageType, message: &str) -> Result<()> {
        let frame = WireMessage::new(kind, self.client_id.clone(), self.target_id.clone(), message);
        self.ws.send(Message::text(encode(&frame)?)).await?;
        Ok(())
    }

    /// Accept the relay's bind request as `target_id`
    pub async fn bind(&mut self, target_id: &str) -> Result<()> {
        let request = self
            .recv()
            .await?
            .ok_or_else(|| anyhow!("no bind request"))?;
        if request.kind != MessageType::Bind || request.message != "targetId" {
            return Err(anyhow!("expected bind request, got {:?}", request));
        }

        self.client_id = request.client_id;
        self.target_id = target_id.to_string();
        self.send(MessageType::Bind, "DGLAB").await?;

        let confirmation = self
            .recv()
            .await?
            .ok_or_else(|| anyhow!("no bind confirmation"))?;
        if confirmation.kind != MessageType::Bind || confirmation.message != "200" {
            return Err(anyhow!("expected bind confirmation, got {:?}", confirmation));
        }
        Ok(())
    }

    pub async fn report_strength(&mut self, a: u32, b: u32, limit_a: u32, limit_b: u32) -> Result<()> {
        self.send(MessageType::Msg, &format!("strength-{a}+{b}+{limit_a}+{limit_b}"))
            .await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}
