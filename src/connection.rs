//! Per-socket protocol state: binding, heartbeats, strength tracking.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::error::{transport_closed, RelayError, RelayResult};
use crate::protocol::{
    data_head, decode, encode, ret_code, Channel, FeedbackButton, MessageType, MsgPayload,
    StrengthMode, StrengthReport, WireMessage,
};
use crate::pulse::{self, PulseScript};
use crate::scheduler::{Scheduler, TimerId};

type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type WsSource = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Capacity of the per-connection event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Timing knobs for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// How long the peer has to answer the bind request
    pub bind_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Pause between the post-bind clear and the first heartbeat
    pub settle_delay: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            bind_timeout: Duration::from_secs(20),
            heartbeat_interval: Duration::from_secs(5),
            settle_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Bound,
    Closed,
}

/// Notifications published by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Bound { target_id: String },
    StrengthChanged(StrengthReport),
    Feedback(FeedbackButton),
    Closed,
}

/// One WebSocket peer speaking the DG-Lab protocol
pub struct Connection {
    client_id: String,
    target_id: RwLock<String>,
    connected_at: DateTime<Utc>,
    settings: ConnectionSettings,
    scheduler: Scheduler,
    state: watch::Sender<ConnectionState>,
    strength: RwLock<StrengthReport>,
    /// Last heartbeat reply from the peer, if any
    last_heartbeat: RwLock<Option<Instant>>,
    events: broadcast::Sender<ConnectionEvent>,
    sink: Mutex<WsSink>,
    source: Mutex<Option<WsSource>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_timer: Mutex<Option<TimerId>>,
    closed: AtomicBool,
}

impl Connection {
    /// Wrap an upgraded socket. A missing `client_id` gets a fresh UUID.
    pub fn new<S>(
        ws: WebSocketStream<S>,
        client_id: Option<String>,
        scheduler: Scheduler,
        settings: ConnectionSettings,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let client_id = client_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (sink, source) = ws.split();
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Arc::new(Self {
            client_id,
            target_id: RwLock::new(String::new()),
            connected_at: Utc::now(),
            settings,
            scheduler,
            state,
            strength: RwLock::new(StrengthReport::default()),
            last_heartbeat: RwLock::new(None),
            events,
            sink: Mutex::new(Box::pin(sink)),
            source: Mutex::new(Some(Box::pin(source))),
            read_task: Mutex::new(None),
            heartbeat_timer: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Empty until the bind handshake completes
    pub async fn target_id(&self) -> String {
        self.target_id.read().await.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_bound(&self) -> bool {
        self.state() == ConnectionState::Bound
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.state() == ConnectionState::Closed
    }

    pub fn settings(&self) -> ConnectionSettings {
        self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub async fn strength(&self) -> StrengthReport {
        *self.strength.read().await
    }

    /// Time since the last heartbeat reply, `None` if the peer never replied
    pub async fn heartbeat_age(&self) -> Option<Duration> {
        self.last_heartbeat.read().await.map(|at| at.elapsed())
    }

    pub async fn heartbeat_started(&self) -> bool {
        self.heartbeat_timer.lock().await.is_some()
    }

    /// Run the bind handshake and start the heartbeat.
    ///
    /// Fails with `BindTimeout` when the peer does not accept the bind in
    /// time; the connection is closed in that case.
    #[instrument(skip(self), fields(client_id = %self.client_id), level = "debug")]
    pub async fn initialize(self: &Arc<Self>) -> RelayResult<()> {
        self.send(MessageType::Bind, data_head::TARGET_ID).await?;
        self.start_read_loop().await;

        let bound = timeout(
            self.settings.bind_timeout,
            wait_for_state(self.state.subscribe(), |s| *s != ConnectionState::Connecting),
        )
        .await;

        match bound {
            Ok(ConnectionState::Bound) => {}
            Ok(_) => {
                return Err(transport_closed("peer left before binding"));
            }
            Err(_) => {
                warn!(
                    client_id = %self.client_id,
                    timeout_secs = self.settings.bind_timeout.as_secs(),
                    "Bind timed out"
                );
                let _ = self.send(MessageType::Break, ret_code::SERVER_DELAY).await;
                self.close().await;
                return Err(RelayError::BindTimeout {
                    client_id: self.client_id.clone(),
                    timeout: self.settings.bind_timeout,
                });
            }
        }

        self.clear_pulse(Channel::A).await?;
        self.clear_pulse(Channel::B).await?;
        sleep(self.settings.settle_delay).await;

        self.start_heartbeat().await;
        Ok(())
    }

    async fn start_read_loop(self: &Arc<Self>) {
        let Some(source) = self.source.lock().await.take() else {
            return;
        };
        let connection = Arc::clone(self);
        let handle = tokio::spawn(async move { connection.read_loop(source).await });
        *self.read_task.lock().await = Some(handle);
    }

    async fn start_heartbeat(self: &Arc<Self>) {
        if let Err(e) = self.send(MessageType::Heartbeat, ret_code::SUCCESS).await {
            warn!(client_id = %self.client_id, error = %e, "First heartbeat failed");
        }

        let weak = Arc::downgrade(self);
        let id = self.scheduler.register_timer(
            format!("heartbeat-{}", self.client_id),
            self.settings.heartbeat_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(connection) = weak.upgrade() {
                        if !connection.is_closed() {
                            connection
                                .send(MessageType::Heartbeat, ret_code::SUCCESS)
                                .await?;
                        }
                    }
                    Ok::<_, anyhow::Error>(())
                }
            },
        );
        *self.heartbeat_timer.lock().await = Some(id);
        debug!(client_id = %self.client_id, "Heartbeat started");
    }

    /// Send one frame to the peer.
    ///
    /// Only `bind` and `break` may go out before the handshake completes.
    pub async fn send(&self, kind: MessageType, message: impl Into<String>) -> RelayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(transport_closed("connection closed"));
        }

        let target_id = self.target_id().await;
        if target_id.is_empty() && !matches!(kind, MessageType::Bind | MessageType::Break) {
            return Err(RelayError::NotBound {
                client_id: self.client_id.clone(),
            });
        }

        self.write(WireMessage::new(kind, self.client_id.clone(), target_id, message))
            .await
    }

    async fn write(&self, message: WireMessage) -> RelayResult<()> {
        let text = encode(&message)?;
        if message.kind == MessageType::Heartbeat {
            trace!(client_id = %self.client_id, "send: {}", text);
        } else {
            debug!(client_id = %self.client_id, "send: {}", text);
        }

        self.sink
            .lock()
            .await
            .send(Message::text(text))
            .await
            .map_err(transport_closed)
    }

    async fn send_payload(&self, payload: MsgPayload) -> RelayResult<()> {
        self.send(MessageType::Msg, payload.to_string()).await
    }

    /// Set an absolute strength, refused when above the channel limit
    pub async fn set_strength(&self, channel: Channel, value: u32) -> RelayResult<()> {
        let limit = self.strength.read().await.channel(channel).limit;
        if value > limit {
            return Err(RelayError::OutOfLimit {
                channel,
                requested: value,
                limit,
            });
        }

        self.send_payload(MsgPayload::StrengthSet {
            channel,
            mode: StrengthMode::Set,
            value,
        })
        .await
    }

    /// Queue frames on the device. Nothing is acknowledged.
    pub async fn send_pulse(&self, channel: Channel, frames: Vec<String>) -> RelayResult<()> {
        self.send_payload(MsgPayload::Pulse { channel, frames }).await
    }

    pub async fn clear_pulse(&self, channel: Channel) -> RelayResult<()> {
        self.send_payload(MsgPayload::Clear(channel)).await
    }

    /// Stream a script step by step, paced in real time
    pub async fn play_pulse(&self, channel: Channel, script: &PulseScript) -> RelayResult<u64> {
        pulse::play(script, |frames| self.send_pulse(channel, frames)).await
    }

    async fn read_loop(self: Arc<Self>, mut source: WsSource) {
        let closed = wait_for_state(self.state.subscribe(), |s| *s == ConnectionState::Closed);
        tokio::pin!(closed);

        loop {
            tokio::select! {
                _ = &mut closed => break,
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => match decode(text.as_str()) {
                        Ok(message) => self.handle_message(message).await,
                        Err(e) => {
                            warn!(client_id = %self.client_id, error = %e, "Dropping malformed frame");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(client_id = %self.client_id, "Peer closed the socket");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client_id = %self.client_id, error = %e, "Socket read failed");
                        break;
                    }
                },
            }
        }

        if self.state.send_replace(ConnectionState::Closed) != ConnectionState::Closed {
            let _ = self.events.send(ConnectionEvent::Closed);
        }
        info!(client_id = %self.client_id, "Connection closed");
    }

    async fn handle_message(&self, message: WireMessage) {
        match message.kind {
            MessageType::Bind => self.handle_bind(message).await,
            MessageType::Heartbeat => {
                if message.message == data_head::DG_LAB || message.message == ret_code::SUCCESS {
                    trace!(client_id = %self.client_id, "Heartbeat success");
                    *self.last_heartbeat.write().await = Some(Instant::now());
                } else {
                    warn!(client_id = %self.client_id, code = %message.message, "Heartbeat failed");
                }
            }
            MessageType::Msg => match MsgPayload::parse(&message.message) {
                Ok(MsgPayload::StrengthChanged(report)) => {
                    *self.strength.write().await = report;
                    debug!(
                        client_id = %self.client_id,
                        "Current strength: {}/{}, {}/{}",
                        report.a.strength,
                        report.a.limit,
                        report.b.strength,
                        report.b.limit
                    );
                    let _ = self.events.send(ConnectionEvent::StrengthChanged(report));
                }
                Ok(MsgPayload::Feedback(button)) => {
                    info!(client_id = %self.client_id, button = ?button, "Feedback");
                    let _ = self.events.send(ConnectionEvent::Feedback(button));
                }
                Ok(other) => {
                    debug!(client_id = %self.client_id, payload = %other, "Ignoring msg payload");
                }
                Err(e) => {
                    warn!(client_id = %self.client_id, error = %e, "Dropping malformed msg payload");
                }
            },
            MessageType::Break => {
                if message.message == ret_code::CLIENT_DISCONNECTED {
                    info!(client_id = %self.client_id, peer = %message.client_id, "Client disconnected");
                } else {
                    warn!(client_id = %self.client_id, code = %message.message, "Break failed");
                }
            }
            MessageType::Error => {
                warn!(client_id = %self.client_id, code = %message.message, "Peer reported an error");
            }
        }
    }

    async fn handle_bind(&self, message: WireMessage) {
        if message.message != data_head::DG_LAB {
            warn!(client_id = %self.client_id, code = %message.message, "Bind failed");
            return;
        }
        if self.is_bound() {
            debug!(client_id = %self.client_id, "Ignoring repeated bind");
            return;
        }
        if message.target_id.is_empty() {
            warn!(client_id = %self.client_id, "Bind without target id");
            return;
        }

        *self.target_id.write().await = message.target_id.clone();
        info!(client_id = %self.client_id, target_id = %message.target_id, "Bind success");

        if let Err(e) = self.send(MessageType::Bind, ret_code::SUCCESS).await {
            warn!(client_id = %self.client_id, error = %e, "Failed to confirm bind");
        }

        let became_bound = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Bound;
                true
            } else {
                false
            }
        });
        if became_bound {
            let _ = self.events.send(ConnectionEvent::Bound {
                target_id: message.target_id,
            });
        }
    }

    /// Wait for the read loop to end, then tear the connection down
    pub async fn run(&self) {
        let handle = self.read_task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.close().await;
    }

    /// Close the socket and stop the heartbeat. Idempotent.
    #[instrument(skip(self), fields(client_id = %self.client_id), level = "debug")]
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.state() == ConnectionState::Bound {
            let target_id = self.target_id().await;
            let _ = self
                .write(WireMessage::new(
                    MessageType::Break,
                    self.client_id.clone(),
                    target_id,
                    ret_code::CLIENT_DISCONNECTED,
                ))
                .await;
        }
        if let Err(e) = self.sink.lock().await.close().await {
            trace!(client_id = %self.client_id, error = %e, "Socket already closed");
        }

        if let Some(id) = self.heartbeat_timer.lock().await.take() {
            self.scheduler.cancel_timer(id);
        }

        if self.state.send_replace(ConnectionState::Closed) != ConnectionState::Closed {
            let _ = self.events.send(ConnectionEvent::Closed);
        }
        debug!(client_id = %self.client_id, "Connection torn down");
    }
}

/// Resolve once the state satisfies `predicate`, returning that state.
/// A dropped sender counts as closed.
async fn wait_for_state<F>(mut rx: watch::Receiver<ConnectionState>, predicate: F) -> ConnectionState
where
    F: Fn(&ConnectionState) -> bool,
{
    loop {
        let current = *rx.borrow_and_update();
        if predicate(&current) {
            return current;
        }
        if rx.changed().await.is_err() {
            return ConnectionState::Closed;
        }
    }
}
