use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, instrument, warn};

use crate::connection::Connection;
use crate::controller::OutputController;
use crate::error::{RelayError, RelayResult};
use crate::scheduler::TimerId;
use crate::RelayContext;

/// How often the liveness monitor looks at heartbeat replies
pub const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(20);

/// Heartbeat replies older than this are reported as stale
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(20);

/// Snapshot of one registered client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub target_id: String,
    pub connected_at: DateTime<Utc>,
}

/// Owns every live connection, keyed by client id
pub struct RelayRegistry {
    ctx: RelayContext,
    clients: DashMap<String, Arc<OutputController>>,
    client_to_target: DashMap<String, String>,
    target_to_client: DashMap<String, String>,
    /// Ids whose handshake is still running
    pending: DashSet<String>,
    /// Set by `destroy_all`; no client is admitted afterwards
    shutting_down: AtomicBool,
    liveness_timer: Mutex<Option<TimerId>>,
}

impl RelayRegistry {
    pub fn new(ctx: RelayContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            clients: DashMap::new(),
            client_to_target: DashMap::new(),
            target_to_client: DashMap::new(),
            pending: DashSet::new(),
            shutting_down: AtomicBool::new(false),
            liveness_timer: Mutex::new(None),
        })
    }

    pub fn context(&self) -> &RelayContext {
        &self.ctx
    }

    /// Check an id before upgrading the socket
    pub fn admit(&self, client_id: &str) -> RelayResult<()> {
        if self.is_shutting_down() {
            return Err(RelayError::ShuttingDown);
        }
        if client_id.is_empty() {
            return Err(RelayError::MissingClientId);
        }
        if self.clients.contains_key(client_id) || self.pending.contains(client_id) {
            return Err(RelayError::AlreadyConnected {
                client_id: client_id.to_string(),
            });
        }
        Ok(())
    }

    /// Bind a fresh socket and start its output routine.
    ///
    /// The mappings are recorded only after the handshake succeeds.
    #[instrument(skip(self, ws), level = "debug")]
    pub async fn connect<S>(
        &self,
        client_id: String,
        ws: WebSocketStream<S>,
    ) -> RelayResult<Arc<OutputController>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.admit(&client_id)?;
        if !self.pending.insert(client_id.clone()) {
            return Err(RelayError::AlreadyConnected { client_id });
        }

        let connection = Connection::new(
            ws,
            Some(client_id.clone()),
            self.ctx.scheduler.clone(),
            self.ctx.connection_settings,
        );
        let controller = OutputController::new(
            connection,
            Arc::clone(&self.ctx.scripts),
            self.ctx.config.subscribe_random_strength(),
        );

        let initialized = controller.initialize().await;
        self.pending.remove(&client_id);
        if let Err(e) = initialized {
            warn!(client_id = %client_id, error = %e, "Connection failed to initialize");
            controller.close().await;
            return Err(e);
        }

        let target_id = controller.connection().target_id().await;
        self.clients.insert(client_id.clone(), Arc::clone(&controller));
        self.client_to_target
            .insert(client_id.clone(), target_id.clone());
        self.target_to_client.insert(target_id.clone(), client_id.clone());

        // `destroy_all` may have run while this client was still binding
        if self.is_shutting_down() {
            info!(client_id = %client_id, "Relay shut down during handshake, closing client");
            self.remove(&client_id);
            controller.close().await;
            return Err(RelayError::ShuttingDown);
        }
        info!(client_id = %client_id, target_id = %target_id, clients = self.clients.len(), "Client registered");

        controller.start(&self.ctx.scheduler);
        Ok(controller)
    }

    /// Connect, run until the socket ends, then forget the client
    pub async fn serve<S>(&self, client_id: String, ws: WebSocketStream<S>) -> RelayResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let controller = self.connect(client_id.clone(), ws).await?;
        controller.run().await;
        self.remove(&client_id);
        Ok(())
    }

    fn remove(&self, client_id: &str) {
        self.clients.remove(client_id);
        if let Some((_, target_id)) = self.client_to_target.remove(client_id) {
            self.target_to_client
                .remove_if(&target_id, |_, owner| owner == client_id);
        }
        debug!(client_id = %client_id, clients = self.clients.len(), "Client removed");
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<OutputController>> {
        self.clients.get(client_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn target_for_client(&self, client_id: &str) -> Option<String> {
        self.client_to_target
            .get(client_id)
            .map(|entry| entry.value().clone())
    }

    pub fn client_for_target(&self, target_id: &str) -> Option<String> {
        self.target_to_client
            .get(target_id)
            .map(|entry| entry.value().clone())
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.clients.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.clients
            .iter()
            .map(|entry| ClientInfo {
                client_id: entry.key().clone(),
                target_id: self.target_for_client(entry.key()).unwrap_or_default(),
                connected_at: entry.value().connection().connected_at(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Close every connection and drop all mappings.
    ///
    /// New clients are refused afterwards, including ones that finish their
    /// handshake after this returns.
    pub async fn destroy_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(id) = self.liveness_timer.lock().await.take() {
            self.ctx.scheduler.cancel_timer(id);
        }

        let controllers: Vec<_> = self
            .clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        info!(clients = controllers.len(), "Closing all clients");

        for controller in controllers {
            controller.close().await;
        }

        self.clients.clear();
        self.client_to_target.clear();
        self.target_to_client.clear();
    }

    /// Periodically log clients whose heartbeat replies have gone quiet
    pub async fn start_liveness_monitor(self: &Arc<Self>) {
        let mut timer = self.liveness_timer.lock().await;
        if timer.is_some() {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let id = self.ctx.scheduler.register_timer(
            "liveness-monitor",
            LIVENESS_CHECK_INTERVAL,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(registry) = weak.upgrade() {
                        registry.check_liveness().await;
                    }
                    Ok::<_, anyhow::Error>(())
                }
            },
        );
        *timer = Some(id);
    }

    async fn check_liveness(&self) {
        let controllers: Vec<_> = self
            .clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for controller in controllers {
            match controller.connection().heartbeat_age().await {
                Some(age) if age > HEARTBEAT_TIMEOUT => {
                    warn!(
                        client_id = %controller.client_id(),
                        connected_at = %controller.connection().connected_at(),
                        age_secs = age.as_secs(),
                        "Heartbeat reply is stale"
                    );
                }
                Some(_) => {}
                None => debug!(client_id = %controller.client_id(), "No heartbeat reply yet"),
            }
        }
    }
}
