//! TCP listener that upgrades `/dglab_ws/{client_id}` requests and hands
//! them to the registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse as HandshakeRejection, Request, Response,
};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::error::{ErrorResponse, ErrorSeverity, RelayError, RelayResult};
use crate::registry::RelayRegistry;

/// Route prefix served by the relay
pub const WS_PATH_PREFIX: &str = "/dglab_ws";

/// Time allowed for the HTTP upgrade
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket front door of the relay
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<RelayRegistry>,
    server_handle: Option<JoinHandle<()>>,
    shutdown_sender: Option<mpsc::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

impl RelayServer {
    pub fn new(config: ServerConfig, registry: Arc<RelayRegistry>) -> Self {
        Self {
            config,
            registry,
            server_handle: None,
            shutdown_sender: None,
            local_addr: None,
        }
    }

    pub fn registry(&self) -> &Arc<RelayRegistry> {
        &self.registry
    }

    /// Bound address, available once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener and start accepting. Port 0 picks a free port.
    pub async fn start(&mut self) -> RelayResult<SocketAddr> {
        if let Some(addr) = self.local_addr.filter(|_| self.server_handle.is_some()) {
            warn!("Relay server already running");
            return Ok(addr);
        }

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            error!(error = %e, "Failed to bind relay server to address {}", addr);
            RelayError::WebSocketBindFailed {
                reason: format!("{addr}: {e}"),
            }
        })?;
        let local_addr = listener.local_addr()?;
        info!("Relay server listening on ws://{}{}/{{client_id}}", local_addr, WS_PATH_PREFIX);

        let (shutdown_sender, mut shutdown_receiver) = mpsc::channel::<()>(1);
        let registry = Arc::clone(&self.registry);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_receiver.recv() => {
                        info!("Relay server shutting down");
                        break;
                    }

                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, peer)) => {
                                debug!(client = %peer, "New TCP connection");
                                let registry = Arc::clone(&registry);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_client(stream, peer, registry).await {
                                        log_client_error(&e, peer);
                                    }
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "Failed to accept connection");
                            }
                        }
                    }
                }
            }
        });

        self.shutdown_sender = Some(shutdown_sender);
        self.server_handle = Some(handle);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stop accepting new connections. Live ones stay up.
    pub async fn stop(&mut self) -> RelayResult<()> {
        let Some(sender) = self.shutdown_sender.take() else {
            debug!("Relay server not running");
            return Ok(());
        };
        let _ = sender.send(()).await;

        if let Some(handle) = self.server_handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Relay server task ended abnormally");
            }
        }
        self.local_addr = None;
        Ok(())
    }
}

#[instrument(skip(stream, registry), level = "debug")]
async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<RelayRegistry>,
) -> RelayResult<()> {
    let mut admitted: Option<String> = None;
    let callback = |request: &Request, response: Response| {
        let checked = client_id_from_path(request.uri().path())
            .and_then(|id| registry.admit(&id).map(|()| id));
        match checked {
            Ok(id) => {
                admitted = Some(id);
                Ok(response)
            }
            Err(e) => {
                info!(client = %peer, path = %request.uri().path(), error = %e, "Rejecting connection");
                Err(rejection(&e))
            }
        }
    };

    let ws = match timeout(HANDSHAKE_TIMEOUT, accept_hdr_async(stream, callback)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            return Err(RelayError::NotAWebsocket {
                reason: e.to_string(),
            })
        }
        Err(_) => {
            return Err(RelayError::NotAWebsocket {
                reason: "handshake timed out".to_string(),
            })
        }
    };

    let client_id = admitted.ok_or(RelayError::MissingClientId)?;
    info!(client = %peer, client_id = %client_id, "WebSocket client connected");
    registry.serve(client_id, ws).await
}

/// Extract the id from `/dglab_ws/{client_id}`
pub fn client_id_from_path(path: &str) -> RelayResult<String> {
    let rest = path
        .strip_prefix(WS_PATH_PREFIX)
        .ok_or_else(|| RelayError::NotAWebsocket {
            reason: format!("unknown path {path}"),
        })?;

    let id = match rest.strip_prefix('/') {
        Some(id) => id.trim_end_matches('/'),
        None if rest.is_empty() => "",
        None => {
            return Err(RelayError::NotAWebsocket {
                reason: format!("unknown path {path}"),
            })
        }
    };

    if id.is_empty() {
        return Err(RelayError::MissingClientId);
    }
    if id.contains('/') {
        return Err(RelayError::NotAWebsocket {
            reason: format!("unknown path {path}"),
        });
    }
    Ok(id.to_string())
}

/// HTTP 400 (404 for unknown routes, 503 while shutting down) with a JSON error body
fn rejection(err: &RelayError) -> HandshakeRejection {
    let body = serde_json::to_string(&ErrorResponse::from(err)).ok();
    let mut response = HandshakeRejection::new(body);
    *response.status_mut() = match err {
        RelayError::NotAWebsocket { .. } => StatusCode::NOT_FOUND,
        RelayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    };
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn log_client_error(err: &RelayError, peer: SocketAddr) {
    match err.severity() {
        ErrorSeverity::Info => debug!(client = %peer, error = %err, "Client session ended"),
        ErrorSeverity::Warning => warn!(client = %peer, error = %err, "Client rejected"),
        ErrorSeverity::Error | ErrorSeverity::Critical => {
            error!(client = %peer, error = %err, "Client session failed")
        }
    }
}
