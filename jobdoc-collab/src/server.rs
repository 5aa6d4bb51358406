//! WebSocket front end for the connection coordinator.
//!
//! Architecture:
//! ```text
//! Editor A ──┐   ws://host/sessions/{session_id}?user_id=..&document_ref=..
//!            ├── socket task ──► ConnectionCoordinator ──► Room (Session + peers)
//! Editor B ──┘        ▲                                        │
//!                     └──────── outbound queue (Frame) ◄───────┘
//! ```
//!
//! Each accepted socket gets its own task. The task forwards inbound text
//! frames to the coordinator and writes whatever lands in the connection's
//! outbound queue, so a slow socket only ever delays itself.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::coordinator::{ConnectionCoordinator, DEFAULT_OUTBOUND_CAPACITY};
use crate::documents::{AnyDocument, DocumentSource};
use crate::error::CollabError;
use crate::session::DEFAULT_HISTORY_LIMIT;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before it is dropped as lagging
    pub outbound_capacity: usize,
    /// Accepted operations retained per session for rebasing
    pub history_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub refused_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    refused_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// Parameters of a connect request, taken from the upgrade URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub session_id: String,
    pub user_id: String,
    pub document_ref: String,
}

impl ConnectRequest {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        document_ref: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            document_ref: document_ref.into(),
        }
    }

    /// Parse `/sessions/{session_id}?user_id=..&document_ref=..`.
    pub fn from_uri(uri: &str) -> Result<Self, CollabError> {
        let url = Url::parse(&format!("http://localhost{uri}"))
            .map_err(|e| CollabError::BadRequest(format!("invalid request uri: {e}")))?;

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();
        let session_id = match segments.as_slice() {
            ["sessions", id] => id.to_string(),
            _ => {
                return Err(CollabError::BadRequest(format!(
                    "expected /sessions/{{session_id}}, got {}",
                    url.path()
                )))
            }
        };

        let mut user_id = None;
        let mut document_ref = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "user_id" => user_id = Some(value.into_owned()),
                "document_ref" => document_ref = Some(value.into_owned()),
                _ => {}
            }
        }

        let user_id = user_id
            .filter(|u| !u.is_empty())
            .ok_or_else(|| CollabError::BadRequest("missing user_id".into()))?;
        let document_ref = document_ref
            .filter(|d| !d.is_empty())
            .ok_or_else(|| CollabError::BadRequest("missing document_ref".into()))?;

        Ok(Self {
            session_id,
            user_id,
            document_ref,
        })
    }

    /// Full connect URL below `base` (e.g. `ws://127.0.0.1:9090`).
    pub fn to_url(&self, base: &str) -> Result<String, CollabError> {
        let mut url = Url::parse(base)
            .map_err(|e| CollabError::BadRequest(format!("invalid server url {base}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| CollabError::BadRequest(format!("invalid server url {base}")))?
            .pop_if_empty()
            .extend(["sessions", self.session_id.as_str()]);
        url.query_pairs_mut()
            .clear()
            .append_pair("user_id", &self.user_id)
            .append_pair("document_ref", &self.document_ref);
        Ok(url.into())
    }
}

fn bad_request(reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    coordinator: Arc<ConnectionCoordinator>,
    counters: Arc<Counters>,
}

impl SyncServer {
    /// Create a new sync server backed by `documents`.
    pub fn new(config: ServerConfig, documents: Arc<dyn DocumentSource>) -> Self {
        let coordinator = ConnectionCoordinator::new(documents)
            .with_history_limit(config.history_limit)
            .with_outbound_capacity(config.outbound_capacity);
        Self {
            config,
            coordinator: Arc::new(coordinator),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Default configuration; every document reference is accepted and starts empty.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Arc::new(AnyDocument))
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve_until(listener, shutdown).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves, then close every session.
    pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let coordinator = self.coordinator.clone();
                    let counters = self.counters.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, coordinator, counters).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }

        self.coordinator.shutdown().await;
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        coordinator: Arc<ConnectionCoordinator>,
        counters: Arc<Counters>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut request = None;
        let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match ConnectRequest::from_uri(&req.uri().to_string()) {
                Ok(parsed) => {
                    request = Some(parsed);
                    Ok(response)
                }
                Err(e) => {
                    log::warn!("Refusing handshake from {addr}: {e}");
                    Err(bad_request(e.to_string()))
                }
            }
        };
        let handshake = tokio_tungstenite::accept_hdr_async(stream, callback).await;
        let ws_stream = match handshake {
            Ok(ws) => ws,
            Err(e) => {
                counters.refused_connections.fetch_add(1, Ordering::Relaxed);
                log::debug!("Handshake with {addr} failed: {e}");
                return Ok(());
            }
        };
        let Some(request) = request else {
            return Ok(());
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let joined = coordinator
            .on_connect(&request.session_id, &request.user_id, &request.document_ref)
            .await;
        let (connection, mut outbound) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                counters.refused_connections.fetch_add(1, Ordering::Relaxed);
                let (code, reason) = match &e {
                    CollabError::UnknownSession(_) => {
                        (CloseCode::Policy, "unknown document".to_string())
                    }
                    CollabError::DocumentUnavailable(_) => {
                        (CloseCode::Error, "document unavailable".to_string())
                    }
                    other => (CloseCode::Policy, other.to_string()),
                };
                log::info!("Refused {} from {addr}: {e}", request.user_id);
                let close = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                ws_sender.send(Message::Close(Some(close))).await?;
                return Ok(());
            }
        };

        counters.total_connections.fetch_add(1, Ordering::Relaxed);
        counters.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "WebSocket {connection} established from {addr} for {} in session {}",
            request.user_id,
            request.session_id
        );

        let pumped = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                counters.total_messages.fetch_add(1, Ordering::Relaxed);
                                counters.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);
                                if let Err(e) = coordinator.handle_text(connection, text.as_str()).await {
                                    log::debug!("{connection} no longer registered: {e}");
                                    break;
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Binary(_))) => {
                                log::debug!("Ignoring binary frame from {connection}");
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {connection} closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    frame = outbound.recv() => {
                        match frame {
                            Some(frame) => ws_sender.send(Message::text(frame.to_string())).await?,
                            None => {
                                // Dropped by the coordinator or server shutdown
                                log::debug!("Outbound queue for {connection} closed");
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                }
            }
            Ok::<(), tokio_tungstenite::tungstenite::Error>(())
        }
        .await;

        coordinator.on_disconnect(connection).await;
        counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        pumped.map_err(Into::into)
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            refused_connections: self.counters.refused_connections.load(Ordering::Relaxed),
            total_messages: self.counters.total_messages.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            active_sessions: self.coordinator.registry().session_count().await,
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the coordinator, for introspection.
    pub fn coordinator(&self) -> &Arc<ConnectionCoordinator> {
        &self.coordinator
    }
}
