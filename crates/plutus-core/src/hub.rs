//! Server side of the swarm: accepts WebSocket connections, authenticates
//! them via headers, and fans out every envelope to everyone else connected.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use rustc_hash::FxHashMap;
use serde_json::Value as JsonValue;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::warn;

use crate::envelope::{Envelope, MessageKind};
use crate::error::PlutusResult;
use crate::event_log::EventLog;
use crate::peer::PeerRegistry;
use crate::replica::Replica;

type ClientSink = SplitSink<WebSocketStream<TcpStream>, Message>;

struct ClientHandle {
    sink: AsyncMutex<ClientSink>,
}

/// Settings controlling how a [`Hub`] listens for and admits connections.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Interface to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
    /// Bearer token clients must present; `None` disables admission checks.
    pub auth_token: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            host: "127.0.0.1".to_string(),
            port: 8765,
            auth_token: None,
        }
    }
}

/// The hub: the central relay every agent connects to.
pub struct Hub {
    config: HubConfig,
    replica: Arc<Replica>,
    event_log: Option<Arc<EventLog>>,
    peers: SyncMutex<PeerRegistry>,
    clients: SyncMutex<FxHashMap<u64, Arc<ClientHandle>>>,
    on_message: StdMutex<Option<Box<dyn Fn(Envelope) + Send + Sync>>>,
    listen_task: AsyncMutex<Option<JoinHandle<()>>>,
}

fn reject(status: u16, reason: &'static str, body: &'static str) -> ErrorResponse {
    Response::builder()
        .status(status)
        .header("X-Plutus-Reason", reason)
        .body(Some(body.to_string()))
        .expect("building a static rejection response cannot fail")
}

impl Hub {
    /// Build a new, not-yet-listening hub owning `replica` and, optionally,
    /// an event log backing it.
    pub fn new(config: HubConfig, replica: Arc<Replica>, event_log: Option<Arc<EventLog>>) -> Arc<Self> {
        Arc::new(Hub {
            config,
            replica,
            event_log,
            peers: SyncMutex::new(PeerRegistry::new()),
            clients: SyncMutex::new(FxHashMap::default()),
            on_message: StdMutex::new(None),
            listen_task: AsyncMutex::new(None),
        })
    }

    /// The hub's authoritative replica.
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    /// Register a callback invoked for every accepted envelope, in addition
    /// to the hub's own JOIN/LEAVE/HEARTBEAT bookkeeping.
    pub fn on_message<F: Fn(Envelope) + Send + Sync + 'static>(&self, callback: F) {
        *self.on_message.lock().unwrap() = Some(Box::new(callback));
    }

    /// Number of currently connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Ids of currently known peers (registered via a JOIN message).
    pub fn peer_ids(&self) -> Vec<u64> {
        self.peers.lock().unwrap().peer_ids()
    }

    /// Start accepting connections in the background.
    pub async fn start(self: &Arc<Self>) -> PlutusResult<()> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let this = self.clone();
        let handle = tokio::spawn(async move { this.accept_loop(listener).await });
        *self.listen_task.lock().await = Some(handle);
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_connection(stream).await });
                }
                Err(e) => {
                    warn!(error = %e, "hub accept failed, stopping accept loop");
                    break;
                }
            }
        }
    }

    /// Stop accepting new connections and close every connected client.
    pub async fn stop(&self) {
        if let Some(handle) = self.listen_task.lock().await.take() {
            handle.abort();
        }
        let clients: Vec<Arc<ClientHandle>> = self.clients.lock().drain().map(|(_, h)| h).collect();
        for handle in clients {
            let mut sink = handle.sink.lock().await;
            let _ = sink.close().await;
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let authenticated_peer_id: Arc<StdMutex<Option<u64>>> = Arc::new(StdMutex::new(None));
        let auth_cell = authenticated_peer_id.clone();
        let auth_token = self.config.auth_token.clone();

        let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let Some(token) = &auth_token else {
                return Ok(response);
            };
            let expected = format!("Bearer {token}");
            let provided = request
                .headers()
                .get("Authorization")
                .and_then(|v| v.to_str().ok());
            if provided != Some(expected.as_str()) {
                return Err(reject(401, "Unauthorized", "missing or invalid authorization token"));
            }

            let peer_header = request
                .headers()
                .get("X-Plutus-Peer-Id")
                .and_then(|v| v.to_str().ok());
            let peer_id = match peer_header {
                Some(raw) => match raw.parse::<u64>() {
                    Ok(id) => id,
                    Err(_) => {
                        return Err(reject(400, "Bad Request", "X-Plutus-Peer-Id must be an integer"))
                    }
                },
                None => {
                    return Err(reject(
                        400,
                        "Bad Request",
                        "X-Plutus-Peer-Id is required when auth is enabled",
                    ))
                }
            };
            *auth_cell.lock().unwrap() = Some(peer_id);
            Ok(response)
        };

        let ws_stream = match accept_hdr_async(stream, callback).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "websocket handshake failed");
                return;
            }
        };

        let authenticated_peer_id = *authenticated_peer_id.lock().unwrap();
        let (sink, mut source) = ws_stream.split();
        let handle = Arc::new(ClientHandle {
            sink: AsyncMutex::new(sink),
        });
        let mut registered_peer_id: Option<u64> = None;

        while let Some(message) = source.next().await {
            let message = match message {
                Ok(message) => message,
                Err(_) => break,
            };
            let bytes = match message {
                Message::Binary(bytes) => bytes,
                Message::Close(_) => break,
                _ => continue,
            };

            let envelope = match Envelope::decode(&bytes) {
                Ok(envelope) => envelope,
                Err(_) => {
                    warn!("dropping malformed envelope from client");
                    continue;
                }
            };

            if let Some(expected) = authenticated_peer_id {
                if envelope.sender != expected {
                    warn!(
                        sender = envelope.sender,
                        expected, "dropping envelope with sender spoofing a different authenticated peer"
                    );
                    continue;
                }
            }

            match envelope.kind {
                MessageKind::Join => {
                    registered_peer_id = Some(envelope.sender);
                    self.clients.lock().insert(envelope.sender, handle.clone());
                    self.peers.lock().unwrap().add_peer(envelope.sender, JsonValue::Null);
                }
                MessageKind::Leave => {
                    self.clients.lock().remove(&envelope.sender);
                    self.peers.lock().unwrap().remove_peer(envelope.sender);
                }
                MessageKind::Heartbeat => {
                    self.peers.lock().unwrap().record_heartbeat(envelope.sender);
                }
                MessageKind::CrdtUpdate => match self.replica.import_updates(&envelope.payload) {
                    Ok(()) => {
                        if let Some(event_log) = &self.event_log {
                            if let Err(e) = event_log.append(&bytes) {
                                warn!(error = %e, "failed to append incoming update to event log");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to import incoming update into hub replica");
                    }
                },
                MessageKind::SnapshotRequest | MessageKind::SnapshotResponse => {}
            }

            if let Some(callback) = self.on_message.lock().unwrap().as_ref() {
                callback(envelope.clone());
            }

            self.fan_out(envelope.sender, &bytes).await;
        }

        if let Some(peer_id) = registered_peer_id {
            self.clients.lock().remove(&peer_id);
        }
    }

    async fn fan_out(&self, sender: u64, raw: &[u8]) {
        let recipients: Vec<(u64, Arc<ClientHandle>)> = self
            .clients
            .lock()
            .iter()
            .filter(|(id, _)| **id != sender)
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();

        let mut stale = Vec::new();
        for (id, handle) in recipients {
            let mut sink = handle.sink.lock().await;
            if sink.send(Message::Binary(raw.to_vec())).await.is_err() {
                stale.push(id);
            }
        }
        if !stale.is_empty() {
            let mut clients = self.clients.lock();
            for id in stale {
                clients.remove(&id);
            }
        }
    }
}
