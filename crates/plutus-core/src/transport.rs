//! Client-side network transport: an abstract [`Transport`] trait plus a
//! WebSocket implementation with retrying connect and header-based admission.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::warn;

use crate::envelope::Envelope;
use crate::error::{PlutusError, PlutusResult};

/// 10 MiB, matching the default frame size limit used across the swarm.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Anything capable of carrying framed envelopes between an agent and a hub.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one envelope.
    async fn send(&self, envelope: &Envelope) -> PlutusResult<()>;

    /// Receive the next envelope, blocking until one arrives.
    async fn receive(&self) -> PlutusResult<Envelope>;

    /// Close the transport. Idempotent.
    async fn close(&self) -> PlutusResult<()>;

    /// Whether the transport believes it is currently connected.
    fn is_connected(&self) -> bool;

    /// Re-establish the connection using the original settings, if supported.
    async fn reconnect(&self) -> PlutusResult<()> {
        Err(PlutusError::Connection("transport does not support reconnecting".to_string()))
    }
}

/// Settings controlling how a [`WebSocketTransport`] connects and retries.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Number of retry attempts after the first failed connect.
    pub retries: u32,
    /// Base delay before the first retry.
    pub backoff_base: Duration,
    /// Ceiling on the exponential backoff delay.
    pub backoff_max: Duration,
    /// Bearer token sent as `Authorization: Bearer <token>`.
    pub token: Option<String>,
    /// This transport's peer id, sent as `X-Plutus-Peer-Id`.
    pub peer_id: Option<u64>,
    /// Maximum accepted frame size in bytes.
    pub max_frame_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            retries: 3,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(5),
            token: None,
            peer_id: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A [`Transport`] backed by a WebSocket connection.
pub struct WebSocketTransport {
    uri: String,
    options: ConnectOptions,
    stream: AsyncMutex<Option<WsStream>>,
    closed: AtomicBool,
}

impl WebSocketTransport {
    /// Connect to `uri`, retrying with exponential backoff on failure.
    pub async fn connect(uri: &str, options: ConnectOptions) -> PlutusResult<Self> {
        let stream = Self::connect_with_retry(uri, &options).await?;
        Ok(WebSocketTransport {
            uri: uri.to_string(),
            options,
            stream: AsyncMutex::new(Some(stream)),
            closed: AtomicBool::new(false),
        })
    }

    async fn connect_with_retry(uri: &str, options: &ConnectOptions) -> PlutusResult<WsStream> {
        let mut attempt = 0u32;
        loop {
            match Self::connect_once(uri, options).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    if attempt >= options.retries {
                        return Err(err);
                    }
                    let delay = std::cmp::min(
                        options.backoff_base * 2u32.saturating_pow(attempt),
                        options.backoff_max,
                    );
                    warn!(
                        attempt = attempt + 1,
                        retries = options.retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "websocket connect failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn connect_once(uri: &str, options: &ConnectOptions) -> PlutusResult<WsStream> {
        let mut request = uri
            .into_client_request()
            .map_err(|e| PlutusError::Connection(format!("invalid websocket uri: {e}")))?;
        let headers = request.headers_mut();
        if let Some(token) = &options.token {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|_| PlutusError::Connection("invalid auth token header value".to_string()))?;
            headers.insert("Authorization", value);
        }
        if let Some(peer_id) = options.peer_id {
            let value = peer_id
                .to_string()
                .parse()
                .map_err(|_| PlutusError::Connection("invalid peer id header value".to_string()))?;
            headers.insert("X-Plutus-Peer-Id", value);
        }

        let config = WebSocketConfig {
            max_message_size: Some(options.max_frame_size),
            max_frame_size: Some(options.max_frame_size),
            ..Default::default()
        };

        let (stream, _response) = tokio_tungstenite::connect_async_with_config(request, Some(config), false)
            .await
            .map_err(|e| PlutusError::Connection(format!("websocket connect failed: {e}")))?;
        Ok(stream)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, envelope: &Envelope) -> PlutusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PlutusError::Closed);
        }
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(PlutusError::Closed);
        };
        if stream.send(Message::Binary(envelope.encode())).await.is_err() {
            self.closed.store(true, Ordering::SeqCst);
            return Err(PlutusError::Connection("websocket send failed; connection closed".to_string()));
        }
        Ok(())
    }

    async fn receive(&self) -> PlutusResult<Envelope> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PlutusError::Closed);
        }
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(PlutusError::Closed);
        };
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(bytes))) => return Envelope::decode(&bytes),
                Some(Ok(Message::Close(_))) | None => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(PlutusError::Connection("websocket receive failed; connection closed".to_string()));
                }
                Some(Ok(_)) => continue, // ignore text/ping/pong frames
                Some(Err(err)) => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(PlutusError::Connection(format!("websocket receive failed: {err}")));
                }
            }
        }
    }

    async fn close(&self) -> PlutusResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = stream.close(None).await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> PlutusResult<()> {
        let _ = self.close().await;
        let stream = Self::connect_with_retry(&self.uri, &self.options).await?;
        *self.stream.lock().await = Some(stream);
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }
}
