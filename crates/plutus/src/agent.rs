//! The primary user-facing type: an [`Agent`] composes a replica, an
//! optional network transport, a broadcaster, and lifecycle hooks.

use std::sync::Arc;

use loro::{Subscription, VersionVector};
use plutus_core::{
    new_peer_id, Broadcaster, ConnectOptions, Envelope, MessageKind, Namespace, PlutusResult,
    Replica, Transport, WebSocketTransport,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::lifecycle::{LifecycleContext, LifecycleEvent, LifecycleManager};

/// A single agent participating in the swarm.
pub struct Agent {
    name: String,
    peer_id: u64,
    replica: Arc<Replica>,
    transport: AsyncMutex<Option<Arc<dyn Transport>>>,
    broadcaster: AsyncMutex<Option<Arc<Broadcaster>>>,
    lifecycle: LifecycleManager,
    joined: std::sync::atomic::AtomicBool,
    last_synced_vv: AsyncMutex<VersionVector>,
    server_uri: AsyncMutex<Option<String>>,
    auth_token: AsyncMutex<Option<String>>,
    auto_reconnect: bool,
    _local_subscription: AsyncMutex<Option<Subscription>>,
    _change_subscription: AsyncMutex<Option<Subscription>>,
}

impl Agent {
    /// Build a new, not-yet-joined agent. `peer_id` defaults to a fresh
    /// random id when `None`.
    pub fn new(name: impl Into<String>, peer_id: Option<u64>) -> Arc<Self> {
        let replica = Arc::new(Replica::new());
        let last_synced_vv = replica.version_vector();
        Arc::new(Agent {
            name: name.into(),
            peer_id: peer_id.unwrap_or_else(new_peer_id),
            replica,
            transport: AsyncMutex::new(None),
            broadcaster: AsyncMutex::new(None),
            lifecycle: LifecycleManager::new(),
            joined: std::sync::atomic::AtomicBool::new(false),
            last_synced_vv: AsyncMutex::new(last_synced_vv),
            server_uri: AsyncMutex::new(None),
            auth_token: AsyncMutex::new(None),
            auto_reconnect: true,
            _local_subscription: AsyncMutex::new(None),
            _change_subscription: AsyncMutex::new(None),
        })
    }

    /// This agent's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This agent's peer id on the wire.
    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    /// The underlying replica, for advanced direct access.
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    /// Hook registration and firing for this agent's lifecycle.
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Whether [`Agent::join`] has been called without a matching [`Agent::leave`].
    pub fn is_joined(&self) -> bool {
        self.joined.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// A typed, validated view over the root-level map container named `name`.
    pub fn state(&self, name: &str) -> PlutusResult<Namespace> {
        Ok(Namespace::new(self.replica.map(name)?))
    }

    fn join_envelope(&self) -> Envelope {
        Envelope::new(MessageKind::Join, self.peer_id, None, Vec::new())
    }

    fn leave_envelope(&self) -> Envelope {
        Envelope::new(MessageKind::Leave, self.peer_id, None, Vec::new())
    }

    async fn start_broadcaster(self: &Arc<Self>, transport: Arc<dyn Transport>) -> PlutusResult<()> {
        let mut broadcaster_guard = self.broadcaster.lock().await;
        match broadcaster_guard.as_ref() {
            Some(broadcaster) => {
                broadcaster.bind_transport(transport.clone());
            }
            None => {
                let broadcaster = Broadcaster::new(self.peer_id, self.replica.clone(), None);
                broadcaster.bind_transport(transport.clone());
                let sub = broadcaster.start_local_subscription();
                *self._local_subscription.lock().await = Some(sub);
                *broadcaster_guard = Some(broadcaster);
            }
        }
        broadcaster_guard.as_ref().unwrap().start().await;
        *self.transport.lock().await = Some(transport);
        Ok(())
    }

    async fn stop_broadcaster(&self) {
        if let Some(broadcaster) = self.broadcaster.lock().await.as_ref() {
            broadcaster.stop().await;
        }
    }

    async fn reconnect_transport(self: &Arc<Self>) -> bool {
        if !self.auto_reconnect {
            return false;
        }
        let Some(uri) = self.server_uri.lock().await.clone() else {
            return false;
        };

        info!(agent = %self.name, "attempting transport reconnect");
        self.stop_broadcaster().await;
        if let Some(transport) = self.transport.lock().await.take() {
            let _ = transport.close().await;
        }

        let token = self.auth_token.lock().await.clone();
        let options = ConnectOptions {
            peer_id: Some(self.peer_id),
            token,
            ..Default::default()
        };
        let transport = match WebSocketTransport::connect(&uri, options).await {
            Ok(transport) => Arc::new(transport) as Arc<dyn Transport>,
            Err(e) => {
                self.lifecycle.fire(
                    LifecycleEvent::OnError,
                    LifecycleContext::Error(format!("reconnect failed: {e}")),
                );
                return false;
            }
        };

        if self.start_broadcaster(transport.clone()).await.is_err() {
            return false;
        }
        if transport.send(&self.join_envelope()).await.is_err() {
            return false;
        }
        *self.last_synced_vv.lock().await = self.replica.version_vector();
        info!(agent = %self.name, "transport reconnect completed");
        true
    }

    /// Join the swarm, optionally connecting to a hub at `server_uri`.
    pub async fn join(self: &Arc<Self>, server_uri: Option<&str>, auth_token: Option<String>) -> PlutusResult<()> {
        self.lifecycle.fire(LifecycleEvent::BeforeJoin, LifecycleContext::None);

        let agent_for_change = self.clone();
        let sub = self.replica.subscribe_change(move |event| {
            agent_for_change
                .lifecycle
                .fire(LifecycleEvent::OnStateChange, LifecycleContext::StateChange(event));
        });
        *self._change_subscription.lock().await = Some(sub);

        if let Some(uri) = server_uri {
            *self.server_uri.lock().await = Some(uri.to_string());
            *self.auth_token.lock().await = auth_token.clone();

            let options = ConnectOptions {
                peer_id: Some(self.peer_id),
                token: auth_token,
                ..Default::default()
            };
            let transport = WebSocketTransport::connect(uri, options).await?;
            let transport: Arc<dyn Transport> = Arc::new(transport);
            self.start_broadcaster(transport.clone()).await?;
            transport.send(&self.join_envelope()).await?;
            *self.last_synced_vv.lock().await = self.replica.version_vector();
        }

        self.joined.store(true, std::sync::atomic::Ordering::SeqCst);
        self.lifecycle.fire(LifecycleEvent::AfterJoin, LifecycleContext::None);
        Ok(())
    }

    /// Leave the swarm and disconnect, if connected.
    pub async fn leave(self: &Arc<Self>) -> PlutusResult<()> {
        self.lifecycle.fire(LifecycleEvent::BeforeLeave, LifecycleContext::None);

        if let Some(transport) = self.transport.lock().await.take() {
            let _ = transport.send(&self.leave_envelope()).await;
            self.stop_broadcaster().await;
            *self.broadcaster.lock().await = None;
            let _ = transport.close().await;
        }

        self.joined.store(false, std::sync::atomic::Ordering::SeqCst);
        self.lifecycle.fire(LifecycleEvent::AfterLeave, LifecycleContext::None);
        Ok(())
    }

    /// Commit pending local changes. Broadcasts automatically once connected.
    pub fn commit(&self) {
        self.replica.commit();
    }

    /// Commit pending changes and, if connected, broadcast anything new since
    /// the last sync.
    pub async fn sync(self: &Arc<Self>) -> PlutusResult<()> {
        let has_transport = self.transport.lock().await.is_some();
        if has_transport {
            if let Some(broadcaster) = self.broadcaster.lock().await.as_ref() {
                broadcaster.suppress_next_local_update();
            }
        }
        self.replica.commit();

        if !has_transport {
            return Ok(());
        }

        let reconnected_if_needed = {
            let connected = self
                .transport
                .lock()
                .await
                .as_ref()
                .map(|t| t.is_connected())
                .unwrap_or(false);
            if !connected {
                self.reconnect_transport().await
            } else {
                true
            }
        };
        if !reconnected_if_needed {
            return Ok(());
        }

        let current_vv = self.replica.version_vector();
        let last_vv = self.last_synced_vv.lock().await.clone();
        if current_vv == last_vv {
            return Ok(());
        }

        let updates = self.replica.export_updates_since(&last_vv)?;
        let broadcaster = self.broadcaster.lock().await.as_ref().cloned();
        if let Some(broadcaster) = broadcaster {
            if broadcaster.broadcast_update(updates.clone()).await.is_err() {
                if !self.reconnect_transport().await {
                    return Err(plutus_core::PlutusError::Connection(
                        "sync failed: transport unavailable and reconnect did not succeed".to_string(),
                    ));
                }
                let broadcaster = self.broadcaster.lock().await.as_ref().cloned();
                if let Some(broadcaster) = broadcaster {
                    broadcaster.broadcast_update(updates).await?;
                }
            }
        }
        *self.last_synced_vv.lock().await = current_vv;
        debug!(agent = %self.name, "sync completed");
        Ok(())
    }

    /// Leave the swarm. Equivalent to calling [`Agent::leave`] directly; kept
    /// as a separate name for call sites that treat completion as distinct
    /// from an ordinary leave.
    pub async fn complete(self: &Arc<Self>) -> PlutusResult<()> {
        self.leave().await
    }
}
