//! Bridges a [`Replica`]'s local update callback to the network: local
//! changes are queued and sent asynchronously, remote updates are received
//! and imported, and everything can be replayed from an [`EventLog`] before
//! a transport is even bound.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loro::Subscription;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::envelope::{Envelope, MessageKind};
use crate::error::PlutusResult;
use crate::event_log::EventLog;
use crate::replica::Replica;
use crate::transport::Transport;

/// Bounded queue depth for locally produced updates awaiting send.
const QUEUE_CAPACITY: usize = 1024;

/// Bridges local CRDT updates to the network and remote updates back into
/// the replica.
pub struct Broadcaster {
    peer_id: u64,
    replica: Arc<Replica>,
    event_log: Option<Arc<EventLog>>,
    transport: SyncMutex<Option<Arc<dyn Transport>>>,
    queue_tx: mpsc::Sender<Vec<u8>>,
    queue_rx: AsyncMutex<Option<mpsc::Receiver<Vec<u8>>>>,
    suppress_count: AtomicU64,
    pending_count: AtomicUsize,
    drained: Notify,
    running: AtomicBool,
    send_task: AsyncMutex<Option<JoinHandle<()>>>,
    receive_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Broadcaster {
    /// Build a new broadcaster for `peer_id`, wired to `replica` and
    /// optionally backed by `event_log` for buffering updates produced
    /// before any transport is bound.
    pub fn new(peer_id: u64, replica: Arc<Replica>, event_log: Option<Arc<EventLog>>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        Arc::new(Broadcaster {
            peer_id,
            replica,
            event_log,
            transport: SyncMutex::new(None),
            queue_tx,
            queue_rx: AsyncMutex::new(Some(queue_rx)),
            suppress_count: AtomicU64::new(0),
            pending_count: AtomicUsize::new(0),
            drained: Notify::new(),
            running: AtomicBool::new(false),
            send_task: AsyncMutex::new(None),
            receive_task: AsyncMutex::new(None),
        })
    }

    /// Bind (or replace) the transport used for sending and receiving.
    pub fn bind_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.lock() = Some(transport);
    }

    /// Skip re-broadcasting the next local update.
    ///
    /// Used when a caller (e.g. a manual `sync()`) has already sent an
    /// update directly, so the update callback triggered by that same write
    /// should not enqueue it a second time.
    pub fn suppress_next_local_update(&self) {
        self.suppress_count.fetch_add(1, Ordering::SeqCst);
    }

    fn on_local_update(&self, update_bytes: &[u8]) {
        let suppressed = self
            .suppress_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                if c > 0 {
                    Some(c - 1)
                } else {
                    None
                }
            })
            .is_ok();
        if suppressed {
            return;
        }

        let transport = self.transport.lock().clone();
        if transport.is_none() {
            if let Some(event_log) = &self.event_log {
                let envelope = Envelope::new(MessageKind::CrdtUpdate, self.peer_id, None, update_bytes.to_vec());
                if let Err(e) = event_log.append(&envelope.encode()) {
                    warn!(error = %e, "failed to append local update to event log");
                }
            }
            return;
        }

        match self.queue_tx.try_send(update_bytes.to_vec()) {
            Ok(()) => {
                self.pending_count.fetch_add(1, Ordering::SeqCst);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("dropping local CRDT update because broadcaster queue is full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("ignoring local update because broadcaster queue is closed");
            }
        }
    }

    /// Subscribe to the replica's local-update callback so future commits
    /// flow into this broadcaster automatically. Keep the returned
    /// [`Subscription`] alive for as long as the broadcaster should run.
    pub fn start_local_subscription(self: &Arc<Self>) -> Subscription {
        let this = self.clone();
        self.replica.subscribe_local_update(move |bytes| {
            this.on_local_update(bytes);
            true
        })
    }

    /// Send one update over the bound transport, appending it to the event
    /// log first if one is configured. No-op if no transport is bound.
    pub async fn broadcast_update(&self, update_bytes: Vec<u8>) -> PlutusResult<()> {
        let Some(transport) = self.transport.lock().clone() else {
            return Ok(());
        };
        let envelope = Envelope::new(MessageKind::CrdtUpdate, self.peer_id, None, update_bytes);
        if let Some(event_log) = &self.event_log {
            event_log.append(&envelope.encode())?;
        }
        transport.send(&envelope).await
    }

    async fn send_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<u8>>) {
        while self.running.load(Ordering::SeqCst) {
            let Some(update_bytes) = rx.recv().await else {
                break;
            };
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.broadcast_update(update_bytes).await {
                warn!(error = %e, "failed to send CRDT update");
                break;
            }
            let remaining = self
                .pending_count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(1)))
                .unwrap_or(0);
            if remaining <= 1 {
                self.drained.notify_waiters();
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    async fn receive_loop(self: Arc<Self>) {
        let Some(transport) = self.transport.lock().clone() else {
            return;
        };
        while self.running.load(Ordering::SeqCst) {
            match transport.receive().await {
                Ok(envelope) => {
                    if envelope.kind == MessageKind::CrdtUpdate {
                        if let Err(e) = self.replica.import_updates(&envelope.payload) {
                            warn!(error = %e, "failed to import remote update");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "receive loop hit transport error");
                    if transport.reconnect().await.is_err() {
                        break;
                    }
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Start the background send/receive tasks. A transport must be bound
    /// first for the receive task to start; the send task starts regardless
    /// so queued updates aren't lost once a transport is bound later.
    pub async fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);

        if let Some(rx) = self.queue_rx.lock().await.take() {
            let this = self.clone();
            let handle = tokio::spawn(this.send_loop(rx));
            *self.send_task.lock().await = Some(handle);
        }

        if self.transport.lock().is_some() {
            let this = self.clone();
            let handle = tokio::spawn(async move { this.receive_loop().await });
            *self.receive_task.lock().await = Some(handle);
        }
    }

    /// Stop the background tasks and release anything waiting on
    /// [`Broadcaster::flush_pending`].
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.send_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.receive_task.lock().await.take() {
            handle.abort();
        }
        self.pending_count.store(0, Ordering::SeqCst);
        self.drained.notify_waiters();
    }

    /// Wait until every locally queued update has been handed to the
    /// transport. Returns `false` if `timeout` elapsed first.
    pub async fn flush_pending(&self, timeout: Option<Duration>) -> bool {
        loop {
            if self.pending_count.load(Ordering::SeqCst) == 0 {
                return true;
            }
            let notified = self.drained.notified();
            if self.pending_count.load(Ordering::SeqCst) == 0 {
                return true;
            }
            match timeout {
                None => notified.await,
                Some(d) => {
                    if tokio::time::timeout(d, notified).await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Import every entry from the event log, skipping entries this peer
    /// itself produced (it already has that state).
    pub fn replay_log(&self) -> PlutusResult<()> {
        let Some(event_log) = &self.event_log else {
            return Ok(());
        };
        for entry in event_log.replay() {
            let envelope = match Envelope::decode(&entry) {
                Ok(envelope) => envelope,
                Err(_) => {
                    warn!("skipping malformed event log entry during replay");
                    continue;
                }
            };
            if envelope.sender != self.peer_id {
                self.replica.import_updates(&envelope.payload)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlutusError;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;
    use tokio::sync::mpsc as tokio_mpsc;

    struct MockTransport {
        sent: StdMutex<Vec<Envelope>>,
        incoming_tx: tokio_mpsc::Sender<Envelope>,
        incoming_rx: AsyncMutex<tokio_mpsc::Receiver<Envelope>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            let (tx, rx) = tokio_mpsc::channel(16);
            Arc::new(MockTransport {
                sent: StdMutex::new(Vec::new()),
                incoming_tx: tx,
                incoming_rx: AsyncMutex::new(rx),
            })
        }

        async fn push_incoming(&self, envelope: Envelope) {
            self.incoming_tx.send(envelope).await.unwrap();
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, envelope: &Envelope) -> PlutusResult<()> {
            self.sent.lock().unwrap().push(envelope.clone());
            Ok(())
        }

        async fn receive(&self) -> PlutusResult<Envelope> {
            self.incoming_rx
                .lock()
                .await
                .recv()
                .await
                .ok_or(PlutusError::Closed)
        }

        async fn close(&self) -> PlutusResult<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn buffers_to_event_log_without_a_transport() {
        let dir = tempdir().unwrap();
        let event_log = Arc::new(EventLog::open(dir.path().join("log"), Default::default()).unwrap());
        let replica = Arc::new(Replica::new());
        let broadcaster = Broadcaster::new(1, replica.clone(), Some(event_log.clone()));
        let _sub = broadcaster.start_local_subscription();

        replica.map("state").unwrap().insert("x", 1).unwrap();
        replica.commit();

        assert!(!event_log.is_empty());
        let envelope = Envelope::decode(&event_log.get(0).unwrap()).unwrap();
        assert_eq!(envelope.sender, 1);
        assert_eq!(envelope.kind, MessageKind::CrdtUpdate);
    }

    #[tokio::test]
    async fn suppressed_update_is_not_buffered() {
        let dir = tempdir().unwrap();
        let event_log = Arc::new(EventLog::open(dir.path().join("log"), Default::default()).unwrap());
        let replica = Arc::new(Replica::new());
        let broadcaster = Broadcaster::new(1, replica.clone(), Some(event_log.clone()));
        let _sub = broadcaster.start_local_subscription();

        broadcaster.suppress_next_local_update();
        replica.map("state").unwrap().insert("x", 1).unwrap();
        replica.commit();

        assert!(event_log.is_empty());
    }

    #[tokio::test]
    async fn queued_updates_are_sent_once_a_transport_is_bound() {
        let replica = Arc::new(Replica::new());
        let broadcaster = Broadcaster::new(1, replica.clone(), None);
        let _sub = broadcaster.start_local_subscription();
        let transport = MockTransport::new();
        broadcaster.bind_transport(transport.clone());
        broadcaster.start().await;

        replica.map("state").unwrap().insert("x", 1).unwrap();
        replica.commit();

        assert!(broadcaster.flush_pending(Some(Duration::from_secs(2))).await);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        broadcaster.stop().await;
    }

    #[tokio::test]
    async fn receive_loop_imports_remote_crdt_updates() {
        let sender_replica = Arc::new(Replica::new());
        sender_replica.map("state").unwrap().insert("x", 1).unwrap();
        sender_replica.commit();
        let update = sender_replica.export_all_updates().unwrap();

        let receiver_replica = Arc::new(Replica::new());
        let broadcaster = Broadcaster::new(2, receiver_replica.clone(), None);
        let transport = MockTransport::new();
        broadcaster.bind_transport(transport.clone());
        broadcaster.start().await;

        transport
            .push_incoming(Envelope::new(MessageKind::CrdtUpdate, 1, None, update))
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let value = receiver_replica.map("state").unwrap().get_deep_value();
        assert_eq!(
            crate::value::PlutusValue::from_loro(&value),
            crate::value::PlutusValue::Map(
                [("x".to_string(), crate::value::PlutusValue::Int(1))]
                    .into_iter()
                    .collect()
            )
        );
        broadcaster.stop().await;
    }

    #[test]
    fn replay_log_skips_entries_from_self() {
        let dir = tempdir().unwrap();
        let event_log = Arc::new(EventLog::open(dir.path().join("log"), Default::default()).unwrap());

        let own = Envelope::new(MessageKind::CrdtUpdate, 1, None, vec![9, 9]);
        event_log.append(&own.encode()).unwrap();

        let remote_replica = Replica::new();
        remote_replica.map("state").unwrap().insert("x", 1).unwrap();
        remote_replica.commit();
        let remote_update = remote_replica.export_all_updates().unwrap();
        let remote = Envelope::new(MessageKind::CrdtUpdate, 2, None, remote_update);
        event_log.append(&remote.encode()).unwrap();

        let replica = Arc::new(Replica::new());
        let broadcaster = Broadcaster::new(1, replica.clone(), Some(event_log));
        broadcaster.replay_log().unwrap();

        assert!(replica.map("state").unwrap().get("x").is_some());
    }
}
