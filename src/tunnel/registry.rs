//! Connection registry — live tunnel connections keyed by environment id.
//!
//! The registry is an owned, injected object (one per process in production,
//! one per test when isolation matters), never ambient global state. All
//! mutation goes through its own synchronized operations; callers never lock
//! anything themselves.
//!
//! A [`Connection`] owns the two tables the protocol needs: `pending`
//! (correlation id → waiting caller) and `streams` (stream id → relay
//! handle). Both die with the connection: shutdown fails every pending
//! request and force-closes every stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::warn;

use super::correlator::ProxiedResponse;
use super::message::{TunnelMessage, WsOpcode};

/// Outbound frame queue depth per connection.
const OUTBOUND_QUEUE: usize = 256;

/// Per-stream inbound event queue depth.
pub const STREAM_QUEUE: usize = 64;

/// Tunnel-layer failure delivered to waiting callers when their connection
/// can no longer produce a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelError {
    /// A newer connection for the same environment replaced this one.
    Superseded,
    /// The transport died (read/write error, heartbeat timeout, shutdown).
    ConnectionLost,
}

impl TunnelError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Superseded => "AGENT_SUPERSEDED",
            Self::ConnectionLost => "AGENT_DISCONNECTED",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Superseded => "Agent connection replaced by a newer registration",
            Self::ConnectionLost => "Agent connection lost",
        }
    }
}

/// Inbound event delivered to a sub-stream's relay task, in arrival order.
#[derive(Debug)]
pub enum StreamEvent {
    Data { opcode: WsOpcode, payload: Vec<u8> },
    Close { code: Option<u16>, reason: Option<String> },
}

/// Handle to an active sub-stream: the ordered channel its relay task
/// consumes. One channel per stream id keeps per-stream ordering without
/// imposing any ordering across streams.
pub struct StreamHandle {
    tx: mpsc::Sender<StreamEvent>,
}

impl StreamHandle {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx }
    }
}

/// Waiting caller for an in-flight proxied request.
pub type PendingSender = oneshot::Sender<Result<ProxiedResponse, TunnelError>>;

/// One persistent tunnel session with an agent.
pub struct Connection {
    pub environment_id: String,
    /// Single writer: every frame goes through this queue, so frame order on
    /// the transport matches send order and writes never interleave.
    outbound: mpsc::Sender<TunnelMessage>,
    /// Correlation id → waiting caller. Plain mutex: critical sections are a
    /// map op, never an await, so the correlator's cancellation drop-guard
    /// can clean up synchronously.
    pending: StdMutex<HashMap<String, PendingSender>>,
    /// Stream id → relay handle.
    streams: StdMutex<HashMap<String, StreamHandle>>,
    /// Last heartbeat ack, as ms since `epoch` (lock-free).
    last_ack_ms: AtomicU64,
    epoch: Instant,
    pub connected_since: Instant,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Create a connection and hand back the outbound frame queue the
    /// transport writer task must drain.
    pub fn new(environment_id: impl Into<String>) -> (Arc<Self>, mpsc::Receiver<TunnelMessage>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (closed, _) = watch::channel(false);
        let now = Instant::now();
        let conn = Arc::new(Self {
            environment_id: environment_id.into(),
            outbound,
            pending: StdMutex::new(HashMap::new()),
            streams: StdMutex::new(HashMap::new()),
            last_ack_ms: AtomicU64::new(0),
            epoch: now,
            connected_since: now,
            closed,
        });
        (conn, rx)
    }

    /// Queue a frame for the transport writer. Fails once the connection is
    /// shut down or the writer is gone.
    pub async fn send(&self, msg: TunnelMessage) -> Result<(), TunnelError> {
        if *self.closed.borrow() {
            return Err(TunnelError::ConnectionLost);
        }
        self.outbound
            .send(msg)
            .await
            .map_err(|_| TunnelError::ConnectionLost)
    }

    pub fn register_pending(&self, id: String, sender: PendingSender) {
        self.pending.lock().expect("pending lock").insert(id, sender);
    }

    /// Claim the waiter for `id`, removing the table entry.
    pub fn take_pending(&self, id: &str) -> Option<PendingSender> {
        self.pending.lock().expect("pending lock").remove(id)
    }

    /// Drop the entry for `id` without resolving it (timeout or caller gone).
    pub fn remove_pending(&self, id: &str) -> bool {
        self.pending.lock().expect("pending lock").remove(id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }

    pub fn register_stream(&self, id: String, handle: StreamHandle) {
        self.streams.lock().expect("streams lock").insert(id, handle);
    }

    pub fn remove_stream(&self, id: &str) -> bool {
        self.streams.lock().expect("streams lock").remove(id).is_some()
    }

    /// Sender for a stream's ordered event channel, if the stream is active.
    pub fn stream_sender(&self, id: &str) -> Option<mpsc::Sender<StreamEvent>> {
        self.streams
            .lock()
            .expect("streams lock")
            .get(id)
            .map(|h| h.tx.clone())
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().expect("streams lock").len()
    }

    /// Record a heartbeat ack (ms since connection epoch).
    pub fn mark_heartbeat_ack(&self) {
        #[allow(clippy::cast_possible_truncation)]
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.last_ack_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_heartbeat_ack_ms(&self) -> u64 {
        self.last_ack_ms.load(Ordering::Relaxed)
    }

    /// Ms since the connection epoch, for comparing against ack timestamps.
    pub fn epoch_ms(&self) -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        now_ms
    }

    /// Watch that flips to `true` when the connection dies.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Tear the connection down: fail every pending request with `error` and
    /// force-close every active stream. Idempotent.
    pub fn shutdown(&self, error: TunnelError) {
        if self.closed.send_replace(true) {
            return; // already down
        }

        let drained: Vec<(String, PendingSender)> = {
            let mut pending = self.pending.lock().expect("pending lock");
            pending.drain().collect()
        };
        if !drained.is_empty() {
            warn!(
                environment = %self.environment_id,
                count = drained.len(),
                reason = error.code(),
                "Failing pending requests on connection shutdown"
            );
        }
        for (_, sender) in drained {
            let _ = sender.send(Err(error));
        }

        let streams: Vec<(String, StreamHandle)> = {
            let mut streams = self.streams.lock().expect("streams lock");
            streams.drain().collect()
        };
        for (_, handle) in streams {
            // Best-effort: a full stream queue means the relay task is about
            // to observe the closed watch anyway.
            let _ = handle.tx.try_send(StreamEvent::Close {
                code: None,
                reason: Some(error.message().to_string()),
            });
        }
    }
}

/// Process-wide table of live connections, keyed by environment id.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register `conn` as the authoritative connection for its environment.
    /// Any prior connection for the same id is shut down with a superseded
    /// error first, failing its pending requests and closing its streams.
    pub async fn register(&self, conn: Arc<Connection>) {
        let mut connections = self.connections.write().await;
        if let Some(old) = connections.insert(conn.environment_id.clone(), conn.clone()) {
            warn!(
                environment = %old.environment_id,
                "Agent re-registered while a connection exists, evicting old"
            );
            old.shutdown(TunnelError::Superseded);
        }
    }

    pub async fn lookup(&self, environment_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(environment_id).cloned()
    }

    /// Remove `conn` from the table, but only if it is still the current
    /// holder — a stale unregister racing a newer registration must not evict
    /// the replacement. Returns whether an entry was removed.
    pub async fn unregister(&self, environment_id: &str, conn: &Arc<Connection>) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(environment_id) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                connections.remove(environment_id);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of all live connections, for the admin listing.
    pub async fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = Connection::new("env-1");
        registry.register(conn.clone()).await;

        let found = registry.lookup("env-1").await.expect("registered");
        assert!(Arc::ptr_eq(&found, &conn));
        assert!(registry.lookup("env-2").await.is_none());
    }

    #[tokio::test]
    async fn test_reregister_supersedes_and_fails_pending() {
        let registry = ConnectionRegistry::new();
        let (old, _old_rx) = Connection::new("env-1");
        registry.register(old.clone()).await;

        let (tx, rx) = oneshot::channel();
        old.register_pending("r1".to_string(), tx);

        let (new, _new_rx) = Connection::new("env-1");
        registry.register(new.clone()).await;

        assert_eq!(rx.await.expect("resolved"), Err(TunnelError::Superseded));
        assert!(old.is_closed());
        let current = registry.lookup("env-1").await.expect("still registered");
        assert!(Arc::ptr_eq(&current, &new));
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_replacement() {
        let registry = ConnectionRegistry::new();
        let (old, _old_rx) = Connection::new("env-1");
        registry.register(old.clone()).await;
        let (new, _new_rx) = Connection::new("env-1");
        registry.register(new.clone()).await;

        assert!(!registry.unregister("env-1", &old).await);
        assert!(registry.lookup("env-1").await.is_some());

        assert!(registry.unregister("env-1", &new).await);
        assert!(registry.lookup("env-1").await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_streams_and_rejects_sends() {
        let (conn, _rx) = Connection::new("env-1");
        let (stream_tx, mut stream_rx) = mpsc::channel(STREAM_QUEUE);
        conn.register_stream("s1".to_string(), StreamHandle::new(stream_tx));

        conn.shutdown(TunnelError::ConnectionLost);

        match stream_rx.recv().await {
            Some(StreamEvent::Close { .. }) => {}
            other => panic!("expected close event, got {other:?}"),
        }
        assert_eq!(conn.stream_count(), 0);
        assert_eq!(
            conn.send(TunnelMessage::Heartbeat).await,
            Err(TunnelError::ConnectionLost)
        );

        // Idempotent: a second shutdown is a no-op.
        conn.shutdown(TunnelError::Superseded);
    }

    #[tokio::test]
    async fn test_pending_take_is_single_use() {
        let (conn, _rx) = Connection::new("env-1");
        let (tx, _rx2) = oneshot::channel();
        conn.register_pending("r1".to_string(), tx);
        assert_eq!(conn.pending_count(), 1);
        assert!(conn.take_pending("r1").is_some());
        assert!(conn.take_pending("r1").is_none());
        assert_eq!(conn.pending_count(), 0);
    }
}
