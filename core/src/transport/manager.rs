//! The transport manager: registered transports, the peers map, the
//! reliable queue, and inbound dispatch.
//!
//! The peers map is guarded by a read-write lock: lookups read-lock,
//! activation and deactivation write-lock, so a peer can never be
//! activated twice against its transport. Peers activate lazily on the
//! first outbound send (registry lookup → first mutually supported
//! transport → `activate_node`) and each runs one sender task until it
//! quiesces.
//!
//! Reliable messages are written in the *caller's* gateway transaction
//! with a node-wide monotonic sequence; the post-commit hook pokes the
//! target peer's sender so delivery starts as soon as the row is
//! durable — and only then.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock as SyncRwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::RegistryManager;
use crate::storage::{CoreDb, DbTxn, Table};
use crate::types::now_millis;

use super::peer::{Peer, PeerStats};
use super::retry::RetryConfig;
use super::{
    Component, InboundHandler, ReliableMessage, ReliableMessageAck, ReliableMessageBuilder,
    ReliableMessageKind, Transport, TransportError, WireMessage,
};

/// Message type of the built-in reliable acknowledgement.
pub const MSG_RELIABLE_ACK: &str = "reliable_ack";

/// Meta-table counter for the node-wide reliable sequence.
const RELIABLE_SEQUENCE_COUNTER: &[u8] = b"reliable_message_sequence";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Fire-and-forget buffer per peer.
    pub send_queue_len: usize,
    /// Reliable messages fetched per page during a drain.
    pub reliable_page_size: usize,
    /// Interval between full rescans of unacked reliable messages.
    pub reliable_resend_interval_ms: u64,
    /// Idle time after which a peer's sender quiesces.
    pub peer_inactivity_timeout_ms: u64,
    /// Window a quiescing peer waits for late work before exiting.
    pub quiesce_timeout_ms: u64,
    /// Short retry wrapped around individual sends.
    #[serde(default)]
    pub short_retry: RetryConfig,
    /// Backoff of the outer (unbounded) reliable-scan loop.
    pub scan_retry: RetryConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_queue_len: 16,
            reliable_page_size: 100,
            reliable_resend_interval_ms: 120_000,
            peer_inactivity_timeout_ms: 30_000,
            quiesce_timeout_ms: 1_000,
            short_retry: RetryConfig::default(),
            scan_retry: RetryConfig {
                max_attempts: 0,
                initial_delay_ms: 50,
                factor: 2.0,
                max_delay_ms: 5_000,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Point-in-time view of one peer, for status listing.
///
/// Entries without an active sender are passive: created to track
/// receive stats, never holding a transport connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    pub name: String,
    pub activated: i64,
    pub sender_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_error: Option<String>,
    pub stats: PeerStats,
}

// ---------------------------------------------------------------------------
// Ack payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AckPayload {
    message_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

pub(crate) fn reliable_key(node: &str, sequence: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(node.len() + 1 + 8);
    k.extend_from_slice(node.as_bytes());
    k.push(0);
    k.extend_from_slice(&sequence.to_be_bytes());
    k
}

pub(crate) fn reliable_prefix(node: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(node.len() + 1);
    k.extend_from_slice(node.as_bytes());
    k.push(0);
    k
}

// ---------------------------------------------------------------------------
// TransportManager
// ---------------------------------------------------------------------------

struct Handlers {
    engine: Option<Arc<dyn InboundHandler>>,
    reliable: Option<Arc<dyn InboundHandler>>,
    identity: Option<Arc<dyn InboundHandler>>,
}

pub struct TransportManager {
    node_name: String,
    config: TransportConfig,
    db: Arc<CoreDb>,
    registry: Arc<RegistryManager>,
    transports: SyncRwLock<HashMap<String, Arc<dyn Transport>>>,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    builder: SyncRwLock<Option<Arc<dyn ReliableMessageBuilder>>>,
    handlers: SyncRwLock<Handlers>,
    ack_listener: SyncRwLock<Option<Arc<dyn Fn(Uuid, Option<&str>) + Send + Sync>>>,
    stopped: AtomicBool,
}

impl TransportManager {
    pub fn new(
        node_name: &str,
        db: Arc<CoreDb>,
        registry: Arc<RegistryManager>,
        config: TransportConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_name: node_name.to_string(),
            config,
            db,
            registry,
            transports: SyncRwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            builder: SyncRwLock::new(None),
            handlers: SyncRwLock::new(Handlers {
                engine: None,
                reliable: None,
                identity: None,
            }),
            ack_listener: SyncRwLock::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub(crate) fn db(&self) -> &Arc<CoreDb> {
        &self.db
    }

    // -- Wiring -------------------------------------------------------------

    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        self.transports
            .write()
            .insert(transport.name().to_string(), transport);
    }

    pub fn set_reliable_builder(&self, builder: Arc<dyn ReliableMessageBuilder>) {
        *self.builder.write() = Some(builder);
    }

    /// Observe every ack row as it lands (e.g. to mirror distribution
    /// acks into their own table).
    pub fn set_ack_listener(&self, listener: Arc<dyn Fn(Uuid, Option<&str>) + Send + Sync>) {
        *self.ack_listener.write() = Some(listener);
    }

    pub fn set_handler(&self, component: Component, handler: Arc<dyn InboundHandler>) {
        let mut handlers = self.handlers.write();
        match component {
            Component::TransactionEngine => handlers.engine = Some(handler),
            Component::ReliableMessageHandler => handlers.reliable = Some(handler),
            Component::IdentityResolver => handlers.identity = Some(handler),
        }
    }

    pub(crate) fn reliable_builder(&self) -> Option<Arc<dyn ReliableMessageBuilder>> {
        self.builder.read().clone()
    }

    // -- Peer lifecycle -----------------------------------------------------

    fn validate_node_name(&self, node: &str) -> Result<(), TransportError> {
        let valid = !node.is_empty()
            && node
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
            && node.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
        if !valid {
            return Err(TransportError::InvalidTarget(node.to_string()));
        }
        if node == self.node_name {
            return Err(TransportError::SendToSelf(node.to_string()));
        }
        Ok(())
    }

    /// Get (and lazily activate) a peer. `sending == false` only
    /// records the peer for stats and does not start a sender.
    pub async fn get_peer(
        self: &Arc<Self>,
        node: &str,
        sending: bool,
    ) -> Result<Arc<Peer>, TransportError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Stopped);
        }
        self.validate_node_name(node)?;

        // The happy path is a read-locked lookup of an active peer.
        {
            let peers = self.peers.read().await;
            if let Some(peer) = peers.get(node) {
                if peer.sender_started() || !sending {
                    return Ok(Arc::clone(peer));
                }
            }
        }
        self.connect_peer(node, sending).await
    }

    async fn connect_peer(
        self: &Arc<Self>,
        node: &str,
        sending: bool,
    ) -> Result<Arc<Peer>, TransportError> {
        // Race to the write lock; the loser finds the winner's peer.
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get(node) {
            if peer.sender_started() || !sending {
                debug!(peer = node, "connection already active (after race)");
                return Ok(Arc::clone(peer));
            }
        }

        let peer = match peers.get(node) {
            Some(existing) => Arc::clone(existing),
            None => {
                debug!(peer = node, "activating new peer");
                let peer = Peer::new(node, self.config.send_queue_len);
                peers.insert(node.to_string(), Arc::clone(&peer));
                peer
            }
        };

        if sending {
            // Resolve the registry and activate while still holding the
            // write lock: this is what makes dual activation impossible.
            if let Err(e) = self.start_peer_sender(&peer).await {
                peer.set_outbound_error(Some(e.to_string()));
                return Err(e);
            }
            peer.set_outbound_error(None);
        }
        Ok(peer)
    }

    async fn start_peer_sender(self: &Arc<Self>, peer: &Arc<Peer>) -> Result<(), TransportError> {
        // The registry caches, so this is as cheap as an in-memory read.
        let registered = self
            .registry
            .node_transports(peer.name())
            .map_err(|e| TransportError::Registry {
                node: peer.name().to_string(),
                reason: e.to_string(),
            })?;

        // First mutually supported transport wins; no fallback retry to
        // a secondary one.
        let selected = {
            let transports = self.transports.read();
            let mut selected = None;
            for entry in &registered {
                if let Some(transport) = transports.get(&entry.transport) {
                    selected = Some((Arc::clone(transport), entry.details.clone()));
                    break;
                }
            }
            selected
        };
        let Some((transport, details)) = selected else {
            return Err(TransportError::NoMutualTransport {
                node: peer.name().to_string(),
                registered: registered.into_iter().map(|e| e.transport).collect(),
            });
        };

        let peer_info = transport
            .activate_node(peer.name(), &details)
            .await
            .map_err(|e| TransportError::ActivationFailed {
                node: peer.name().to_string(),
                reason: e.to_string(),
            })?;
        peer.activated(Arc::clone(&transport), peer_info);

        info!(peer = peer.name(), transport = transport.name(), "peer activated");
        peer.spawn_sender(Arc::clone(self));
        Ok(())
    }

    /// Remove and deactivate a peer. Called from the peer's own sender
    /// task on quiesce; the write lock makes sure no activation races.
    pub(crate) async fn deactivate_peer(&self, peer: &Arc<Peer>) {
        let mut peers = self.peers.write().await;
        peers.remove(peer.name());
        info!(peer = peer.name(), "peer deactivating");
        if let Some(transport) = peer.transport() {
            if let Err(e) = transport.deactivate_node(peer.name()).await {
                warn!(peer = peer.name(), "deactivation error: {}", e);
            }
        }
    }

    /// All currently-active peers, name order.
    pub async fn list_active_peers(&self) -> Vec<PeerStatus> {
        let peers = self.peers.read().await;
        let mut list: Vec<PeerStatus> = peers.values().map(|p| p.status()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    // -- Sending ------------------------------------------------------------

    /// Queue a fire-and-forget message; activates the peer if needed.
    pub async fn send_fire_and_forget(
        self: &Arc<Self>,
        node: &str,
        message: WireMessage,
    ) -> Result<(), TransportError> {
        let peer = self.get_peer(node, true).await?;
        peer.enqueue(message).await
    }

    /// Stage a reliable message into the caller's transaction.
    ///
    /// The sequence allocation rides the same write-set, and the
    /// peer's sender is poked only from the post-commit hook — an
    /// aborted transaction never signals anything.
    pub fn queue_reliable(
        self: &Arc<Self>,
        txn: &mut DbTxn<'_>,
        node: &str,
        kind: ReliableMessageKind,
        metadata: &Value,
    ) -> Result<Uuid, TransportError> {
        self.validate_node_name(node)?;
        let sequence = txn.next_sequence(RELIABLE_SEQUENCE_COUNTER)?;
        let row = ReliableMessage {
            sequence,
            id: Uuid::new_v4(),
            node: node.to_string(),
            kind,
            metadata: metadata.to_string(),
            created: now_millis(),
        };
        txn.put(Table::ReliableMessages, &reliable_key(node, sequence), &row)?;

        let this = Arc::clone(self);
        let target = node.to_string();
        let id = row.id;
        txn.on_commit(move || {
            tokio::spawn(async move {
                if let Err(e) = this.notify_reliable(&target).await {
                    warn!(peer = %target, "failed to wake peer for reliable message: {}", e);
                }
            });
        });
        Ok(id)
    }

    async fn notify_reliable(self: &Arc<Self>, node: &str) -> Result<(), TransportError> {
        let peer = self.get_peer(node, true).await?;
        peer.notify_persisted();
        Ok(())
    }

    // -- Acks ---------------------------------------------------------------

    /// Write the ack row for a message id (idempotent).
    pub fn write_ack(&self, message_id: Uuid, error: Option<String>) -> Result<(), TransportError> {
        let error_for_listener = error.clone();
        self.db.transaction(|txn| {
            let ack = ReliableMessageAck {
                message_id,
                time: now_millis(),
                error,
            };
            txn.put_if_absent(Table::ReliableMessageAcks, message_id.as_bytes(), &ack)?;
            Ok::<(), TransportError>(())
        })?;
        if let Some(listener) = self.ack_listener.read().clone() {
            listener(message_id, error_for_listener.as_deref());
        }
        Ok(())
    }

    /// True if the ack row for a message exists.
    pub fn is_acked(&self, message_id: Uuid) -> Result<bool, TransportError> {
        Ok(self
            .db
            .contains(Table::ReliableMessageAcks, message_id.as_bytes())?)
    }

    /// Send the ack for a processed reliable message back to its origin.
    pub async fn send_ack(
        self: &Arc<Self>,
        node: &str,
        message_id: Uuid,
        error: Option<String>,
    ) -> Result<(), TransportError> {
        let payload = AckPayload { message_id, error };
        let message = WireMessage::json(Component::ReliableMessageHandler, MSG_RELIABLE_ACK, &payload)?
            .correlated(message_id);
        self.send_fire_and_forget(node, message).await
    }

    // -- Receiving ----------------------------------------------------------

    /// Entry point for transports delivering an inbound message.
    pub async fn receive_message(self: &Arc<Self>, from_node: &str, message: WireMessage) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        // Record stats against the (possibly passive) peer entry.
        if let Ok(peer) = self.get_peer(from_node, false).await {
            peer.update_received(&message);
        }

        // Acks for our own reliable messages are handled in place.
        if message.component == Component::ReliableMessageHandler
            && message.message_type == MSG_RELIABLE_ACK
        {
            match message.parse_payload::<AckPayload>() {
                Ok(ack) => {
                    debug!(peer = from_node, message = %ack.message_id, "reliable ack received");
                    if let Err(e) = self.write_ack(ack.message_id, ack.error) {
                        warn!(peer = from_node, "failed to record ack: {}", e);
                    }
                }
                Err(e) => warn!(peer = from_node, "malformed ack: {}", e),
            }
            return;
        }

        let handler = {
            let handlers = self.handlers.read();
            match message.component {
                Component::TransactionEngine => handlers.engine.clone(),
                Component::ReliableMessageHandler => handlers.reliable.clone(),
                Component::IdentityResolver => handlers.identity.clone(),
            }
        };
        match handler {
            Some(handler) => handler.handle(from_node, message).await,
            None => warn!(
                peer = from_node,
                component = ?message.component,
                "inbound message for unwired component dropped"
            ),
        }
    }

    // -- Shutdown -----------------------------------------------------------

    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let peers: Vec<Arc<Peer>> = self.peers.read().await.values().cloned().collect();
        for peer in &peers {
            peer.cancel();
        }
        for peer in peers {
            peer.wait_sender_done().await;
        }
        self.peers.write().await.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryConfig, RegistryEntry, RegistryProperty};

    fn registry_with(node: &str, transport: &str) -> Arc<RegistryManager> {
        let registry = Arc::new(RegistryManager::new(RegistryConfig::default()).unwrap());
        registry
            .upsert_registry_records(
                vec![RegistryEntry {
                    id: "e1".to_string(),
                    name: node.to_string(),
                    parent_id: None,
                    active: true,
                    location: None,
                }],
                vec![RegistryProperty {
                    entry_id: "e1".to_string(),
                    name: format!("transport.{}", transport),
                    value: "details".to_string(),
                    active: true,
                    plugin_reserved: false,
                    location: None,
                }],
            )
            .unwrap();
        registry
    }

    fn manager(registry: Arc<RegistryManager>) -> Arc<TransportManager> {
        let db = Arc::new(CoreDb::open_temporary().unwrap());
        TransportManager::new("node1", db, registry, TransportConfig::default())
    }

    #[tokio::test]
    async fn rejects_bad_and_self_targets() {
        let tm = manager(registry_with("node2", "memory"));
        assert!(matches!(
            tm.get_peer("", true).await,
            Err(TransportError::InvalidTarget(_))
        ));
        assert!(matches!(
            tm.get_peer("bad name", true).await,
            Err(TransportError::InvalidTarget(_))
        ));
        assert!(matches!(
            tm.get_peer("node1", true).await,
            Err(TransportError::SendToSelf(_))
        ));
    }

    #[tokio::test]
    async fn no_mutual_transport_reports_registered_names() {
        let tm = manager(registry_with("node2", "grpc"));
        // No transports registered locally at all.
        let err = tm.get_peer("node2", true).await.unwrap_err();
        match err {
            TransportError::NoMutualTransport { node, registered } => {
                assert_eq!(node, "node2");
                assert_eq!(registered, vec!["grpc".to_string()]);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn queue_reliable_assigns_monotonic_sequences() {
        let tm = manager(registry_with("node2", "memory"));
        let db = Arc::clone(tm.db());

        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = db
                .transaction::<_, TransportError, _>(|txn| {
                    tm.queue_reliable(
                        txn,
                        "node2",
                        ReliableMessageKind::StateDistribution,
                        &serde_json::json!({}),
                    )
                })
                .unwrap();
            ids.push(id);
        }

        let rows: Vec<(Vec<u8>, ReliableMessage)> = db
            .scan_prefix(Table::ReliableMessages, &reliable_prefix("node2"))
            .unwrap();
        let sequences: Vec<u64> = rows.iter().map(|(_, r)| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);

        // None acked yet.
        for id in ids {
            assert!(!tm.is_acked(id).unwrap());
        }
    }

    #[tokio::test]
    async fn ack_rows_are_idempotent() {
        let tm = manager(registry_with("node2", "memory"));
        let id = Uuid::new_v4();
        tm.write_ack(id, None).unwrap();
        tm.write_ack(id, Some("late duplicate".to_string())).unwrap();
        assert!(tm.is_acked(id).unwrap());

        let ack: ReliableMessageAck = tm
            .db()
            .get(Table::ReliableMessageAcks, id.as_bytes())
            .unwrap()
            .unwrap();
        // First write wins.
        assert!(ack.error.is_none());
    }
}
