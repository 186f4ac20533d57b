//! An in-process transport: multi-node tests in one process.
//!
//! A [`MemoryNetwork`] holds every node's transport manager; each node
//! gets a [`MemoryTransport`] endpoint that delivers straight into the
//! target's receive path on a spawned task. Nodes can be *paused* to
//! simulate an unreachable transport — activation and sends to a
//! paused node fail until it is resumed, which is exactly the shape of
//! the deactivate/reactivate scenarios the peer loop has to survive.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;

use crate::registry::{RegistryEntry, RegistryProperty};

use super::manager::TransportManager;
use super::{Transport, TransportError, WireMessage};

/// The transport name nodes advertise in the registry.
pub const MEMORY_TRANSPORT: &str = "memory";

// ---------------------------------------------------------------------------
// MemoryNetwork
// ---------------------------------------------------------------------------

pub struct MemoryNetwork {
    nodes: RwLock<HashMap<String, Arc<TransportManager>>>,
    paused: RwLock<HashSet<String>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            paused: RwLock::new(HashSet::new()),
        })
    }

    /// Attach a node's transport manager to the network.
    pub fn register(&self, node: &str, manager: Arc<TransportManager>) {
        self.nodes.write().insert(node.to_string(), manager);
    }

    /// The local endpoint for one node.
    pub fn transport(self: &Arc<Self>, local_node: &str) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            local: local_node.to_string(),
            network: Arc::clone(self),
        })
    }

    /// Make a node unreachable: activations and sends to it fail.
    pub fn pause(&self, node: &str) {
        self.paused.write().insert(node.to_string());
    }

    /// Restore reachability.
    pub fn resume(&self, node: &str) {
        self.paused.write().remove(node);
    }

    fn is_paused(&self, node: &str) -> bool {
        self.paused.read().contains(node)
    }

    fn manager_of(&self, node: &str) -> Option<Arc<TransportManager>> {
        self.nodes.read().get(node).cloned()
    }

    /// The registry rows a node on this network publishes.
    pub fn registry_records(node: &str) -> (RegistryEntry, RegistryProperty) {
        let entry = RegistryEntry {
            id: format!("entry-{}", node),
            name: node.to_string(),
            parent_id: None,
            active: true,
            location: None,
        };
        let property = RegistryProperty {
            entry_id: entry.id.clone(),
            name: format!("transport.{}", MEMORY_TRANSPORT),
            value: json!({"node": node}).to_string(),
            active: true,
            plugin_reserved: false,
            location: None,
        };
        (entry, property)
    }
}

// ---------------------------------------------------------------------------
// MemoryTransport
// ---------------------------------------------------------------------------

pub struct MemoryTransport {
    local: String,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        MEMORY_TRANSPORT
    }

    async fn activate_node(
        &self,
        node_name: &str,
        _transport_details: &str,
    ) -> Result<String, TransportError> {
        if self.network.is_paused(node_name) {
            return Err(TransportError::SendFailed(format!(
                "node {:?} is unreachable",
                node_name
            )));
        }
        if self.network.manager_of(node_name).is_none() {
            return Err(TransportError::SendFailed(format!(
                "node {:?} is not on the network",
                node_name
            )));
        }
        Ok(json!({"connected": node_name, "from": self.local}).to_string())
    }

    async fn deactivate_node(&self, _node_name: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send(&self, node_name: &str, message: WireMessage) -> Result<(), TransportError> {
        if self.network.is_paused(node_name) {
            return Err(TransportError::SendFailed(format!(
                "node {:?} is unreachable",
                node_name
            )));
        }
        let target = self.network.manager_of(node_name).ok_or_else(|| {
            TransportError::SendFailed(format!("node {:?} is not on the network", node_name))
        })?;
        let from = self.local.clone();
        // Deliver on a fresh task so a receive handler that sends back
        // cannot deadlock against this send.
        tokio::spawn(async move {
            target.receive_message(&from, message).await;
        });
        Ok(())
    }

    async fn local_details(&self) -> Result<String, TransportError> {
        Ok(json!({"node": self.local}).to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::manager::TransportConfig;
    use super::super::{Component, InboundHandler};
    use super::*;
    use crate::registry::{RegistryConfig, RegistryManager};
    use crate::storage::CoreDb;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct CountingHandler {
        count: AtomicUsize,
        notify: Notify,
    }

    #[async_trait]
    impl InboundHandler for CountingHandler {
        async fn handle(&self, _from: &str, _message: WireMessage) {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_one();
        }
    }

    fn node(
        name: &str,
        network: &Arc<MemoryNetwork>,
        peers: &[&str],
    ) -> Arc<TransportManager> {
        let registry = Arc::new(RegistryManager::new(RegistryConfig::default()).unwrap());
        for peer in peers {
            let (entry, property) = MemoryNetwork::registry_records(peer);
            registry
                .upsert_registry_records(vec![entry], vec![property])
                .unwrap();
        }
        let db = Arc::new(CoreDb::open_temporary().unwrap());
        let tm = TransportManager::new(name, db, registry, TransportConfig::default());
        tm.register_transport(network.transport(name));
        network.register(name, Arc::clone(&tm));
        tm
    }

    #[tokio::test]
    async fn fire_and_forget_delivery_between_nodes() {
        let network = MemoryNetwork::new();
        let node1 = node("node1", &network, &["node2"]);
        let node2 = node("node2", &network, &["node1"]);

        let handler = Arc::new(CountingHandler {
            count: AtomicUsize::new(0),
            notify: Notify::new(),
        });
        node2.set_handler(Component::TransactionEngine, Arc::clone(&handler) as _);

        let message = WireMessage::json(
            Component::TransactionEngine,
            "hello",
            &json!({"greeting": "hi"}),
        )
        .unwrap();
        node1.send_fire_and_forget("node2", message).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(2), handler.notify.notified())
            .await
            .expect("message should arrive");
        assert_eq!(handler.count.load(Ordering::SeqCst), 1);

        node1.stop().await;
        node2.stop().await;
    }

    #[tokio::test]
    async fn paused_node_fails_activation_until_resumed() {
        let network = MemoryNetwork::new();
        let node1 = node("node1", &network, &["node2"]);
        let _node2 = node("node2", &network, &["node1"]);

        network.pause("node2");
        let message = WireMessage::json(Component::TransactionEngine, "hello", &json!({})).unwrap();
        let err = node1
            .send_fire_and_forget("node2", message.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ActivationFailed { .. }));

        network.resume("node2");
        node1.send_fire_and_forget("node2", message).await.unwrap();

        node1.stop().await;
    }
}
