//! Engine configuration.
//!
//! Every knob the core exposes lives on [`CoreConfig`], assembled from
//! the per-module config structs next to the code they tune. All of it
//! deserializes from one JSON/TOML document and everything has a
//! sensible default, so a test node is `CoreConfig::for_node("node1")`
//! and nothing else.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::domains::manager::DomainManagerConfig;
use crate::keys::identity::IdentityConfig;
use crate::keys::signer::SignerConfig;
use crate::privatetx::manager::CoordinatorConfig;
use crate::publictx::manager::PublicTxManagerConfig;
use crate::registry::RegistryConfig;
use crate::states::store::StateStoreConfig;
use crate::transport::manager::TransportConfig;

/// Engine name, used in logs and version strings.
pub const ENGINE_NAME: &str = "umbra-core";

/// The engine version, from the crate metadata at compile time.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The whole engine's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// This node's name, as peers address it through the registry.
    pub node_name: String,

    /// Durable store location. `None` runs an in-memory store that
    /// disappears on shutdown (tests only).
    pub data_dir: Option<PathBuf>,

    pub state_store: StateStoreConfig,
    /// Capacity of the ABI-by-hash cache.
    pub abi_cache: CacheConfig,
    pub domain_manager: DomainManagerConfig,
    pub registry: RegistryConfig,
    pub transport: TransportConfig,
    pub public_tx: PublicTxManagerConfig,
    pub coordinator: CoordinatorConfig,
    pub signer: SignerConfig,
    pub identity: IdentityConfig,

    /// Interval between base-ledger event polls.
    pub ledger_poll_interval_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            node_name: "node1".to_string(),
            data_dir: None,
            state_store: StateStoreConfig::default(),
            abi_cache: CacheConfig::default(),
            domain_manager: DomainManagerConfig::default(),
            registry: RegistryConfig::default(),
            transport: TransportConfig::default(),
            public_tx: PublicTxManagerConfig::default(),
            coordinator: CoordinatorConfig::default(),
            signer: SignerConfig::default(),
            identity: IdentityConfig::default(),
            ledger_poll_interval_ms: 500,
        }
    }
}

impl CoreConfig {
    /// A default configuration for a named node.
    pub fn for_node(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = CoreConfig::default();
        assert_eq!(config.node_name, "node1");
        assert!(config.data_dir.is_none());
        assert!(config.transport.reliable_page_size > 0);
    }

    #[test]
    fn deserializes_partial_documents() {
        // Everything defaults; only what's named is overridden.
        let json = r#"{
            "node_name": "node7",
            "transport": { "reliable_page_size": 5 },
            "coordinator": { "endorsement_timeout_ms": 123 }
        }"#;
        let config: CoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.node_name, "node7");
        assert_eq!(config.transport.reliable_page_size, 5);
        assert_eq!(config.coordinator.endorsement_timeout_ms, 123);
        // Untouched sections keep defaults.
        assert_eq!(
            config.public_tx.orchestrator.max_in_flight,
            PublicTxManagerConfig::default().orchestrator.max_in_flight
        );
    }
}
