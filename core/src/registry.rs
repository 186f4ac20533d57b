//! The node registry: who is reachable, and how.
//!
//! Registry plugins push records in as (entry, property) rows; the
//! transport manager asks one question back — "which transports does
//! node N offer, with what details?". Transport properties are
//! recognised by a configurable regex (capture group 1 is the
//! transport name), and node entries may be organised hierarchically
//! with a configurable splitter (`org.node` walks `org` → `node`).
//!
//! Lookups are cached; any upsert touching an entry drops its cached
//! answer, which keeps the transport manager's activation path as
//! cheap as an in-memory read.

use std::collections::HashMap;

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cache::{Cache, CacheConfig};
use crate::error::{Classified, ErrorKind};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("node {0:?} not found in registry")]
    NodeNotFound(String),

    #[error("invalid registry record: {0}")]
    InvalidRecord(String),

    #[error("invalid transport property regex {0:?}: {1}")]
    BadRegex(String, String),
}

impl Classified for RegistryError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NodeNotFound(_) => ErrorKind::NotFound,
            Self::InvalidRecord(_) | Self::BadRegex(_, _) => ErrorKind::InputValidation,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub active: bool,
    /// Provenance location (block/tx of the on-chain registry event).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryProperty {
    pub entry_id: String,
    pub name: String,
    pub value: String,
    pub active: bool,
    /// Reserved properties are plugin bookkeeping, never transport
    /// details.
    #[serde(default)]
    pub plugin_reserved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// One transport a node offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTransportEntry {
    pub transport: String,
    pub details: String,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// When set, node names are split on this string and resolved as a
    /// path through parented entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hierarchy_splitter: Option<String>,

    /// Regex recognising transport properties; capture group 1 is the
    /// transport name.
    pub transport_property_regex: String,

    #[serde(default)]
    pub lookup_cache: CacheConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            hierarchy_splitter: None,
            transport_property_regex: r"^transport\.(.*)$".to_string(),
            lookup_cache: CacheConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// RegistryManager
// ---------------------------------------------------------------------------

pub struct RegistryManager {
    splitter: Option<String>,
    transport_regex: Regex,
    entries: RwLock<HashMap<String, RegistryEntry>>,
    properties: RwLock<HashMap<String, Vec<RegistryProperty>>>,
    lookup_cache: Cache<String, Vec<NodeTransportEntry>>,
}

impl std::fmt::Debug for RegistryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryManager")
            .field("splitter", &self.splitter)
            .field("transport_regex", &self.transport_regex)
            .field("entries", &self.entries)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

impl RegistryManager {
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let transport_regex = Regex::new(&config.transport_property_regex).map_err(|e| {
            RegistryError::BadRegex(config.transport_property_regex.clone(), e.to_string())
        })?;
        Ok(Self {
            splitter: config.hierarchy_splitter,
            transport_regex,
            entries: RwLock::new(HashMap::new()),
            properties: RwLock::new(HashMap::new()),
            lookup_cache: Cache::new(config.lookup_cache),
        })
    }

    /// Apply a batch of registry records (insert-or-replace by id).
    pub fn upsert_registry_records(
        &self,
        entries: Vec<RegistryEntry>,
        properties: Vec<RegistryProperty>,
    ) -> Result<(), RegistryError> {
        for entry in &entries {
            if entry.id.is_empty() || entry.name.is_empty() {
                return Err(RegistryError::InvalidRecord(
                    "entry requires id and name".to_string(),
                ));
            }
        }
        for property in &properties {
            if property.entry_id.is_empty() || property.name.is_empty() {
                return Err(RegistryError::InvalidRecord(
                    "property requires entry_id and name".to_string(),
                ));
            }
        }

        {
            let mut map = self.entries.write();
            for entry in entries {
                self.lookup_cache.remove(&entry.name);
                map.insert(entry.id.clone(), entry);
            }
        }
        {
            let mut map = self.properties.write();
            let entries = self.entries.read();
            for property in properties {
                if let Some(entry) = entries.get(&property.entry_id) {
                    self.lookup_cache.remove(&entry.name);
                }
                let list = map.entry(property.entry_id.clone()).or_default();
                list.retain(|p| p.name != property.name);
                list.push(property);
            }
        }
        Ok(())
    }

    /// Resolve the entry id a node name refers to, honouring the
    /// hierarchy splitter when configured.
    fn resolve_entry(&self, node: &str) -> Result<String, RegistryError> {
        let entries = self.entries.read();
        let not_found = || RegistryError::NodeNotFound(node.to_string());

        let find =
            |name: &str, parent: Option<&str>| -> Option<String> {
                entries
                    .values()
                    .find(|e| {
                        e.active && e.name == name && e.parent_id.as_deref() == parent
                    })
                    .map(|e| e.id.clone())
            };

        match &self.splitter {
            None => find(node, None)
                .or_else(|| {
                    // Flat lookup also accepts nested entries published
                    // under their leaf name.
                    entries
                        .values()
                        .find(|e| e.active && e.name == node)
                        .map(|e| e.id.clone())
                })
                .ok_or_else(not_found),
            Some(splitter) => {
                let mut parent: Option<String> = None;
                for segment in node.split(splitter.as_str()) {
                    let next = find(segment, parent.as_deref()).ok_or_else(not_found)?;
                    parent = Some(next);
                }
                parent.ok_or_else(not_found)
            }
        }
    }

    /// The transports a node offers, in property-name order.
    pub fn node_transports(&self, node: &str) -> Result<Vec<NodeTransportEntry>, RegistryError> {
        if let Some(cached) = self.lookup_cache.get(&node.to_string()) {
            return Ok(cached);
        }

        let entry_id = self.resolve_entry(node)?;
        let mut transports: Vec<NodeTransportEntry> = self
            .properties
            .read()
            .get(&entry_id)
            .into_iter()
            .flatten()
            .filter(|p| p.active && !p.plugin_reserved)
            .filter_map(|p| {
                self.transport_regex.captures(&p.name).map(|captures| {
                    let transport = captures
                        .get(1)
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_else(|| p.name.clone());
                    NodeTransportEntry {
                        transport,
                        details: p.value.clone(),
                    }
                })
            })
            .collect();
        transports.sort_by(|a, b| a.transport.cmp(&b.transport));

        self.lookup_cache.set(node.to_string(), transports.clone());
        Ok(transports)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
