//! Core identifier types shared across the engine.
//!
//! These are deliberately small newtypes: a state id is *not* a schema id
//! is *not* a ledger address, and the compiler should keep them apart.
//! All of them serialize as 0x-prefixed hex strings so they read the same
//! in logs, JSON payloads and database keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// Hex helpers
// ---------------------------------------------------------------------------

fn parse_hex(s: &str) -> Result<Vec<u8>, String> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(stripped).map_err(|e| format!("invalid hex string {:?}: {}", s, e))
}

// ---------------------------------------------------------------------------
// StateId
// ---------------------------------------------------------------------------

/// Content-derived identifier of a private state.
///
/// The byte length is domain-defined (the default hash rule produces 32
/// bytes, but a domain with a custom hash function may produce any length),
/// so this wraps a `Vec<u8>` rather than a fixed array.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(Vec<u8>);

impl StateId {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.0))
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateId({})", self.to_hex())
    }
}

impl FromStr for StateId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(parse_hex(s)?))
    }
}

impl Serialize for StateId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for StateId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// SchemaId
// ---------------------------------------------------------------------------

/// Identifier of a state schema: the SHA-256 of its canonical declaration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaId(pub [u8; 32]);

impl SchemaId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchemaId({})", self.to_hex())
    }
}

impl FromStr for SchemaId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = parse_hex(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| format!("schema id must be 32 bytes, got {}", v.len()))?;
        Ok(Self(arr))
    }
}

impl Serialize for SchemaId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SchemaId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// LedgerAddress
// ---------------------------------------------------------------------------

/// A 20-byte account / contract address on the shared base ledger.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerAddress(pub [u8; 20]);

impl LedgerAddress {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for LedgerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for LedgerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LedgerAddress({})", self.to_hex())
    }
}

impl FromStr for LedgerAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = parse_hex(s)?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| format!("ledger address must be 20 bytes, got {}", v.len()))?;
        Ok(Self(arr))
    }
}

impl Serialize for LedgerAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for LedgerAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// IdentityLocator
// ---------------------------------------------------------------------------

/// A fully-qualified party identity: `identifier@node`.
///
/// The identifier half names a key within the owning node's signing module;
/// the node half names the peer that owns it. A locator without an `@` is
/// treated as local to the node doing the parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityLocator {
    /// Key identifier within the owning node.
    pub identity: String,
    /// Owning node name. `None` means "the local node".
    pub node: Option<String>,
}

impl IdentityLocator {
    /// Parse `identifier@node` (or a bare `identifier`).
    pub fn parse(s: &str) -> Result<Self, String> {
        let (identity, node) = match s.split_once('@') {
            Some((i, n)) => (i, Some(n.to_string())),
            None => (s, None),
        };
        if identity.is_empty() {
            return Err(format!("identity locator {:?} has an empty identifier", s));
        }
        if let Some(n) = &node {
            if n.is_empty() {
                return Err(format!("identity locator {:?} has an empty node", s));
            }
        }
        Ok(Self {
            identity: identity.to_string(),
            node,
        })
    }

    /// The node this identity lives on, resolving `None` to `local_node`.
    pub fn node_or<'a>(&'a self, local_node: &'a str) -> &'a str {
        self.node.as_deref().unwrap_or(local_node)
    }

    /// True if the identity is owned by `local_node`.
    pub fn is_local(&self, local_node: &str) -> bool {
        self.node_or(local_node) == local_node
    }

    /// Render back to the canonical `identifier@node` form.
    pub fn qualified(&self, local_node: &str) -> String {
        format!("{}@{}", self.identity, self.node_or(local_node))
    }
}

impl fmt::Display for IdentityLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(n) => write!(f, "{}@{}", self.identity, n),
            None => write!(f, "{}", self.identity),
        }
    }
}

// ---------------------------------------------------------------------------
// LedgerEvent
// ---------------------------------------------------------------------------

/// An observed event on the shared base ledger, as reported by the
/// base-ledger client. Domains interpret the `data` payload (contract
/// registrations, state confirmations); the core only routes batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub block: u64,
    pub tx_index: u64,
    /// Emitting contract (or the freshly deployed contract itself).
    pub address: LedgerAddress,
    pub data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_id_hex_roundtrip() {
        let id = StateId::new(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(id.to_hex(), "0xdeadbeef");
        let parsed: StateId = "0xdeadbeef".parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn schema_id_requires_32_bytes() {
        assert!("0x0011".parse::<SchemaId>().is_err());
        let ok: SchemaId = format!("0x{}", "ab".repeat(32)).parse().unwrap();
        assert_eq!(ok.as_bytes().len(), 32);
    }

    #[test]
    fn ledger_address_requires_20_bytes() {
        assert!("0x00".parse::<LedgerAddress>().is_err());
        let ok: LedgerAddress = format!("0x{}", "01".repeat(20)).parse().unwrap();
        assert_eq!(ok.as_bytes().len(), 20);
    }

    #[test]
    fn identity_locator_parsing() {
        let full = IdentityLocator::parse("alice@node2").unwrap();
        assert_eq!(full.identity, "alice");
        assert_eq!(full.node.as_deref(), Some("node2"));
        assert!(!full.is_local("node1"));

        let bare = IdentityLocator::parse("bob").unwrap();
        assert!(bare.is_local("node1"));
        assert_eq!(bare.qualified("node1"), "bob@node1");

        assert!(IdentityLocator::parse("@node2").is_err());
        assert!(IdentityLocator::parse("alice@").is_err());
    }

    #[test]
    fn id_serde_as_hex_string() {
        let id = StateId::new(vec![1, 2, 3]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"0x010203\"");
        let back: StateId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
