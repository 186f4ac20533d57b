//! # Transport Manager & Peers
//!
//! Delivery of two message classes between nodes:
//!
//! - **Fire-and-forget** — buffered in a per-peer bounded channel, sent
//!   with short retry, dropped with an error log on give-up.
//! - **Reliable** — written to the durable `reliable_messages` table
//!   with a per-node monotonic sequence and delivered repeatedly until
//!   the receiving side's ack row exists.
//!
//! Peers are activated lazily on first outbound send, through the
//! registry (resolve node → transport details, pick the first mutually
//! supported transport, `activate_node`). Each active peer owns one
//! sender task; deactivation happens from that task under the peers
//! write lock so dual activation is impossible.
//!
//! - [`manager`] — the peers map, send entry points, inbound dispatch
//! - [`peer`] — the sender loop: reliable drain, paging, quiesce
//! - [`retry`] — bounded exponential backoff for the short-retry sends
//! - [`memory`] — an in-process transport for multi-node tests

pub mod manager;
pub mod memory;
pub mod peer;
pub mod retry;

pub use manager::{PeerStatus, TransportConfig, TransportManager};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use retry::RetryConfig;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Classified, ErrorKind};
use crate::storage::DbError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("invalid target node {0:?}")]
    InvalidTarget(String),

    #[error("refusing to send to the local node {0:?}")]
    SendToSelf(String),

    #[error("node {node:?} has no mutually supported transport (registered: {registered:?})")]
    NoMutualTransport {
        node: String,
        registered: Vec<String>,
    },

    #[error("registry lookup failed for node {node:?}: {reason}")]
    Registry { node: String, reason: String },

    #[error("transport send failed: {0}")]
    SendFailed(String),

    #[error("transport activation failed for node {node:?}: {reason}")]
    ActivationFailed { node: String, reason: String },

    #[error("malformed message payload: {0}")]
    BadPayload(String),

    #[error("transport manager is stopped")]
    Stopped,
}

impl Classified for TransportError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTarget(_) | Self::SendToSelf(_) | Self::BadPayload(_) => {
                ErrorKind::InputValidation
            }
            Self::Db(DbError::NotFound(_)) => ErrorKind::NotFound,
            _ => ErrorKind::Transient,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// Which engine component an inbound message is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Component {
    TransactionEngine,
    ReliableMessageHandler,
    IdentityResolver,
}

/// The unit a transport plugin carries between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub message_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub component: Component,
    pub message_type: String,
    #[serde(with = "payload_bytes")]
    pub payload: Vec<u8>,
}

impl WireMessage {
    /// Build a message with a JSON payload.
    pub fn json<T: Serialize>(
        component: Component,
        message_type: &str,
        payload: &T,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            message_id: Uuid::new_v4(),
            correlation_id: None,
            component,
            message_type: message_type.to_string(),
            payload: serde_json::to_vec(payload)
                .map_err(|e| TransportError::BadPayload(e.to_string()))?,
        })
    }

    pub fn correlated(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Fix the message id (reliable messages reuse their durable id so
    /// re-sends are recognisable).
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.message_id = id;
        self
    }

    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.payload).map_err(|e| TransportError::BadPayload(e.to_string()))
    }
}

/// Hex-encode payload bytes in JSON renderings (logs, status APIs);
/// bincode renderings stay raw.
mod payload_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
        } else {
            serializer.serialize_bytes(bytes)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            let stripped = s.strip_prefix("0x").unwrap_or(&s);
            hex::decode(stripped).map_err(serde::de::Error::custom)
        } else {
            let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
            Ok(bytes)
        }
    }
}

// ---------------------------------------------------------------------------
// Transport plugin contract
// ---------------------------------------------------------------------------

/// The contract every transport plugin implements.
///
/// `activate_node` returns opaque peer info recorded for status;
/// activation/deactivation calls are serialised by the manager under
/// the peers write lock.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn activate_node(
        &self,
        node_name: &str,
        transport_details: &str,
    ) -> Result<String, TransportError>;

    async fn deactivate_node(&self, node_name: &str) -> Result<(), TransportError>;

    async fn send(&self, node_name: &str, message: WireMessage) -> Result<(), TransportError>;

    async fn local_details(&self) -> Result<String, TransportError>;
}

// ---------------------------------------------------------------------------
// Reliable messages
// ---------------------------------------------------------------------------

/// The kinds of payload the reliable channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReliableMessageKind {
    /// Distribution of a private state to a participant node.
    StateDistribution,
    /// Distribution of a finalised receipt.
    Receipt,
    /// A request for a remote endorsement of an assembled transaction.
    Endorsement,
}

/// A durably queued message: retransmitted until the ack row exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliableMessage {
    /// Monotonic per-sending-node sequence (the drain ordering).
    pub sequence: u64,
    /// Globally-unique ack key.
    pub id: Uuid,
    /// Target node name.
    pub node: String,
    pub kind: ReliableMessageKind,
    /// Kind-specific JSON metadata, sufficient to rebuild the wire form.
    pub metadata: String,
    pub created: i64,
}

/// A message is "done" iff this row exists. `error` records a permanent
/// build failure (the message will never be sent, by design).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliableMessageAck {
    pub message_id: Uuid,
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of building the wire form of one reliable message.
pub enum BuildOutcome {
    /// Ready to send.
    Message(WireMessage),
    /// The message can never be built (data error). The peer loop
    /// records an error ack so it is never scanned again.
    Permanent(String),
}

/// Seam through which the peer sender loop turns durable reliable rows
/// into wire messages. The engine supplies the production
/// implementation (state lookups etc.); retryable failures return
/// `Err`, permanent data errors return [`BuildOutcome::Permanent`].
pub trait ReliableMessageBuilder: Send + Sync {
    fn build(&self, message: &ReliableMessage) -> Result<BuildOutcome, TransportError>;
}

/// Inbound dispatch seam, one per [`Component`].
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, from_node: &str, message: WireMessage);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_json_roundtrip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Payload {
            hello: String,
        }

        let msg = WireMessage::json(
            Component::TransactionEngine,
            "test_message",
            &Payload {
                hello: "world".to_string(),
            },
        )
        .unwrap();

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("TRANSACTION_ENGINE"));
        let back: WireMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message_id, msg.message_id);
        assert_eq!(back.parse_payload::<Payload>().unwrap().hello, "world");
    }

    #[test]
    fn bincode_roundtrip_for_reliable_rows() {
        let row = ReliableMessage {
            sequence: 7,
            id: Uuid::new_v4(),
            node: "node2".to_string(),
            kind: ReliableMessageKind::StateDistribution,
            metadata: "{}".to_string(),
            created: 123,
        };
        let bytes = bincode::serialize(&row).unwrap();
        let back: ReliableMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.sequence, 7);
        assert_eq!(back.node, "node2");
    }

    #[test]
    fn error_classification() {
        assert_eq!(
            TransportError::InvalidTarget("x".into()).kind(),
            ErrorKind::InputValidation
        );
        assert!(TransportError::SendFailed("x".into()).is_retryable());
    }
}
