//! Remote verifier resolution over the transport.
//!
//! A domain's Init phase declares the verifiers it needs, keyed by
//! algorithm and verifier type. Local identities answer straight from
//! the signing module; remote ones turn into an identity-resolver
//! request to the owning node, matched back by correlation id with a
//! timeout. Successful answers are cached — verifiers are derived
//! deterministically on their owning node, so they never change.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{Cache, CacheConfig};
use crate::transport::{Component, InboundHandler, TransportError, WireMessage};
use crate::types::IdentityLocator;

use super::signer::SigningModule;
use super::KeyError;

/// Message type for a verifier lookup request.
pub const MSG_RESOLVE_REQUEST: &str = "resolve_verifier_request";
/// Message type for the matching response.
pub const MSG_RESOLVE_RESPONSE: &str = "resolve_verifier_response";

// ---------------------------------------------------------------------------
// Outbound seam
// ---------------------------------------------------------------------------

/// The one thing the resolver needs from the transport layer: deliver a
/// fire-and-forget message to a node.
#[async_trait]
pub trait FireAndForgetSender: Send + Sync {
    async fn send_fire_and_forget(
        &self,
        node: &str,
        message: WireMessage,
    ) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResolveRequest {
    lookup: String,
    algorithm: String,
    verifier_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResolveResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    verifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// How long to wait for a remote node's answer.
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub verifier_cache: CacheConfig,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            verifier_cache: CacheConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// IdentityResolver
// ---------------------------------------------------------------------------

pub struct IdentityResolver {
    local_node: String,
    signer: Arc<SigningModule>,
    config: IdentityConfig,
    /// (qualified lookup, algorithm, verifier type) → verifier.
    cache: Cache<(String, String, String), String>,
    pending: DashMap<Uuid, oneshot::Sender<Result<String, String>>>,
    sender: RwLock<Option<Arc<dyn FireAndForgetSender>>>,
}

impl IdentityResolver {
    pub fn new(local_node: &str, signer: Arc<SigningModule>, config: IdentityConfig) -> Arc<Self> {
        let cache = Cache::new(config.verifier_cache);
        Arc::new(Self {
            local_node: local_node.to_string(),
            signer,
            config,
            cache,
            pending: DashMap::new(),
            sender: RwLock::new(None),
        })
    }

    /// Late-bound transport hookup (the transport manager is built
    /// after the resolver during engine wiring).
    pub fn set_sender(&self, sender: Arc<dyn FireAndForgetSender>) {
        *self.sender.write() = Some(sender);
    }

    /// Resolve a verifier for `lookup` (`identifier` or
    /// `identifier@node`), local or remote.
    pub async fn resolve(
        &self,
        lookup: &str,
        algorithm: &str,
        verifier_type: &str,
    ) -> Result<String, KeyError> {
        let locator = IdentityLocator::parse(lookup).map_err(KeyError::BadLocator)?;
        if locator.is_local(&self.local_node) {
            return self
                .signer
                .resolve_verifier(&locator.identity, algorithm, verifier_type);
        }

        let node = locator.node_or(&self.local_node).to_string();
        let cache_key = (
            locator.qualified(&self.local_node),
            algorithm.to_string(),
            verifier_type.to_string(),
        );
        if let Some(verifier) = self.cache.get(&cache_key) {
            return Ok(verifier);
        }

        let sender = self
            .sender
            .read()
            .clone()
            .ok_or_else(|| KeyError::Transport("transport not wired".to_string()))?;

        let request = WireMessage::json(
            Component::IdentityResolver,
            MSG_RESOLVE_REQUEST,
            &ResolveRequest {
                lookup: locator.identity.clone(),
                algorithm: algorithm.to_string(),
                verifier_type: verifier_type.to_string(),
            },
        )
        .map_err(|e| KeyError::Transport(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request.message_id, tx);
        debug!(node = %node, lookup, "requesting remote verifier");
        if let Err(e) = sender.send_fire_and_forget(&node, request).await {
            return Err(KeyError::Transport(e.to_string()));
        }

        let timeout = std::time::Duration::from_millis(self.config.request_timeout_ms);
        let outcome = tokio::time::timeout(timeout, rx).await;
        match outcome {
            Err(_) => Err(KeyError::Timeout(self.config.request_timeout_ms)),
            Ok(Err(_)) => Err(KeyError::Transport("resolver dropped".to_string())),
            Ok(Ok(Err(remote_err))) => Err(KeyError::RemoteResolution(node, remote_err)),
            Ok(Ok(Ok(verifier))) => {
                self.cache.set(cache_key, verifier.clone());
                Ok(verifier)
            }
        }
    }
}

#[async_trait]
impl InboundHandler for IdentityResolver {
    async fn handle(&self, from_node: &str, message: WireMessage) {
        match message.message_type.as_str() {
            MSG_RESOLVE_REQUEST => {
                let response = match message.parse_payload::<ResolveRequest>() {
                    Ok(req) => {
                        match self.signer.resolve_verifier(
                            &req.lookup,
                            &req.algorithm,
                            &req.verifier_type,
                        ) {
                            Ok(verifier) => ResolveResponse {
                                verifier: Some(verifier),
                                error: None,
                            },
                            Err(e) => ResolveResponse {
                                verifier: None,
                                error: Some(e.to_string()),
                            },
                        }
                    }
                    Err(e) => ResolveResponse {
                        verifier: None,
                        error: Some(e.to_string()),
                    },
                };
                let Some(sender) = self.sender.read().clone() else {
                    warn!("verifier request received before transport wired");
                    return;
                };
                match WireMessage::json(Component::IdentityResolver, MSG_RESOLVE_RESPONSE, &response)
                {
                    Ok(reply) => {
                        let reply = reply.correlated(message.message_id);
                        if let Err(e) = sender.send_fire_and_forget(from_node, reply).await {
                            warn!(node = from_node, "failed to answer verifier request: {}", e);
                        }
                    }
                    Err(e) => warn!("failed to encode verifier response: {}", e),
                }
            }
            MSG_RESOLVE_RESPONSE => {
                let Some(correlation) = message.correlation_id else {
                    warn!(node = from_node, "verifier response without correlation id");
                    return;
                };
                let Some((_, waiter)) = self.pending.remove(&correlation) else {
                    // Timed out or duplicate; harmless.
                    debug!(node = from_node, %correlation, "no waiter for verifier response");
                    return;
                };
                let outcome = match message.parse_payload::<ResolveResponse>() {
                    Ok(ResolveResponse {
                        verifier: Some(v), ..
                    }) => Ok(v),
                    Ok(ResolveResponse { error, .. }) => {
                        Err(error.unwrap_or_else(|| "empty response".to_string()))
                    }
                    Err(e) => Err(e.to_string()),
                };
                let _ = waiter.send(outcome);
            }
            other => warn!(node = from_node, message_type = other, "unexpected identity message"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::signer::{SignerConfig, ALGORITHM_ED25519, VERIFIER_PUBLIC_KEY_HEX};
    use super::*;

    fn resolver_pair() -> (Arc<IdentityResolver>, Arc<IdentityResolver>) {
        let signer1 = Arc::new(
            SigningModule::new(&SignerConfig {
                seed: Some(format!("0x{}", "01".repeat(32))),
                ..Default::default()
            })
            .unwrap(),
        );
        let signer2 = Arc::new(
            SigningModule::new(&SignerConfig {
                seed: Some(format!("0x{}", "02".repeat(32))),
                ..Default::default()
            })
            .unwrap(),
        );
        let r1 = IdentityResolver::new("node1", signer1, IdentityConfig::default());
        let r2 = IdentityResolver::new("node2", signer2, IdentityConfig::default());
        (r1, r2)
    }

    /// Loopback sender delivering directly into the paired resolver.
    struct DirectSender {
        me: String,
        peers: RwLock<Vec<(String, Arc<IdentityResolver>)>>,
    }

    #[async_trait]
    impl FireAndForgetSender for DirectSender {
        async fn send_fire_and_forget(
            &self,
            node: &str,
            message: WireMessage,
        ) -> Result<(), TransportError> {
            let target = self
                .peers
                .read()
                .iter()
                .find(|(name, _)| name == node)
                .map(|(_, r)| Arc::clone(r))
                .ok_or_else(|| TransportError::InvalidTarget(node.to_string()))?;
            let from = self.me.clone();
            tokio::spawn(async move { target.handle(&from, message).await });
            Ok(())
        }
    }

    fn wire(r1: &Arc<IdentityResolver>, r2: &Arc<IdentityResolver>) {
        let s1 = Arc::new(DirectSender {
            me: "node1".to_string(),
            peers: RwLock::new(vec![("node2".to_string(), Arc::clone(r2))]),
        });
        let s2 = Arc::new(DirectSender {
            me: "node2".to_string(),
            peers: RwLock::new(vec![("node1".to_string(), Arc::clone(r1))]),
        });
        r1.set_sender(s1);
        r2.set_sender(s2);
    }

    #[tokio::test]
    async fn local_resolution_answers_from_signer() {
        let (r1, _) = resolver_pair();
        let direct = r1
            .resolve("alice", ALGORITHM_ED25519, VERIFIER_PUBLIC_KEY_HEX)
            .await
            .unwrap();
        let qualified = r1
            .resolve("alice@node1", ALGORITHM_ED25519, VERIFIER_PUBLIC_KEY_HEX)
            .await
            .unwrap();
        assert_eq!(direct, qualified);
    }

    #[tokio::test]
    async fn remote_resolution_roundtrip_and_cache() {
        let (r1, r2) = resolver_pair();
        wire(&r1, &r2);

        let remote = r1
            .resolve("bob@node2", ALGORITHM_ED25519, VERIFIER_PUBLIC_KEY_HEX)
            .await
            .unwrap();
        let local_on_2 = r2
            .resolve("bob", ALGORITHM_ED25519, VERIFIER_PUBLIC_KEY_HEX)
            .await
            .unwrap();
        assert_eq!(remote, local_on_2);

        // Second resolve is answered from cache even with no transport.
        r1.set_sender(Arc::new(DirectSender {
            me: "node1".to_string(),
            peers: RwLock::new(vec![]),
        }));
        let cached = r1
            .resolve("bob@node2", ALGORITHM_ED25519, VERIFIER_PUBLIC_KEY_HEX)
            .await
            .unwrap();
        assert_eq!(cached, remote);
    }

    #[tokio::test]
    async fn remote_error_is_reported() {
        let (r1, r2) = resolver_pair();
        wire(&r1, &r2);

        let err = r1
            .resolve("carol@node2", "secp256k1", VERIFIER_PUBLIC_KEY_HEX)
            .await
            .unwrap_err();
        assert!(matches!(err, KeyError::RemoteResolution(_, _)));
    }

    #[tokio::test]
    async fn timeout_when_peer_unreachable() {
        let signer = Arc::new(SigningModule::new(&SignerConfig::default()).unwrap());
        let r1 = IdentityResolver::new(
            "node1",
            signer,
            IdentityConfig {
                request_timeout_ms: 20,
                ..Default::default()
            },
        );
        // A sender that accepts the message and then goes silent.
        struct BlackHole;
        #[async_trait]
        impl FireAndForgetSender for BlackHole {
            async fn send_fire_and_forget(
                &self,
                _node: &str,
                _message: WireMessage,
            ) -> Result<(), TransportError> {
                Ok(())
            }
        }
        r1.set_sender(Arc::new(BlackHole));

        let err = r1
            .resolve("bob@node2", ALGORITHM_ED25519, VERIFIER_PUBLIC_KEY_HEX)
            .await
            .unwrap_err();
        assert!(matches!(err, KeyError::Timeout(_)));
    }
}
