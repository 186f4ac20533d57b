//! The local signing module.
//!
//! Keys are derived deterministically from a 32-byte root seed by
//! identifier path (`sha256(seed || identifier)` feeds the ed25519
//! secret), so the same identifier always resolves to the same verifier
//! on a given node, across restarts, without per-key storage. Derived
//! keys are cached in memory.
//!
//! The module signs opaque payloads — what a payload *means* (a state
//! hash, an endorsement digest, a SNARK witness) is the domain's
//! business, never ours. The config accepts optional ZKP circuit and
//! proving-key directories for domains that bring a SNARK prover;
//! proof generation itself lives behind the same opaque-payload call.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::LedgerAddress;

use super::KeyError;

/// The one signature algorithm shipped in-tree.
pub const ALGORITHM_ED25519: &str = "ed25519";

/// Verifier type: the hex-encoded 32-byte ed25519 public key.
pub const VERIFIER_PUBLIC_KEY_HEX: &str = "public_key_hex";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Signing module configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignerConfig {
    /// Hex-encoded 32-byte root seed. Generated at random when absent
    /// (fine for tests; production nodes persist one at init time).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,

    /// Supported algorithms. Defaults to just ed25519.
    #[serde(default)]
    pub algorithms: Vec<String>,

    /// Directory of ZKP circuits, for domains that prove rather than
    /// sign. Accepted and recorded; unused by the in-tree algorithms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zkp_circuits_dir: Option<PathBuf>,

    /// Directory of proving keys matching `zkp_circuits_dir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zkp_proving_keys_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// SigningModule
// ---------------------------------------------------------------------------

pub struct SigningModule {
    root_seed: [u8; 32],
    algorithms: Vec<String>,
    derived: DashMap<String, Arc<SigningKey>>,
}

impl SigningModule {
    pub fn new(config: &SignerConfig) -> Result<Self, KeyError> {
        let root_seed = match &config.seed {
            Some(hex_seed) => {
                let stripped = hex_seed.strip_prefix("0x").unwrap_or(hex_seed);
                let bytes =
                    hex::decode(stripped).map_err(|e| KeyError::BadKeyMaterial(e.to_string()))?;
                bytes.try_into().map_err(|v: Vec<u8>| {
                    KeyError::BadKeyMaterial(format!("seed must be 32 bytes, got {}", v.len()))
                })?
            }
            None => {
                let mut seed = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut seed);
                seed
            }
        };
        let algorithms = if config.algorithms.is_empty() {
            vec![ALGORITHM_ED25519.to_string()]
        } else {
            config.algorithms.clone()
        };
        Ok(Self {
            root_seed,
            algorithms,
            derived: DashMap::new(),
        })
    }

    fn check_algorithm(&self, algorithm: &str) -> Result<(), KeyError> {
        if algorithm != ALGORITHM_ED25519 || !self.algorithms.iter().any(|a| a == algorithm) {
            return Err(KeyError::UnsupportedAlgorithm(algorithm.to_string()));
        }
        Ok(())
    }

    /// Derive (or fetch the cached) key for an identifier.
    fn key_for(&self, identifier: &str) -> Arc<SigningKey> {
        if let Some(key) = self.derived.get(identifier) {
            return Arc::clone(&key);
        }
        let mut hasher = Sha256::new();
        hasher.update(self.root_seed);
        hasher.update(identifier.as_bytes());
        let secret: [u8; 32] = hasher.finalize().into();
        let key = Arc::new(SigningKey::from_bytes(&secret));
        self.derived.insert(identifier.to_string(), Arc::clone(&key));
        key
    }

    /// Resolve the verifier string for a local identifier.
    pub fn resolve_verifier(
        &self,
        identifier: &str,
        algorithm: &str,
        verifier_type: &str,
    ) -> Result<String, KeyError> {
        self.check_algorithm(algorithm)?;
        if verifier_type != VERIFIER_PUBLIC_KEY_HEX {
            return Err(KeyError::UnsupportedVerifierType(
                verifier_type.to_string(),
                algorithm.to_string(),
            ));
        }
        let key = self.key_for(identifier);
        Ok(hex::encode(key.verifying_key().to_bytes()))
    }

    /// Sign an opaque payload with the identifier's key.
    pub fn sign(
        &self,
        identifier: &str,
        algorithm: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, KeyError> {
        self.check_algorithm(algorithm)?;
        let key = self.key_for(identifier);
        Ok(key.sign(payload).to_bytes().to_vec())
    }

    /// Verify a signature against a verifier string.
    pub fn verify(
        algorithm: &str,
        verifier: &str,
        payload: &[u8],
        signature: &[u8],
    ) -> Result<bool, KeyError> {
        if algorithm != ALGORITHM_ED25519 {
            return Err(KeyError::UnsupportedAlgorithm(algorithm.to_string()));
        }
        let key_bytes: [u8; 32] = hex::decode(verifier)
            .map_err(|e| KeyError::BadKeyMaterial(e.to_string()))?
            .try_into()
            .map_err(|_| KeyError::BadKeyMaterial("verifier must be 32 bytes".to_string()))?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| KeyError::BadKeyMaterial(e.to_string()))?;
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| KeyError::BadKeyMaterial("signature must be 64 bytes".to_string()))?;
        Ok(key.verify(payload, &Signature::from_bytes(&sig_bytes)).is_ok())
    }

    /// The base-ledger address of an identifier's key: the last 20
    /// bytes of the SHA-256 of its public key.
    pub fn ledger_address(&self, identifier: &str) -> LedgerAddress {
        let key = self.key_for(identifier);
        let mut hasher = Sha256::new();
        hasher.update(key.verifying_key().to_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&digest[12..]);
        LedgerAddress(addr)
    }
}

impl std::fmt::Debug for SigningModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print seed material.
        f.debug_struct("SigningModule")
            .field("algorithms", &self.algorithms)
            .field("derived_keys", &self.derived.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> SigningModule {
        SigningModule::new(&SignerConfig {
            seed: Some(format!("0x{}", "ab".repeat(32))),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = module();
        let b = module();
        let va = a
            .resolve_verifier("alice", ALGORITHM_ED25519, VERIFIER_PUBLIC_KEY_HEX)
            .unwrap();
        let vb = b
            .resolve_verifier("alice", ALGORITHM_ED25519, VERIFIER_PUBLIC_KEY_HEX)
            .unwrap();
        assert_eq!(va, vb);

        let other = a
            .resolve_verifier("bob", ALGORITHM_ED25519, VERIFIER_PUBLIC_KEY_HEX)
            .unwrap();
        assert_ne!(va, other);
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let signer = module();
        let verifier = signer
            .resolve_verifier("alice", ALGORITHM_ED25519, VERIFIER_PUBLIC_KEY_HEX)
            .unwrap();
        let payload = b"endorse this";
        let signature = signer.sign("alice", ALGORITHM_ED25519, payload).unwrap();

        assert!(SigningModule::verify(ALGORITHM_ED25519, &verifier, payload, &signature).unwrap());
        assert!(
            !SigningModule::verify(ALGORITHM_ED25519, &verifier, b"tampered", &signature).unwrap()
        );
    }

    #[test]
    fn rejects_unknown_algorithm_and_verifier_type() {
        let signer = module();
        assert!(matches!(
            signer.resolve_verifier("alice", "secp256k1", VERIFIER_PUBLIC_KEY_HEX),
            Err(KeyError::UnsupportedAlgorithm(_))
        ));
        assert!(matches!(
            signer.resolve_verifier("alice", ALGORITHM_ED25519, "eth_address"),
            Err(KeyError::UnsupportedVerifierType(_, _))
        ));
    }

    #[test]
    fn ledger_address_is_stable_per_identifier() {
        let signer = module();
        assert_eq!(signer.ledger_address("seq"), signer.ledger_address("seq"));
        assert_ne!(signer.ledger_address("a"), signer.ledger_address("b"));
    }

    #[test]
    fn random_seed_when_unconfigured() {
        let a = SigningModule::new(&SignerConfig::default()).unwrap();
        let b = SigningModule::new(&SignerConfig::default()).unwrap();
        let va = a
            .resolve_verifier("alice", ALGORITHM_ED25519, VERIFIER_PUBLIC_KEY_HEX)
            .unwrap();
        let vb = b
            .resolve_verifier("alice", ALGORITHM_ED25519, VERIFIER_PUBLIC_KEY_HEX)
            .unwrap();
        assert_ne!(va, vb);
    }

    #[test]
    fn bad_seed_is_rejected() {
        let err = SigningModule::new(&SignerConfig {
            seed: Some("0x1234".to_string()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, KeyError::BadKeyMaterial(_)));
    }
}
