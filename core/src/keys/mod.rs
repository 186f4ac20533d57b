//! # Keys & Verifier Resolution
//!
//! Two halves of one question — "who is `alice@node2` for algorithm X?":
//!
//! - [`signer`] — the local signing module: deterministic key
//!   derivation from a root seed by identifier path, verifier lookup
//!   and payload signing.
//! - [`identity`] — resolution of *remote* verifiers over the transport
//!   (identity-resolver component), correlation-id matched with a
//!   timeout, answers cached.

pub mod identity;
pub mod signer;

pub use identity::{IdentityConfig, IdentityResolver};
pub use signer::{SignerConfig, SigningModule, ALGORITHM_ED25519, VERIFIER_PUBLIC_KEY_HEX};

use crate::error::{Classified, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("unsupported algorithm {0:?}")]
    UnsupportedAlgorithm(String),

    #[error("unsupported verifier type {0:?} for algorithm {1:?}")]
    UnsupportedVerifierType(String, String),

    #[error("invalid key material: {0}")]
    BadKeyMaterial(String),

    #[error("invalid identity locator: {0}")]
    BadLocator(String),

    #[error("verifier resolution via node {0:?} failed: {1}")]
    RemoteResolution(String, String),

    #[error("verifier resolution timed out after {0}ms")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),
}

impl Classified for KeyError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedAlgorithm(_)
            | Self::UnsupportedVerifierType(_, _)
            | Self::BadKeyMaterial(_)
            | Self::BadLocator(_) => ErrorKind::InputValidation,
            Self::RemoteResolution(_, _) | Self::Timeout(_) | Self::Transport(_) => {
                ErrorKind::Transient
            }
        }
    }
}
