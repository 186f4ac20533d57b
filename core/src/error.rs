//! Error classification shared across components.
//!
//! Each module defines its own `thiserror` enum (the way `storage::DbError`
//! does), but the coordinator and orchestrator need to *branch* on what a
//! failure means: hand it back to the submitter, retry it, or mark the
//! transaction permanently failed. `ErrorKind` is that classification, and
//! any error that crosses a component boundary can report one.

use std::fmt;

/// What a failure means to the code that has to react to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input from the submitter: malformed ABI, unparseable data,
    /// missing required field, idempotency conflict. Nothing was mutated.
    InputValidation,
    /// A lookup missed: schema, state or transaction not found.
    NotFound,
    /// Infrastructure hiccup: store unavailable, transport unreachable,
    /// plugin call failed. Safe to re-drive the operation.
    Transient,
    /// A domain reported a non-retryable failure (e.g. insufficient
    /// inputs). The transaction is failed and receipted.
    DomainPermanent,
    /// An internal invariant was violated. Fatal for the enclosing
    /// context, which must be reset.
    InternalInvariant,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InputValidation => "input-validation",
            Self::NotFound => "not-found",
            Self::Transient => "transient",
            Self::DomainPermanent => "domain-permanent",
            Self::InternalInvariant => "internal-invariant",
        };
        write!(f, "{}", s)
    }
}

/// Implemented by component errors that participate in cross-component
/// retry / fail decisions.
pub trait Classified {
    fn kind(&self) -> ErrorKind;

    /// Shorthand for "the enclosing loop may re-drive this operation".
    fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_display() {
        assert_eq!(ErrorKind::InputValidation.to_string(), "input-validation");
        assert_eq!(ErrorKind::DomainPermanent.to_string(), "domain-permanent");
    }
}
