//! # Privacy Domains
//!
//! A domain is a pluggable privacy implementation — a UTXO token, a
//! private EVM group — that the core drives through a four-phase
//! contract per transaction:
//!
//! **Init** (declare required verifiers) → **Assemble** (input/output
//! states + an attestation plan, against a domain-context query handle)
//! → **Endorse** (run by each designated endorser) → **Prepare** (a
//! public call for the base ledger, or a chained private transaction).
//! Deploys mirror the sequence without Assemble.
//!
//! Errors from any phase are fatal to that attempt; the coordinator may
//! re-assemble from scratch, so Assemble must be idempotent over its
//! inputs. Domains run out of process in production — the typed message
//! set in [`wire`] is the channel contract, and every request is safe
//! to resend — while the [`Domain`] trait is what in-process adapters
//! (and the in-tree reference domain [`notes`]) implement directly.

pub mod manager;
pub mod notes;
pub mod wire;

pub use manager::{DomainManager, DomainManagerConfig, DomainSmartContract, SmartContract};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Classified, ErrorKind};
use crate::states::store::ReceivedState;
use crate::states::{DomainContext, SchemaDeclaration, StateError};
use crate::storage::DbError;
use crate::types::{LedgerAddress, LedgerEvent, SchemaId, StateId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("domain {0:?} is not loaded")]
    NotLoaded(String),

    #[error("no smart contract registered at {0}")]
    ContractNotFound(LedgerAddress),

    #[error("invalid domain configuration: {0}")]
    ConfigInvalid(String),

    #[error("invalid transaction for domain: {0}")]
    BadTransaction(String),

    #[error("{0}")]
    Permanent(String),

    #[error("domain plugin call failed: {0}")]
    Transient(String),

    #[error("timed out waiting for contract registration of transaction {0}")]
    DeployTimeout(Uuid),
}

impl Classified for DomainError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Db(DbError::NotFound(_)) | Self::NotLoaded(_) | Self::ContractNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::Db(_) | Self::Transient(_) | Self::DeployTimeout(_) => ErrorKind::Transient,
            Self::ConfigInvalid(_) | Self::BadTransaction(_) => ErrorKind::InputValidation,
            Self::Permanent(_) => ErrorKind::DomainPermanent,
            Self::State(e) => e.kind(),
        }
    }
}

// ---------------------------------------------------------------------------
// Verifiers & attestations
// ---------------------------------------------------------------------------

/// An identity lookup a domain needs before assembly can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierRequest {
    /// `identifier` or `identifier@node`.
    pub lookup: String,
    pub algorithm: String,
    pub verifier_type: String,
}

/// A resolved identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedVerifier {
    pub lookup: String,
    pub algorithm: String,
    pub verifier_type: String,
    pub verifier: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttestationType {
    /// A signature produced locally by the submitting node.
    Sign,
    /// An endorsement executed by a (possibly remote) endorser.
    Endorse,
}

/// One entry of an attestation plan: what to collect, from whom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationRequest {
    pub name: String,
    pub attestation_type: AttestationType,
    pub algorithm: String,
    pub verifier_type: String,
    /// For `Sign` requests: the exact payload to sign.
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Identity locators of the required parties.
    pub parties: Vec<String>,
}

/// One collected signature or endorsement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationResult {
    pub name: String,
    pub attestation_type: AttestationType,
    pub verifier: ResolvedVerifier,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Reference to an existing state consumed or read by an assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRef {
    pub id: StateId,
    pub schema: SchemaId,
}

/// A state proposed by an assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewState {
    /// `None` defers id computation to the state store (default hash)
    /// or the domain (custom hash).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<StateId>,
    pub schema: SchemaId,
    pub data: Value,
    /// Nodes that must receive this state over reliable distribution.
    #[serde(default)]
    pub distribute_to: Vec<String>,
}

/// A full state as shipped to endorsers (and into receipts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndorsableState {
    pub id: StateId,
    pub schema: SchemaId,
    pub data: Value,
}

/// The successful product of the Assemble phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Assembly {
    pub input_states: Vec<StateRef>,
    pub read_states: Vec<StateRef>,
    pub output_states: Vec<NewState>,
    pub attestation_plan: Vec<AttestationRequest>,
}

/// Assemble either succeeds or reverts with a domain-permanent reason
/// (e.g. insufficient inputs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssembleResult {
    Ok(Assembly),
    Revert { reason: String },
}

// ---------------------------------------------------------------------------
// Endorsement
// ---------------------------------------------------------------------------

/// Everything an endorser needs to execute one endorsement request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndorseRequest {
    pub transaction: PrivateTxSpec,
    pub verifiers: Vec<ResolvedVerifier>,
    pub signatures: Vec<AttestationResult>,
    pub input_states: Vec<EndorsableState>,
    pub read_states: Vec<EndorsableState>,
    pub output_states: Vec<EndorsableState>,
    /// The plan entry being executed.
    pub attestation_request: AttestationRequest,
    /// The party executing it.
    pub endorser: ResolvedVerifier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EndorseOutcome {
    /// Approved; `payload` carries the endorsement artifact (signature).
    Approve { payload: Vec<u8> },
    /// Refused, with the reason recorded against the transaction.
    Reject { reason: String },
    /// Approved, and the endorser takes over submission: the prepared
    /// call's required signer becomes the endorsing party.
    EndorserSubmit { payload: Vec<u8> },
}

// ---------------------------------------------------------------------------
// Prepare
// ---------------------------------------------------------------------------

/// A prepared base-ledger call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedCall {
    pub function: crate::abi::AbiFunction,
    pub inputs: Value,
    /// Identity locator that must sign the public submission; `None`
    /// lets the coordinator pick its anonymous submitter key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_signer: Option<String>,
}

/// A private transaction chained from a Prepare phase instead of a
/// public call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainedTransaction {
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<LedgerAddress>,
    pub from: String,
    pub function: String,
    pub inputs: Value,
    /// Chained transactions must be idempotent across re-drives.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PrepareResult {
    PublicCall(PreparedCall),
    ChainedPrivate(ChainedTransaction),
}

/// Prepare's input: the surviving assembly plus collected attestations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareInput {
    pub input_states: Vec<EndorsableState>,
    pub read_states: Vec<EndorsableState>,
    pub output_states: Vec<EndorsableState>,
    pub signatures: Vec<AttestationResult>,
    pub endorsements: Vec<AttestationResult>,
}

// ---------------------------------------------------------------------------
// Transaction & deploy specifications
// ---------------------------------------------------------------------------

/// The slice of a private transaction a domain sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateTxSpec {
    pub id: Uuid,
    pub domain: String,
    pub contract: LedgerAddress,
    pub from: String,
    /// Resolved function signature, e.g. `transfer(string,uint256)`.
    pub function: String,
    /// Normalized JSON inputs.
    pub inputs: Value,
}

/// A deploy of a new private smart contract instance within a domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySpec {
    pub id: Uuid,
    pub domain: String,
    pub from: String,
    pub inputs: Value,
}

/// Prepare-deploy output: the base-ledger deploy call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedDeploy {
    pub call: PreparedCall,
}

// ---------------------------------------------------------------------------
// Configure / registration / receipts
// ---------------------------------------------------------------------------

/// What a domain announces when loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainCapabilities {
    /// Schemas to register (immutable, content-addressed).
    pub schemas: Vec<SchemaDeclaration>,
}

/// A contract registration extracted from base-ledger events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractRegistration {
    pub address: LedgerAddress,
    pub config: Value,
    /// The deploy transaction this registration satisfies, when known —
    /// what wakes up `exec_deploy_and_wait` waiters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_transaction: Option<Uuid>,
}

/// Outcome of a `handle_event_batch` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventHandling {
    pub registrations: Vec<ContractRegistration>,
}

/// The states of a finalised transaction, for receipt enrichment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionStates {
    pub spent: Vec<EndorsableState>,
    pub confirmed: Vec<EndorsableState>,
}

// ---------------------------------------------------------------------------
// The Domain contract
// ---------------------------------------------------------------------------

/// The four-phase contract (plus deploy pathway, calls, receipts and
/// custom-hash support) every privacy domain implements.
#[async_trait]
pub trait Domain: Send + Sync {
    fn name(&self) -> &str;

    /// True if the domain declares its own state-id hash rule; the
    /// store then routes received states through
    /// [`Domain::validate_state_hashes`] instead of the default rule.
    fn custom_hash_function(&self) -> bool {
        false
    }

    /// One-time load: parse domain config, announce schemas.
    async fn configure(&self, config: &Value) -> Result<DomainCapabilities, DomainError>;

    /// Parse a newly registered contract instance's config.
    async fn init_contract(
        &self,
        address: LedgerAddress,
        config: &Value,
    ) -> Result<Value, DomainError>;

    // -- Deploy pathway (no Assemble) ---------------------------------------

    async fn init_deploy(&self, deploy: &DeploySpec) -> Result<Vec<VerifierRequest>, DomainError>;

    async fn prepare_deploy(
        &self,
        deploy: &DeploySpec,
        verifiers: &[ResolvedVerifier],
    ) -> Result<PreparedDeploy, DomainError>;

    // -- Transaction pathway ------------------------------------------------

    async fn init_transaction(
        &self,
        tx: &PrivateTxSpec,
    ) -> Result<Vec<VerifierRequest>, DomainError>;

    async fn assemble_transaction(
        &self,
        ctx: &DomainContext,
        tx: &PrivateTxSpec,
        verifiers: &[ResolvedVerifier],
    ) -> Result<AssembleResult, DomainError>;

    async fn endorse_transaction(
        &self,
        ctx: &DomainContext,
        req: &EndorseRequest,
    ) -> Result<EndorseOutcome, DomainError>;

    async fn prepare_transaction(
        &self,
        tx: &PrivateTxSpec,
        input: &PrepareInput,
    ) -> Result<PrepareResult, DomainError>;

    // -- Read-only calls ----------------------------------------------------

    async fn init_call(&self, tx: &PrivateTxSpec) -> Result<Vec<VerifierRequest>, DomainError>;

    async fn exec_call(
        &self,
        ctx: &DomainContext,
        tx: &PrivateTxSpec,
        verifiers: &[ResolvedVerifier],
    ) -> Result<Value, DomainError>;

    // -- Custom hash / receipts / events ------------------------------------

    /// Fill nil ids and validate provided ones for states received from
    /// peers. Only called for domains with a custom hash function.
    async fn validate_state_hashes(
        &self,
        states: &[ReceivedState],
    ) -> Result<Vec<StateId>, DomainError>;

    /// Enrich a receipt with domain-level decoding. Allowed to fail;
    /// the failure is recorded as non-fatal.
    async fn build_receipt(
        &self,
        transaction: Uuid,
        states: &TransactionStates,
    ) -> Result<Value, DomainError>;

    /// Interpret a batch of base-ledger events.
    async fn handle_event_batch(
        &self,
        events: &[LedgerEvent],
    ) -> Result<EventHandling, DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert_eq!(
            DomainError::Permanent("insufficient funds (available=0)".to_string()).kind(),
            ErrorKind::DomainPermanent
        );
        assert_eq!(
            DomainError::NotLoaded("noto".to_string()).kind(),
            ErrorKind::NotFound
        );
        assert!(DomainError::Transient("rpc".to_string()).is_retryable());
    }

    #[test]
    fn assemble_result_serde() {
        let revert = AssembleResult::Revert {
            reason: "insufficient funds (available=0)".to_string(),
        };
        let json = serde_json::to_string(&revert).unwrap();
        let back: AssembleResult = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, AssembleResult::Revert { .. }));
    }
}
