//! The coordinator: submission boundary, idempotency, updates,
//! endorsement plumbing and finalisation.
//!
//! Ownership rule: the `transactions` and `transaction_deps` rows are
//! written inside the submission's gateway transaction; a submission
//! of type `public` stages its `PublicTxSubmission` in the same commit,
//! bound 1:1. Idempotency is enforced by an insert-if-absent on the
//! key index — when that collides, the whole write-set rolls back and
//! the key is re-queried *outside* the failed transaction to answer
//! with the existing id instead of an opaque conflict.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::abi::{AbiResolver, ResolvedFunction};
use crate::domains::{
    AttestationResult, AttestationType, DomainManager, EndorsableState, EndorseOutcome,
    EndorseRequest, TransactionStates,
};
use crate::keys::identity::IdentityResolver;
use crate::keys::signer::SigningModule;
use crate::publictx::{PublicTxInput, PublicTxManager, TxCompletion};
use crate::states::store::ReceivedState;
use crate::states::{DomainContext, StateStore};
use crate::storage::{CoreDb, DbError, DbTxn, Table};
use crate::transport::{
    BuildOutcome, Component, InboundHandler, ReliableMessage, ReliableMessageBuilder,
    ReliableMessageKind, TransportError, TransportManager, WireMessage,
};
use crate::types::{now_millis, IdentityLocator, LedgerAddress, StateId};

use super::sequencer::SequencerSet;
use super::{
    DispatchRow, StoredTransaction, SubmitMode, TransactionDep, TransactionInput,
    TransactionReceipt, TransactionUpdate, TxError, TxType,
};

// ---------------------------------------------------------------------------
// Message types on the wire
// ---------------------------------------------------------------------------

pub const MSG_STATE_DISTRIBUTION: &str = "state_distribution";
pub const MSG_ENDORSEMENT_REQUEST: &str = "endorsement_request";
pub const MSG_ENDORSEMENT_RESPONSE: &str = "endorsement_response";
pub const MSG_RECEIPT_DISTRIBUTION: &str = "receipt_distribution";

/// Metadata (and wire payload) of one distributed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDistribution {
    pub domain: String,
    pub contract: LedgerAddress,
    pub schema: crate::types::SchemaId,
    /// Omitted when the domain declares a custom hash function — the
    /// receiver asks the domain to fill it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_id: Option<StateId>,
    /// Full state data; populated when the wire message is built.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndorsementEnvelope {
    pub request: EndorseRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndorsementResponse {
    pub transaction: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<AttestationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
    /// The endorser takes over submission of the prepared call.
    #[serde(default)]
    pub endorser_submit: bool,
}

/// A finalised receipt travelling to the other participants, together
/// with the finality markers their copies of the states need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptDistribution {
    pub transaction: Uuid,
    pub receipt: TransactionReceipt,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<LedgerAddress>,
    #[serde(default)]
    pub confirmed_states: Vec<StateId>,
    #[serde(default)]
    pub spent_states: Vec<StateId>,
}

/// Sender-side record of one state distribution, keyed by the reliable
/// message id that carries it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDistributionRow {
    pub message_id: Uuid,
    pub state: StateId,
    pub node: String,
    pub transaction: Uuid,
}

/// The matching ack record, mirrored from the reliable ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDistributionAckRow {
    pub message_id: Uuid,
    pub time: i64,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long to wait for one remote endorsement before the attempt
    /// is retried.
    pub endorsement_timeout_ms: u64,
    /// Assembly attempts per transaction before giving up as transient.
    pub assemble_attempts: u32,
    /// Pause between assembly attempts.
    pub attempt_backoff_ms: u64,
    /// Gas limit applied when a submission does not carry one.
    pub default_gas_limit: u64,
    /// The local signing identifier used to submit prepared calls when
    /// the domain does not require a specific signer.
    pub submitter_identity: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            endorsement_timeout_ms: 10_000,
            assemble_attempts: 3,
            attempt_backoff_ms: 200,
            default_gas_limit: 100_000,
            submitter_identity: "submitter".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// In-memory bookkeeping for a dispatched private transaction awaiting
/// its public confirmation.
pub(crate) struct PendingDispatch {
    pub context: Option<Arc<DomainContext>>,
    pub domain: String,
    pub contract: Option<LedgerAddress>,
    pub confirmed: Vec<EndorsableState>,
    pub spent: Vec<EndorsableState>,
    /// Nodes that should receive the receipt.
    pub receipt_to: Vec<String>,
}

pub struct Coordinator {
    pub(crate) node_name: String,
    pub(crate) config: CoordinatorConfig,
    pub(crate) db: Arc<CoreDb>,
    pub(crate) abi: Arc<AbiResolver>,
    pub(crate) store: Arc<StateStore>,
    pub(crate) domains: Arc<DomainManager>,
    pub(crate) transport: Arc<TransportManager>,
    pub(crate) identity: Arc<IdentityResolver>,
    pub(crate) signer: Arc<SigningModule>,
    pub(crate) publictx: Arc<PublicTxManager>,
    pub(crate) sequencers: SequencerSet,
    /// One long-lived domain context per (domain, contract): in-flight
    /// transactions of one contract share it, so a later assembly sees
    /// the earlier ones' spend locks and unconfirmed outputs.
    pub(crate) contexts: DashMap<String, Arc<DomainContext>>,
    pub(crate) pending_endorsements:
        DashMap<Uuid, oneshot::Sender<Result<EndorsementResponse, TxError>>>,
    pub(crate) pending_dispatches: DashMap<Uuid, PendingDispatch>,
    handles: SyncMutex<Vec<JoinHandle<()>>>,
    completions: Mutex<Option<mpsc::UnboundedReceiver<TxCompletion>>>,
    cancel_tx: watch::Sender<bool>,
    /// Installed at construction; lets `&self` seams recover the Arc.
    weak_self: std::sync::Weak<Self>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: &str,
        config: CoordinatorConfig,
        db: Arc<CoreDb>,
        abi: Arc<AbiResolver>,
        store: Arc<StateStore>,
        domains: Arc<DomainManager>,
        transport: Arc<TransportManager>,
        identity: Arc<IdentityResolver>,
        signer: Arc<SigningModule>,
        publictx: Arc<PublicTxManager>,
    ) -> Arc<Self> {
        let completions = publictx.take_completions();
        let (cancel_tx, _) = watch::channel(false);
        Arc::new_cyclic(|weak_self| Self {
            node_name: node_name.to_string(),
            config,
            db,
            abi,
            store,
            domains,
            transport,
            identity,
            signer,
            publictx,
            sequencers: SequencerSet::new(),
            contexts: DashMap::new(),
            pending_endorsements: DashMap::new(),
            pending_dispatches: DashMap::new(),
            handles: SyncMutex::new(Vec::new()),
            completions: Mutex::new(completions),
            cancel_tx,
            weak_self: weak_self.clone(),
        })
    }

    /// Start the finalisation loop (consuming public tx completions).
    pub async fn start(self: &Arc<Self>) {
        let Some(mut completions) = self.completions.lock().await.take() else {
            warn!("coordinator started twice, completion loop already running");
            return;
        };
        let this = Arc::clone(self);
        let mut cancel = self.cancel_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.changed() => break,
                    completion = completions.recv() => match completion {
                        None => break,
                        Some(completion) => {
                            if let Err(e) = this.handle_completion(&completion).await {
                                warn!(
                                    local_id = completion.local_id,
                                    "finalisation failed: {}", e
                                );
                            }
                        }
                    },
                }
            }
        });
        self.handles.lock().push(handle);
    }

    pub async fn stop(&self) {
        let _ = self.cancel_tx.send(true);
        self.sequencers.stop().await;
        for entry in self.contexts.iter() {
            entry.value().close();
        }
        self.contexts.clear();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
    }

    /// The shared context for one (domain, contract), created lazily.
    pub(crate) fn context_for(&self, domain: &str, contract: LedgerAddress) -> Arc<DomainContext> {
        let key = format!("{}:{}", domain, contract);
        self.contexts
            .entry(key)
            .or_insert_with(|| self.store.new_context(domain, contract))
            .clone()
    }

    pub(crate) fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    // -- Submission ---------------------------------------------------------

    /// Submit one transaction; an idempotency-key collision resolves to
    /// the existing transaction id.
    pub async fn submit_transaction(self: &Arc<Self>, input: TransactionInput) -> Result<Uuid, TxError> {
        match self.submit_transactions(vec![input]).await {
            Ok(ids) => Ok(ids[0]),
            Err(TxError::IdempotencyClash { existing, .. }) => Ok(existing),
            Err(e) => Err(e),
        }
    }

    /// Submit a batch atomically. All rows (and any staged public
    /// submissions) commit together or not at all.
    pub async fn submit_transactions(
        self: &Arc<Self>,
        inputs: Vec<TransactionInput>,
    ) -> Result<Vec<Uuid>, TxError> {
        let this = Arc::clone(self);
        let result = self.db.transaction(|txn| {
            let mut ids = Vec::with_capacity(inputs.len());
            let mut private_ids = Vec::new();
            for input in &inputs {
                let (row, public) = this.resolve_new_transaction(txn, input, SubmitMode::Auto)?;
                this.insert_transaction(txn, &row, &input.depends_on)?;
                if let Some(public) = public {
                    this.publictx.stage_submission(txn, &public)?;
                }
                if row.tx_type == TxType::Private {
                    private_ids.push(row.id);
                }
                ids.push(row.id);
            }
            let coordinator = Arc::clone(&this);
            txn.on_commit(move || {
                for id in private_ids {
                    coordinator.dispatch_to_sequencer(id);
                }
            });
            Ok(ids)
        });

        match result {
            Ok(ids) => Ok(ids),
            Err(original) => {
                // Post-rollback: a unique-key conflict surfaced by the
                // store may be a known-idempotent duplicate. Re-query
                // outside the failed transaction to decide.
                for input in &inputs {
                    if let Some(key) = &input.idempotency_key {
                        if let Some(existing) = self.transaction_by_idempotency_key(key)? {
                            info!(key = %key, existing = %existing, "idempotency key clash resolved to existing transaction");
                            return Err(TxError::IdempotencyClash {
                                key: key.clone(),
                                existing,
                            });
                        }
                    }
                }
                Err(original)
            }
        }
    }

    /// Validate and resolve one input into its durable row plus the
    /// public staging, if its type calls for one.
    fn resolve_new_transaction(
        &self,
        txn: &mut DbTxn<'_>,
        input: &TransactionInput,
        submit_mode: SubmitMode,
    ) -> Result<(StoredTransaction, Option<PublicTxInput>), TxError> {
        let id = Uuid::new_v4();
        debug!(transaction = %id, idempotency_key = ?input.idempotency_key, "resolving new transaction");

        // The submitting identity must be local.
        let from = IdentityLocator::parse(&input.from).map_err(TxError::Validation)?;
        if !from.is_local(&self.node_name) {
            return Err(TxError::Validation(format!(
                "sender {:?} is not local to this node",
                input.from
            )));
        }

        // Private transactions resolve their domain from the target
        // contract; deploys must name it.
        let domain = match input.tx_type {
            TxType::Private => Some(self.resolve_private_domain(input)?),
            TxType::Public => None,
        };

        let function = self.abi.resolve_function(
            txn,
            input.abi.as_deref(),
            input.abi_reference,
            input.function.as_deref(),
            input.to.as_ref(),
        )?;
        let normalized = AbiResolver::normalize_inputs(&function.function, &input.data)?;

        let row = StoredTransaction {
            id,
            submit_mode,
            tx_type: input.tx_type,
            created: now_millis(),
            from: from.qualified(&self.node_name),
            to: input.to,
            domain,
            function: function.signature(),
            abi_reference: function.abi_reference,
            data: normalized.to_string(),
            idempotency_key: input.idempotency_key.clone(),
        };

        let public = match input.tx_type {
            TxType::Public => Some(PublicTxInput {
                from: from.identity.clone(),
                to: input.to,
                data: json!({
                    "function": row.function,
                    "inputs": normalized,
                }),
                gas_limit: input.gas_limit.unwrap_or(self.config.default_gas_limit),
                bindings: vec![id],
            }),
            TxType::Private => None,
        };
        Ok((row, public))
    }

    fn resolve_private_domain(&self, input: &TransactionInput) -> Result<String, TxError> {
        match input.to {
            Some(to) => {
                let contract = self.domains.smart_contract(&to)?;
                let actual = contract.domain_name().to_string();
                match &input.domain {
                    Some(given) if *given != actual => Err(TxError::DomainMismatch {
                        given: given.clone(),
                        actual,
                    }),
                    _ => Ok(actual),
                }
            }
            None => input.domain.clone().ok_or(TxError::MissingDomain),
        }
    }

    fn insert_transaction(
        &self,
        txn: &mut DbTxn<'_>,
        row: &StoredTransaction,
        depends_on: &[Uuid],
    ) -> Result<(), TxError> {
        if let Some(key) = &row.idempotency_key {
            // Insert-or-nothing on the key index; a conflict rolls the
            // whole submission back.
            let inserted =
                txn.put_if_absent(Table::TransactionIdempotency, key.as_bytes(), &row.id)?;
            if !inserted {
                return Err(TxError::Db(DbError::Conflict(format!(
                    "idempotency key {:?} already exists",
                    key
                ))));
            }
        }
        txn.put(Table::Transactions, row.id.as_bytes(), row)?;
        for dep in depends_on {
            let edge = TransactionDep {
                transaction: row.id,
                depends_on: *dep,
            };
            let mut key = row.id.as_bytes().to_vec();
            key.extend_from_slice(dep.as_bytes());
            txn.put_if_absent(Table::TransactionDeps, &key, &edge)?;
        }
        Ok(())
    }

    fn dispatch_to_sequencer(self: &Arc<Self>, id: Uuid) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(Some(row)) = this.get_transaction(id) else {
                warn!(transaction = %id, "dispatched transaction vanished");
                return;
            };
            let slot = match (&row.domain, row.to) {
                (Some(domain), Some(to)) => format!("{}:{}", domain, to),
                (Some(domain), None) => format!("{}:deploy", domain),
                _ => return, // public transactions don't sequence
            };
            this.sequencers.dispatch(&this, &slot, id).await;
        });
    }

    // -- Privacy groups -------------------------------------------------------

    /// Create a privacy group: the genesis state lives in the state
    /// store like any other state, the member list is a side table,
    /// and every remote member receives the genesis over the reliable
    /// channel. Returns the group id (the genesis state id).
    pub async fn create_privacy_group(
        self: &Arc<Self>,
        domain_name: &str,
        contract: LedgerAddress,
        schema: crate::types::SchemaId,
        genesis: Value,
        members: Vec<String>,
    ) -> Result<StateId, TxError> {
        if members.is_empty() {
            return Err(TxError::Validation(
                "a privacy group requires at least one member".to_string(),
            ));
        }
        let mut member_nodes = Vec::new();
        for member in &members {
            let locator = IdentityLocator::parse(member).map_err(TxError::Validation)?;
            let node = locator.node_or(&self.node_name).to_string();
            if node != self.node_name && !member_nodes.contains(&node) {
                member_nodes.push(node);
            }
        }

        let schema_record = self.store.get_schema(domain_name, &schema)?;
        let state = self
            .store
            .process_state(&schema_record, genesis, None, now_millis())?;
        let group_id = state.id.clone();
        let group = crate::states::store::PrivacyGroup {
            domain: domain_name.to_string(),
            id: group_id.clone(),
            members,
        };

        let creating_tx = Uuid::new_v4();
        self.db.transaction(|txn| {
            crate::states::DbFlushWriter::stage_state(txn, contract, &state)?;
            self.store
                .stage_finality(txn, domain_name, &contract, creating_tx, &[group_id.clone()], &[])?;
            self.store.stage_privacy_group(txn, &group)?;
            for node in &member_nodes {
                let metadata = StateDistribution {
                    domain: domain_name.to_string(),
                    contract,
                    schema,
                    state_id: Some(group_id.clone()),
                    data: None,
                };
                let message_id = self.transport.queue_reliable(
                    txn,
                    node,
                    ReliableMessageKind::StateDistribution,
                    &serde_json::to_value(&metadata)
                        .map_err(|e| TxError::Validation(e.to_string()))?,
                )?;
                txn.put(
                    Table::StateDistributions,
                    message_id.as_bytes(),
                    &StateDistributionRow {
                        message_id,
                        state: group_id.clone(),
                        node: node.clone(),
                        transaction: creating_tx,
                    },
                )?;
            }
            Ok::<(), TxError>(())
        })?;
        info!(domain = domain_name, group = %group_id, "privacy group created");
        Ok(group_id)
    }

    // -- Read-only calls ------------------------------------------------------

    /// Execute a read-only call against a private smart contract:
    /// InitCall → verifier resolution → ExecCall, under a throwaway
    /// context. Nothing is persisted.
    pub async fn call_private(
        self: &Arc<Self>,
        contract: LedgerAddress,
        from: &str,
        function: &str,
        inputs: Value,
    ) -> Result<Value, TxError> {
        let handle = self.domains.smart_contract(&contract)?;
        let spec = crate::domains::PrivateTxSpec {
            id: Uuid::new_v4(),
            domain: handle.domain_name().to_string(),
            contract,
            from: from.to_string(),
            function: function.to_string(),
            inputs,
        };

        let requests = handle.init_call(&spec).await?;
        let mut verifiers = Vec::with_capacity(requests.len());
        for request in &requests {
            let verifier = self
                .identity
                .resolve(&request.lookup, &request.algorithm, &request.verifier_type)
                .await?;
            verifiers.push(crate::domains::ResolvedVerifier {
                lookup: request.lookup.clone(),
                algorithm: request.algorithm.clone(),
                verifier_type: request.verifier_type.clone(),
                verifier,
            });
        }

        let ctx = self.store.new_context(&spec.domain, contract);
        let result = handle.exec_call(&ctx, &spec, &verifiers).await;
        ctx.close();
        Ok(result?)
    }

    // -- Update path ----------------------------------------------------------

    /// Update an existing transaction. Only public transactions may be
    /// updated; the re-validated fields and the forward to the public
    /// orchestrator share one gateway transaction.
    pub async fn update_transaction(
        self: &Arc<Self>,
        id: Uuid,
        update: TransactionUpdate,
    ) -> Result<(), TxError> {
        let row = self.get_transaction(id)?.ok_or(TxError::NotFound(id))?;
        if row.tx_type != TxType::Public {
            return Err(TxError::Validation(
                "only public transactions may be updated".to_string(),
            ));
        }

        let this = Arc::clone(self);
        self.db.transaction(move |txn| {
            let to = update.to.or(row.to);
            let abi_reference = match (&update.abi, update.abi_reference) {
                (None, None) => Some(row.abi_reference),
                (_, reference) => reference,
            };
            let function: ResolvedFunction = this.abi.resolve_function(
                txn,
                update.abi.as_deref(),
                abi_reference,
                Some(update.function.as_deref().unwrap_or(&row.function)),
                to.as_ref(),
            )?;
            let data = match &update.data {
                Some(data) => data.clone(),
                None => serde_json::from_str(&row.data)
                    .map_err(|e| TxError::Validation(e.to_string()))?,
            };
            let normalized = AbiResolver::normalize_inputs(&function.function, &data)?;

            let mut updated = row.clone();
            updated.to = to;
            updated.function = function.signature();
            updated.abi_reference = function.abi_reference;
            updated.data = normalized.to_string();
            txn.put(Table::Transactions, id.as_bytes(), &updated)?;

            this.publictx.stage_update(
                txn,
                id,
                to,
                &json!({"function": updated.function, "inputs": normalized}),
                update.gas_limit,
            )?;
            Ok(())
        })
    }

    // -- Queries --------------------------------------------------------------

    pub fn get_transaction(&self, id: Uuid) -> Result<Option<StoredTransaction>, TxError> {
        Ok(self.db.get(Table::Transactions, id.as_bytes())?)
    }

    pub fn get_receipt(&self, id: Uuid) -> Result<Option<TransactionReceipt>, TxError> {
        Ok(self.db.get(Table::TransactionReceipts, id.as_bytes())?)
    }

    pub fn transaction_by_idempotency_key(&self, key: &str) -> Result<Option<Uuid>, TxError> {
        Ok(self
            .db
            .get(Table::TransactionIdempotency, key.as_bytes())?)
    }

    pub fn get_dispatch(&self, id: Uuid) -> Result<Option<DispatchRow>, TxError> {
        Ok(self.db.get(Table::Dispatches, id.as_bytes())?)
    }

    /// Mirror a reliable ack into the distribution-ack table when the
    /// acked message was a state distribution. Wired as the transport
    /// manager's ack listener.
    pub fn record_distribution_ack(&self, message_id: Uuid) {
        let result: Result<(), TxError> = self.db.transaction(|txn| {
            let distribution: Option<StateDistributionRow> =
                txn.get(Table::StateDistributions, message_id.as_bytes())?;
            if distribution.is_some() {
                let ack = StateDistributionAckRow {
                    message_id,
                    time: now_millis(),
                };
                txn.put_if_absent(Table::StateDistributionAcks, message_id.as_bytes(), &ack)?;
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!(message = %message_id, "failed to record distribution ack: {}", e);
        }
    }

    // -- Receipts -------------------------------------------------------------

    /// Write a receipt row exactly once.
    pub(crate) fn stage_receipt(
        &self,
        txn: &mut DbTxn<'_>,
        receipt: &TransactionReceipt,
    ) -> Result<(), TxError> {
        txn.put_if_absent(
            Table::TransactionReceipts,
            receipt.transaction.as_bytes(),
            receipt,
        )?;
        Ok(())
    }

    /// Failure receipt with no on-chain location (e.g. assembly revert).
    pub(crate) fn write_failure_receipt(&self, id: Uuid, failure: &str) -> Result<(), TxError> {
        let receipt = TransactionReceipt {
            transaction: id,
            indexed: now_millis(),
            success: false,
            failure: Some(failure.to_string()),
            location: None,
            contract_address: None,
            domain_receipt: None,
            domain_receipt_error: None,
        };
        self.db
            .transaction(|txn| self.stage_receipt(txn, &receipt))?;
        info!(transaction = %id, "failure receipt written: {}", failure);
        Ok(())
    }

    // -- Finalisation -----------------------------------------------------------

    async fn handle_completion(self: &Arc<Self>, completion: &TxCompletion) -> Result<(), TxError> {
        for binding in &completion.bindings {
            let pending = self.pending_dispatches.remove(binding).map(|(_, p)| p);
            let success = completion.succeeded();
            let failure = if success {
                None
            } else {
                Some(
                    completion
                        .failure
                        .clone()
                        .unwrap_or_else(|| "reverted on base ledger".to_string()),
                )
            };

            let mut receipt = TransactionReceipt {
                transaction: *binding,
                indexed: now_millis(),
                success,
                failure,
                location: completion.location.clone(),
                contract_address: completion
                    .location
                    .as_ref()
                    .and_then(|l| l.contract_address),
                domain_receipt: None,
                domain_receipt_error: None,
            };

            // Domain receipt enrichment is allowed to fail, recorded.
            if let Some(pending) = &pending {
                if success {
                    let states = TransactionStates {
                        spent: pending.spent.clone(),
                        confirmed: pending.confirmed.clone(),
                    };
                    match self.domains.get_domain(&pending.domain) {
                        Ok(domain) => match domain.build_receipt(*binding, &states).await {
                            Ok(enriched) => receipt.domain_receipt = Some(enriched.to_string()),
                            Err(e) => receipt.domain_receipt_error = Some(e.to_string()),
                        },
                        Err(e) => receipt.domain_receipt_error = Some(e.to_string()),
                    }
                }
            }

            // One commit: finality markers plus the receipt.
            self.db.transaction(|txn| {
                if success {
                    if let Some(pending) = &pending {
                        if let Some(contract) = pending.contract {
                            let confirmed: Vec<StateId> =
                                pending.confirmed.iter().map(|s| s.id.clone()).collect();
                            let spent: Vec<StateId> =
                                pending.spent.iter().map(|s| s.id.clone()).collect();
                            self.store.stage_finality(
                                txn,
                                &pending.domain,
                                &contract,
                                *binding,
                                &confirmed,
                                &spent,
                            )?;
                        }
                    }
                }
                self.stage_receipt(txn, &receipt)?;
                // Receipts travel reliably to the other participants,
                // carrying the finality markers for their state copies.
                if let Some(pending) = &pending {
                    for node in &pending.receipt_to {
                        let distribution = ReceiptDistribution {
                            transaction: *binding,
                            receipt: receipt.clone(),
                            domain: Some(pending.domain.clone()),
                            contract: pending.contract,
                            confirmed_states: pending
                                .confirmed
                                .iter()
                                .map(|s| s.id.clone())
                                .collect(),
                            spent_states: pending.spent.iter().map(|s| s.id.clone()).collect(),
                        };
                        self.transport.queue_reliable(
                            txn,
                            node,
                            ReliableMessageKind::Receipt,
                            &serde_json::to_value(&distribution)
                                .map_err(|e| TxError::Validation(e.to_string()))?,
                        )?;
                    }
                }
                Ok::<(), TxError>(())
            })?;

            // Only after the confirmation is durable do the context's
            // locks clear (flipping overlay states to database states).
            // The context itself is shared with the contract's other
            // in-flight transactions and stays open.
            if let Some(pending) = pending {
                if let Some(context) = pending.context {
                    context.clear_transactions(&[*binding]);
                }
            }
            info!(transaction = %binding, success, "transaction finalised");
        }
        Ok(())
    }

    // -- Endorsements ------------------------------------------------------------

    /// Send an endorsement request to a remote party's node (reliable)
    /// and wait for the response.
    pub(crate) async fn request_remote_endorsement(
        self: &Arc<Self>,
        node: &str,
        request: &EndorseRequest,
    ) -> Result<EndorsementResponse, TxError> {
        let envelope = EndorsementEnvelope {
            request: request.clone(),
        };
        let metadata =
            serde_json::to_value(&envelope).map_err(|e| TxError::Validation(e.to_string()))?;

        let (sender, receiver) = oneshot::channel();
        let this = Arc::clone(self);
        let node_owned = node.to_string();
        let message_id = self.db.transaction(move |txn| {
            let message_id =
                this.transport
                    .queue_reliable(txn, &node_owned, ReliableMessageKind::Endorsement, &metadata)?;
            // Register the waiter before the commit returns, so even an
            // instant response finds it.
            let pending = Arc::clone(&this);
            txn.on_commit(move || {
                pending.pending_endorsements.insert(message_id, sender);
            });
            Ok::<Uuid, TxError>(message_id)
        })?;

        let timeout = std::time::Duration::from_millis(self.config.endorsement_timeout_ms);
        match tokio::time::timeout(timeout, receiver).await {
            Err(_) => {
                // A very late response finds no waiter and is dropped.
                self.pending_endorsements.remove(&message_id);
                Err(TxError::EndorsementTimeout {
                    party: request.endorser.lookup.clone(),
                })
            }
            Ok(Err(_)) => Err(TxError::EndorsementTimeout {
                party: request.endorser.lookup.clone(),
            }),
            Ok(Ok(response)) => response,
        }
    }

    /// Receiver side: execute one endorsement request and answer.
    async fn process_endorsement_request(
        self: &Arc<Self>,
        from_node: &str,
        message_id: Uuid,
        envelope: EndorsementEnvelope,
    ) -> Result<(), TxError> {
        // Ack receipt first: processing is idempotent, the sender's
        // retry loop needs the ack row, not the outcome.
        self.transport.send_ack(from_node, message_id, None).await?;

        let request = envelope.request;
        let contract = self.domains.smart_contract(&request.transaction.contract)?;
        let ctx = self
            .store
            .new_context(&request.transaction.domain, request.transaction.contract);
        let outcome = contract.endorse_transaction(&ctx, &request).await;
        ctx.close();

        let response = match outcome? {
            EndorseOutcome::Reject { reason } => EndorsementResponse {
                transaction: request.transaction.id,
                attestation: None,
                rejection: Some(reason),
                endorser_submit: false,
            },
            approved => {
                let (payload, endorser_submit) = match approved {
                    EndorseOutcome::Approve { payload } => (payload, false),
                    EndorseOutcome::EndorserSubmit { payload } => (payload, true),
                    EndorseOutcome::Reject { .. } => unreachable!("handled above"),
                };
                let endorser = IdentityLocator::parse(&request.endorser.lookup)
                    .map_err(TxError::Validation)?;
                let signature = self.signer.sign(
                    &endorser.identity,
                    &request.attestation_request.algorithm,
                    &payload,
                )?;
                EndorsementResponse {
                    transaction: request.transaction.id,
                    attestation: Some(AttestationResult {
                        name: request.attestation_request.name.clone(),
                        attestation_type: AttestationType::Endorse,
                        verifier: request.endorser.clone(),
                        payload: signature,
                    }),
                    rejection: None,
                    endorser_submit,
                }
            }
        };

        let reply = WireMessage::json(
            Component::TransactionEngine,
            MSG_ENDORSEMENT_RESPONSE,
            &response,
        )?
        .correlated(message_id);
        self.transport.send_fire_and_forget(from_node, reply).await?;
        Ok(())
    }

    // -- State distribution receive path -------------------------------------

    async fn receive_state_distribution(
        self: &Arc<Self>,
        from_node: &str,
        message_id: Uuid,
        distribution: StateDistribution,
    ) -> Result<(), TxError> {
        let data = distribution
            .data
            .clone()
            .ok_or_else(|| TxError::Validation("state distribution without data".to_string()))?;

        let received = ReceivedState {
            id: distribution.state_id.clone(),
            schema: distribution.schema,
            data,
        };
        let domain = self.domains.get_domain(&distribution.domain)?;
        let ids = if domain.custom_hash_function() {
            // The domain fills nil ids and validates provided ones.
            domain.validate_state_hashes(std::slice::from_ref(&received)).await?
        } else {
            self.store
                .resolve_default_ids(&distribution.domain, std::slice::from_ref(&received))?
        };

        let written = self.store.write_received_states(
            &distribution.domain,
            &distribution.contract,
            vec![(ids[0].clone(), received.schema, received.data)],
            now_millis(),
        )?;
        debug!(
            from = from_node,
            state = %written[0],
            "received distributed state"
        );

        // Ack only after the state is durable: at-least-once delivery,
        // the write itself is the idempotent part.
        self.transport.send_ack(from_node, message_id, None).await?;
        Ok(())
    }

    async fn receive_receipt_distribution(
        self: &Arc<Self>,
        from_node: &str,
        message_id: Uuid,
        distribution: ReceiptDistribution,
    ) -> Result<(), TxError> {
        self.db.transaction(|txn| {
            self.stage_receipt(txn, &distribution.receipt)?;
            // Flip our copies of the states to their final status; a
            // marker for a state we have not received yet is harmless,
            // the state becomes available the moment it arrives.
            if let (Some(domain), Some(contract)) = (&distribution.domain, distribution.contract) {
                if distribution.receipt.success {
                    self.store.stage_finality(
                        txn,
                        domain,
                        &contract,
                        distribution.transaction,
                        &distribution.confirmed_states,
                        &distribution.spent_states,
                    )?;
                }
            }
            Ok::<(), TxError>(())
        })?;
        self.transport.send_ack(from_node, message_id, None).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Inbound dispatch
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl InboundHandler for Coordinator {
    async fn handle(&self, from_node: &str, message: WireMessage) {
        // The manager hands us an Arc; recover it for the async paths.
        let this = match self.self_arc() {
            Some(arc) => arc,
            None => return,
        };
        let result: Result<(), TxError> = match message.message_type.as_str() {
            MSG_STATE_DISTRIBUTION => match message.parse_payload::<StateDistribution>() {
                Ok(distribution) => {
                    this.receive_state_distribution(from_node, message.message_id, distribution)
                        .await
                }
                Err(e) => Err(e.into()),
            },
            MSG_ENDORSEMENT_REQUEST => match message.parse_payload::<EndorsementEnvelope>() {
                Ok(envelope) => {
                    this.process_endorsement_request(from_node, message.message_id, envelope)
                        .await
                }
                Err(e) => Err(e.into()),
            },
            MSG_ENDORSEMENT_RESPONSE => {
                if let Some(correlation) = message.correlation_id {
                    if let Some((_, waiter)) = this.pending_endorsements.remove(&correlation) {
                        let outcome = message
                            .parse_payload::<EndorsementResponse>()
                            .map_err(TxError::from);
                        let _ = waiter.send(outcome);
                    }
                }
                Ok(())
            }
            MSG_RECEIPT_DISTRIBUTION => match message.parse_payload::<ReceiptDistribution>() {
                Ok(distribution) => {
                    this.receive_receipt_distribution(from_node, message.message_id, distribution)
                        .await
                }
                Err(e) => Err(e.into()),
            },
            other => {
                warn!(from = from_node, message_type = other, "unhandled engine message");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(
                from = from_node,
                message_type = %message.message_type,
                "inbound message handling failed: {}", e
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Reliable message building
// ---------------------------------------------------------------------------

impl ReliableMessageBuilder for Coordinator {
    fn build(&self, message: &ReliableMessage) -> Result<BuildOutcome, TransportError> {
        match message.kind {
            ReliableMessageKind::StateDistribution => {
                let mut distribution: StateDistribution = serde_json::from_str(&message.metadata)
                    .map_err(|e| TransportError::BadPayload(e.to_string()))?;
                let Some(state_id) = distribution.state_id.clone() else {
                    return Ok(BuildOutcome::Permanent(
                        "state distribution metadata without id".to_string(),
                    ));
                };
                let state = self
                    .store
                    .get_state(&distribution.domain, &distribution.contract, &state_id)
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?;
                let Some(state) = state else {
                    // Not available locally: a data error, never resendable.
                    return Ok(BuildOutcome::Permanent(format!(
                        "state {} not available locally",
                        state_id
                    )));
                };
                distribution.data = Some(state.data);
                // Custom-hash domains defer id computation to the receiver.
                let custom_hash = self
                    .domains
                    .get_domain(&distribution.domain)
                    .map(|d| d.custom_hash_function())
                    .unwrap_or(false);
                if custom_hash {
                    distribution.state_id = None;
                }
                let wire = WireMessage::json(
                    Component::ReliableMessageHandler,
                    MSG_STATE_DISTRIBUTION,
                    &distribution,
                )?;
                Ok(BuildOutcome::Message(wire))
            }
            ReliableMessageKind::Endorsement => {
                let envelope: EndorsementEnvelope = match serde_json::from_str(&message.metadata) {
                    Ok(envelope) => envelope,
                    Err(e) => return Ok(BuildOutcome::Permanent(e.to_string())),
                };
                let wire = WireMessage::json(
                    Component::ReliableMessageHandler,
                    MSG_ENDORSEMENT_REQUEST,
                    &envelope,
                )?;
                Ok(BuildOutcome::Message(wire))
            }
            ReliableMessageKind::Receipt => {
                let distribution: ReceiptDistribution = match serde_json::from_str(&message.metadata)
                {
                    Ok(d) => d,
                    Err(e) => return Ok(BuildOutcome::Permanent(e.to_string())),
                };
                let wire = WireMessage::json(
                    Component::ReliableMessageHandler,
                    MSG_RECEIPT_DISTRIBUTION,
                    &distribution,
                )?;
                Ok(BuildOutcome::Message(wire))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Arc recovery for the handler seam
// ---------------------------------------------------------------------------

impl Coordinator {
    /// The transport hands `&self` into handlers; the async paths need
    /// the owning `Arc` back.
    fn self_arc(&self) -> Option<Arc<Self>> {
        self.weak_self.upgrade()
    }
}
