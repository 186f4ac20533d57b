//! The private transaction pipeline, as run on a sequencer slot.
//!
//! Invoke: open a domain context → Init → resolve verifiers → Assemble
//! → write potential states and locks into the context → gather the
//! attestation plan (local signatures through the signing module,
//! remote endorsements over the reliable channel) → Prepare → flush
//! the overlay and commit the dispatch + public staging + state
//! distributions in one transaction. Deploy skips Assemble and parks
//! on the registration event.
//!
//! Assemble is idempotent over its inputs, so a transient failure
//! anywhere in an attempt resets the context and re-assembles from
//! scratch; a domain revert or an endorsement rejection fails the
//! transaction with a receipt carrying the reason.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::abi::AbiResolver;
use crate::domains::{
    Assembly, AttestationRequest, AttestationResult, AttestationType, DeploySpec, DomainError,
    DomainSmartContract, EndorsableState, EndorseOutcome, EndorseRequest, PrepareInput,
    PrepareResult, PreparedCall, PrivateTxSpec, ResolvedVerifier, StateRef, VerifierRequest,
};
use crate::error::Classified;
use crate::publictx::PublicTxInput;
use crate::states::{DomainContext, LockKind, StateLock, StateUpsert};
use crate::storage::Table;
use crate::transport::ReliableMessageKind;
use crate::types::{IdentityLocator, LedgerAddress};

use super::manager::{
    Coordinator, PendingDispatch, StateDistribution, StateDistributionRow,
};
use super::{DispatchRow, StoredTransaction, TransactionInput, TxError, TxType};

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run one transaction to dispatch (or to a failure receipt). Errors
/// that are not retryable become the transaction's receipt; everything
/// else was already retried up to the configured attempt count.
pub(crate) async fn process(coordinator: &Arc<Coordinator>, id: Uuid) {
    match run(coordinator, id).await {
        Ok(()) => {}
        Err(e) => {
            warn!(transaction = %id, kind = %e.kind(), "private transaction failed: {}", e);
            if let Err(receipt_err) = coordinator.write_failure_receipt(id, &e.to_string()) {
                warn!(transaction = %id, "failure receipt could not be written: {}", receipt_err);
            }
        }
    }
}

async fn run(coordinator: &Arc<Coordinator>, id: Uuid) -> Result<(), TxError> {
    let row = coordinator
        .get_transaction(id)?
        .ok_or(TxError::NotFound(id))?;
    debug_assert_eq!(row.tx_type, TxType::Private);
    let domain_name = row.domain.clone().ok_or(TxError::MissingDomain)?;

    match row.to {
        None => run_deploy(coordinator, &row, &domain_name).await,
        Some(to) => run_invoke(coordinator, &row, &domain_name, to).await,
    }
}

fn parse_inputs(row: &StoredTransaction) -> Result<Value, TxError> {
    serde_json::from_str(&row.data).map_err(|e| TxError::Validation(e.to_string()))
}

async fn resolve_verifiers(
    coordinator: &Arc<Coordinator>,
    requests: &[VerifierRequest],
) -> Result<Vec<ResolvedVerifier>, TxError> {
    let mut verifiers = Vec::with_capacity(requests.len());
    for request in requests {
        let verifier = coordinator
            .identity
            .resolve(&request.lookup, &request.algorithm, &request.verifier_type)
            .await?;
        verifiers.push(ResolvedVerifier {
            lookup: request.lookup.clone(),
            algorithm: request.algorithm.clone(),
            verifier_type: request.verifier_type.clone(),
            verifier,
        });
    }
    Ok(verifiers)
}

/// The local identity that signs the prepared public call.
fn submission_identity(
    coordinator: &Coordinator,
    required_signer: Option<&str>,
) -> Result<String, TxError> {
    match required_signer {
        None => Ok(coordinator.config.submitter_identity.clone()),
        Some(signer) => {
            let locator = IdentityLocator::parse(signer).map_err(TxError::Validation)?;
            if !locator.is_local(&coordinator.node_name) {
                return Err(TxError::Validation(format!(
                    "required signer {:?} is not local",
                    signer
                )));
            }
            Ok(locator.identity)
        }
    }
}

fn prepared_call_data(call: &PreparedCall) -> Result<Value, TxError> {
    let normalized = AbiResolver::normalize_inputs(&call.function, &call.inputs)?;
    Ok(json!({
        "function": call.function.signature(),
        "inputs": normalized,
    }))
}

// ---------------------------------------------------------------------------
// Deploy pathway
// ---------------------------------------------------------------------------

async fn run_deploy(
    coordinator: &Arc<Coordinator>,
    row: &StoredTransaction,
    domain_name: &str,
) -> Result<(), TxError> {
    let domain = coordinator.domains.get_domain(domain_name)?;
    let deploy = DeploySpec {
        id: row.id,
        domain: domain_name.to_string(),
        from: row.from.clone(),
        inputs: parse_inputs(row)?,
    };

    let requests = domain.init_deploy(&deploy).await?;
    let verifiers = resolve_verifiers(coordinator, &requests).await?;
    let prepared = domain.prepare_deploy(&deploy, &verifiers).await?;

    let from = submission_identity(coordinator, prepared.call.required_signer.as_deref())?;
    // The on-chain deploy data carries the domain and the deploying
    // transaction id — that is how the deployment event routes back to
    // the right domain and wakes the registration waiter.
    let mut data = prepared_call_data(&prepared.call)?;
    data["domain"] = json!(domain_name);
    data["deployTransaction"] = json!(row.id.to_string());
    let gas_limit = coordinator.config.default_gas_limit;

    // Single-flight on the registration event: submit inside the
    // waiter so concurrent lookups all park on the same transaction.
    let id = row.id;
    let submitter = Arc::clone(coordinator);
    let contract = coordinator
        .domains
        .exec_deploy_and_wait(id, move || async move {
            submitter
                .db
                .transaction(|txn| {
                    let (sender, local_id) = submitter.publictx.stage_submission(
                        txn,
                        &PublicTxInput {
                            from: from.clone(),
                            to: None,
                            data: data.clone(),
                            gas_limit,
                            bindings: vec![id],
                        },
                    )?;
                    txn.put(
                        Table::Dispatches,
                        id.as_bytes(),
                        &DispatchRow {
                            private_transaction: id,
                            sender,
                            public_local_id: local_id,
                        },
                    )?;
                    Ok::<(), TxError>(())
                })
                .map_err(|e| DomainError::Transient(e.to_string()))
        })
        .await?;

    info!(
        transaction = %row.id,
        domain = domain_name,
        contract = %contract.address(),
        "private contract deployed"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Invoke pathway
// ---------------------------------------------------------------------------

async fn run_invoke(
    coordinator: &Arc<Coordinator>,
    row: &StoredTransaction,
    domain_name: &str,
    to: LedgerAddress,
) -> Result<(), TxError> {
    let handle = coordinator.domains.smart_contract(&to)?;
    let spec = PrivateTxSpec {
        id: row.id,
        domain: domain_name.to_string(),
        contract: to,
        from: row.from.clone(),
        function: row.function.clone(),
        inputs: parse_inputs(row)?,
    };

    // The contract's shared context: earlier in-flight transactions'
    // locks and unconfirmed outputs are visible to this assembly.
    let ctx = coordinator.context_for(&spec.domain, spec.contract);

    let attempts = coordinator.config.assemble_attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match drive_invoke(coordinator, &ctx, &handle, &spec).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                // This transaction's footprint leaves the shared
                // context; other transactions' locks stay.
                ctx.clear_transactions(&[spec.id]);
                if matches!(&e, TxError::State(crate::states::StateError::FlushFailed(_))) {
                    warn!(transaction = %row.id, "flush failure poisoned the context, resetting");
                    ctx.reset();
                }
                if e.is_retryable() && attempt < attempts {
                    warn!(
                        transaction = %row.id,
                        attempt,
                        "attempt failed, re-assembling from scratch: {}", e
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(
                        coordinator.config.attempt_backoff_ms,
                    ))
                    .await;
                    last_error = Some(e);
                } else {
                    return Err(e);
                }
            }
        }
    }
    Err(last_error.unwrap_or(TxError::Stopped))
}

async fn drive_invoke(
    coordinator: &Arc<Coordinator>,
    ctx: &Arc<DomainContext>,
    handle: &DomainSmartContract,
    spec: &PrivateTxSpec,
) -> Result<(), TxError> {
    // Init → verifier resolution → Assemble.
    let requests = handle.init_transaction(spec).await?;
    let verifiers = resolve_verifiers(coordinator, &requests).await?;

    let assembly = match handle.assemble_transaction(ctx, spec, &verifiers).await? {
        crate::domains::AssembleResult::Revert { reason } => {
            return Err(TxError::Domain(DomainError::Permanent(reason)));
        }
        crate::domains::AssembleResult::Ok(assembly) => assembly,
    };
    debug!(
        transaction = %spec.id,
        inputs = assembly.input_states.len(),
        outputs = assembly.output_states.len(),
        "transaction assembled"
    );

    // Candidate output states enter the overlay under our create lock.
    let upserts: Vec<StateUpsert> = assembly
        .output_states
        .iter()
        .map(|state| StateUpsert {
            id: state.id.clone(),
            schema: state.schema,
            data: state.data.clone(),
            created_by: Some(spec.id),
        })
        .collect();
    let outputs = ctx.upsert_states(upserts)?;

    // Inputs are spend-locked, reads read-locked.
    let mut locks = Vec::new();
    for input in &assembly.input_states {
        locks.push(StateLock {
            state: input.id.clone(),
            transaction: spec.id,
            kind: LockKind::Spend,
        });
    }
    for read in &assembly.read_states {
        locks.push(StateLock {
            state: read.id.clone(),
            transaction: spec.id,
            kind: LockKind::Read,
        });
    }
    ctx.add_state_locks(locks)?;

    // Full state bodies for endorsers and receipts.
    let input_states = load_endorsable(coordinator, ctx, spec, &assembly.input_states)?;
    let read_states = load_endorsable(coordinator, ctx, spec, &assembly.read_states)?;
    let output_states: Vec<EndorsableState> = outputs
        .iter()
        .map(|state| EndorsableState {
            id: state.id.clone(),
            schema: state.schema,
            data: state.data.clone(),
        })
        .collect();

    // Gather the attestation plan.
    let mut signatures = Vec::new();
    let mut endorsements = Vec::new();
    let mut endorser_submit: Option<String> = None;
    for request in &assembly.attestation_plan {
        match request.attestation_type {
            AttestationType::Sign => {
                for party in &request.parties {
                    signatures.push(local_signature(coordinator, &verifiers, request, party)?);
                }
            }
            AttestationType::Endorse => {
                for party in &request.parties {
                    let endorse_request = EndorseRequest {
                        transaction: spec.clone(),
                        verifiers: verifiers.clone(),
                        signatures: signatures.clone(),
                        input_states: input_states.clone(),
                        read_states: read_states.clone(),
                        output_states: output_states.clone(),
                        attestation_request: request.clone(),
                        endorser: find_verifier(&verifiers, party)?.clone(),
                    };
                    let (attestation, takes_over) =
                        gather_endorsement(coordinator, handle, ctx, &endorse_request, party)
                            .await?;
                    if takes_over {
                        endorser_submit = Some(party.clone());
                    }
                    endorsements.push(attestation);
                }
            }
        }
    }

    // Prepare.
    let prepare_input = PrepareInput {
        input_states: input_states.clone(),
        read_states,
        output_states: output_states.clone(),
        signatures,
        endorsements,
    };
    let prepared = handle.prepare_transaction(spec, &prepare_input).await?;

    match prepared {
        PrepareResult::PublicCall(mut call) => {
            // An endorser-submit endorsement reassigns the signer.
            if let Some(party) = endorser_submit {
                call.required_signer = Some(party);
            }
            dispatch_public(
                coordinator,
                ctx,
                spec,
                &assembly,
                &call,
                input_states,
                output_states,
            )
            .await
        }
        PrepareResult::ChainedPrivate(chained) => {
            // Flush whatever the assembly produced, then hand the baton
            // to the chained transaction.
            flush_context(ctx).await?;
            let chained_id = coordinator
                .submit_transaction(TransactionInput {
                    tx_type: TxType::Private,
                    domain: Some(chained.domain),
                    from: chained.from,
                    to: chained.to,
                    function: Some(chained.function),
                    abi: None,
                    abi_reference: None,
                    data: chained.inputs,
                    idempotency_key: Some(chained.idempotency_key),
                    depends_on: vec![spec.id],
                    gas_limit: None,
                })
                .await?;
            info!(transaction = %spec.id, chained = %chained_id, "prepared a chained private transaction");

            let receipt = super::TransactionReceipt {
                transaction: spec.id,
                indexed: crate::types::now_millis(),
                success: true,
                failure: None,
                location: None,
                contract_address: None,
                domain_receipt: None,
                domain_receipt_error: None,
            };
            coordinator
                .db
                .transaction(|txn| coordinator.stage_receipt(txn, &receipt))?;
            ctx.clear_transactions(&[spec.id]);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Attestations
// ---------------------------------------------------------------------------

fn local_signature(
    coordinator: &Coordinator,
    verifiers: &[ResolvedVerifier],
    request: &AttestationRequest,
    party: &str,
) -> Result<AttestationResult, TxError> {
    let locator = IdentityLocator::parse(party).map_err(TxError::Validation)?;
    if !locator.is_local(&coordinator.node_name) {
        return Err(TxError::Validation(format!(
            "signature party {:?} is not local to the assembling node",
            party
        )));
    }
    let signature =
        coordinator
            .signer
            .sign(&locator.identity, &request.algorithm, &request.payload)?;
    Ok(AttestationResult {
        name: request.name.clone(),
        attestation_type: AttestationType::Sign,
        verifier: find_verifier(verifiers, party)?.clone(),
        payload: signature,
    })
}

fn find_verifier<'a>(
    verifiers: &'a [ResolvedVerifier],
    party: &str,
) -> Result<&'a ResolvedVerifier, TxError> {
    verifiers
        .iter()
        .find(|v| v.lookup == party)
        .ok_or_else(|| TxError::Validation(format!("no resolved verifier for party {:?}", party)))
}

/// One endorsement: local parties run the domain in place, remote
/// parties go over the reliable channel. Returns the attestation plus
/// whether the endorser takes over submission.
async fn gather_endorsement(
    coordinator: &Arc<Coordinator>,
    handle: &DomainSmartContract,
    ctx: &Arc<DomainContext>,
    request: &EndorseRequest,
    party: &str,
) -> Result<(AttestationResult, bool), TxError> {
    let locator = IdentityLocator::parse(party).map_err(TxError::Validation)?;

    if locator.is_local(&coordinator.node_name) {
        let outcome = handle.endorse_transaction(ctx, request).await?;
        return match outcome {
            EndorseOutcome::Approve { payload } => {
                let signature = coordinator.signer.sign(
                    &locator.identity,
                    &request.attestation_request.algorithm,
                    &payload,
                )?;
                Ok((
                    AttestationResult {
                        name: request.attestation_request.name.clone(),
                        attestation_type: AttestationType::Endorse,
                        verifier: request.endorser.clone(),
                        payload: signature,
                    },
                    false,
                ))
            }
            EndorseOutcome::EndorserSubmit { payload } => {
                let signature = coordinator.signer.sign(
                    &locator.identity,
                    &request.attestation_request.algorithm,
                    &payload,
                )?;
                Ok((
                    AttestationResult {
                        name: request.attestation_request.name.clone(),
                        attestation_type: AttestationType::Endorse,
                        verifier: request.endorser.clone(),
                        payload: signature,
                    },
                    true,
                ))
            }
            EndorseOutcome::Reject { reason } => Err(TxError::EndorsementRejected {
                party: party.to_string(),
                reason,
            }),
        };
    }

    let node = locator.node_or(&coordinator.node_name).to_string();
    let response = coordinator
        .request_remote_endorsement(&node, request)
        .await?;
    if let Some(reason) = response.rejection {
        return Err(TxError::EndorsementRejected {
            party: party.to_string(),
            reason,
        });
    }
    let attestation = response.attestation.ok_or_else(|| {
        TxError::Validation(format!("empty endorsement response from {:?}", party))
    })?;
    Ok((attestation, response.endorser_submit))
}

// ---------------------------------------------------------------------------
// State loading & dispatch
// ---------------------------------------------------------------------------

fn load_endorsable(
    coordinator: &Coordinator,
    ctx: &DomainContext,
    spec: &PrivateTxSpec,
    refs: &[StateRef],
) -> Result<Vec<EndorsableState>, TxError> {
    let mut states = Vec::with_capacity(refs.len());
    for state_ref in refs {
        let state = match coordinator.store.get_state(
            &spec.domain,
            &spec.contract,
            &state_ref.id,
        )? {
            Some(state) => state,
            None => ctx.get_created(&state_ref.id).ok_or_else(|| {
                TxError::Validation(format!("assembled state {} is unknown", state_ref.id))
            })?,
        };
        states.push(EndorsableState {
            id: state.id,
            schema: state.schema,
            data: state.data,
        });
    }
    Ok(states)
}

async fn flush_context(ctx: &Arc<DomainContext>) -> Result<(), TxError> {
    let (sender, receiver) = tokio::sync::oneshot::channel();
    ctx.initiate_flush(move |err| {
        let _ = sender.send(err);
    })?;
    match receiver.await {
        Ok(None) => Ok(()),
        Ok(Some(e)) => Err(e.into()),
        Err(_) => Err(TxError::Stopped),
    }
}

/// Commit the dispatch: flush the overlay, then in one transaction the
/// dispatch row, the public staging and the reliable distributions.
async fn dispatch_public(
    coordinator: &Arc<Coordinator>,
    ctx: &Arc<DomainContext>,
    spec: &PrivateTxSpec,
    assembly: &Assembly,
    call: &PreparedCall,
    input_states: Vec<EndorsableState>,
    output_states: Vec<EndorsableState>,
) -> Result<(), TxError> {
    flush_context(ctx).await?;

    let from = submission_identity(coordinator, call.required_signer.as_deref())?;
    let data = prepared_call_data(call)?;
    let gas_limit = coordinator.config.default_gas_limit;
    let id = spec.id;

    let receipt_to: Vec<String> = assembly
        .output_states
        .iter()
        .flat_map(|output| output.distribute_to.iter())
        .filter(|node| *node != &coordinator.node_name)
        .cloned()
        .fold(Vec::new(), |mut nodes, node| {
            if !nodes.contains(&node) {
                nodes.push(node);
            }
            nodes
        });

    // Register the finalisation bookkeeping *before* the commit that
    // stages the public submission: a fast chain can confirm the
    // public transaction the instant it becomes durable.
    coordinator.pending_dispatches.insert(
        id,
        PendingDispatch {
            context: Some(Arc::clone(ctx)),
            domain: spec.domain.clone(),
            contract: Some(spec.contract),
            confirmed: output_states,
            spent: input_states,
            receipt_to: receipt_to.clone(),
        },
    );

    let committed = coordinator.db.transaction(|txn| {
        let (sender, local_id) = coordinator.publictx.stage_submission(
            txn,
            &PublicTxInput {
                from: from.clone(),
                to: Some(spec.contract),
                data: data.clone(),
                gas_limit,
                bindings: vec![id],
            },
        )?;
        txn.put(
            Table::Dispatches,
            id.as_bytes(),
            &DispatchRow {
                private_transaction: id,
                sender,
                public_local_id: local_id,
            },
        )?;

        // Reliable state distribution to every named participant node.
        for output in &assembly.output_states {
            let Some(state_id) = output.id.clone() else {
                continue;
            };
            for node in &output.distribute_to {
                if node == &coordinator.node_name {
                    continue;
                }
                let metadata = StateDistribution {
                    domain: spec.domain.clone(),
                    contract: spec.contract,
                    schema: output.schema,
                    state_id: Some(state_id.clone()),
                    data: None,
                };
                let message_id = coordinator.transport.queue_reliable(
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
                        state: state_id.clone(),
                        node: node.clone(),
                        transaction: id,
                    },
                )?;
            }
        }
        Ok::<(), TxError>(())
    });
    if let Err(e) = committed {
        coordinator.pending_dispatches.remove(&id);
        return Err(e);
    }

    // The context stays open (locks held by this transaction) until
    // the confirmation lands and `clear_transactions` releases them.
    info!(transaction = %id, "private transaction dispatched to public orchestrator");
    Ok(())
}
