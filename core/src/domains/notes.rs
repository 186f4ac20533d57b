//! The reference "notes" domain: a UTXO token.
//!
//! Coins are states `{owner, amount, salt}` owned by a verifier key.
//! `mint` creates coins out of thin air (deploy config names the notary
//! allowed to receive the contract), `transfer` selects the sender's
//! smallest coins first, produces a recipient coin plus change, and
//! requires a sender signature and a recipient endorsement before the
//! prepared public call may be submitted.
//!
//! The domain also doubles as the custom-hash test vehicle: with
//! `custom_hash` configured, state ids are the SHA-256 of the canonical
//! coin data alone, and the store routes received states through
//! [`NotesDomain::validate_state_hashes`] to fill and check them.

use async_trait::async_trait;
use rand::RngCore;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::abi::{AbiFunction, AbiParam, AbiType};
use crate::filters::{LabelKind, Query};
use crate::keys::signer::{SigningModule, ALGORITHM_ED25519, VERIFIER_PUBLIC_KEY_HEX};
use crate::states::schema::canonical_json;
use crate::states::store::ReceivedState;
use crate::states::{DomainContext, FieldDef, Schema, SchemaDeclaration};
use crate::types::{IdentityLocator, LedgerAddress, LedgerEvent, StateId};

use super::{
    AssembleResult, Assembly, AttestationRequest, AttestationType, ContractRegistration,
    DeploySpec, Domain, DomainCapabilities, DomainError, EndorsableState, EndorseOutcome,
    EndorseRequest, EventHandling, NewState, PrepareInput, PrepareResult, PreparedCall,
    PreparedDeploy, PrivateTxSpec, ResolvedVerifier, StateRef, TransactionStates, VerifierRequest,
};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct NotesConfig {
    /// Use the domain's own state-id rule instead of the store default.
    pub custom_hash: bool,
}

// ---------------------------------------------------------------------------
// NotesDomain
// ---------------------------------------------------------------------------

pub struct NotesDomain {
    name: String,
    config: NotesConfig,
    coin_schema: Schema,
}

fn coin_declaration() -> SchemaDeclaration {
    SchemaDeclaration {
        name: "coin".to_string(),
        fields: vec![
            FieldDef::indexed("owner", LabelKind::String),
            FieldDef::indexed("amount", LabelKind::Uint256),
            FieldDef::opaque("salt", LabelKind::HexBytes),
        ],
    }
}

impl NotesDomain {
    pub fn new(name: &str, config: NotesConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            coin_schema: Schema::new(name, coin_declaration()),
        }
    }

    pub fn coin_schema_id(&self) -> crate::types::SchemaId {
        self.coin_schema.id
    }

    fn coin_data(owner_verifier: &str, amount: u128) -> Value {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        json!({
            "owner": owner_verifier,
            "amount": amount.to_string(),
            "salt": format!("0x{}", hex::encode(salt)),
        })
    }

    fn coin_id(&self, data: &Value) -> StateId {
        if self.config.custom_hash {
            Self::custom_coin_id(data)
        } else {
            self.coin_schema.default_state_id(data)
        }
    }

    /// The custom rule: hash of the data alone, no schema prefix.
    fn custom_coin_id(data: &Value) -> StateId {
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(data).as_bytes());
        StateId::new(hasher.finalize().to_vec())
    }

    fn parse_amount(inputs: &Value, field: &str) -> Result<u128, DomainError> {
        inputs
            .get(field)
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<u128>().ok())
            .ok_or_else(|| {
                DomainError::BadTransaction(format!("missing or invalid {:?} amount", field))
            })
    }

    fn coin_amount(data: &Value) -> Result<u128, DomainError> {
        data.get("amount")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<u128>().ok())
            .ok_or_else(|| DomainError::BadTransaction("coin without a valid amount".to_string()))
    }

    fn coin_owner(data: &Value) -> Result<&str, DomainError> {
        data.get("owner")
            .and_then(Value::as_str)
            .ok_or_else(|| DomainError::BadTransaction("coin without an owner".to_string()))
    }

    fn verifier_for<'a>(
        verifiers: &'a [ResolvedVerifier],
        lookup: &str,
    ) -> Result<&'a ResolvedVerifier, DomainError> {
        verifiers.iter().find(|v| v.lookup == lookup).ok_or_else(|| {
            DomainError::BadTransaction(format!("no resolved verifier for {:?}", lookup))
        })
    }

    fn verifier_request(lookup: &str) -> VerifierRequest {
        VerifierRequest {
            lookup: lookup.to_string(),
            algorithm: ALGORITHM_ED25519.to_string(),
            verifier_type: VERIFIER_PUBLIC_KEY_HEX.to_string(),
        }
    }

    /// The payload both the sender signature and the recipient
    /// endorsement commit to: SHA-256 over input ids then output ids.
    fn attestation_payload(input_ids: &[StateId], output_ids: &[StateId]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        for id in input_ids {
            hasher.update(id.as_bytes());
        }
        hasher.update([0u8]);
        for id in output_ids {
            hasher.update(id.as_bytes());
        }
        hasher.finalize().to_vec()
    }

    fn concat_ids(states: &[EndorsableState]) -> String {
        let mut bytes = Vec::new();
        for s in states {
            bytes.extend_from_slice(s.id.as_bytes());
        }
        format!("0x{}", hex::encode(bytes))
    }

    fn bare_name(function: &str) -> &str {
        function.split('(').next().unwrap_or(function)
    }
}

#[async_trait]
impl Domain for NotesDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn custom_hash_function(&self) -> bool {
        self.config.custom_hash
    }

    async fn configure(&self, _config: &Value) -> Result<DomainCapabilities, DomainError> {
        Ok(DomainCapabilities {
            schemas: vec![coin_declaration()],
        })
    }

    async fn init_contract(
        &self,
        _address: LedgerAddress,
        config: &Value,
    ) -> Result<Value, DomainError> {
        let notary = config
            .get("notary")
            .and_then(Value::as_str)
            .ok_or_else(|| DomainError::ConfigInvalid("missing notary".to_string()))?;
        Ok(json!({ "notary": notary }))
    }

    // -- Deploy -------------------------------------------------------------

    async fn init_deploy(&self, deploy: &DeploySpec) -> Result<Vec<VerifierRequest>, DomainError> {
        let notary = deploy
            .inputs
            .get("notary")
            .and_then(Value::as_str)
            .unwrap_or(&deploy.from);
        Ok(vec![Self::verifier_request(notary)])
    }

    async fn prepare_deploy(
        &self,
        deploy: &DeploySpec,
        verifiers: &[ResolvedVerifier],
    ) -> Result<PreparedDeploy, DomainError> {
        let notary = deploy
            .inputs
            .get("notary")
            .and_then(Value::as_str)
            .unwrap_or(&deploy.from);
        let notary_verifier = Self::verifier_for(verifiers, notary)?;
        Ok(PreparedDeploy {
            call: PreparedCall {
                function: AbiFunction::constructor(vec![AbiParam {
                    name: "notary".to_string(),
                    kind: AbiType::String,
                }]),
                inputs: json!({ "notary": notary_verifier.verifier }),
                required_signer: Some(deploy.from.clone()),
            },
        })
    }

    // -- Transactions -------------------------------------------------------

    async fn init_transaction(
        &self,
        tx: &PrivateTxSpec,
    ) -> Result<Vec<VerifierRequest>, DomainError> {
        match Self::bare_name(&tx.function) {
            "transfer" | "mint" => {
                let to = tx
                    .inputs
                    .get("to")
                    .and_then(Value::as_str)
                    .ok_or_else(|| DomainError::BadTransaction("missing 'to'".to_string()))?;
                Ok(vec![
                    Self::verifier_request(&tx.from),
                    Self::verifier_request(to),
                ])
            }
            other => Err(DomainError::BadTransaction(format!(
                "unknown function {:?}",
                other
            ))),
        }
    }

    async fn assemble_transaction(
        &self,
        ctx: &DomainContext,
        tx: &PrivateTxSpec,
        verifiers: &[ResolvedVerifier],
    ) -> Result<AssembleResult, DomainError> {
        let to_lookup = tx
            .inputs
            .get("to")
            .and_then(Value::as_str)
            .ok_or_else(|| DomainError::BadTransaction("missing 'to'".to_string()))?;
        let to_node = IdentityLocator::parse(to_lookup)
            .map_err(DomainError::BadTransaction)?
            .node;
        let sender = Self::verifier_for(verifiers, &tx.from)?.clone();
        let recipient = Self::verifier_for(verifiers, to_lookup)?.clone();
        let amount = Self::parse_amount(&tx.inputs, "amount")?;

        let (input_refs, input_ids, total_in) = match Self::bare_name(&tx.function) {
            "mint" => (Vec::new(), Vec::new(), amount),
            "transfer" => {
                // Smallest coins first, so dust gets consolidated.
                let query = Query::build()
                    .eq("owner", json!(sender.verifier))
                    .sort("amount")
                    .query();
                let available = ctx.find_available_states(&self.coin_schema.id, &query)?;

                let mut selected = Vec::new();
                let mut total = 0u128;
                for coin in &available {
                    total += Self::coin_amount(&coin.state.data)?;
                    selected.push(coin);
                    if total >= amount {
                        break;
                    }
                }
                if total < amount {
                    return Ok(AssembleResult::Revert {
                        reason: format!("insufficient funds (available={})", total),
                    });
                }
                let refs = selected
                    .iter()
                    .map(|c| StateRef {
                        id: c.state.id.clone(),
                        schema: c.state.schema,
                    })
                    .collect::<Vec<_>>();
                let ids = selected.iter().map(|c| c.state.id.clone()).collect();
                (refs, ids, total)
            }
            other => {
                return Err(DomainError::BadTransaction(format!(
                    "unknown function {:?}",
                    other
                )))
            }
        };

        // Outputs: recipient coin, plus change back to the sender.
        let mut outputs = Vec::new();
        let mut output_ids = Vec::new();
        let mut push_output = |owner: &ResolvedVerifier, value: u128, distribute: Option<&str>| {
            let data = Self::coin_data(&owner.verifier, value);
            let id = self.coin_id(&data);
            output_ids.push(id.clone());
            outputs.push(NewState {
                id: Some(id),
                schema: self.coin_schema.id,
                data,
                distribute_to: distribute.map(|n| vec![n.to_string()]).unwrap_or_default(),
            });
        };
        push_output(&recipient, amount, to_node.as_deref());
        if total_in > amount {
            push_output(&sender, total_in - amount, None);
        }

        let payload = Self::attestation_payload(&input_ids, &output_ids);
        let mut attestation_plan = vec![AttestationRequest {
            name: "sender".to_string(),
            attestation_type: AttestationType::Sign,
            algorithm: ALGORITHM_ED25519.to_string(),
            verifier_type: VERIFIER_PUBLIC_KEY_HEX.to_string(),
            payload: payload.clone(),
            parties: vec![tx.from.clone()],
        }];
        if Self::bare_name(&tx.function) == "transfer" {
            attestation_plan.push(AttestationRequest {
                name: "recipient".to_string(),
                attestation_type: AttestationType::Endorse,
                algorithm: ALGORITHM_ED25519.to_string(),
                verifier_type: VERIFIER_PUBLIC_KEY_HEX.to_string(),
                payload,
                parties: vec![to_lookup.to_string()],
            });
        }

        Ok(AssembleResult::Ok(Assembly {
            input_states: input_refs,
            read_states: Vec::new(),
            output_states: outputs,
            attestation_plan,
        }))
    }

    async fn endorse_transaction(
        &self,
        _ctx: &DomainContext,
        req: &EndorseRequest,
    ) -> Result<EndorseOutcome, DomainError> {
        // Balance check: value in equals value out.
        let mut total_in = 0u128;
        for state in &req.input_states {
            total_in += Self::coin_amount(&state.data)?;
        }
        let mut total_out = 0u128;
        for state in &req.output_states {
            total_out += Self::coin_amount(&state.data)?;
        }
        if !req.input_states.is_empty() && total_in != total_out {
            return Ok(EndorseOutcome::Reject {
                reason: format!("unbalanced transfer: in={} out={}", total_in, total_out),
            });
        }

        // The endorser must actually receive one of the outputs.
        let receives = req
            .output_states
            .iter()
            .any(|s| Self::coin_owner(&s.data).is_ok_and(|o| o == req.endorser.verifier));
        if !receives {
            return Ok(EndorseOutcome::Reject {
                reason: "endorser receives no output".to_string(),
            });
        }

        // Verify the sender's signature over the attestation payload.
        let input_ids: Vec<StateId> = req.input_states.iter().map(|s| s.id.clone()).collect();
        let output_ids: Vec<StateId> = req.output_states.iter().map(|s| s.id.clone()).collect();
        let payload = Self::attestation_payload(&input_ids, &output_ids);
        let Some(signature) = req.signatures.iter().find(|s| s.name == "sender") else {
            return Ok(EndorseOutcome::Reject {
                reason: "missing sender signature".to_string(),
            });
        };
        let valid = SigningModule::verify(
            ALGORITHM_ED25519,
            &signature.verifier.verifier,
            &payload,
            &signature.payload,
        )
        .map_err(|e| DomainError::BadTransaction(e.to_string()))?;
        if !valid {
            return Ok(EndorseOutcome::Reject {
                reason: "invalid sender signature".to_string(),
            });
        }

        Ok(EndorseOutcome::Approve { payload })
    }

    async fn prepare_transaction(
        &self,
        tx: &PrivateTxSpec,
        input: &PrepareInput,
    ) -> Result<PrepareResult, DomainError> {
        let proof = input
            .signatures
            .iter()
            .find(|s| s.name == "sender")
            .map(|s| format!("0x{}", hex::encode(&s.payload)))
            .unwrap_or_else(|| "0x".to_string());

        let call = match Self::bare_name(&tx.function) {
            "mint" => PreparedCall {
                function: AbiFunction::function(
                    "mint",
                    vec![
                        AbiParam {
                            name: "outputs".to_string(),
                            kind: AbiType::Bytes,
                        },
                        AbiParam {
                            name: "proof".to_string(),
                            kind: AbiType::Bytes,
                        },
                    ],
                ),
                inputs: json!({
                    "outputs": Self::concat_ids(&input.output_states),
                    "proof": proof,
                }),
                required_signer: None,
            },
            _ => PreparedCall {
                function: AbiFunction::function(
                    "transfer",
                    vec![
                        AbiParam {
                            name: "inputs".to_string(),
                            kind: AbiType::Bytes,
                        },
                        AbiParam {
                            name: "outputs".to_string(),
                            kind: AbiType::Bytes,
                        },
                        AbiParam {
                            name: "proof".to_string(),
                            kind: AbiType::Bytes,
                        },
                    ],
                ),
                inputs: json!({
                    "inputs": Self::concat_ids(&input.input_states),
                    "outputs": Self::concat_ids(&input.output_states),
                    "proof": proof,
                }),
                required_signer: None,
            },
        };
        Ok(PrepareResult::PublicCall(call))
    }

    // -- Calls --------------------------------------------------------------

    async fn init_call(&self, tx: &PrivateTxSpec) -> Result<Vec<VerifierRequest>, DomainError> {
        let owner = tx
            .inputs
            .get("owner")
            .and_then(Value::as_str)
            .ok_or_else(|| DomainError::BadTransaction("missing 'owner'".to_string()))?;
        Ok(vec![Self::verifier_request(owner)])
    }

    async fn exec_call(
        &self,
        ctx: &DomainContext,
        tx: &PrivateTxSpec,
        verifiers: &[ResolvedVerifier],
    ) -> Result<Value, DomainError> {
        let owner = tx
            .inputs
            .get("owner")
            .and_then(Value::as_str)
            .ok_or_else(|| DomainError::BadTransaction("missing 'owner'".to_string()))?;
        let verifier = Self::verifier_for(verifiers, owner)?;
        let query = Query::build()
            .eq("owner", json!(verifier.verifier))
            .sort("amount")
            .query();
        let coins = ctx.find_available_states(&self.coin_schema.id, &query)?;
        let mut total = 0u128;
        for coin in &coins {
            total += Self::coin_amount(&coin.state.data)?;
        }
        Ok(json!({ "total": total.to_string(), "coins": coins.len() }))
    }

    // -- Custom hash / receipts / events ------------------------------------

    async fn validate_state_hashes(
        &self,
        states: &[ReceivedState],
    ) -> Result<Vec<StateId>, DomainError> {
        let mut ids = Vec::with_capacity(states.len());
        for state in states {
            let expected = Self::custom_coin_id(&state.data);
            match &state.id {
                Some(id) if *id != expected => {
                    return Err(DomainError::Permanent(format!(
                        "state hash mismatch: expected {}, got {}",
                        expected, id
                    )));
                }
                _ => ids.push(expected),
            }
        }
        Ok(ids)
    }

    async fn build_receipt(
        &self,
        _transaction: Uuid,
        states: &TransactionStates,
    ) -> Result<Value, DomainError> {
        let mut received = Vec::new();
        for state in &states.confirmed {
            received.push(json!({
                "owner": Self::coin_owner(&state.data)?,
                "amount": Self::coin_amount(&state.data)?.to_string(),
            }));
        }
        Ok(json!({
            "domain": self.name,
            "coinsSpent": states.spent.len(),
            "coinsReceived": received,
        }))
    }

    async fn handle_event_batch(
        &self,
        events: &[LedgerEvent],
    ) -> Result<EventHandling, DomainError> {
        // A deployment event echoes the deploy call data; we recognise
        // our own deploys by the embedded domain name, and the
        // constructor inputs become the instance config.
        let mut registrations = Vec::new();
        for event in events {
            let Some(obj) = event.data.as_object() else {
                continue;
            };
            if obj.get("type").and_then(Value::as_str) != Some("contract_deployment") {
                continue;
            }
            let Some(call) = obj.get("call").and_then(Value::as_object) else {
                continue;
            };
            if call.get("domain").and_then(Value::as_str) != Some(self.name.as_str()) {
                continue;
            }
            registrations.push(ContractRegistration {
                address: event.address,
                config: call.get("inputs").cloned().unwrap_or(Value::Null),
                deploy_transaction: call
                    .get("deployTransaction")
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok()),
            });
        }
        Ok(EventHandling { registrations })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::signer::SignerConfig;
    use crate::states::{StateStore, StateStoreConfig, StateUpsert};
    use crate::storage::CoreDb;
    use std::sync::Arc;

    fn domain() -> NotesDomain {
        NotesDomain::new("noto", NotesConfig::default())
    }

    fn verifier(lookup: &str, verifier: &str) -> ResolvedVerifier {
        ResolvedVerifier {
            lookup: lookup.to_string(),
            algorithm: ALGORITHM_ED25519.to_string(),
            verifier_type: VERIFIER_PUBLIC_KEY_HEX.to_string(),
            verifier: verifier.to_string(),
        }
    }

    fn tx_spec(function: &str, inputs: Value) -> PrivateTxSpec {
        PrivateTxSpec {
            id: Uuid::new_v4(),
            domain: "noto".to_string(),
            contract: LedgerAddress([5u8; 20]),
            from: "alice@node1".to_string(),
            function: function.to_string(),
            inputs,
        }
    }

    async fn context_with_coins(
        domain: &NotesDomain,
        owner_verifier: &str,
        amounts: &[u128],
    ) -> (Arc<StateStore>, Arc<DomainContext>) {
        let db = Arc::new(CoreDb::open_temporary().unwrap());
        let store = StateStore::new(db, StateStoreConfig::default());
        store
            .ensure_schemas(&[Schema::new("noto", coin_declaration())])
            .unwrap();
        let ctx = store.new_context("noto", LedgerAddress([5u8; 20]));
        let funding_tx = Uuid::new_v4();
        let upserts: Vec<StateUpsert> = amounts
            .iter()
            .map(|amount| StateUpsert {
                id: None,
                schema: domain.coin_schema_id(),
                data: NotesDomain::coin_data(owner_verifier, *amount),
                created_by: Some(funding_tx),
            })
            .collect();
        ctx.upsert_states(upserts).unwrap();
        (store, ctx)
    }

    #[tokio::test]
    async fn transfer_selects_smallest_coins_and_makes_change() {
        let domain = domain();
        let (_store, ctx) = context_with_coins(&domain, "AV", &[5, 3, 50]).await;
        let verifiers = vec![
            verifier("alice@node1", "AV"),
            verifier("bob@node2", "BV"),
        ];

        let tx = tx_spec(
            "transfer(string,uint256)",
            json!({"to": "bob@node2", "amount": "6"}),
        );
        let AssembleResult::Ok(assembly) = domain
            .assemble_transaction(&ctx, &tx, &verifiers)
            .await
            .unwrap()
        else {
            panic!("expected assembly")
        };

        // 3 + 5 = 8 covers 6; the 50 coin is untouched.
        assert_eq!(assembly.input_states.len(), 2);
        assert_eq!(assembly.output_states.len(), 2);

        let to_bob = &assembly.output_states[0];
        assert_eq!(to_bob.data.get("owner").unwrap(), "BV");
        assert_eq!(to_bob.data.get("amount").unwrap(), "6");
        assert_eq!(to_bob.distribute_to, vec!["node2".to_string()]);

        let change = &assembly.output_states[1];
        assert_eq!(change.data.get("owner").unwrap(), "AV");
        assert_eq!(change.data.get("amount").unwrap(), "2");
        assert!(change.distribute_to.is_empty());

        // One signature, one endorsement.
        assert_eq!(assembly.attestation_plan.len(), 2);
        assert_eq!(
            assembly.attestation_plan[0].attestation_type,
            AttestationType::Sign
        );
        assert_eq!(
            assembly.attestation_plan[1].attestation_type,
            AttestationType::Endorse
        );
        assert_eq!(
            assembly.attestation_plan[1].parties,
            vec!["bob@node2".to_string()]
        );
    }

    #[tokio::test]
    async fn transfer_with_no_funds_reverts() {
        let domain = domain();
        let (_store, ctx) = context_with_coins(&domain, "AV", &[]).await;
        let verifiers = vec![
            verifier("alice@node1", "AV"),
            verifier("bob@node2", "BV"),
        ];
        let tx = tx_spec(
            "transfer(string,uint256)",
            json!({"to": "bob@node2", "amount": "10"}),
        );
        let result = domain
            .assemble_transaction(&ctx, &tx, &verifiers)
            .await
            .unwrap();
        let AssembleResult::Revert { reason } = result else {
            panic!("expected revert")
        };
        assert_eq!(reason, "insufficient funds (available=0)");
    }

    #[tokio::test]
    async fn mint_creates_output_without_inputs() {
        let domain = domain();
        let (_store, ctx) = context_with_coins(&domain, "AV", &[]).await;
        let verifiers = vec![
            verifier("alice@node1", "AV"),
            verifier("bob@node2", "BV"),
        ];
        let tx = tx_spec(
            "mint(string,uint256)",
            json!({"to": "bob@node2", "amount": "100"}),
        );
        let AssembleResult::Ok(assembly) = domain
            .assemble_transaction(&ctx, &tx, &verifiers)
            .await
            .unwrap()
        else {
            panic!("expected assembly")
        };
        assert!(assembly.input_states.is_empty());
        assert_eq!(assembly.output_states.len(), 1);
        assert_eq!(assembly.attestation_plan.len(), 1);
    }

    fn endorsable(domain: &NotesDomain, owner: &str, amount: u128) -> EndorsableState {
        let data = json!({
            "owner": owner,
            "amount": amount.to_string(),
            "salt": "0x00",
        });
        EndorsableState {
            id: domain.coin_id(&data),
            schema: domain.coin_schema_id(),
            data,
        }
    }

    #[tokio::test]
    async fn endorsement_checks_balance_and_signature() {
        let domain = domain();
        let signer = SigningModule::new(&SignerConfig {
            seed: Some(format!("0x{}", "aa".repeat(32))),
            ..Default::default()
        })
        .unwrap();
        let sender_verifier = signer
            .resolve_verifier("alice", ALGORITHM_ED25519, VERIFIER_PUBLIC_KEY_HEX)
            .unwrap();

        let inputs = vec![endorsable(&domain, &sender_verifier, 10)];
        let outputs = vec![
            endorsable(&domain, "BV", 6),
            endorsable(&domain, &sender_verifier, 4),
        ];
        let input_ids: Vec<StateId> = inputs.iter().map(|s| s.id.clone()).collect();
        let output_ids: Vec<StateId> = outputs.iter().map(|s| s.id.clone()).collect();
        let payload = NotesDomain::attestation_payload(&input_ids, &output_ids);
        let signature = signer.sign("alice", ALGORITHM_ED25519, &payload).unwrap();

        let endorse_req = |sig: Vec<u8>| EndorseRequest {
            transaction: tx_spec(
                "transfer(string,uint256)",
                json!({"to": "bob@node2", "amount": "6"}),
            ),
            verifiers: vec![],
            signatures: vec![super::super::AttestationResult {
                name: "sender".to_string(),
                attestation_type: AttestationType::Sign,
                verifier: verifier("alice@node1", &sender_verifier),
                payload: sig,
            }],
            input_states: inputs.clone(),
            read_states: vec![],
            output_states: outputs.clone(),
            attestation_request: AttestationRequest {
                name: "recipient".to_string(),
                attestation_type: AttestationType::Endorse,
                algorithm: ALGORITHM_ED25519.to_string(),
                verifier_type: VERIFIER_PUBLIC_KEY_HEX.to_string(),
                payload: payload.clone(),
                parties: vec!["bob@node2".to_string()],
            },
            endorser: verifier("bob@node2", "BV"),
        };

        let db = Arc::new(CoreDb::open_temporary().unwrap());
        let store = StateStore::new(db, StateStoreConfig::default());
        store
            .ensure_schemas(&[Schema::new("noto", coin_declaration())])
            .unwrap();
        let ctx = store.new_context("noto", LedgerAddress([5u8; 20]));

        let outcome = domain
            .endorse_transaction(&ctx, &endorse_req(signature.clone()))
            .await
            .unwrap();
        assert!(matches!(outcome, EndorseOutcome::Approve { .. }));

        // A corrupted signature is rejected, not errored.
        let mut bad = signature;
        bad[0] ^= 0xff;
        let outcome = domain
            .endorse_transaction(&ctx, &endorse_req(bad))
            .await
            .unwrap();
        assert!(matches!(outcome, EndorseOutcome::Reject { .. }));
    }

    #[tokio::test]
    async fn custom_hash_fills_and_validates() {
        let domain = NotesDomain::new("noto", NotesConfig { custom_hash: true });
        let data = json!({"owner": "AV", "amount": "5", "salt": "0x01"});
        let expected = NotesDomain::custom_coin_id(&data);

        let filled = domain
            .validate_state_hashes(&[ReceivedState {
                id: None,
                schema: domain.coin_schema_id(),
                data: data.clone(),
            }])
            .await
            .unwrap();
        assert_eq!(filled, vec![expected.clone()]);

        // Same data twice yields the same hash (dedupe key).
        let again = domain
            .validate_state_hashes(&[ReceivedState {
                id: None,
                schema: domain.coin_schema_id(),
                data: data.clone(),
            }])
            .await
            .unwrap();
        assert_eq!(again, vec![expected]);

        let err = domain
            .validate_state_hashes(&[ReceivedState {
                id: Some(StateId::new(vec![1, 2, 3])),
                schema: domain.coin_schema_id(),
                data,
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Permanent(_)));
    }

    #[tokio::test]
    async fn event_batch_extracts_registrations() {
        let domain = domain();
        let deploy_tx = Uuid::new_v4();
        let events = vec![
            LedgerEvent {
                block: 1,
                tx_index: 0,
                address: LedgerAddress([9u8; 20]),
                data: json!({
                    "type": "contract_deployment",
                    "call": {
                        "function": "constructor(string)",
                        "domain": "noto",
                        "inputs": {"notary": "NV"},
                        "deployTransaction": deploy_tx.to_string(),
                    },
                }),
            },
            // Someone else's deployment.
            LedgerEvent {
                block: 1,
                tx_index: 1,
                address: LedgerAddress([8u8; 20]),
                data: json!({
                    "type": "contract_deployment",
                    "call": {"domain": "zkcoin", "inputs": {}},
                }),
            },
        ];
        let handling = domain.handle_event_batch(&events).await.unwrap();
        assert_eq!(handling.registrations.len(), 1);
        assert_eq!(handling.registrations[0].deploy_transaction, Some(deploy_tx));
        assert_eq!(handling.registrations[0].config, json!({"notary": "NV"}));
    }
}
