//! End-to-end scenarios over a two-node in-process network.
//!
//! Each test wires two full engines to one in-memory dev chain and the
//! in-process memory transport, loads the reference notes domain, and
//! drives the private transaction lifecycle across both nodes: deploy,
//! mint, endorsed transfer, idempotent resubmission, failure receipts,
//! peer quiesce/reactivation, and the custom-hash receive path.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use umbra_core::abi::{AbiFunction, AbiParam, AbiType};
use umbra_core::config::CoreConfig;
use umbra_core::domains::notes::{NotesConfig, NotesDomain};
use umbra_core::filters::Query;
use umbra_core::keys::signer::{ALGORITHM_ED25519, VERIFIER_PUBLIC_KEY_HEX};
use umbra_core::privatetx::{TransactionInput, TransactionReceipt, TxError, TxType};
use umbra_core::publictx::DevChain;
use umbra_core::storage::Table;
use umbra_core::transport::{MemoryNetwork, RetryConfig};
use umbra_core::types::LedgerAddress;
use umbra_core::Node;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct TestNet {
    network: Arc<MemoryNetwork>,
    chain: Arc<DevChain>,
    nodes: Vec<Arc<Node>>,
}

impl TestNet {
    fn node(&self, index: usize) -> &Arc<Node> {
        &self.nodes[index]
    }

    async fn stop(self) {
        for node in &self.nodes {
            node.stop().await;
        }
    }
}

fn fast_config(name: &str, seed_hex_byte: &str) -> CoreConfig {
    let mut config = CoreConfig::for_node(name);
    config.signer.seed = Some(format!("0x{}", seed_hex_byte.repeat(32)));
    config.transport.reliable_resend_interval_ms = 200;
    config.transport.peer_inactivity_timeout_ms = 400;
    config.transport.quiesce_timeout_ms = 100;
    config.transport.short_retry = RetryConfig {
        max_attempts: 2,
        initial_delay_ms: 10,
        factor: 2.0,
        max_delay_ms: 50,
    };
    config.transport.scan_retry = RetryConfig {
        max_attempts: 0,
        initial_delay_ms: 20,
        factor: 2.0,
        max_delay_ms: 200,
    };
    config.public_tx.orchestrator.poll_interval_ms = 20;
    config.public_tx.orchestrator.resubmit_interval_ms = 300;
    config.public_tx.orchestrator.stage_persistence_retry_ms = 20;
    config.coordinator.endorsement_timeout_ms = 2_000;
    config.coordinator.assemble_attempts = 5;
    config.coordinator.attempt_backoff_ms = 100;
    config.domain_manager.deploy_wait_timeout_ms = 10_000;
    config.ledger_poll_interval_ms = 50;
    config
}

async fn start_two_nodes(custom_hash: bool) -> TestNet {
    let network = MemoryNetwork::new();
    let chain = DevChain::new();

    let mut nodes = Vec::new();
    for (name, seed) in [("node1", "11"), ("node2", "22")] {
        let node = Node::start(fast_config(name, seed), chain.clone())
            .await
            .expect("node starts");
        node.register_transport(network.transport(name));
        network.register(name, Arc::clone(node.transport()));
        node.register_domain(
            Arc::new(NotesDomain::new("noto", NotesConfig { custom_hash })),
            &json!({}),
        )
        .await
        .expect("domain registers");
        nodes.push(node);
    }

    // Every node publishes its peers' transport details.
    for node in &nodes {
        for peer in ["node1", "node2"] {
            if peer != node.config().node_name {
                let (entry, property) = MemoryNetwork::registry_records(peer);
                node.upsert_registry_records(vec![entry], vec![property])
                    .expect("registry upsert");
            }
        }
    }

    TestNet {
        network,
        chain,
        nodes,
    }
}

fn notes_abi() -> Vec<AbiFunction> {
    let to = AbiParam {
        name: "to".to_string(),
        kind: AbiType::String,
    };
    let amount = AbiParam {
        name: "amount".to_string(),
        kind: AbiType::Uint256,
    };
    vec![
        AbiFunction::function("transfer", vec![to.clone(), amount.clone()]),
        AbiFunction::function("mint", vec![to, amount]),
    ]
}

fn deploy_input(from: &str) -> TransactionInput {
    TransactionInput {
        tx_type: TxType::Private,
        domain: Some("noto".to_string()),
        from: from.to_string(),
        to: None,
        function: None,
        abi: None,
        abi_reference: None,
        data: json!({}),
        idempotency_key: None,
        depends_on: vec![],
        gas_limit: None,
    }
}

fn invoke_input(
    from: &str,
    contract: LedgerAddress,
    function: &str,
    to: &str,
    amount: &str,
    idempotency_key: Option<&str>,
) -> TransactionInput {
    TransactionInput {
        tx_type: TxType::Private,
        domain: None,
        from: from.to_string(),
        to: Some(contract),
        function: Some(function.to_string()),
        abi: Some(notes_abi()),
        abi_reference: None,
        data: json!({"to": to, "amount": amount}),
        idempotency_key: idempotency_key.map(String::from),
        depends_on: vec![],
        gas_limit: None,
    }
}

/// Poll until the receipt exists (10s budget).
async fn await_receipt(node: &Arc<Node>, id: uuid::Uuid) -> TransactionReceipt {
    for _ in 0..200 {
        if let Some(receipt) = node.get_receipt(id).expect("receipt query") {
            return receipt;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("no receipt for {} within timeout", id);
}

/// Deploy a notes contract and return its address.
async fn deploy_notes(node: &Arc<Node>, from: &str) -> LedgerAddress {
    let id = node
        .submit_transaction(deploy_input(from))
        .await
        .expect("deploy submits");
    let receipt = await_receipt(node, id).await;
    assert!(receipt.success, "deploy failed: {:?}", receipt.failure);
    receipt.contract_address.expect("deploy receipt carries the contract address")
}

/// Count a party's available coins on a node (total, count).
fn balance_of(node: &Arc<Node>, contract: &LedgerAddress, party: &str) -> (u128, usize) {
    let verifier = node
        .signer()
        .resolve_verifier(party, ALGORITHM_ED25519, VERIFIER_PUBLIC_KEY_HEX)
        .expect("verifier resolves");
    let schema = NotesDomain::new("noto", NotesConfig::default()).coin_schema_id();
    let query = Query::build()
        .eq("owner", json!(verifier))
        .sort("amount")
        .query();
    let coins = node
        .store()
        .find_available_states(
            "noto",
            contract,
            &schema,
            &query,
            &Default::default(),
            false,
        )
        .expect("state query");
    let total = coins
        .iter()
        .map(|c| {
            c.data
                .get("amount")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<u128>().ok())
                .unwrap_or(0)
        })
        .sum();
    (total, coins.len())
}

/// Poll until a party's available balance on a node reaches `expected`.
async fn await_balance(node: &Arc<Node>, contract: &LedgerAddress, party: &str, expected: u128) {
    for _ in 0..200 {
        if balance_of(node, contract, party).0 == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let (actual, coins) = balance_of(node, contract, party);
    panic!(
        "balance of {} never reached {} (stuck at {} across {} coins)",
        party, expected, actual, coins
    );
}

// ---------------------------------------------------------------------------
// S1: deploy + endorsed transfer + idempotent resubmit
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn deploy_transfer_and_idempotent_resubmit() {
    let net = start_two_nodes(false).await;
    let node1 = net.node(0);
    let node2 = net.node(1);

    // Deploy lands on chain; both nodes register the contract from the
    // deployment event.
    let contract = deploy_notes(node1, "alice").await;

    // Mint funds to alice (no endorsement round for mints).
    let mint_id = node1
        .submit_transaction(invoke_input("alice", contract, "mint", "alice", "100", None))
        .await
        .expect("mint submits");
    let mint_receipt = await_receipt(node1, mint_id).await;
    assert!(mint_receipt.success, "mint failed: {:?}", mint_receipt.failure);
    await_balance(node1, &contract, "alice", 100).await;

    // Transfer to bob@node2: one round of endorsement with node2, then
    // a public transaction, then a success receipt.
    let transfer = invoke_input("alice", contract, "transfer", "bob@node2", "5", Some("k1"));
    let transfer_id = node1
        .submit_transaction(transfer.clone())
        .await
        .expect("transfer submits");
    let receipt = await_receipt(node1, transfer_id).await;
    assert!(receipt.success, "transfer failed: {:?}", receipt.failure);
    assert!(receipt.location.is_some(), "receipt records the chain location");
    // The domain enriched the receipt.
    let domain_receipt = receipt.domain_receipt.expect("domain receipt present");
    assert!(domain_receipt.contains("coinsReceived"));

    // Re-submitting with the same idempotency key returns the same id
    // and creates nothing new.
    let resubmit_id = node1
        .submit_transaction(transfer)
        .await
        .expect("resubmit resolves");
    assert_eq!(resubmit_id, transfer_id);

    // Alice keeps her change; bob's node received and confirmed his
    // coin (state distribution + receipt distribution).
    await_balance(node1, &contract, "alice", 95).await;
    await_balance(node2, &contract, "bob", 5).await;

    // The transfer's dispatch row binds it to its public submission.
    let dispatch = node1
        .coordinator()
        .get_dispatch(transfer_id)
        .expect("dispatch query")
        .expect("dispatch row exists");
    assert_eq!(dispatch.private_transaction, transfer_id);

    // The read-only call path agrees with the store.
    let balance = node1
        .coordinator()
        .call_private(contract, "alice", "balanceOf(string)", json!({"owner": "alice"}))
        .await
        .expect("call executes");
    assert_eq!(balance.get("total").unwrap(), "95");

    net.stop().await;
}

// ---------------------------------------------------------------------------
// S2: insufficient inputs fail with a receipt, creating nothing
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn insufficient_funds_writes_failure_receipt() {
    let net = start_two_nodes(false).await;
    let node1 = net.node(0);

    let contract = deploy_notes(node1, "alice").await;
    let states_before = node1.db().count(Table::States);

    // No prior mints for dave: the transfer cannot assemble.
    let id = node1
        .submit_transaction(invoke_input(
            "dave", contract, "transfer", "bob@node2", "10", None,
        ))
        .await
        .expect("submission is accepted");
    let receipt = await_receipt(node1, id).await;

    assert!(!receipt.success);
    assert_eq!(
        receipt.failure.as_deref(),
        Some("insufficient funds (available=0)")
    );
    assert!(receipt.location.is_none(), "nothing reached the chain");
    assert_eq!(
        node1.db().count(Table::States),
        states_before,
        "no states were created"
    );

    net.stop().await;
}

// ---------------------------------------------------------------------------
// S3: peer quiesce and transparent reactivation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn peer_quiesces_and_reactivates_transparently() {
    let net = start_two_nodes(false).await;
    let node1 = net.node(0);
    let node2 = net.node(1);

    let contract = deploy_notes(node1, "alice").await;
    let mint_id = node1
        .submit_transaction(invoke_input("alice", contract, "mint", "alice", "100", None))
        .await
        .unwrap();
    assert!(await_receipt(node1, mint_id).await.success);

    // First transfer activates the node2 peer.
    let t1 = node1
        .submit_transaction(invoke_input("alice", contract, "transfer", "bob@node2", "3", None))
        .await
        .unwrap();
    assert!(await_receipt(node1, t1).await.success);
    await_balance(node2, &contract, "bob", 3).await;

    // With nothing left to send and nothing received, the sender
    // quiesces past the inactivity timeout. (Passive entries tracking
    // receive stats may remain; no sender stays active.)
    let mut quiesced = false;
    for _ in 0..100 {
        let senders_active = node1
            .transport()
            .list_active_peers()
            .await
            .iter()
            .any(|p| p.sender_active);
        if !senders_active {
            quiesced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(quiesced, "node2 peer sender should have quiesced");

    // Stop node2's transport for longer than the quiesce window, then
    // transfer again: the send re-activates the peer transparently and
    // the reliable messages land exactly once each.
    net.network.pause("node2");
    let t2 = {
        let node1 = Arc::clone(node1);
        tokio::spawn(async move {
            node1
                .submit_transaction(invoke_input(
                    "alice", contract, "transfer", "bob@node2", "4", None,
                ))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    net.network.resume("node2");

    let t2 = t2.await.unwrap().expect("transfer submits");
    assert!(await_receipt(node1, t2).await.success);
    await_balance(node2, &contract, "bob", 7).await;

    // Every reliable message to node2 ends acked — and stays acked, so
    // a later rescan resends nothing.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let rows: Vec<(Vec<u8>, umbra_core::transport::ReliableMessage)> = node1
            .db()
            .scan_prefix(Table::ReliableMessages, b"node2\0")
            .unwrap();
        assert!(!rows.is_empty());
        let unacked = rows
            .iter()
            .filter(|(_, row)| !node1.transport().is_acked(row.id).unwrap())
            .count();
        if unacked == 0 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "{} reliable messages never acked",
            unacked
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    net.stop().await;
}

// ---------------------------------------------------------------------------
// S4: idempotency race
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_submits_with_one_key_yield_one_transaction() {
    let net = start_two_nodes(false).await;
    let node1 = net.node(0);
    let contract = deploy_notes(node1, "alice").await;

    let input = || {
        vec![invoke_input(
            "alice",
            contract,
            "mint",
            "alice",
            "10",
            Some("race-key"),
        )]
    };

    let (a, b) = tokio::join!(
        node1.coordinator().submit_transactions(input()),
        node1.coordinator().submit_transactions(input()),
    );

    // One winner, one conflict carrying the winner's id.
    let (winner, clash) = match (a, b) {
        (Ok(ids), Err(e)) => (ids[0], e),
        (Err(e), Ok(ids)) => (ids[0], e),
        other => panic!("expected exactly one winner, got {:?}", other),
    };
    match clash {
        TxError::IdempotencyClash { existing, key } => {
            assert_eq!(existing, winner);
            assert_eq!(key, "race-key");
        }
        other => panic!("expected an idempotency clash, got {:?}", other),
    }

    // The index maps the key to exactly the winning transaction.
    assert_eq!(
        node1
            .coordinator()
            .transaction_by_idempotency_key("race-key")
            .unwrap(),
        Some(winner)
    );
    assert!(node1.coordinator().get_transaction(winner).unwrap().is_some());

    net.stop().await;
}

// ---------------------------------------------------------------------------
// S6: custom-hash domain receive path
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn custom_hash_states_are_filled_and_deduplicated() {
    let net = start_two_nodes(true).await;
    let node1 = net.node(0);
    let node2 = net.node(1);

    let contract = deploy_notes(node1, "alice").await;
    let mint_id = node1
        .submit_transaction(invoke_input("alice", contract, "mint", "alice", "50", None))
        .await
        .unwrap();
    assert!(await_receipt(node1, mint_id).await.success);
    await_balance(node1, &contract, "alice", 50).await;

    // The transfer ships bob's coin to node2 with a nil id; node2 asks
    // the domain to fill it.
    let transfer_id = node1
        .submit_transaction(invoke_input(
            "alice", contract, "transfer", "bob@node2", "20", None,
        ))
        .await
        .unwrap();
    assert!(await_receipt(node1, transfer_id).await.success);
    await_balance(node2, &contract, "bob", 20).await;

    // Both nodes agree on the domain-computed id, and resent
    // deliveries never duplicate the row.
    let (total1, coins1) = balance_of(node1, &contract, "bob");
    let (total2, coins2) = balance_of(node2, &contract, "bob");
    assert_eq!((total1, coins1), (20, 1));
    assert_eq!((total2, coins2), (20, 1));

    // Give the resend interval a chance to fire again, then re-check.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(balance_of(node2, &contract, "bob").1, 1);

    net.stop().await;
}

// ---------------------------------------------------------------------------
// Public transactions ride the same submission boundary
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn public_transaction_confirms_with_receipt() {
    let net = start_two_nodes(false).await;
    let node1 = net.node(0);

    let target: LedgerAddress = format!("0x{}", "42".repeat(20)).parse().unwrap();
    let id = node1
        .submit_transaction(TransactionInput {
            tx_type: TxType::Public,
            domain: None,
            from: "ops".to_string(),
            to: Some(target),
            function: Some("transfer".to_string()),
            abi: Some(notes_abi()),
            abi_reference: None,
            data: json!({"to": "somewhere", "amount": "1"}),
            idempotency_key: None,
            depends_on: vec![],
            gas_limit: Some(60_000),
        })
        .await
        .expect("public submission");

    let receipt = await_receipt(node1, id).await;
    assert!(receipt.success);
    assert!(receipt.location.is_some());
    assert!(net.chain.submission_count() >= 1);

    // Bound 1:1 to its public submission.
    let submission = node1
        .publictx()
        .submission_for(id)
        .unwrap()
        .expect("submission binding exists");
    assert_eq!(submission.transaction, id);

    net.stop().await;
}

// ---------------------------------------------------------------------------
// Privacy groups: genesis state distributed to every remote member
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn privacy_group_genesis_reaches_members() {
    let net = start_two_nodes(false).await;
    let node1 = net.node(0);
    let node2 = net.node(1);

    let contract = deploy_notes(node1, "alice").await;
    let schema = NotesDomain::new("noto", NotesConfig::default()).coin_schema_id();

    let group_id = node1
        .coordinator()
        .create_privacy_group(
            "noto",
            contract,
            schema,
            json!({"owner": "group-genesis", "amount": "0", "salt": "0x01"}),
            vec!["alice@node1".to_string(), "bob@node2".to_string()],
        )
        .await
        .expect("group creates");

    // The member list is durable on the creating node...
    let group = node1
        .store()
        .get_privacy_group("noto", &group_id)
        .unwrap()
        .expect("group row exists");
    assert_eq!(group.members.len(), 2);

    // ...and the genesis state lands on the remote member's node.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        if node2
            .store()
            .get_state("noto", &contract, &group_id)
            .unwrap()
            .is_some()
        {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "genesis state never reached node2"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    net.stop().await;
}

// ---------------------------------------------------------------------------
// Chained sends: a second transfer spends unconfirmed change
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn sequential_transfers_share_the_contract_context() {
    let net = start_two_nodes(false).await;
    let node1 = net.node(0);
    let node2 = net.node(1);

    let contract = deploy_notes(node1, "alice").await;
    let mint_id = node1
        .submit_transaction(invoke_input("alice", contract, "mint", "alice", "10", None))
        .await
        .unwrap();
    assert!(await_receipt(node1, mint_id).await.success);
    await_balance(node1, &contract, "alice", 10).await;

    // Two transfers in a row; the second selects from what the first
    // left (change or confirmed coins), never double-spending.
    for amount in ["4", "3"] {
        let id = node1
            .submit_transaction(invoke_input(
                "alice", contract, "transfer", "bob@node2", amount, None,
            ))
            .await
            .unwrap();
        let receipt = await_receipt(node1, id).await;
        assert!(receipt.success, "transfer of {} failed: {:?}", amount, receipt.failure);
    }

    await_balance(node1, &contract, "alice", 3).await;
    await_balance(node2, &contract, "bob", 7).await;

    net.stop().await;
}
