//! The public transaction manager: orchestrator lifecycle, admission,
//! updates and the completion feed.
//!
//! Submissions are staged into the *caller's* gateway transaction —
//! the row, the binding rows and the local-id allocation all commit
//! together with whatever the coordinator is persisting — and the
//! owning orchestrator is only poked from the post-commit hook.
//! Orchestrators are created on demand per sender address, recovering
//! their queue and nonce baseline from the persisted rows (and the
//! chain) before processing anything new.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::keys::signer::SigningModule;
use crate::storage::{CoreDb, DbTxn, Table};
use crate::types::{now_millis, LedgerAddress};

use super::balance::BalanceManager;
use super::inflight::InFlight;
use super::ledger::{BaseLedger, TxLocation};
use super::nonce::NonceAllocator;
use super::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorMsg};
use super::{
    public_tx_key, sender_prefix, PublicTxError, PublicTxInput, PublicTxRow, PublicTxSubmissionRow,
};

/// Meta-table counter for node-local public transaction ids.
const LOCAL_ID_COUNTER: &[u8] = b"public_tx_local_id";

// ---------------------------------------------------------------------------
// Config & completion feed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublicTxManagerConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Emitted once per public transaction when it becomes removable.
#[derive(Debug, Clone)]
pub struct TxCompletion {
    pub local_id: u64,
    pub sender: LedgerAddress,
    pub bindings: Vec<Uuid>,
    pub tx_hash: Option<String>,
    pub location: Option<TxLocation>,
    pub failure: Option<String>,
}

impl TxCompletion {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none() && self.location.as_ref().is_some_and(|l| l.success)
    }
}

// ---------------------------------------------------------------------------
// PublicTxManager
// ---------------------------------------------------------------------------

pub struct PublicTxManager {
    db: Arc<CoreDb>,
    ledger: Arc<dyn BaseLedger>,
    signer: Arc<SigningModule>,
    config: PublicTxManagerConfig,
    orchestrators: Mutex<HashMap<LedgerAddress, mpsc::UnboundedSender<OrchestratorMsg>>>,
    handles: SyncMutex<Vec<JoinHandle<()>>>,
    completions_tx: mpsc::UnboundedSender<TxCompletion>,
    completions_rx: SyncMutex<Option<mpsc::UnboundedReceiver<TxCompletion>>>,
    cancel_tx: watch::Sender<bool>,
}

impl PublicTxManager {
    pub fn new(
        db: Arc<CoreDb>,
        ledger: Arc<dyn BaseLedger>,
        signer: Arc<SigningModule>,
        config: PublicTxManagerConfig,
    ) -> Arc<Self> {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            db,
            ledger,
            signer,
            config,
            orchestrators: Mutex::new(HashMap::new()),
            handles: SyncMutex::new(Vec::new()),
            completions_tx,
            completions_rx: SyncMutex::new(Some(completions_rx)),
            cancel_tx,
        })
    }

    /// The stream of completions, taken once by the coordinator.
    pub fn take_completions(&self) -> Option<mpsc::UnboundedReceiver<TxCompletion>> {
        self.completions_rx.lock().take()
    }

    /// The base-ledger address a signer identifier submits from.
    pub fn sender_address(&self, from: &str) -> LedgerAddress {
        self.signer.ledger_address(from)
    }

    // -- Validation & staging -----------------------------------------------

    pub fn validate(&self, input: &PublicTxInput) -> Result<(), PublicTxError> {
        if input.from.is_empty() {
            return Err(PublicTxError::Validation(
                "public transaction requires a 'from' signer".to_string(),
            ));
        }
        if input.gas_limit == 0 {
            return Err(PublicTxError::Validation(
                "gas limit must be non-zero".to_string(),
            ));
        }
        if !input.data.is_object() {
            return Err(PublicTxError::Validation(
                "call data must be a JSON object".to_string(),
            ));
        }
        Ok(())
    }

    /// Stage a validated submission into the caller's transaction and
    /// arrange post-commit admission. Returns the (sender, local-id)
    /// pair identifying the public transaction.
    pub fn stage_submission(
        self: &Arc<Self>,
        txn: &mut DbTxn<'_>,
        input: &PublicTxInput,
    ) -> Result<(LedgerAddress, u64), PublicTxError> {
        self.validate(input)?;
        let sender = self.sender_address(&input.from);
        let local_id = txn.next_sequence(LOCAL_ID_COUNTER)?;

        let row = PublicTxRow {
            local_id,
            from: input.from.clone(),
            sender,
            to: input.to,
            data: input.data.to_string(),
            gas_limit: input.gas_limit,
            created: now_millis(),
            nonce: None,
            signature: None,
            submitted_hash: None,
            last_gas_price: None,
            version: 0,
            confirmed: None,
            failure: None,
        };
        txn.put(Table::PublicTxns, &public_tx_key(&sender, local_id), &row)?;

        for binding in &input.bindings {
            let submission = PublicTxSubmissionRow {
                transaction: *binding,
                sender,
                local_id,
            };
            txn.put(Table::PublicTxSubmissions, binding.as_bytes(), &submission)?;
        }

        let this = Arc::clone(self);
        txn.on_commit(move || {
            tokio::spawn(async move {
                this.notify(sender, OrchestratorMsg::Admit(local_id)).await;
            });
        });
        Ok((sender, local_id))
    }

    /// Stage a content update of an in-flight public transaction in the
    /// caller's transaction; the orchestrator opens the new version
    /// after commit.
    pub fn stage_update(
        self: &Arc<Self>,
        txn: &mut DbTxn<'_>,
        transaction: Uuid,
        to: Option<LedgerAddress>,
        data: &serde_json::Value,
        gas_limit: Option<u64>,
    ) -> Result<(), PublicTxError> {
        let binding: PublicTxSubmissionRow = txn
            .get(Table::PublicTxSubmissions, transaction.as_bytes())?
            .ok_or(PublicTxError::Validation(format!(
                "transaction {} has no public submission",
                transaction
            )))?;

        let key = public_tx_key(&binding.sender, binding.local_id);
        let mut row: PublicTxRow = txn
            .get(Table::PublicTxns, &key)?
            .ok_or(PublicTxError::NotFound(binding.local_id))?;
        if row.is_complete() {
            return Err(PublicTxError::Validation(
                "public transaction already complete".to_string(),
            ));
        }

        row.to = to.or(row.to);
        row.data = data.to_string();
        if let Some(gas_limit) = gas_limit {
            row.gas_limit = gas_limit;
        }
        row.version += 1;
        // The new content must be re-signed and re-submitted.
        row.signature = None;
        txn.put(Table::PublicTxns, &key, &row)?;

        let this = Arc::clone(self);
        let sender = binding.sender;
        let local_id = binding.local_id;
        txn.on_commit(move || {
            tokio::spawn(async move {
                this.notify(sender, OrchestratorMsg::Update(local_id)).await;
            });
        });
        Ok(())
    }

    /// The public submission bound to an engine transaction, if any.
    pub fn submission_for(
        &self,
        transaction: Uuid,
    ) -> Result<Option<PublicTxSubmissionRow>, PublicTxError> {
        Ok(self
            .db
            .get(Table::PublicTxSubmissions, transaction.as_bytes())?)
    }

    // -- Orchestrator lifecycle ---------------------------------------------

    async fn notify(self: &Arc<Self>, sender: LedgerAddress, message: OrchestratorMsg) {
        match self.ensure_orchestrator(sender).await {
            Ok(inbox) => {
                if inbox.send(message).is_err() {
                    warn!(sender = %sender, "orchestrator inbox closed");
                }
            }
            Err(e) => warn!(sender = %sender, "failed to start orchestrator: {}", e),
        }
    }

    async fn ensure_orchestrator(
        self: &Arc<Self>,
        sender: LedgerAddress,
    ) -> Result<mpsc::UnboundedSender<OrchestratorMsg>, PublicTxError> {
        let mut orchestrators = self.orchestrators.lock().await;
        if let Some(inbox) = orchestrators.get(&sender) {
            return Ok(inbox.clone());
        }

        // Recovery: rebuild the queue and nonce baseline from rows.
        let rows: Vec<(Vec<u8>, PublicTxRow)> = self
            .db
            .scan_prefix(Table::PublicTxns, &sender_prefix(&sender))?;
        let bindings = self.bindings_by_local_id(&sender)?;

        let highest_nonce = rows.iter().filter_map(|(_, r)| r.nonce).max();
        let recovered: Vec<InFlight> = rows
            .iter()
            .filter(|(_, r)| !r.is_complete())
            .map(|(_, r)| {
                InFlight::from_row(r, bindings.get(&r.local_id).cloned().unwrap_or_default())
            })
            .collect();

        let chain_confirmed = match self.ledger.confirmed_nonce(&sender).await {
            Ok(nonce) => nonce,
            Err(e) => {
                warn!(sender = %sender, "confirmed-nonce lookup failed, using persisted baseline: {}", e);
                None
            }
        };

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator {
            sender,
            db: Arc::clone(&self.db),
            ledger: Arc::clone(&self.ledger),
            signer: Arc::clone(&self.signer),
            balance: BalanceManager::new(Arc::clone(&self.ledger)),
            nonces: NonceAllocator::recover(highest_nonce, chain_confirmed),
            config: self.config.orchestrator.clone(),
            completions: self.completions_tx.clone(),
        };
        let cancel = self.cancel_tx.subscribe();
        let handle = tokio::spawn(orchestrator.run(inbox_rx, cancel, recovered));
        self.handles.lock().push(handle);
        orchestrators.insert(sender, inbox_tx.clone());
        Ok(inbox_tx)
    }

    fn bindings_by_local_id(
        &self,
        sender: &LedgerAddress,
    ) -> Result<HashMap<u64, Vec<Uuid>>, PublicTxError> {
        let rows: Vec<(Vec<u8>, PublicTxSubmissionRow)> =
            self.db.scan_prefix(Table::PublicTxSubmissions, &[])?;
        let mut map: HashMap<u64, Vec<Uuid>> = HashMap::new();
        for (_, row) in rows {
            if row.sender == *sender {
                map.entry(row.local_id).or_default().push(row.transaction);
            }
        }
        Ok(map)
    }

    /// Restart orchestrators for every sender with incomplete rows —
    /// run once at node startup.
    pub async fn recover(self: &Arc<Self>) -> Result<(), PublicTxError> {
        let rows: Vec<(Vec<u8>, PublicTxRow)> = self.db.scan_prefix(Table::PublicTxns, &[])?;
        let mut senders: Vec<LedgerAddress> = rows
            .iter()
            .filter(|(_, r)| !r.is_complete())
            .map(|(_, r)| r.sender)
            .collect();
        senders.sort();
        senders.dedup();
        for sender in senders {
            info!(sender = %sender, "recovering public tx orchestrator");
            self.ensure_orchestrator(sender).await?;
        }
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.cancel_tx.send(true);
        self.orchestrators.lock().await.clear();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::ledger::{LedgerError, SignedSubmission};
    use super::*;
    use crate::keys::signer::SignerConfig;
    use crate::types::LedgerEvent;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// A chain that confirms everything on the next poll, in order.
    struct InstantChain {
        submissions: Mutex<Vec<SignedSubmission>>,
        confirmed: Mutex<HashMap<String, TxLocation>>,
        next_block: Mutex<u64>,
    }

    impl InstantChain {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                submissions: Mutex::new(Vec::new()),
                confirmed: Mutex::new(HashMap::new()),
                next_block: Mutex::new(1),
            })
        }

        fn submitted_nonces(&self) -> Vec<u64> {
            self.submissions.lock().iter().map(|s| s.nonce).collect()
        }
    }

    #[async_trait]
    impl BaseLedger for InstantChain {
        async fn balance(&self, _sender: &LedgerAddress) -> Result<u128, LedgerError> {
            Ok(u128::MAX)
        }
        async fn confirmed_nonce(
            &self,
            _sender: &LedgerAddress,
        ) -> Result<Option<u64>, LedgerError> {
            Ok(None)
        }
        async fn gas_price(&self) -> Result<u128, LedgerError> {
            Ok(10)
        }
        async fn submit(&self, submission: &SignedSubmission) -> Result<String, LedgerError> {
            let mut submissions = self.submissions.lock();
            submissions.push(submission.clone());
            let hash = format!("0xtx{}", submissions.len());
            let mut block = self.next_block.lock();
            self.confirmed.lock().insert(
                hash.clone(),
                TxLocation {
                    block: *block,
                    tx_index: 0,
                    success: true,
                    contract_address: None,
                },
            );
            *block += 1;
            Ok(hash)
        }
        async fn transaction_location(
            &self,
            tx_hash: &str,
        ) -> Result<Option<TxLocation>, LedgerError> {
            Ok(self.confirmed.lock().get(tx_hash).cloned())
        }
        async fn events_since(
            &self,
            from_block: u64,
        ) -> Result<(u64, Vec<LedgerEvent>), LedgerError> {
            Ok((from_block, vec![]))
        }
    }

    fn fast_config() -> PublicTxManagerConfig {
        PublicTxManagerConfig {
            orchestrator: OrchestratorConfig {
                poll_interval_ms: 10,
                resubmit_interval_ms: 50,
                stage_persistence_retry_ms: 10,
                ..Default::default()
            },
        }
    }

    fn manager(chain: Arc<InstantChain>) -> Arc<PublicTxManager> {
        let db = Arc::new(CoreDb::open_temporary().unwrap());
        let signer = Arc::new(
            SigningModule::new(&SignerConfig {
                seed: Some(format!("0x{}", "cc".repeat(32))),
                ..Default::default()
            })
            .unwrap(),
        );
        PublicTxManager::new(db, chain, signer, fast_config())
    }

    fn input(bindings: Vec<Uuid>) -> PublicTxInput {
        PublicTxInput {
            from: "sequencer".to_string(),
            to: Some(LedgerAddress([9u8; 20])),
            data: json!({"function": "transfer(bytes,bytes,bytes)", "inputs": {}}),
            gas_limit: 50_000,
            bindings,
        }
    }

    #[tokio::test]
    async fn validation_rejects_bad_inputs() {
        let manager = manager(InstantChain::new());
        let mut bad = input(vec![]);
        bad.from = String::new();
        assert!(matches!(
            manager.validate(&bad),
            Err(PublicTxError::Validation(_))
        ));

        let mut bad = input(vec![]);
        bad.gas_limit = 0;
        assert!(manager.validate(&bad).is_err());

        let mut bad = input(vec![]);
        bad.data = json!("not an object");
        assert!(manager.validate(&bad).is_err());
    }

    #[tokio::test]
    async fn submissions_confirm_in_nonce_order() {
        let chain = InstantChain::new();
        let manager = manager(Arc::clone(&chain));
        let mut completions = manager.take_completions().unwrap();

        let bindings: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for binding in &bindings {
            manager
                .db
                .transaction::<_, PublicTxError, _>(|txn| {
                    manager.stage_submission(txn, &input(vec![*binding]))
                })
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let completion =
                tokio::time::timeout(std::time::Duration::from_secs(5), completions.recv())
                    .await
                    .expect("completion within timeout")
                    .expect("channel open");
            assert!(completion.succeeded());
            seen.push(completion);
        }

        // P4: strictly increasing nonces from the baseline, no gaps.
        assert_eq!(chain.submitted_nonces(), vec![0, 1, 2]);
        // Completions in admission order, each bound to its transaction.
        let completed_bindings: Vec<Uuid> =
            seen.iter().map(|c| c.bindings[0]).collect();
        assert_eq!(completed_bindings, bindings);

        manager.stop().await;
    }

    #[tokio::test]
    async fn recovery_resumes_nonce_sequence() {
        let chain = InstantChain::new();
        let db = Arc::new(CoreDb::open_temporary().unwrap());
        let signer = Arc::new(
            SigningModule::new(&SignerConfig {
                seed: Some(format!("0x{}", "cc".repeat(32))),
                ..Default::default()
            })
            .unwrap(),
        );

        // First life: submit one transaction and stop.
        {
            let manager = PublicTxManager::new(
                Arc::clone(&db),
                Arc::clone(&chain) as Arc<dyn BaseLedger>,
                Arc::clone(&signer),
                fast_config(),
            );
            let mut completions = manager.take_completions().unwrap();
            manager
                .db
                .transaction::<_, PublicTxError, _>(|txn| {
                    manager.stage_submission(txn, &input(vec![Uuid::new_v4()]))
                })
                .unwrap();
            tokio::time::timeout(std::time::Duration::from_secs(5), completions.recv())
                .await
                .unwrap()
                .unwrap();
            manager.stop().await;
        }

        // Second life over the same store: the nonce continues at 1.
        let manager = PublicTxManager::new(
            Arc::clone(&db),
            Arc::clone(&chain) as Arc<dyn BaseLedger>,
            signer,
            fast_config(),
        );
        let mut completions = manager.take_completions().unwrap();
        manager.recover().await.unwrap();
        manager
            .db
            .transaction::<_, PublicTxError, _>(|txn| {
                manager.stage_submission(txn, &input(vec![Uuid::new_v4()]))
            })
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), completions.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(chain.submitted_nonces(), vec![0, 1]);
        manager.stop().await;
    }

    #[tokio::test]
    async fn update_of_completed_transaction_is_rejected() {
        let chain = InstantChain::new();
        let manager = manager(Arc::clone(&chain));
        let mut completions = manager.take_completions().unwrap();
        let binding = Uuid::new_v4();

        manager
            .db
            .transaction::<_, PublicTxError, _>(|txn| {
                manager.stage_submission(txn, &input(vec![binding]))
            })
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), completions.recv())
            .await
            .unwrap()
            .unwrap();

        let err = manager
            .db
            .transaction::<(), PublicTxError, _>(|txn| {
                manager.stage_update(txn, binding, None, &json!({"function": "x()"}), None)
            })
            .unwrap_err();
        assert!(matches!(err, PublicTxError::Validation(_)));
        manager.stop().await;
    }
}
