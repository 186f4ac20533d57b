//! The per-sender orchestrator task.
//!
//! One task per signing address; within it, in-flight transactions
//! advance strictly in admission (FIFO, nonce) order. Each tick walks
//! the queue front to back: every entry gets a chance to advance, with
//! the summed worst-case cost of the entries ahead of it reserved
//! against the sender's balance. Stage outputs are persisted — with a
//! per-stage retry — before the machine moves on, so a crash replays
//! nothing and forgets nothing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::keys::signer::{SigningModule, ALGORITHM_ED25519};
use crate::storage::{CoreDb, Table};
use crate::types::LedgerAddress;

use super::balance::BalanceManager;
use super::inflight::{escalate_gas_price, InFlight, TxStage};
use super::ledger::{BaseLedger, LedgerError, SignedSubmission};
use super::manager::TxCompletion;
use super::nonce::NonceAllocator;
use super::{public_tx_key, PublicTxError, PublicTxRow};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum transactions admitted into one orchestrator's queue.
    pub max_in_flight: usize,
    /// Tick interval driving tracking polls.
    pub poll_interval_ms: u64,
    /// Tracking time without confirmation before escalation triggers.
    pub resubmit_interval_ms: u64,
    /// Gas price multiplier per escalation.
    pub gas_escalation_factor: f64,
    /// Ceiling for any escalated price.
    pub gas_price_cap: u128,
    /// Sleep between retries of a failed stage-output persistence.
    pub stage_persistence_retry_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 50,
            poll_interval_ms: 500,
            resubmit_interval_ms: 5_000,
            gas_escalation_factor: 1.5,
            gas_price_cap: 1_000_000_000_000,
            stage_persistence_retry_ms: 1_000,
        }
    }
}

/// Messages from the manager into one orchestrator.
#[derive(Debug)]
pub(crate) enum OrchestratorMsg {
    /// A new row was committed for this sender.
    Admit(u64),
    /// The row's content changed; open a new version.
    Update(u64),
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub(crate) struct Orchestrator {
    pub sender: LedgerAddress,
    pub db: Arc<CoreDb>,
    pub ledger: Arc<dyn BaseLedger>,
    pub signer: Arc<SigningModule>,
    pub balance: BalanceManager,
    pub nonces: NonceAllocator,
    pub config: OrchestratorConfig,
    pub completions: mpsc::UnboundedSender<TxCompletion>,
}

impl Orchestrator {
    pub(crate) async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<OrchestratorMsg>,
        mut cancel: watch::Receiver<bool>,
        recovered: Vec<InFlight>,
    ) {
        info!(sender = %self.sender, recovered = recovered.len(), "orchestrator started");
        let mut queue: VecDeque<InFlight> = recovered.into();
        let mut waiting: VecDeque<u64> = VecDeque::new();

        loop {
            // Admit waiting transactions up to the in-flight cap. A row
            // picked up by recovery may also arrive as an admission;
            // the queue holds each local id once.
            while queue.len() < self.config.max_in_flight {
                let Some(local_id) = waiting.pop_front() else {
                    break;
                };
                if queue.iter().any(|t| t.local_id == local_id) {
                    continue;
                }
                match self.load_inflight(local_id) {
                    Ok(Some(inflight)) => queue.push_back(inflight),
                    Ok(None) => warn!(sender = %self.sender, local_id, "admitted row vanished"),
                    Err(e) => {
                        warn!(sender = %self.sender, local_id, "re-queueing admission: {}", e);
                        waiting.push_front(local_id);
                        break;
                    }
                }
            }

            if let Err(e) = self.advance_queue(&mut queue, &mut cancel).await {
                if matches!(e, PublicTxError::Stopped) {
                    break;
                }
                debug!(sender = %self.sender, "advance pass error: {}", e);
            }

            // Completed-and-drained transactions leave the queue.
            while let Some(front) = queue.front() {
                if !front.removable() {
                    break;
                }
                let done = queue.pop_front().expect("checked front");
                let _ = self.completions.send(TxCompletion {
                    local_id: done.local_id,
                    sender: done.sender,
                    bindings: done.bindings.clone(),
                    tx_hash: done.submitted_hash.clone(),
                    location: done.confirmed.clone(),
                    failure: done.failure.clone(),
                });
            }

            tokio::select! {
                _ = cancel.changed() => break,
                message = inbox.recv() => match message {
                    None => break,
                    Some(OrchestratorMsg::Admit(local_id)) => waiting.push_back(local_id),
                    Some(OrchestratorMsg::Update(local_id)) => {
                        self.apply_update(&mut queue, local_id);
                    }
                },
                _ = tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)) => {}
            }
        }
        info!(sender = %self.sender, "orchestrator stopped");
    }

    fn load_inflight(&self, local_id: u64) -> Result<Option<InFlight>, PublicTxError> {
        let row: Option<PublicTxRow> = self
            .db
            .get(Table::PublicTxns, &public_tx_key(&self.sender, local_id))?;
        let Some(row) = row else { return Ok(None) };
        let bindings = self.load_bindings(local_id)?;
        Ok(Some(InFlight::from_row(&row, bindings)))
    }

    fn load_bindings(&self, local_id: u64) -> Result<Vec<uuid::Uuid>, PublicTxError> {
        let rows: Vec<(Vec<u8>, super::PublicTxSubmissionRow)> =
            self.db.scan_prefix(Table::PublicTxSubmissions, &[])?;
        Ok(rows
            .into_iter()
            .filter(|(_, r)| r.sender == self.sender && r.local_id == local_id)
            .map(|(_, r)| r.transaction)
            .collect())
    }

    fn apply_update(&self, queue: &mut VecDeque<InFlight>, local_id: u64) {
        let Ok(Some(row)) = self
            .db
            .get::<PublicTxRow>(Table::PublicTxns, &public_tx_key(&self.sender, local_id))
        else {
            return;
        };
        if let Some(inflight) = queue.iter_mut().find(|t| t.local_id == local_id) {
            if inflight.new_version(row.to, row.data.clone(), row.gas_limit) {
                debug!(sender = %self.sender, local_id, version = row.version, "update opened new version");
            }
        }
        // Not in the queue yet: the row already carries the new
        // content, so admission will pick it up as-is.
    }

    // -- Advancing ----------------------------------------------------------

    async fn advance_queue(
        &mut self,
        queue: &mut VecDeque<InFlight>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), PublicTxError> {
        // FIFO with per-position balance reservations: each entry sees
        // the worst-case cost of everything ahead of it.
        let mut reserved_ahead: u128 = 0;
        for index in 0..queue.len() {
            let inflight = &mut queue[index];
            if !inflight.is_complete() {
                Self::step(
                    &self.db,
                    &self.ledger,
                    &self.signer,
                    &self.balance,
                    &self.nonces,
                    &self.config,
                    inflight,
                    reserved_ahead,
                    cancel,
                )
                .await?;
            }
            let price = inflight.last_gas_price.unwrap_or(0);
            reserved_ahead = reserved_ahead
                .saturating_add(BalanceManager::cost(inflight.current_version().gas_limit, price));
        }
        Ok(())
    }

    /// Advance one transaction as far as it can go this tick.
    #[allow(clippy::too_many_arguments)]
    async fn step(
        db: &Arc<CoreDb>,
        ledger: &Arc<dyn BaseLedger>,
        signer: &Arc<SigningModule>,
        balance: &BalanceManager,
        nonces: &NonceAllocator,
        config: &OrchestratorConfig,
        inflight: &mut InFlight,
        reserved_ahead: u128,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), PublicTxError> {
        loop {
            match inflight.stage {
                // ---- Received: allocate and persist the nonce.
                TxStage::Received => {
                    let nonce = nonces.assign();
                    Self::persist_output(db, config, inflight, cancel, |row| {
                        row.nonce = Some(nonce);
                    })
                    .await?;
                    inflight.nonce = Some(nonce);
                    inflight.stage = TxStage::Signing;
                }

                // ---- Signing: sign the current version's content.
                TxStage::Signing => {
                    let nonce = inflight.nonce.expect("nonce persisted before signing");
                    let version = inflight.current_version();
                    let sequence = version.sequence;
                    let payload = SignedSubmission::signing_payload(
                        &inflight.sender,
                        nonce,
                        version.gas_limit,
                        version.to.as_ref(),
                        &version.data,
                    );
                    let signature = signer
                        .sign(&inflight.from, ALGORITHM_ED25519, &payload)
                        .map_err(|e| PublicTxError::Signer(e.to_string()))?;

                    inflight.current_version_mut().output_pending = true;
                    let sig_hex = format!("0x{}", hex::encode(&signature));
                    let version_data = inflight.current_version().data.clone();
                    let version_to = inflight.current_version().to;
                    let version_gas = inflight.current_version().gas_limit;
                    Self::persist_output(db, config, inflight, cancel, move |row| {
                        row.signature = Some(sig_hex.clone());
                        row.version = sequence;
                        row.data = version_data.clone();
                        row.to = version_to;
                        row.gas_limit = version_gas;
                    })
                    .await?;
                    if !inflight.is_current_version(sequence) {
                        // An update raced the signing; the new version
                        // re-signs, this output is discarded.
                        if let Some(stale) =
                            inflight.versions.iter_mut().find(|v| v.sequence == sequence)
                        {
                            stale.output_pending = false;
                        }
                        continue;
                    }
                    let version = inflight.current_version_mut();
                    version.signature = Some(signature);
                    version.output_pending = false;
                    inflight.stage = TxStage::Submitting;
                }

                // ---- Submitting: balance gate, then first submission.
                TxStage::Submitting => {
                    let gas_price = match inflight.last_gas_price {
                        Some(price) => price,
                        None => ledger.gas_price().await?,
                    };
                    let cost =
                        BalanceManager::cost(inflight.current_version().gas_limit, gas_price);
                    let available = balance
                        .available_to_spend(&inflight.sender, reserved_ahead)
                        .await?;
                    if !BalanceManager::can_submit(cost, available) {
                        debug!(
                            local_id = inflight.local_id,
                            cost, available, "insufficient balance, holding submission"
                        );
                        return Ok(());
                    }
                    match Self::submit(db, ledger, config, inflight, gas_price, cancel).await? {
                        true => {}
                        false => return Ok(()), // transient; retry next tick
                    }
                }

                // ---- Tracking: poll for the confirmation.
                TxStage::Tracking => {
                    let Some(hash) = inflight.submitted_hash.clone() else {
                        inflight.stage = TxStage::Submitting;
                        continue;
                    };
                    match ledger.transaction_location(&hash).await? {
                        Some(location) => {
                            Self::persist_output(db, config, inflight, cancel, {
                                let location = location.clone();
                                move |row| row.confirmed = Some(location.clone())
                            })
                            .await?;
                            info!(
                                local_id = inflight.local_id,
                                block = location.block,
                                success = location.success,
                                "public transaction confirmed"
                            );
                            inflight.mark_confirmed(location);
                        }
                        None => {
                            let overdue = inflight.last_submit_at.is_none_or(|at| {
                                at.elapsed()
                                    >= Duration::from_millis(config.resubmit_interval_ms)
                            });
                            if overdue {
                                inflight.stage = TxStage::Escalating;
                                continue;
                            }
                            return Ok(());
                        }
                    }
                }

                // ---- Escalating: bump the price and replace.
                TxStage::Escalating => {
                    let last = match inflight.last_gas_price {
                        Some(price) => price,
                        None => ledger.gas_price().await?,
                    };
                    let bumped = escalate_gas_price(
                        last,
                        config.gas_escalation_factor,
                        config.gas_price_cap,
                    );
                    if bumped <= last {
                        // Already at the cap; hold until the next tick
                        // rather than spinning against the chain.
                        warn!(
                            local_id = inflight.local_id,
                            cap = config.gas_price_cap,
                            "gas price cap reached, holding"
                        );
                        inflight.stage = TxStage::Submitting;
                        return Ok(());
                    }
                    debug!(
                        local_id = inflight.local_id,
                        last, bumped, "escalating gas price"
                    );
                    inflight.last_gas_price = Some(bumped);
                    inflight.stage = TxStage::Submitting;
                }

                TxStage::Confirmed | TxStage::Failed => return Ok(()),
            }
        }
    }

    /// One submission attempt at `gas_price`. Returns `Ok(true)` when
    /// the machine advanced, `Ok(false)` to hold and retry next tick.
    async fn submit(
        db: &Arc<CoreDb>,
        ledger: &Arc<dyn BaseLedger>,
        config: &OrchestratorConfig,
        inflight: &mut InFlight,
        gas_price: u128,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<bool, PublicTxError> {
        let version = inflight.current_version();
        let sequence = version.sequence;
        let submission = SignedSubmission {
            sender: inflight.sender,
            nonce: inflight.nonce.expect("nonce persisted before submit"),
            gas_price,
            gas_limit: version.gas_limit,
            to: version.to,
            data: version.data.clone(),
            signature: version.signature.clone().unwrap_or_default(),
        };

        let result = ledger.submit(&submission).await;
        if !inflight.is_current_version(sequence) {
            // A later output of a stale version is discarded — the new
            // version drives its own submission.
            debug!(local_id = inflight.local_id, sequence, "discarding stale submit outcome");
            return Ok(true);
        }

        match result {
            Ok(hash) => {
                Self::persist_output(db, config, inflight, cancel, {
                    let hash = hash.clone();
                    move |row| {
                        row.submitted_hash = Some(hash.clone());
                        row.last_gas_price = Some(gas_price);
                    }
                })
                .await?;
                inflight.submitted_hash = Some(hash);
                inflight.last_gas_price = Some(gas_price);
                inflight.last_submit_at = Some(Instant::now());
                inflight.stage = TxStage::Tracking;
                Ok(true)
            }
            Err(LedgerError::Underpriced) => {
                // Repeat with a further bump.
                inflight.last_gas_price = Some(gas_price);
                inflight.stage = TxStage::Escalating;
                Ok(true)
            }
            Err(LedgerError::NonceTooLow) => {
                // Our earlier replacement (or a prior run) already made
                // it: keep tracking the known hash if we have one.
                if inflight.submitted_hash.is_some() {
                    inflight.stage = TxStage::Tracking;
                    Ok(true)
                } else {
                    let reason = "nonce consumed by an unknown transaction".to_string();
                    Self::persist_output(db, config, inflight, cancel, {
                        let reason = reason.clone();
                        move |row| row.failure = Some(reason.clone())
                    })
                    .await?;
                    inflight.mark_failed(reason);
                    Ok(true)
                }
            }
            Err(LedgerError::Rejected(reason)) => {
                Self::persist_output(db, config, inflight, cancel, {
                    let reason = reason.clone();
                    move |row| row.failure = Some(reason.clone())
                })
                .await?;
                inflight.mark_failed(reason);
                Ok(true)
            }
            Err(LedgerError::Unavailable(reason)) => {
                debug!(local_id = inflight.local_id, "ledger unavailable: {}", reason);
                Ok(false)
            }
        }
    }

    /// Persist a stage output, retrying on the configured interval
    /// until it lands (or the orchestrator is cancelled). Nothing
    /// advances past an unpersisted output.
    async fn persist_output(
        db: &Arc<CoreDb>,
        config: &OrchestratorConfig,
        inflight: &InFlight,
        cancel: &mut watch::Receiver<bool>,
        mutate: impl Fn(&mut PublicTxRow) + Send,
    ) -> Result<(), PublicTxError> {
        let key = public_tx_key(&inflight.sender, inflight.local_id);
        loop {
            let attempt = db.transaction::<_, PublicTxError, _>(|txn| {
                let mut row: PublicTxRow = txn
                    .get(Table::PublicTxns, &key)?
                    .ok_or(PublicTxError::NotFound(inflight.local_id))?;
                mutate(&mut row);
                txn.put(Table::PublicTxns, &key, &row)?;
                Ok(())
            });
            match attempt {
                Ok(()) => return Ok(()),
                Err(e @ PublicTxError::NotFound(_)) => return Err(e),
                Err(e) => {
                    warn!(
                        local_id = inflight.local_id,
                        "stage output persistence failed, retrying: {}", e
                    );
                    tokio::select! {
                        _ = cancel.changed() => return Err(PublicTxError::Stopped),
                        _ = tokio::time::sleep(Duration::from_millis(
                            config.stage_persistence_retry_ms,
                        )) => {}
                    }
                }
            }
        }
    }
}
