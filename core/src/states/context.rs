//! Per-transaction domain contexts: the in-memory overlay on the store.
//!
//! A context makes two adjustments to what the database would say:
//! states this context is *creating* become queryable before they are
//! flushed or confirmed, and states it is *spending* disappear from its
//! own queries. Both views exist only in memory, on the assembling node.
//!
//! Overlay mutations are serialised by one mutex per context. Flushes
//! run on a background thread outside that mutex; only the seal/swap of
//! the `unFlushed` slot happens under it, and at most one flush is in
//! progress per context. A failed flush poisons the context: every
//! later mutation reports "must reset" until [`DomainContext::reset`]
//! is called, because in-memory state past a failed flush cannot be
//! trusted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::filters::{sort_by_fields, Query};
use crate::types::{now_millis, LedgerAddress, SchemaId, StateId};

use super::store::StateStore;
use super::writer::WriteOperation;
use super::{LockKind, MaterializedState, Nullifier, StateError, StateLock, StateUpsert};

// ---------------------------------------------------------------------------
// Public shapes
// ---------------------------------------------------------------------------

/// Identity row for a live context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextInfo {
    pub id: Uuid,
    pub domain: String,
    pub contract: LedgerAddress,
}

/// A state crossing the context boundary: always carries the union of
/// locks currently applied to it in this context.
#[derive(Debug, Clone)]
pub struct AvailableState {
    pub state: MaterializedState,
    pub locks: Vec<StateLock>,
}

// ---------------------------------------------------------------------------
// Flush completion plumbing
// ---------------------------------------------------------------------------

/// Shared completion slot for one in-flight flush. `None` = running;
/// `Some(None)` = succeeded; `Some(Some(msg))` = failed with message.
struct FlushShared {
    result: Mutex<Option<Option<String>>>,
    cond: Condvar,
}

impl FlushShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn complete(&self, err: Option<String>) {
        let mut slot = self.result.lock();
        *slot = Some(err);
        self.cond.notify_all();
    }

    /// Block until the flush finishes; returns its error message if any.
    fn wait(&self) -> Option<String> {
        let mut slot = self.result.lock();
        while slot.is_none() {
            self.cond.wait(&mut slot);
        }
        slot.clone().expect("slot filled")
    }

    /// Non-blocking peek.
    fn try_result(&self) -> Option<Option<String>> {
        self.result.lock().clone()
    }
}

struct FlushHandle {
    op_id: Uuid,
    shared: Arc<FlushShared>,
}

// ---------------------------------------------------------------------------
// DomainContext
// ---------------------------------------------------------------------------

struct CtxInner {
    closed: bool,
    un_flushed: Option<WriteOperation>,
    flushing: Option<FlushHandle>,
    /// Only states in this map may be returned as "available" from this
    /// context. Entries survive flushes — the database will not return
    /// these states as available until they are confirmed, so the map
    /// lives until `clear_transactions` or a reset.
    creating: HashMap<StateId, MaterializedState>,
    /// Ordered lock list. No duplicate detection, by contract: the same
    /// lock may appear more than once harmlessly.
    locks: Vec<StateLock>,
}

/// A transient, per-transaction overlay on the state store, scoped to
/// one (domain, contract).
pub struct DomainContext {
    id: Uuid,
    domain: String,
    contract: LedgerAddress,
    store: Arc<StateStore>,
    inner: Mutex<CtxInner>,
}

impl DomainContext {
    pub(super) fn new(store: Arc<StateStore>, domain: &str, contract: LedgerAddress) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            domain: domain.to_string(),
            contract,
            store,
            inner: Mutex::new(CtxInner {
                closed: false,
                un_flushed: None,
                flushing: None,
                creating: HashMap::new(),
                locks: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn contract(&self) -> LedgerAddress {
        self.contract
    }

    pub fn info(&self) -> ContextInfo {
        ContextInfo {
            id: self.id,
            domain: self.domain.clone(),
            contract: self.contract,
        }
    }

    /// MUST hold the inner lock. Rejects operations on a closed context,
    /// surfaces a completed-but-failed flush (the must-reset condition),
    /// and lazily initialises the `unFlushed` slot.
    fn check_flush_and_init(&self, inner: &mut CtxInner) -> Result<(), StateError> {
        if inner.closed {
            return Err(StateError::ContextClosed);
        }
        if let Some(handle) = &inner.flushing {
            if let Some(Some(msg)) = handle.shared.try_result() {
                warn!(context = %self.id, flush = %handle.op_id, "flush failed - context must be reset");
                return Err(StateError::FlushFailed(msg));
            }
        }
        if inner.un_flushed.is_none() {
            inner.un_flushed = Some(WriteOperation::new(&self.domain, self.contract));
        }
        Ok(())
    }

    /// The set of state ids spend-locked by this context.
    fn spending_set(&self, inner: &CtxInner) -> HashSet<StateId> {
        inner
            .locks
            .iter()
            .filter(|l| l.kind == LockKind::Spend)
            .map(|l| l.state.clone())
            .collect()
    }

    // -- Queries ------------------------------------------------------------

    /// Run an "available states" query under this context's view:
    /// durable matches minus spend-locked, plus overlay creating states
    /// that match — de-duplicated by id, re-sorted under the query's
    /// sort, truncated to its limit, each result carrying the union of
    /// this context's current locks on it.
    pub fn find_available_states(
        &self,
        schema_id: &SchemaId,
        query: &Query,
    ) -> Result<Vec<AvailableState>, StateError> {
        self.find_available(schema_id, query, false)
    }

    /// As [`Self::find_available_states`], but every returned state must
    /// carry a nullifier (overlay or durable).
    pub fn find_available_nullifiers(
        &self,
        schema_id: &SchemaId,
        query: &Query,
    ) -> Result<Vec<AvailableState>, StateError> {
        self.find_available(schema_id, query, true)
    }

    fn find_available(
        &self,
        schema_id: &SchemaId,
        query: &Query,
        require_nullifier: bool,
    ) -> Result<Vec<AvailableState>, StateError> {
        let schema = self.store.get_schema(&self.domain, schema_id)?;
        let kind_of = |field: &str| schema.label_kind(field);

        // Snapshot the spending set under the lock, then query the
        // database without holding it.
        let spending = {
            let mut inner = self.inner.lock();
            self.check_flush_and_init(&mut inner)?;
            self.spending_set(&inner)
        };
        let durable = self.store.find_available_states(
            &self.domain,
            &self.contract,
            schema_id,
            query,
            &spending,
            require_nullifier,
        )?;

        // Re-take the lock to merge the overlay as of *now*.
        let mut inner = self.inner.lock();
        self.check_flush_and_init(&mut inner)?;
        let spending = self.spending_set(&inner);
        let durable_ids: HashSet<StateId> = durable.iter().map(|s| s.id.clone()).collect();

        let mut merged = durable;
        for state in inner.creating.values() {
            if state.schema != *schema_id
                || spending.contains(&state.id)
                || durable_ids.contains(&state.id)
            {
                continue;
            }
            if require_nullifier && state.nullifier.is_none() {
                continue;
            }
            if query.matches(&kind_of, &state.labels)? {
                debug!(state = %state.id, "matched state from un-flushed overlay");
                merged.push(state.clone());
            }
        }

        let sort = query.sort_fields();
        sort_by_fields(&mut merged, &sort, |s, field| s.labels.get(field).cloned());
        if let Some(limit) = query.limit {
            merged.truncate(limit);
        }

        Ok(merged
            .into_iter()
            .map(|state| {
                let locks = inner
                    .locks
                    .iter()
                    .filter(|l| l.state == state.id)
                    .cloned()
                    .collect();
                AvailableState { state, locks }
            })
            .collect())
    }

    // -- Mutations ----------------------------------------------------------

    /// Validate and add states to the overlay.
    ///
    /// Repeat upserts of the same id replace the previous overlay entry
    /// (last write wins); a flushed repeat never produces a duplicate
    /// row. Upserts carrying `created_by` gain a create-lock and enter
    /// the creating map; the rest are flushed for data availability but
    /// never returned as available from this context.
    pub fn upsert_states(
        &self,
        upserts: Vec<StateUpsert>,
    ) -> Result<Vec<MaterializedState>, StateError> {
        // Materialise outside the lock: schema lookups hit the database.
        let mut materialised = Vec::with_capacity(upserts.len());
        let mut new_locks = Vec::new();
        for upsert in upserts {
            let schema = self.store.get_schema(&self.domain, &upsert.schema)?;
            let state =
                self.store
                    .process_state(&schema, upsert.data, upsert.id, now_millis())?;
            if let Some(tx) = upsert.created_by {
                debug!(state = %state.id, %tx, "upserting state with create lock");
                new_locks.push(StateLock {
                    state: state.id.clone(),
                    transaction: tx,
                    kind: LockKind::Create,
                });
            } else {
                debug!(state = %state.id, "upserting state (no create lock)");
            }
            materialised.push(state);
        }

        let mut inner = self.inner.lock();
        self.check_flush_and_init(&mut inner)?;

        let op = inner.un_flushed.as_mut().expect("initialised above");
        // De-duplicate previous un-flushed writes of the same ids.
        op.states
            .retain(|existing| !materialised.iter().any(|s| s.id == existing.id));
        op.states.extend(materialised.iter().cloned());

        for lock in &new_locks {
            let state = materialised
                .iter()
                .find(|s| s.id == lock.state)
                .expect("lock built from materialised state");
            inner.creating.insert(state.id.clone(), state.clone());
        }
        self.add_locks_internal(&mut inner, new_locks)?;

        Ok(materialised)
    }

    /// Attach nullifiers to overlay states.
    ///
    /// Fails if the state is not in the creating map, or if a different
    /// nullifier is already attached.
    pub fn upsert_nullifiers(&self, nullifiers: Vec<Nullifier>) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        self.check_flush_and_init(&mut inner)?;

        for nullifier in nullifiers {
            let creating = inner.creating.get_mut(&nullifier.state).ok_or_else(|| {
                StateError::NullifierNotInContext {
                    state: nullifier.state.clone(),
                }
            })?;
            if let Some(existing) = &creating.nullifier {
                if existing.id != nullifier.id {
                    return Err(StateError::NullifierConflict {
                        state: nullifier.state.clone(),
                        existing: existing.id.clone(),
                    });
                }
            }
            creating.nullifier = Some(nullifier.clone());

            let op = inner.un_flushed.as_mut().expect("initialised above");
            // Keep any un-flushed copy of the state itself in step.
            if let Some(state) = op.states.iter_mut().find(|s| s.id == nullifier.state) {
                state.nullifier = Some(nullifier.clone());
            }
            op.nullifiers.push(nullifier);
        }
        Ok(())
    }

    /// Add locks to the context's view.
    pub fn add_state_locks(&self, locks: Vec<StateLock>) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        self.check_flush_and_init(&mut inner)?;
        self.add_locks_internal(&mut inner, locks)
    }

    /// MUST hold the inner lock.
    fn add_locks_internal(
        &self,
        inner: &mut CtxInner,
        locks: Vec<StateLock>,
    ) -> Result<(), StateError> {
        for lock in locks {
            if lock.transaction.is_nil() {
                return Err(StateError::LockMissingTransaction);
            }
            if lock.state.as_bytes().is_empty() {
                return Err(StateError::InvalidState(
                    "state lock is missing its state id".to_string(),
                ));
            }
            // A create lock must refer to a state held in the overlay,
            // or queries would never be able to return it.
            if lock.kind == LockKind::Create && !inner.creating.contains_key(&lock.state) {
                return Err(StateError::CreateLockNotInContext { state: lock.state });
            }
            debug!(state = %lock.state, kind = ?lock.kind, tx = %lock.transaction, "adding state lock");
            inner.locks.push(lock);
        }
        Ok(())
    }

    /// Drop every lock belonging to the given transactions; for cleared
    /// create-locks the overlay and creating-map entries go too.
    ///
    /// Only call after the confirmation of the states involved is fully
    /// durable — this is what flips the states' visibility from "this
    /// context's overlay" to "everyone's database".
    pub fn clear_transactions(&self, transactions: &[Uuid]) {
        let mut inner = self.inner.lock();
        let mut kept = Vec::with_capacity(inner.locks.len());
        let mut dropped_creates = Vec::new();
        for lock in inner.locks.drain(..) {
            if transactions.contains(&lock.transaction) {
                if lock.kind == LockKind::Create {
                    dropped_creates.push(lock.state.clone());
                }
            } else {
                kept.push(lock);
            }
        }
        inner.locks = kept;
        for state in &dropped_creates {
            inner.creating.remove(state);
            if let Some(op) = inner.un_flushed.as_mut() {
                op.states.retain(|s| s.id != *state);
            }
        }
    }

    /// A state from this context's creating map, if present.
    pub fn get_created(&self, id: &StateId) -> Option<MaterializedState> {
        self.inner.lock().creating.get(id).cloned()
    }

    /// The current lock view, grouped by transaction.
    pub fn state_locks_by_transaction(&self) -> HashMap<Uuid, Vec<StateLock>> {
        let inner = self.inner.lock();
        let mut out: HashMap<Uuid, Vec<StateLock>> = HashMap::new();
        for lock in &inner.locks {
            out.entry(lock.transaction).or_default().push(lock.clone());
        }
        out
    }

    // -- Flush lifecycle ----------------------------------------------------

    /// MUST hold the inner lock. If a flush is in progress, wait for it
    /// here (one flush ahead, never two); a failed previous flush is
    /// surfaced to the caller.
    fn clear_existing_flush(&self, inner: &mut CtxInner) -> Result<(), StateError> {
        if let Some(handle) = inner.flushing.take() {
            if let Some(msg) = handle.shared.wait() {
                // Put the failed handle back: the context stays poisoned
                // until reset.
                inner.flushing = Some(handle);
                return Err(StateError::FlushFailed(msg));
            }
        }
        Ok(())
    }

    /// Seal the current overlay and write it in the background.
    ///
    /// `callback` is always invoked exactly once with the flush outcome
    /// (`None` on success — including the nothing-to-do case).
    pub fn initiate_flush(
        &self,
        callback: impl FnOnce(Option<StateError>) + Send + 'static,
    ) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StateError::ContextClosed);
        }
        self.clear_existing_flush(&mut inner)?;

        let op = inner.un_flushed.take();
        let shared = FlushShared::new();
        if let Some(op) = &op {
            inner.flushing = Some(FlushHandle {
                op_id: op.id,
                shared: Arc::clone(&shared),
            });
        }
        drop(inner);

        let writer = self.store.writer();
        let context_id = self.id;
        std::thread::spawn(move || {
            let result = match &op {
                Some(op) if !op.is_empty() => {
                    debug!(context = %context_id, flush = %op.id, states = op.states.len(), "flushing");
                    writer.write(op)
                }
                _ => Ok(()),
            };
            match result {
                Ok(()) => {
                    shared.complete(None);
                    callback(None);
                }
                Err(e) => {
                    shared.complete(Some(e.to_string()));
                    callback(Some(e));
                }
            }
        });
        Ok(())
    }

    /// Block until any in-flight flush completes, then discard all
    /// overlay state, the creating map and every lock.
    ///
    /// Required after a flush failure: the caller must re-drive the
    /// context from its last point of consistency.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.flushing.take() {
            if let Some(msg) = handle.shared.wait() {
                warn!(context = %self.id, "reset recovering from flush error: {}", msg);
            }
        }
        inner.un_flushed = None;
        inner.creating.clear();
        inner.locks.clear();
    }

    /// Mark closed and deregister. Subsequent operations fail.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
        }
        debug!(context = %self.id, domain = %self.domain, contract = %self.contract, "domain context closed");
        self.store.remove_context(self.id);
    }
}

impl std::fmt::Debug for DomainContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainContext")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("contract", &self.contract)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
