//! The durable store: named trees as tables over an embedded database.
//!
//! ## Tree layout
//!
//! Each [`Table`] maps to an independent sled tree. Values are bincode;
//! keys are composite byte strings built by the owning module (fixed-width
//! fields raw, variable-width name fields terminated with a `0x00`
//! separator so prefix scans stay unambiguous).
//!
//! ## Atomicity
//!
//! All writes flow through [`super::DbTxn`]: the staged operations are
//! applied as one batch per touched tree under a single writer lock, then
//! flushed. Either the whole write-set is applied or (on staging error)
//! none of it is.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::Tree;

use super::txn::DbTxn;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from the persistence gateway.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

pub type DbResult<T> = Result<T, DbError>;

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Every durable table the engine owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Transactions,
    TransactionDeps,
    TransactionReceipts,
    TransactionIdempotency,
    Abis,
    Schemas,
    States,
    StateLabels,
    StateInt64Labels,
    StateNullifiers,
    StateConfirms,
    StateSpends,
    Dispatches,
    StateDistributions,
    StateDistributionAcks,
    ReliableMessages,
    ReliableMessageAcks,
    PublicTxns,
    PublicTxSubmissions,
    PrivacyGroups,
    PrivacyGroupMembers,
    SmartContracts,
    Meta,
}

impl Table {
    /// The sled tree name for this table.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Transactions => "transactions",
            Self::TransactionDeps => "transaction_deps",
            Self::TransactionReceipts => "transaction_receipts",
            Self::TransactionIdempotency => "transaction_idempotency",
            Self::Abis => "abis",
            Self::Schemas => "schemas",
            Self::States => "states",
            Self::StateLabels => "state_labels",
            Self::StateInt64Labels => "state_int64_labels",
            Self::StateNullifiers => "state_nullifiers",
            Self::StateConfirms => "state_confirms",
            Self::StateSpends => "state_spends",
            Self::Dispatches => "dispatches",
            Self::StateDistributions => "state_distributions",
            Self::StateDistributionAcks => "state_distribution_acks",
            Self::ReliableMessages => "reliable_messages",
            Self::ReliableMessageAcks => "reliable_message_acks",
            Self::PublicTxns => "public_txns",
            Self::PublicTxSubmissions => "public_tx_submissions",
            Self::PrivacyGroups => "privacy_groups",
            Self::PrivacyGroupMembers => "privacy_group_members",
            Self::SmartContracts => "private_smart_contracts",
            Self::Meta => "meta",
        }
    }

    const ALL: &'static [Table] = &[
        Self::Transactions,
        Self::TransactionDeps,
        Self::TransactionReceipts,
        Self::TransactionIdempotency,
        Self::Abis,
        Self::Schemas,
        Self::States,
        Self::StateLabels,
        Self::StateInt64Labels,
        Self::StateNullifiers,
        Self::StateConfirms,
        Self::StateSpends,
        Self::Dispatches,
        Self::StateDistributions,
        Self::StateDistributionAcks,
        Self::ReliableMessages,
        Self::ReliableMessageAcks,
        Self::PublicTxns,
        Self::PublicTxSubmissions,
        Self::PrivacyGroups,
        Self::PrivacyGroupMembers,
        Self::SmartContracts,
        Self::Meta,
    ];
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

pub(crate) fn encode<T: Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// CoreDb
// ---------------------------------------------------------------------------

/// Handle to the node's durable store.
///
/// Cheap to clone via `Arc`; all trees are opened once at startup. Reads
/// go straight to the trees; writes go through [`CoreDb::transaction`].
pub struct CoreDb {
    db: sled::Db,
    trees: HashMap<Table, Tree>,
    /// Serializes write-set application so two transactions never
    /// interleave their per-tree batches.
    write_lock: Mutex<()>,
}

impl CoreDb {
    /// Open (or create) the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// An in-memory store that disappears on drop. For tests.
    pub fn open_temporary() -> DbResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> DbResult<Self> {
        let mut trees = HashMap::with_capacity(Table::ALL.len());
        for table in Table::ALL {
            trees.insert(*table, db.open_tree(table.name())?);
        }
        Ok(Self {
            db,
            trees,
            write_lock: Mutex::new(()),
        })
    }

    pub(crate) fn tree(&self, table: Table) -> &Tree {
        // All tables are opened in from_db; a miss is a programming error.
        self.trees.get(&table).expect("table tree opened at startup")
    }

    // -- Reads --------------------------------------------------------------

    /// Fetch and decode a single row.
    pub fn get<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> DbResult<Option<T>> {
        match self.tree(table).get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// True if a row exists at `key`.
    pub fn contains(&self, table: Table, key: &[u8]) -> DbResult<bool> {
        Ok(self.tree(table).contains_key(key)?)
    }

    /// Scan all rows whose key starts with `prefix`, in key order.
    pub fn scan_prefix<T: DeserializeOwned>(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> DbResult<Vec<(Vec<u8>, T)>> {
        let mut out = Vec::new();
        for entry in self.tree(table).scan_prefix(prefix) {
            let (key, value) = entry?;
            out.push((key.to_vec(), decode(&value)?));
        }
        Ok(out)
    }

    /// Scan rows with key in `[from, to)` under `prefix` ordering rules.
    pub fn scan_range<T: DeserializeOwned>(
        &self,
        table: Table,
        from: &[u8],
        to: &[u8],
    ) -> DbResult<Vec<(Vec<u8>, T)>> {
        let mut out = Vec::new();
        for entry in self.tree(table).range(from.to_vec()..to.to_vec()) {
            let (key, value) = entry?;
            out.push((key.to_vec(), decode(&value)?));
        }
        Ok(out)
    }

    /// Number of rows in a table. O(n) in sled; fine for tests and status.
    pub fn count(&self, table: Table) -> usize {
        self.tree(table).len()
    }

    // -- Writes -------------------------------------------------------------

    /// Run `f` against a fresh write-set and commit it atomically.
    ///
    /// The writer lock is held for the whole transaction, so two
    /// write-sets never interleave: an insert-if-absent checked inside
    /// one transaction cannot be raced by another (the unique-key
    /// guarantee the idempotency path depends on). On `Ok`, the staged
    /// operations are applied (one batch per touched tree), the store
    /// is flushed, and the post-commit hooks run. On `Err`, nothing is
    /// applied and the post-rollback hooks run instead. The error type
    /// only needs a `From<DbError>` so callers keep their own enums.
    ///
    /// Never open a transaction inside another transaction's closure.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<DbError>,
        F: FnOnce(&mut DbTxn<'_>) -> Result<T, E>,
    {
        let guard = self.write_lock.lock();
        let mut txn = DbTxn::new(self);
        match f(&mut txn) {
            Ok(value) => {
                let (staged, post_commit, post_rollback) = txn.into_parts();
                let applied = self.apply(staged);
                drop(guard);
                match applied {
                    Ok(()) => {
                        for hook in post_commit {
                            hook();
                        }
                        Ok(value)
                    }
                    Err(e) => {
                        for hook in post_rollback {
                            hook();
                        }
                        Err(E::from(e))
                    }
                }
            }
            Err(e) => {
                let (_, _, post_rollback) = txn.into_parts();
                drop(guard);
                for hook in post_rollback {
                    hook();
                }
                Err(e)
            }
        }
    }

    /// Apply a staged write-set as one batch per touched tree. Caller
    /// holds the writer lock.
    fn apply(&self, staged: Vec<(Table, Vec<u8>, Option<Vec<u8>>)>) -> DbResult<()> {
        if staged.is_empty() {
            return Ok(());
        }
        let mut batches: HashMap<Table, sled::Batch> = HashMap::new();
        for (table, key, value) in staged {
            let batch = batches.entry(table).or_default();
            match value {
                Some(v) => batch.insert(key, v),
                None => batch.remove(key),
            }
        }
        for (table, batch) in batches {
            self.tree(table).apply_batch(batch)?;
        }
        self.db.flush()?;
        Ok(())
    }

    /// Force a flush of all pending writes to disk.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_temporary_is_empty() {
        let db = CoreDb::open_temporary().unwrap();
        assert_eq!(db.count(Table::Transactions), 0);
        assert_eq!(db.count(Table::States), 0);
    }

    #[test]
    fn open_persistent_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = CoreDb::open(dir.path()).unwrap();
            db.transaction::<_, DbError, _>(|txn| {
                txn.put(Table::Meta, b"answer", &42u64)?;
                Ok(())
            })
            .unwrap();
        }
        let db = CoreDb::open(dir.path()).unwrap();
        assert_eq!(db.get::<u64>(Table::Meta, b"answer").unwrap(), Some(42));
    }

    #[test]
    fn transaction_commit_applies_all_tables() {
        let db = CoreDb::open_temporary().unwrap();
        db.transaction::<_, DbError, _>(|txn| {
            txn.put(Table::Meta, b"a", &1u64)?;
            txn.put(Table::Schemas, b"b", &2u64)?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.get::<u64>(Table::Meta, b"a").unwrap(), Some(1));
        assert_eq!(db.get::<u64>(Table::Schemas, b"b").unwrap(), Some(2));
    }

    #[test]
    fn transaction_error_applies_nothing() {
        let db = CoreDb::open_temporary().unwrap();
        let result: Result<(), DbError> = db.transaction(|txn| {
            txn.put(Table::Meta, b"a", &1u64)?;
            Err(DbError::Conflict("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(db.get::<u64>(Table::Meta, b"a").unwrap(), None);
    }

    #[test]
    fn post_commit_and_rollback_hooks() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let db = CoreDb::open_temporary().unwrap();
        let committed = Arc::new(AtomicU32::new(0));
        let rolled_back = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&committed);
        db.transaction::<_, DbError, _>(|txn| {
            txn.put(Table::Meta, b"x", &1u64)?;
            txn.on_commit(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            Ok(())
        })
        .unwrap();
        assert_eq!(committed.load(Ordering::SeqCst), 1);

        let c = Arc::clone(&committed);
        let r = Arc::clone(&rolled_back);
        let result: Result<(), DbError> = db.transaction(|txn| {
            txn.on_commit(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            txn.on_rollback(move || {
                r.fetch_add(1, Ordering::SeqCst);
            });
            Err(DbError::Conflict("nope".into()))
        });
        assert!(result.is_err());
        assert_eq!(committed.load(Ordering::SeqCst), 1, "commit hook must not run");
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scan_prefix_in_key_order() {
        let db = CoreDb::open_temporary().unwrap();
        db.transaction::<_, DbError, _>(|txn| {
            txn.put(Table::Meta, b"p/3", &3u64)?;
            txn.put(Table::Meta, b"p/1", &1u64)?;
            txn.put(Table::Meta, b"p/2", &2u64)?;
            txn.put(Table::Meta, b"q/9", &9u64)?;
            Ok(())
        })
        .unwrap();

        let rows: Vec<(Vec<u8>, u64)> = db.scan_prefix(Table::Meta, b"p/").unwrap();
        let values: Vec<u64> = rows.into_iter().map(|(_, v)| v).collect();
        assert_eq!(values, vec![1, 2, 3]);
    }
}
