//! The transactional write-set.
//!
//! A [`DbTxn`] stages puts and deletes without touching the trees, gives
//! read-through visibility of its own staged writes, and carries the
//! post-commit / post-rollback hooks that the rest of the engine leans on
//! (cache fills on commit, idempotency reconciliation on rollback).

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::db::{decode, encode, CoreDb, DbResult, Table};

type Hook = Box<dyn FnOnce() + Send>;

/// A staged write-set against a [`CoreDb`].
///
/// Created by [`CoreDb::transaction`]; never constructed directly.
pub struct DbTxn<'a> {
    db: &'a CoreDb,
    /// Ordered staged operations: `(table, key, Some(value) | None)`.
    /// Later entries shadow earlier ones for the same key.
    staged: Vec<(Table, Vec<u8>, Option<Vec<u8>>)>,
    post_commit: Vec<Hook>,
    post_rollback: Vec<Hook>,
}

impl<'a> DbTxn<'a> {
    pub(crate) fn new(db: &'a CoreDb) -> Self {
        Self {
            db,
            staged: Vec::new(),
            post_commit: Vec::new(),
            post_rollback: Vec::new(),
        }
    }

    // -- Staging ------------------------------------------------------------

    /// Stage an insert/replace of `value` at `key`.
    pub fn put<T: Serialize>(&mut self, table: Table, key: &[u8], value: &T) -> DbResult<()> {
        let bytes = encode(value)?;
        self.staged.push((table, key.to_vec(), Some(bytes)));
        Ok(())
    }

    /// Stage an insert only if no row exists at `key` (durably or staged).
    ///
    /// Returns `true` if the insert was staged, `false` if a row already
    /// exists — the "on conflict do nothing" path used by idempotent
    /// retry writes.
    pub fn put_if_absent<T: Serialize>(
        &mut self,
        table: Table,
        key: &[u8],
        value: &T,
    ) -> DbResult<bool> {
        if self.exists(table, key)? {
            return Ok(false);
        }
        self.put(table, key, value)?;
        Ok(true)
    }

    /// Stage a delete of `key`.
    pub fn delete(&mut self, table: Table, key: &[u8]) {
        self.staged.push((table, key.to_vec(), None));
    }

    // -- Read-through -------------------------------------------------------

    /// Read a row, seeing this write-set's own staged operations first.
    pub fn get<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> DbResult<Option<T>> {
        for (t, k, v) in self.staged.iter().rev() {
            if *t == table && k.as_slice() == key {
                return match v {
                    Some(bytes) => Ok(Some(decode(bytes)?)),
                    None => Ok(None),
                };
            }
        }
        self.db.get(table, key)
    }

    /// True if a row exists at `key`, staged writes included.
    pub fn exists(&self, table: Table, key: &[u8]) -> DbResult<bool> {
        for (t, k, v) in self.staged.iter().rev() {
            if *t == table && k.as_slice() == key {
                return Ok(v.is_some());
            }
        }
        self.db.contains(table, key)
    }

    /// Prefix scan with this write-set's staged operations merged in.
    pub fn scan_prefix<T: DeserializeOwned>(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> DbResult<Vec<(Vec<u8>, T)>> {
        use std::collections::BTreeMap;

        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        for entry in self.db.tree(table).scan_prefix(prefix) {
            let (key, value) = entry?;
            merged.insert(key.to_vec(), Some(value.to_vec()));
        }
        for (t, k, v) in &self.staged {
            if *t == table && k.starts_with(prefix) {
                merged.insert(k.clone(), v.clone());
            }
        }

        let mut out = Vec::with_capacity(merged.len());
        for (key, value) in merged {
            if let Some(bytes) = value {
                out.push((key, decode(&bytes)?));
            }
        }
        Ok(out)
    }

    // -- Sequences ----------------------------------------------------------

    /// Allocate the next value of a monotonic counter stored in the
    /// `meta` table. The increment is part of this write-set, so the
    /// counter only advances if the transaction commits.
    pub fn next_sequence(&mut self, counter: &[u8]) -> DbResult<u64> {
        let current: u64 = self.get(Table::Meta, counter)?.unwrap_or(0);
        let next = current + 1;
        self.put(Table::Meta, counter, &next)?;
        Ok(next)
    }

    // -- Hooks --------------------------------------------------------------

    /// Register a hook that runs after the write-set is durably applied.
    pub fn on_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.post_commit.push(Box::new(hook));
    }

    /// Register a hook that runs if the transaction does not commit.
    pub fn on_rollback(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.post_rollback.push(Box::new(hook));
    }

    #[allow(clippy::type_complexity)]
    pub(crate) fn into_parts(self) -> (Vec<(Table, Vec<u8>, Option<Vec<u8>>)>, Vec<Hook>, Vec<Hook>) {
        (self.staged, self.post_commit, self.post_rollback)
    }
}

impl std::fmt::Debug for DbTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbTxn")
            .field("staged_ops", &self.staged.len())
            .field("post_commit_hooks", &self.post_commit.len())
            .field("post_rollback_hooks", &self.post_rollback.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::db::DbError;
    use super::*;

    #[test]
    fn read_through_sees_staged_writes() {
        let db = CoreDb::open_temporary().unwrap();
        db.transaction::<_, DbError, _>(|txn| {
            assert_eq!(txn.get::<u64>(Table::Meta, b"k").unwrap(), None);
            txn.put(Table::Meta, b"k", &7u64)?;
            assert_eq!(txn.get::<u64>(Table::Meta, b"k").unwrap(), Some(7));
            txn.delete(Table::Meta, b"k");
            assert_eq!(txn.get::<u64>(Table::Meta, b"k").unwrap(), None);
            Ok(())
        })
        .unwrap();
        assert_eq!(db.get::<u64>(Table::Meta, b"k").unwrap(), None);
    }

    #[test]
    fn put_if_absent_detects_durable_and_staged_rows() {
        let db = CoreDb::open_temporary().unwrap();
        db.transaction::<_, DbError, _>(|txn| {
            txn.put(Table::Meta, b"existing", &1u64)?;
            Ok(())
        })
        .unwrap();

        db.transaction::<_, DbError, _>(|txn| {
            assert!(!txn.put_if_absent(Table::Meta, b"existing", &2u64)?);
            assert!(txn.put_if_absent(Table::Meta, b"fresh", &3u64)?);
            assert!(!txn.put_if_absent(Table::Meta, b"fresh", &4u64)?);
            Ok(())
        })
        .unwrap();

        assert_eq!(db.get::<u64>(Table::Meta, b"existing").unwrap(), Some(1));
        assert_eq!(db.get::<u64>(Table::Meta, b"fresh").unwrap(), Some(3));
    }

    #[test]
    fn sequence_is_monotonic_and_transactional() {
        let db = CoreDb::open_temporary().unwrap();
        let first = db
            .transaction::<_, DbError, _>(|txn| txn.next_sequence(b"seq"))
            .unwrap();
        assert_eq!(first, 1);

        // A rolled-back allocation must not advance the counter.
        let _ = db.transaction::<u64, DbError, _>(|txn| {
            let _ = txn.next_sequence(b"seq")?;
            Err(DbError::Conflict("rollback".into()))
        });

        let second = db
            .transaction::<_, DbError, _>(|txn| txn.next_sequence(b"seq"))
            .unwrap();
        assert_eq!(second, 2);
    }

    #[test]
    fn scan_prefix_merges_staged_over_durable() {
        let db = CoreDb::open_temporary().unwrap();
        db.transaction::<_, DbError, _>(|txn| {
            txn.put(Table::Meta, b"s/1", &1u64)?;
            txn.put(Table::Meta, b"s/2", &2u64)?;
            Ok(())
        })
        .unwrap();

        db.transaction::<_, DbError, _>(|txn| {
            txn.put(Table::Meta, b"s/2", &20u64)?; // shadow
            txn.put(Table::Meta, b"s/3", &3u64)?; // new
            txn.delete(Table::Meta, b"s/1"); // remove
            let rows: Vec<(Vec<u8>, u64)> = txn.scan_prefix(Table::Meta, b"s/")?;
            let values: Vec<u64> = rows.into_iter().map(|(_, v)| v).collect();
            assert_eq!(values, vec![20, 3]);
            Ok(())
        })
        .unwrap();
    }
}
