//! # Persistence Gateway
//!
//! Durable storage for the engine: a [`CoreDb`] wrapping the embedded
//! store with one named tree per table, and a [`DbTxn`] write-set that
//! gives every caller transactional semantics plus post-commit /
//! post-rollback hooks.
//!
//! Components never touch trees directly for writes — they stage
//! operations on a `DbTxn` and the gateway applies them together. Caches
//! are filled exclusively from post-commit hooks so a rolled-back write
//! can never leak into memory.

pub mod db;
pub mod txn;

pub use db::{CoreDb, DbError, DbResult, Table};
pub use txn::DbTxn;
