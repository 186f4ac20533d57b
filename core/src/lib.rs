// Copyright (c) 2026 Umbra Labs. MIT License.
// See LICENSE for details.

//! # UMBRA Core — Coordination Engine
//!
//! The on-node core of a permissioned, privacy-preserving ledger
//! platform. Clients submit private transactions against pluggable
//! privacy domains; this engine assembles them against a private state
//! store, collects signatures and endorsements from the required
//! parties across the network, and dispatches the resulting public
//! transactions to a shared base ledger — without ever showing private
//! state to a non-participant.
//!
//! ## Architecture
//!
//! The modules map onto the moving parts of the node:
//!
//! - **storage** — the persistence gateway: tables, write-sets,
//!   post-commit/post-rollback hooks. Everything durable goes through
//!   here.
//! - **states** — the domain-scoped state store and the per-transaction
//!   domain contexts (the overlay/lock machinery that makes private
//!   assembly correct).
//! - **domains** — the four-phase privacy-domain contract, the plugin
//!   wire protocol, the manager, and the in-tree reference UTXO domain.
//! - **transport** — reliable and fire-and-forget peer messaging with
//!   lazy peer activation and durable resend.
//! - **publictx** — per-sender orchestrators: nonces, balances, gas
//!   escalation, staged submission state machines.
//! - **privatetx** — the coordinator driving the private lifecycle end
//!   to end, sequenced per contract.
//! - **keys** — local signing and remote verifier resolution.
//! - **registry** — who is reachable, and over which transport.
//! - **engine** — the wiring that turns all of the above into a node.
//!
//! ## Design stance
//!
//! 1. Nothing advances past an unpersisted output. Crash recovery is
//!    re-derivation, never replay.
//! 2. In-memory overlays are explicit values with owners, not global
//!    caches of uncommitted state.
//! 3. Plugins are out-of-process by design; every request across a
//!    plugin channel is safe to resend.

pub mod abi;
pub mod cache;
pub mod config;
pub mod domains;
pub mod engine;
pub mod error;
pub mod filters;
pub mod keys;
pub mod privatetx;
pub mod publictx;
pub mod registry;
pub mod states;
pub mod storage;
pub mod transport;
pub mod types;

pub use config::CoreConfig;
pub use engine::{EngineError, Node};
