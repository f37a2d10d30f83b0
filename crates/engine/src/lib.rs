//! MVCC software transactional memory
//!
//! This crate implements optimistic concurrency over a set of versioned
//! memory cells ("refs"):
//! - `VersionedStore`: the single atomically-swapped snapshot of all refs
//! - `Transaction`: per-attempt read/write/commute tracking
//! - `Stm`: the coordinator driving the attempt/validate/commit/retry loop
//! - `Ref` / `CommuteHandle`: the typed user-facing API
//!
//! Correctness comes entirely from validate-then-commit plus retry; there is
//! no lock ordering and no pessimistic locking anywhere in the engine.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod backoff;
mod context;
mod handle;
mod notify;
mod pmap;
mod runtime;
mod store;
mod transaction;

pub use handle::{CommuteHandle, Ref};
pub use runtime::{current_transaction_id, Stm};

pub use refstm_core::{Isolation, RefId, Result, StmConfig, StmError, TxnId, Version, WatchToken};
