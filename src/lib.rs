//! In-process software transactional memory over versioned refs.
//!
//! `refstm` coordinates concurrent access to shared memory cells with
//! optimistic multi-version concurrency control: transactions run against an
//! immutable snapshot, stage their effects privately, and commit through a
//! single atomic swap after validation. Conflicted attempts retry from a
//! fresh snapshot automatically.
//!
//! # Quick start
//!
//! ```
//! use refstm::{Stm, StmError};
//!
//! let stm = Stm::new();
//! let checking = stm.new_ref(100i64);
//! let savings = stm.new_ref(50i64);
//!
//! // Move money atomically: either both cells change or neither does.
//! stm.run_serializable(|| {
//!     let amount = 30;
//!     let from = checking.get()?;
//!     if from < amount {
//!         return Err(StmError::aborted("insufficient funds"));
//!     }
//!     checking.set(from - amount)?;
//!     savings.swap(|s| s + amount)?;
//!     Ok(())
//! })?;
//!
//! assert_eq!(checking.get()?, 70);
//! assert_eq!(savings.get()?, 80);
//! # Ok::<(), StmError>(())
//! ```
//!
//! # Crate layout
//!
//! - [`refstm_core`]: identifiers, configuration, and the error type
//! - [`refstm_engine`]: the store, transaction machinery, and coordinator
//!
//! This facade re-exports the public API of both.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use refstm_engine::{
    current_transaction_id, CommuteHandle, Isolation, Ref, RefId, Result, Stm, StmConfig,
    StmError, TxnId, Version, WatchToken,
};
