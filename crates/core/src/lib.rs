//! Core types for the refstm engine
//!
//! This crate is the leaf of the workspace: identifier newtypes, the
//! isolation levels, engine configuration, and the error enum shared by
//! every other crate. It has no concurrency logic of its own.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

pub use error::{Result, StmError};
pub use types::{Isolation, RefId, StmConfig, TxnId, Version, WatchToken};
