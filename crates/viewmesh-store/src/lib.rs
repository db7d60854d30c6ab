//! viewmesh Store - transactional persistence and the transaction-id index
//!
//! [`TxIdStore`] maps external transaction ids to their finality status and
//! remembers the order in which they were first written. It sits on top of
//! any [`Persistence`] implementation; [`MemoryPersistence`] and
//! [`FilePersistence`] ship with the crate.

#![forbid(unsafe_code)]

/// Namespaced persistence contract and implementations
pub mod persistence;

/// Transaction-id index and cursors
pub mod txidstore;

pub use persistence::{FilePersistence, MemoryPersistence, Persistence, StateEntries};
pub use txidstore::{SeekPosition, TxIdEntry, TxIdIterator, TxIdStore};
