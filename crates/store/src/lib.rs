//! `store` crate — transactional handle storage.
//!
//! Every stored value is addressed by a [`Handle`]. Maps are mutated through a
//! [`Transaction`]; writes are staged inside the transaction and only become
//! visible to other transactions once [`TxRegistry::commit`] succeeds.
//! No domain logic lives here.

pub mod error;
pub mod handle;
pub mod transaction;
pub mod map;
pub mod memory;
pub mod cache;

pub use error::StoreError;
pub use handle::Handle;
pub use transaction::{MapId, Transaction, TxId, TxRegistry};
pub use map::{HandleMap, Storable, TransactionParticipant, Versioned};
pub use memory::MemoryHandleMap;
pub use cache::CachingHandleMap;
