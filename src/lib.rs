//! # Warden
//!
//! Hierarchical lock manager for a multi-threaded database server.
//!
//! Warden serializes access to shared resources through multi-granularity
//! locking over a fixed hierarchy: the global lock, the flush lock, then
//! databases, collections and named mutexes. Intent modes announce
//! finer-grained work below, a fixed conflict lattice decides who may run
//! together, and a compatible-first queueing policy keeps readers flowing
//! without starving writers. See [`table`] for the conflict rules and
//! [`guards`] for the scoped acquisition types most callers should use.
//!
//! The building blocks, bottom up:
//!
//! - [`base`]: lock modes, the conflict/cover tables, resource identifiers.
//! - [`table`]: the sharded lock table and per-resource lock heads.
//! - [`tickets`]: admission throttling for global-lock acquisition.
//! - [`locker`]: per-operation lock state (recursion, upgrades, yields).
//! - [`guards`]: RAII acquisition handles encoding the hierarchy.
//! - [`context`]: the operation-context glue the server attaches a locker to.
//! - [`retry`]: the write-conflict retry helper.

#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate tracing;

pub mod base;
pub mod config;
pub mod context;
pub mod engine;
pub mod guards;
pub mod locker;
pub mod retry;
pub mod table;
pub mod tickets;


pub mod prelude {
    //! The types most embedders need, in one import.
    pub use crate::base::{LockMode, ResourceId, ResourceType, WardenError, WardenResult};
    pub use crate::context::{OperationContext, RecoveryUnit, WriteUnitOfWork};
    pub use crate::guards::{
        CollectionLock, DbLock, ExclusiveLock, GlobalLock, GlobalRead, GlobalWrite, ResourceMutex,
        SharedLock, TempRelease,
    };
    pub use crate::locker::Locker;
    pub use crate::retry::write_conflict_retry;
    pub use crate::table::LockTable;
    pub use crate::tickets::TicketHolder;
}
