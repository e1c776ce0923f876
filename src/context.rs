//! The operation-context object graph the lock manager attaches to.
//!
//! The real server owns a much larger graph (client, service context,
//! command state); the lock manager only needs the pieces modeled here.
//! Ownership breaks the reference cycle: the operation context owns its
//! locker and recovery unit, and nothing points back.

use std::cell::Cell;
use std::sync::Arc;

use crate::locker::Locker;
use crate::table::LockTable;

/// Storage-engine handle to the operation's transaction/snapshot.
pub trait RecoveryUnit: Send {
    /// Drops the storage snapshot so the next read starts a fresh one.
    /// Invoked when the operation's last global lock is released outside
    /// a write unit of work.
    fn abandon_snapshot(&self);
}

/// Recovery unit for engines without snapshots, and for tests.
#[derive(Debug, Default)]
pub struct NoopRecoveryUnit;

impl RecoveryUnit for NoopRecoveryUnit {
    fn abandon_snapshot(&self) {}
}

/// Records whether the operation ever successfully took the global lock
/// in a write-intent or exclusive mode. Monotone: set once, never
/// cleared. The write path uses it to decide whether commit-time work is
/// required.
#[derive(Debug, Default)]
pub struct GlobalLockAcquisitionTracker {
    taken: Cell<bool>,
}

impl GlobalLockAcquisitionTracker {
    pub fn global_exclusive_lock_taken(&self) -> bool {
        self.taken.get()
    }

    pub(crate) fn record_exclusive_taken(&self) {
        self.taken.set(true);
    }
}

/// One in-flight operation: a locker, a recovery unit, and the
/// per-operation counters. Owned by a single thread at a time.
pub struct OperationContext {
    locker: Locker,
    recovery: Box<dyn RecoveryUnit>,
    tracker: GlobalLockAcquisitionTracker,
    write_conflicts: Cell<u64>,
}

impl OperationContext {
    pub fn new(table: Arc<LockTable>) -> Self {
        Self {
            locker: Locker::new(table),
            recovery: Box::new(NoopRecoveryUnit),
            tracker: GlobalLockAcquisitionTracker::default(),
            write_conflicts: Cell::new(0),
        }
    }

    pub fn locker(&self) -> &Locker {
        &self.locker
    }

    /// Swaps in a different locker variant. Must not be called while
    /// locks are held.
    pub fn set_locker(&mut self, locker: Locker) {
        self.locker = locker;
    }

    pub fn recovery_unit(&self) -> &dyn RecoveryUnit {
        self.recovery.as_ref()
    }

    pub fn set_recovery_unit(&mut self, recovery: Box<dyn RecoveryUnit>) {
        self.recovery = recovery;
    }

    pub fn global_lock_tracker(&self) -> &GlobalLockAcquisitionTracker {
        &self.tracker
    }

    /// Write conflicts this operation has retried so far.
    pub fn write_conflicts(&self) -> u64 {
        self.write_conflicts.get()
    }

    pub(crate) fn record_write_conflict(&self) {
        self.write_conflicts.set(self.write_conflicts.get() + 1);
    }
}

/// Scoped region delimiting a storage transaction. While one is open,
/// lock releases are deferred (two-phase locking) and write conflicts
/// propagate instead of retrying.
pub struct WriteUnitOfWork<'a> {
    opctx: &'a OperationContext,
}

impl<'a> WriteUnitOfWork<'a> {
    pub fn new(opctx: &'a OperationContext) -> Self {
        opctx.locker().begin_write_unit_of_work();
        Self { opctx }
    }
}

impl Drop for WriteUnitOfWork<'_> {
    fn drop(&mut self) {
        self.opctx.locker().end_write_unit_of_work();
    }
}
