//! Scoped acquisition handles.
//!
//! Callers take locks by constructing one of these on the stack; every
//! handle releases what it acquired on every exit path from its scope.
//! The handles also encode the hierarchy: a [`DbLock`] takes the global
//! lock in the matching intent mode first, and a [`CollectionLock`]
//! refuses to exist without its database lock.
//!
//! A moved-from or never-granted handle releases nothing.

use std::time::Instant;

use crate::base::{
    LockMode, ResourceId, ResourceType, mutex_label, namespace_db, register_mutex_label,
};
use crate::context::OperationContext;
use crate::engine::supports_doc_locking;
use crate::locker::{LockSnapshot, Locker};
use crate::table::LockRequestStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardState {
    /// Never granted, timed out, or already released.
    Unlocked,
    /// Enqueued; complete with [`GlobalLock::wait_for_lock_until`].
    Pending,
    Locked,
}

/// Scoped acquisition of the global lock.
///
/// Acquires, in order: an admission ticket (when the locker is
/// configured for throttling and this is its first global reference),
/// the global lock itself, and the flush lock on the legacy engine.
/// Destruction releases in reverse, and when the global lock fully
/// leaves the locker outside a write unit of work, the operation's
/// storage snapshot is abandoned.
pub struct GlobalLock<'a> {
    opctx: &'a OperationContext,
    mode: LockMode,
    state: GuardState,
}

impl<'a> GlobalLock<'a> {
    /// Acquires the global lock in `mode`, waiting until `deadline`
    /// (`None` waits without bound).
    pub fn new(opctx: &'a OperationContext, mode: LockMode, deadline: Option<Instant>) -> Self {
        let mut lock = Self::begin(opctx, mode, deadline);
        if lock.state == GuardState::Pending {
            lock.wait_for_lock_until(deadline);
        }
        lock
    }

    /// Issues the request but defers waiting, so callers can build a
    /// controlled queue arrangement and complete it later with
    /// [`wait_for_lock_until`](Self::wait_for_lock_until). The deadline
    /// only bounds ticket admission here.
    pub fn enqueue(
        opctx: &'a OperationContext,
        mode: LockMode,
        deadline: Option<Instant>,
    ) -> Self {
        Self::begin(opctx, mode, deadline)
    }

    fn begin(opctx: &'a OperationContext, mode: LockMode, deadline: Option<Instant>) -> Self {
        let state = match opctx.locker().lock_global_begin(mode, deadline) {
            Ok(LockRequestStatus::Granted) => GuardState::Locked,
            Ok(LockRequestStatus::Waiting) => GuardState::Pending,
            Err(_) => GuardState::Unlocked,
        };
        let lock = Self { opctx, mode, state };
        if lock.state == GuardState::Locked {
            lock.record_exclusive();
        }
        lock
    }

    /// Completes an enqueued request. On timeout the request is
    /// withdrawn entirely and the handle stays unlocked.
    pub fn wait_for_lock_until(&mut self, deadline: Option<Instant>) {
        if self.state != GuardState::Pending {
            return;
        }
        match self.opctx.locker().lock_global_complete(deadline) {
            Ok(()) => {
                self.state = GuardState::Locked;
                self.record_exclusive();
            }
            Err(_) => self.state = GuardState::Unlocked,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state == GuardState::Locked
    }

    /// Write-intent and exclusive global acquisitions are recorded on
    /// the operation, but only once actually granted.
    fn record_exclusive(&self) {
        if matches!(self.mode, LockMode::IntentExclusive | LockMode::Exclusive) {
            self.opctx.global_lock_tracker().record_exclusive_taken();
        }
    }
}

impl Drop for GlobalLock<'_> {
    fn drop(&mut self) {
        match self.state {
            GuardState::Unlocked => {}
            GuardState::Pending => {
                // Withdraw the queued request (or fold in and release a
                // grant that raced us).
                self.opctx.locker().unlock_global();
            }
            GuardState::Locked => {
                let released = self.opctx.locker().unlock_global();
                if released && !self.opctx.locker().in_write_unit_of_work() {
                    self.opctx.recovery_unit().abandon_snapshot();
                }
            }
        }
    }
}

/// Global lock in `S` mode.
#[derive(Deref, DerefMut)]
pub struct GlobalRead<'a>(GlobalLock<'a>);

impl<'a> GlobalRead<'a> {
    pub fn new(opctx: &'a OperationContext, deadline: Option<Instant>) -> Self {
        Self(GlobalLock::new(opctx, LockMode::Shared, deadline))
    }
}

/// Global lock in `X` mode.
#[derive(Deref, DerefMut)]
pub struct GlobalWrite<'a>(GlobalLock<'a>);

impl<'a> GlobalWrite<'a> {
    pub fn new(opctx: &'a OperationContext, deadline: Option<Instant>) -> Self {
        Self(GlobalLock::new(opctx, LockMode::Exclusive, deadline))
    }
}

/// Scoped acquisition of one database, with the implicit global intent
/// lock in front of it.
///
/// For the `admin` database, write modes escalate to `X`: `admin` holds
/// server-wide metadata, and writes to it must not interleave.
pub struct DbLock<'a> {
    opctx: &'a OperationContext,
    resource: ResourceId,
    locked: bool,
    // Field order keeps the global intent lock alive until `drop` has
    // released the database resource.
    _global: GlobalLock<'a>,
}

impl<'a> DbLock<'a> {
    pub fn new(
        opctx: &'a OperationContext,
        db: &str,
        mode: LockMode,
        deadline: Option<Instant>,
    ) -> Self {
        let mode = if db == "admin" && !mode.is_shared() {
            LockMode::Exclusive
        } else {
            mode
        };
        let global = GlobalLock::new(opctx, mode.intent(), deadline);
        let resource = ResourceId::for_database(db);
        let locked =
            global.is_locked() && opctx.locker().lock(resource, mode, deadline).is_ok();
        Self {
            opctx,
            resource,
            locked,
            _global: global,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for DbLock<'_> {
    fn drop(&mut self) {
        if self.locked {
            self.opctx.locker().unlock(self.resource);
        }
    }
}

/// Scoped acquisition of one collection. The parent database must
/// already be held in the matching intent mode.
///
/// When the engine does not support document-level locking the
/// collection is the finest granularity, so intent modes harden to their
/// full equivalents (`IS` to `S`, `IX` to `X`).
pub struct CollectionLock<'a> {
    locker: &'a Locker,
    resource: ResourceId,
    locked: bool,
}

impl<'a> CollectionLock<'a> {
    pub fn new(
        locker: &'a Locker,
        ns: &str,
        mode: LockMode,
        deadline: Option<Instant>,
    ) -> Self {
        assert!(ns.contains('.'), "expected a full `db.collection` namespace");
        assert!(
            locker.is_db_locked_for_mode(namespace_db(ns), mode.intent()),
            "collection lock on {ns} requires the database held in {}",
            mode.intent(),
        );
        let actual = if supports_doc_locking() {
            mode
        } else if mode.is_shared() {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        };
        let resource = ResourceId::for_collection(ns);
        let locked = locker.lock(resource, actual, deadline).is_ok();
        Self {
            locker,
            resource,
            locked,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for CollectionLock<'_> {
    fn drop(&mut self) {
        if self.locked {
            self.locker.unlock(self.resource);
        }
    }
}

/// A named resource usable as a cooperative reader/writer mutex via
/// [`SharedLock`] and [`ExclusiveLock`].
#[derive(Debug, Clone, Copy)]
pub struct ResourceMutex {
    resource: ResourceId,
}

impl ResourceMutex {
    pub fn new(name: &str) -> Self {
        let resource = ResourceId::new(ResourceType::Mutex, name);
        register_mutex_label(resource, name);
        Self { resource }
    }

    pub fn name(&self) -> String {
        mutex_label(self.resource).expect("label was registered at construction")
    }

    pub fn resource_id(&self) -> ResourceId {
        self.resource
    }
}

macro_rules! resource_mutex_guard {
    ($name:ident, $mode:expr, $doc:literal) => {
        #[doc = $doc]
        ///
        /// The explicit `lock`/`unlock` methods let the holder release
        /// and re-acquire mid-scope; destruction releases only when
        /// currently locked.
        pub struct $name<'a> {
            locker: &'a Locker,
            resource: ResourceId,
            locked: bool,
        }

        impl<'a> $name<'a> {
            pub fn new(locker: &'a Locker, mutex: ResourceMutex) -> Self {
                let mut lock = Self {
                    locker,
                    resource: mutex.resource_id(),
                    locked: false,
                };
                lock.lock();
                lock
            }

            /// Acquires (or re-acquires), waiting as long as it takes.
            pub fn lock(&mut self) {
                debug_assert!(!self.locked);
                self.locker
                    .lock(self.resource, $mode, None)
                    .expect("unbounded wait cannot time out");
                self.locked = true;
            }

            pub fn unlock(&mut self) {
                assert!(self.locked, "unlock of an unlocked guard");
                self.locker.unlock(self.resource);
                self.locked = false;
            }

            pub fn is_locked(&self) -> bool {
                self.locked
            }
        }

        impl Drop for $name<'_> {
            fn drop(&mut self) {
                if self.locked {
                    self.locker.unlock(self.resource);
                }
            }
        }
    };
}

resource_mutex_guard!(
    SharedLock,
    LockMode::Shared,
    "Shared (`S`) hold on a [`ResourceMutex`]."
);
resource_mutex_guard!(
    ExclusiveLock,
    LockMode::Exclusive,
    "Exclusive (`X`) hold on a [`ResourceMutex`]."
);

/// Cooperative yield: releases the locker's locks on construction and
/// restores them on destruction, in the original modes.
///
/// When the global lock is held recursively (an enclosing scope still
/// depends on it) nothing is released and the yield is a no-op, so the
/// release is never observable by contenders of locks the enclosing
/// scope has pinned.
pub struct TempRelease<'a> {
    locker: &'a Locker,
    snapshot: Option<LockSnapshot>,
}

impl<'a> TempRelease<'a> {
    pub fn new(locker: &'a Locker) -> Self {
        Self {
            locker,
            snapshot: locker.save_lock_state_and_unlock(),
        }
    }

    /// Whether anything was actually released.
    pub fn released(&self) -> bool {
        self.snapshot.is_some()
    }
}

impl Drop for TempRelease<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.locker.restore_lock_state(snapshot);
        }
    }
}
