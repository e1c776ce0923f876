//! Per-operation lock state.
//!
//! Every operation owns exactly one [`Locker`]. It is the sole caller of
//! the [lock table](crate::table) on the operation's behalf and keeps the
//! bookkeeping the table does not: recursion counts, the in-flight
//! request, ticket admission, unit-of-work deferred unlocks, and the
//! save/restore machinery behind cooperative yields.
//!
//! A locker belongs to one thread at a time and is not thread-safe; the
//! single sanctioned cross-thread view is the [`WaitProbe`], which other
//! threads may poll to learn which resource the owner is parked on.

use std::{
    cell::RefCell,
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use crate::base::{
    LockMode, ResourceId, ResourceType, WardenError, WardenResult, namespace_db,
};
use crate::table::{
    CancelOutcome, LockRequestStatus, LockTable, LockerId, RequestFlags, WaitOutcome,
};
use crate::tickets::TicketHolder;

static NEXT_LOCKER_ID: AtomicU64 = AtomicU64::new(1);

/// Selects the flush-lock behavior of a locker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockerVariant {
    /// Engine with document-level concurrency control; the flush lock
    /// does not exist for it.
    DocumentLevel,
    /// Legacy journaled engine. Every global acquisition is paired with
    /// the flush lock so the journal flusher can exclude all writers.
    Legacy,
}

#[derive(Debug, Clone, Copy)]
struct HeldLock {
    mode: LockMode,
    recursion: u32,
}

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    resource: ResourceId,
    target: LockMode,
    /// Mode held before an upgrade request, `None` for a fresh request.
    /// Restored when the request fails.
    converted_from: Option<LockMode>,
}

#[derive(Debug)]
struct LockerInner {
    held: HashMap<ResourceId, HeldLock>,
    pending: Option<PendingRequest>,
    wuow_nesting: u32,
    deferred_unlocks: Vec<ResourceId>,
    should_acquire_ticket: bool,
    read_tickets: Option<Arc<TicketHolder>>,
    write_tickets: Option<Arc<TicketHolder>>,
    /// The holder the current ticket came from, kept so a mid-hold swap
    /// of the throttling config cannot misroute the release.
    ticket: Option<Arc<TicketHolder>>,
}

/// Cross-thread view of the resource a locker is parked on, if any.
#[derive(Debug, Clone)]
pub struct WaitProbe(Arc<AtomicU64>);

impl WaitProbe {
    pub fn waiting_resource(&self) -> Option<ResourceId> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            raw => Some(ResourceId::from_raw(raw)),
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting_resource().is_some()
    }
}

/// Snapshot of held locks, produced by
/// [`Locker::save_lock_state_and_unlock`].
#[derive(Debug)]
pub struct LockSnapshot {
    global_mode: LockMode,
    resources: Vec<(ResourceId, LockMode)>,
}

pub struct Locker {
    id: LockerId,
    variant: LockerVariant,
    table: Arc<LockTable>,
    waiting: Arc<AtomicU64>,
    inner: RefCell<LockerInner>,
}

impl Locker {
    /// A locker for an engine with document-level locking.
    pub fn new(table: Arc<LockTable>) -> Self {
        Self::with_variant(table, LockerVariant::DocumentLevel)
    }

    /// A locker for the legacy engine; pairs global locks with the flush
    /// lock.
    pub fn new_legacy(table: Arc<LockTable>) -> Self {
        Self::with_variant(table, LockerVariant::Legacy)
    }

    pub fn with_variant(table: Arc<LockTable>, variant: LockerVariant) -> Self {
        Self {
            id: NEXT_LOCKER_ID.fetch_add(1, Ordering::Relaxed),
            variant,
            table,
            waiting: Arc::new(AtomicU64::new(0)),
            inner: RefCell::new(LockerInner {
                held: HashMap::new(),
                pending: None,
                wuow_nesting: 0,
                deferred_unlocks: Vec::new(),
                should_acquire_ticket: true,
                read_tickets: None,
                write_tickets: None,
                ticket: None,
            }),
        }
    }

    pub fn id(&self) -> LockerId {
        self.id
    }

    pub fn variant(&self) -> LockerVariant {
        self.variant
    }

    /// A handle other threads may poll while this locker's owner is
    /// blocked.
    pub fn wait_probe(&self) -> WaitProbe {
        WaitProbe(Arc::clone(&self.waiting))
    }

    pub fn waiting_resource(&self) -> Option<ResourceId> {
        self.wait_probe().waiting_resource()
    }

    // ---- generic acquisition ----------------------------------------

    /// Acquires `resource` in `mode`, blocking until granted or
    /// `deadline` passes (`None` waits without bound).
    pub fn lock(
        &self,
        resource: ResourceId,
        mode: LockMode,
        deadline: Option<Instant>,
    ) -> WardenResult<()> {
        match self.lock_begin(resource, mode) {
            LockRequestStatus::Granted => Ok(()),
            LockRequestStatus::Waiting => self.lock_complete(resource, deadline),
        }
    }

    /// Issues the request without waiting. An already-held resource is
    /// absorbed (recursion) or upgraded to the least upper bound of the
    /// held and requested modes.
    pub(crate) fn lock_begin(&self, resource: ResourceId, mode: LockMode) -> LockRequestStatus {
        debug_assert!(mode != LockMode::None);
        let mut inner = self.inner.borrow_mut();
        debug_assert!(
            inner.pending.is_none(),
            "only one request may be in flight per locker"
        );

        let existing = inner.held.get(&resource).copied();
        if let Some(held) = existing {
            if held.mode.covers(mode) {
                inner
                    .held
                    .get_mut(&resource)
                    .expect("entry was just looked up")
                    .recursion += 1;
                return LockRequestStatus::Granted;
            }
            let target = held.mode.lub(mode);
            let status = self.table.convert(self.id, resource, target);
            let entry = inner
                .held
                .get_mut(&resource)
                .expect("entry was just looked up");
            entry.recursion += 1;
            match status {
                LockRequestStatus::Granted => {
                    entry.mode = target;
                    LockRequestStatus::Granted
                }
                LockRequestStatus::Waiting => {
                    inner.pending = Some(PendingRequest {
                        resource,
                        target,
                        converted_from: Some(held.mode),
                    });
                    LockRequestStatus::Waiting
                }
            }
        } else {
            match self.table.lock(self.id, resource, mode, Self::request_flags(resource, mode)) {
                LockRequestStatus::Granted => {
                    inner.held.insert(resource, HeldLock { mode, recursion: 1 });
                    LockRequestStatus::Granted
                }
                LockRequestStatus::Waiting => {
                    inner.pending = Some(PendingRequest {
                        resource,
                        target: mode,
                        converted_from: None,
                    });
                    LockRequestStatus::Waiting
                }
            }
        }
    }

    /// Parks on the in-flight request until granted or `deadline`. A
    /// timeout leaves the locker exactly as it was before the request.
    pub(crate) fn lock_complete(
        &self,
        resource: ResourceId,
        deadline: Option<Instant>,
    ) -> WardenResult<()> {
        debug_assert!(
            matches!(self.inner.borrow().pending, Some(p) if p.resource == resource),
            "completing a request that was never issued"
        );
        self.waiting.store(resource.raw(), Ordering::Release);
        let outcome = self.table.wait(self.id, resource, deadline);
        self.waiting.store(0, Ordering::Release);

        let mut inner = self.inner.borrow_mut();
        let pending = inner.pending.take().expect("a request is in flight");
        match outcome {
            WaitOutcome::Granted(mode) => {
                debug_assert_eq!(mode, pending.target);
                match pending.converted_from {
                    Some(_) => {
                        inner
                            .held
                            .get_mut(&resource)
                            .expect("conversion source is held")
                            .mode = mode;
                    }
                    None => {
                        inner.held.insert(resource, HeldLock { mode, recursion: 1 });
                    }
                }
                Ok(())
            }
            WaitOutcome::TimedOut => {
                if pending.converted_from.is_some() {
                    inner
                        .held
                        .get_mut(&resource)
                        .expect("conversion source is held")
                        .recursion -= 1;
                }
                Err(WardenError::LockTimeout {
                    resource,
                    mode: pending.target,
                })
            }
        }
    }

    /// Withdraws the in-flight request without waiting for it. If the
    /// table granted it in the meantime, the grant is folded in and
    /// immediately released again.
    pub(crate) fn cancel_pending(&self) {
        let pending = self
            .inner
            .borrow_mut()
            .pending
            .take()
            .expect("no request in flight");
        match self.table.cancel(self.id, pending.resource) {
            CancelOutcome::Cancelled => {}
            CancelOutcome::RevertedConversion => {
                self.inner
                    .borrow_mut()
                    .held
                    .get_mut(&pending.resource)
                    .expect("conversion source is held")
                    .recursion -= 1;
            }
            CancelOutcome::WasGranted(mode) => {
                {
                    let mut inner = self.inner.borrow_mut();
                    match pending.converted_from {
                        Some(_) => {
                            inner
                                .held
                                .get_mut(&pending.resource)
                                .expect("conversion source is held")
                                .mode = mode;
                        }
                        None => {
                            inner
                                .held
                                .insert(pending.resource, HeldLock { mode, recursion: 1 });
                        }
                    }
                }
                self.unlock_now(pending.resource);
            }
        }
        if pending.resource == ResourceId::GLOBAL {
            self.release_ticket_if_unheld();
        }
    }

    /// Full global locks get queue priority and engage the
    /// compatible-first policy once granted.
    fn request_flags(resource: ResourceId, mode: LockMode) -> RequestFlags {
        if resource == ResourceId::GLOBAL
            && matches!(mode, LockMode::Shared | LockMode::Exclusive)
        {
            RequestFlags {
                enqueue_at_front: true,
                compatible_first: true,
            }
        } else {
            RequestFlags::default()
        }
    }

    // ---- release -----------------------------------------------------

    /// Releases one reference to `resource`; returns whether the lock
    /// left this locker entirely. Inside a write unit of work, releases
    /// of non-mutex resources are deferred to
    /// [`end_write_unit_of_work`](Self::end_write_unit_of_work).
    pub fn unlock(&self, resource: ResourceId) -> bool {
        let pending_here = {
            let inner = self.inner.borrow();
            matches!(inner.pending, Some(p) if p.resource == resource)
        };
        if pending_here {
            self.cancel_pending();
            return !self.inner.borrow().held.contains_key(&resource);
        }

        let defer = {
            let mut inner = self.inner.borrow_mut();
            assert!(
                inner.held.contains_key(&resource),
                "unlock of a lock that is not held: {resource:?}"
            );
            if inner.wuow_nesting > 0 && resource.kind() != ResourceType::Mutex {
                inner.deferred_unlocks.push(resource);
                true
            } else {
                false
            }
        };
        if defer {
            return false;
        }
        self.unlock_now(resource)
    }

    fn unlock_now(&self, resource: ResourceId) -> bool {
        let fully = {
            let mut inner = self.inner.borrow_mut();
            let entry = inner
                .held
                .get_mut(&resource)
                .expect("unlock of a lock that is not held");
            entry.recursion -= 1;
            if entry.recursion > 0 {
                false
            } else {
                inner.held.remove(&resource);
                true
            }
        };
        if fully {
            self.table.unlock(self.id, resource);
            if resource == ResourceId::GLOBAL {
                self.release_ticket_if_unheld();
            }
        }
        fully
    }

    // ---- the global lock --------------------------------------------

    pub fn lock_global(&self, mode: LockMode, deadline: Option<Instant>) -> WardenResult<()> {
        match self.lock_global_begin(mode, deadline)? {
            LockRequestStatus::Granted => Ok(()),
            LockRequestStatus::Waiting => self.lock_global_complete(deadline),
        }
    }

    /// Issues the global request without waiting, acquiring an admission
    /// ticket first when this is the locker's first global reference.
    pub fn lock_global_begin(
        &self,
        mode: LockMode,
        deadline: Option<Instant>,
    ) -> WardenResult<LockRequestStatus> {
        self.acquire_ticket(mode, deadline)?;
        let status = self.lock_begin(ResourceId::GLOBAL, mode);
        if status == LockRequestStatus::Granted {
            self.lock_flush(mode, deadline)?;
        }
        Ok(status)
    }

    pub fn lock_global_complete(&self, deadline: Option<Instant>) -> WardenResult<()> {
        let mode = self
            .inner
            .borrow()
            .pending
            .expect("no global request in flight")
            .target;
        match self.lock_complete(ResourceId::GLOBAL, deadline) {
            Ok(()) => self.lock_flush(mode, deadline),
            Err(err) => {
                self.release_ticket_if_unheld();
                Err(err)
            }
        }
    }

    /// Releases one global reference (with its flush pairing on the
    /// legacy engine). Returns whether the global lock actually left the
    /// locker, which is what gates snapshot abandonment.
    pub fn unlock_global(&self) -> bool {
        let pending_global = {
            let inner = self.inner.borrow();
            matches!(inner.pending, Some(p) if p.resource == ResourceId::GLOBAL)
        };
        if pending_global {
            self.cancel_pending();
            return false;
        }
        if self.variant == LockerVariant::Legacy {
            self.unlock(ResourceId::FLUSH);
        }
        self.unlock(ResourceId::GLOBAL)
    }

    fn acquire_ticket(&self, mode: LockMode, deadline: Option<Instant>) -> WardenResult<()> {
        let holder = {
            let inner = self.inner.borrow();
            if inner.held.contains_key(&ResourceId::GLOBAL) || !inner.should_acquire_ticket {
                None
            } else {
                debug_assert!(inner.ticket.is_none());
                if mode.is_shared() {
                    inner.read_tickets.clone()
                } else {
                    inner.write_tickets.clone()
                }
            }
        };
        let Some(holder) = holder else {
            return Ok(());
        };
        if !holder.wait_until(deadline) {
            debug!(%mode, "global admission ticket timed out");
            return Err(WardenError::LockTimeout {
                resource: ResourceId::GLOBAL,
                mode,
            });
        }
        self.inner.borrow_mut().ticket = Some(holder);
        Ok(())
    }

    fn release_ticket_if_unheld(&self) {
        let holder = {
            let mut inner = self.inner.borrow_mut();
            if inner.held.contains_key(&ResourceId::GLOBAL) {
                None
            } else {
                inner.ticket.take()
            }
        };
        if let Some(holder) = holder {
            holder.release();
        }
    }

    /// The legacy engine pairs every global reference with a flush-lock
    /// reference, so the flush recursion always mirrors the global one.
    fn lock_flush(&self, global_mode: LockMode, deadline: Option<Instant>) -> WardenResult<()> {
        if self.variant != LockerVariant::Legacy {
            return Ok(());
        }
        self.lock(ResourceId::FLUSH, global_mode.intent(), deadline)
    }

    // ---- downgrade ---------------------------------------------------

    /// Weakens the mode held on `resource` without releasing it, making
    /// the weaker mode visible to other operations. `mode` must be
    /// covered by the held mode.
    pub fn downgrade(&self, resource: ResourceId, mode: LockMode) {
        let mut inner = self.inner.borrow_mut();
        let entry = inner
            .held
            .get_mut(&resource)
            .expect("downgrade of a lock that is not held");
        assert!(
            entry.mode.covers(mode),
            "downgrade must weaken the held mode"
        );
        if entry.mode == mode {
            return;
        }
        entry.mode = mode;
        drop(inner);
        self.table.downgrade(self.id, resource, mode);
    }

    // ---- write unit of work -----------------------------------------

    pub fn begin_write_unit_of_work(&self) {
        self.inner.borrow_mut().wuow_nesting += 1;
    }

    pub fn end_write_unit_of_work(&self) {
        let deferred = {
            let mut inner = self.inner.borrow_mut();
            assert!(inner.wuow_nesting > 0, "not in a write unit of work");
            inner.wuow_nesting -= 1;
            if inner.wuow_nesting > 0 {
                return;
            }
            std::mem::take(&mut inner.deferred_unlocks)
        };
        for resource in deferred {
            self.unlock_now(resource);
        }
    }

    pub fn in_write_unit_of_work(&self) -> bool {
        self.inner.borrow().wuow_nesting > 0
    }

    // ---- temporary release ------------------------------------------

    /// Releases everything this locker holds so other operations can
    /// run, returning a snapshot for [`restore_lock_state`]. Returns
    /// `None` without releasing anything when there is nothing to yield:
    /// the global lock is not held, or is held recursively (an enclosing
    /// scope still depends on it).
    ///
    /// [`restore_lock_state`]: Self::restore_lock_state
    pub fn save_lock_state_and_unlock(&self) -> Option<LockSnapshot> {
        let (global_mode, resources) = {
            let inner = self.inner.borrow();
            assert!(
                inner.wuow_nesting == 0,
                "cannot yield locks inside a write unit of work"
            );
            let global = inner.held.get(&ResourceId::GLOBAL)?;
            if global.recursion > 1 {
                return None;
            }
            let mut resources: Vec<_> = inner
                .held
                .iter()
                .filter(|(res, _)| {
                    !matches!(res.kind(), ResourceType::Global | ResourceType::Flush)
                })
                .map(|(res, held)| {
                    debug_assert_eq!(
                        held.recursion, 1,
                        "cannot yield a recursively held lock: {res:?}"
                    );
                    (*res, held.mode)
                })
                .collect();
            // Re-acquisition happens in hierarchy order.
            resources.sort_unstable_by_key(|(res, _)| (res.kind() as u8, res.raw()));
            (global.mode, resources)
        };
        for (resource, _) in &resources {
            self.unlock(*resource);
        }
        self.unlock_global();
        debug!(global = %global_mode, count = resources.len(), "yielded locks");
        Some(LockSnapshot {
            global_mode,
            resources,
        })
    }

    /// Re-acquires everything released by
    /// [`save_lock_state_and_unlock`](Self::save_lock_state_and_unlock),
    /// waiting as long as it takes.
    pub fn restore_lock_state(&self, snapshot: LockSnapshot) {
        self.lock_global(snapshot.global_mode, None)
            .expect("unbounded wait cannot time out");
        for (resource, mode) in snapshot.resources {
            self.lock(resource, mode, None)
                .expect("unbounded wait cannot time out");
        }
    }

    // ---- admission configuration ------------------------------------

    /// Installs (or clears) the ticket holders gating global
    /// acquisition. Takes effect on the next `NONE -> mode` transition.
    pub fn set_global_throttling(
        &self,
        read: Option<Arc<TicketHolder>>,
        write: Option<Arc<TicketHolder>>,
    ) {
        let mut inner = self.inner.borrow_mut();
        inner.read_tickets = read;
        inner.write_tickets = write;
    }

    pub fn set_should_acquire_ticket(&self, should: bool) {
        self.inner.borrow_mut().should_acquire_ticket = should;
    }

    // ---- introspection ----------------------------------------------

    /// The mode currently held on `resource`; `LockMode::None` when
    /// unheld.
    pub fn lock_mode(&self, resource: ResourceId) -> LockMode {
        self.inner
            .borrow()
            .held
            .get(&resource)
            .map_or(LockMode::None, |h| h.mode)
    }

    pub fn is_locked_for_mode(&self, resource: ResourceId, mode: LockMode) -> bool {
        self.lock_mode(resource).covers(mode)
    }

    /// Whether the global lock is held in any mode.
    pub fn is_locked(&self) -> bool {
        self.lock_mode(ResourceId::GLOBAL) != LockMode::None
    }

    /// Global exclusive.
    pub fn is_w(&self) -> bool {
        self.lock_mode(ResourceId::GLOBAL) == LockMode::Exclusive
    }

    /// Global shared.
    pub fn is_r(&self) -> bool {
        self.lock_mode(ResourceId::GLOBAL) == LockMode::Shared
    }

    pub fn is_read_locked(&self) -> bool {
        self.is_locked_for_mode(ResourceId::GLOBAL, LockMode::IntentShared)
    }

    pub fn is_write_locked(&self) -> bool {
        self.is_locked_for_mode(ResourceId::GLOBAL, LockMode::IntentExclusive)
    }

    pub fn is_db_locked_for_mode(&self, db: &str, mode: LockMode) -> bool {
        if self.is_w() {
            return true;
        }
        if self.is_r() && mode.is_shared() {
            return true;
        }
        self.is_locked_for_mode(ResourceId::for_database(db), mode)
    }

    /// `ns` is the full `db.collection` namespace.
    pub fn is_collection_locked_for_mode(&self, ns: &str, mode: LockMode) -> bool {
        debug_assert!(ns.contains('.'), "expected a full `db.collection` namespace");
        if self.is_w() {
            return true;
        }
        if self.is_r() && mode.is_shared() {
            return true;
        }
        match self.lock_mode(ResourceId::for_database(namespace_db(ns))) {
            LockMode::None => false,
            LockMode::Exclusive => true,
            LockMode::Shared => mode.is_shared(),
            LockMode::IntentShared | LockMode::IntentExclusive => {
                self.is_locked_for_mode(ResourceId::for_collection(ns), mode)
            }
        }
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        // Unwinding tests drop lockers mid-operation; a second panic here
        // would abort before the first one is reported.
        if std::thread::panicking() {
            return;
        }
        let inner = self.inner.get_mut();
        debug_assert!(
            inner.pending.is_none(),
            "locker dropped with a request in flight"
        );
        debug_assert!(
            inner.held.is_empty(),
            "locker dropped while holding locks: {:?}",
            inner.held.keys().collect::<Vec<_>>()
        );
        debug_assert!(
            inner.ticket.is_none(),
            "locker dropped while holding a ticket"
        );
    }
}
