//! # Lock Table
//!
//! The lock table maps resource identifiers to *lock heads*, the
//! per-resource queueing state. It is the only state shared between
//! operations; everything else lives in the per-operation
//! [`Locker`](crate::locker::Locker).
//!
//! ## Lock Heads
//!
//! A head owns a mutex covering its granted set, wait queue and counters,
//! plus one condition variable that waiters park on. All transitions on a
//! head happen under that mutex and complete in bounded time; only the
//! wait loop ever blocks.
//!
//! ## Granting
//!
//! A fresh request is granted immediately when it is compatible with the
//! granted set *and* with the modes already queued ahead of it; otherwise
//! it queues FIFO (or at the front, for requests with queue priority).
//! An upgrade of an existing grant is checked against the other holders
//! only and is never gated on the queue, since parking an upgrade behind
//! a conflicting waiter would deadlock both.
//!
//! ## The compatible-first policy
//!
//! Plain FIFO would let one queued writer stall every new reader even
//! while other readers are running. So full-mode global holders engage
//! *compatible-first*: while such a holder is granted, new compatible
//! requests may be granted past queued incompatible ones, and the grant
//! walk skips over blocked waiters instead of stopping at the first one.
//! When the last such holder leaves, the policy disengages and the
//! front-of-queue writer is granted normally.
//!
//! ## Sharding
//!
//! The resource map is split over shards to keep map lookups from
//! contending. A head is dropped from its shard once its granted set and
//! queue are both empty; removal re-checks emptiness under both the shard
//! and the head mutex, and a `defunct` marker makes concurrent lookups
//! retry rather than resurrect a dead head.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Instant,
};

use itertools::Itertools;
use parking_lot::{Condvar, Mutex};

use crate::base::{LockMode, MODE_COUNT, ModeMask, ResourceId};
use crate::config::LockTableConfig;

pub(crate) type LockerId = u64;

/// Outcome of issuing a request to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRequestStatus {
    Granted,
    /// Queued (or upgrade pending); complete with [`LockTable::wait`].
    Waiting,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RequestFlags {
    /// Queue at the head instead of the tail.
    pub(crate) enqueue_at_front: bool,
    /// Engage the compatible-first policy while this request is granted.
    pub(crate) compatible_first: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Granted(LockMode),
    /// Deadline passed; the request was removed (or the upgrade reverted)
    /// before returning, leaving no trace in the head.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelOutcome {
    /// Queued request removed before it was ever granted.
    Cancelled,
    /// Pending upgrade reverted; the original mode is still granted.
    RevertedConversion,
    /// The request was granted before the cancel arrived; the caller now
    /// owns a full grant and must release it.
    WasGranted(LockMode),
}

#[derive(Debug)]
struct GrantedEntry {
    locker: LockerId,
    mode: LockMode,
    /// Target of an in-flight upgrade, granted against the other holders
    /// by the grant walk.
    converting_to: Option<LockMode>,
    compatible_first: bool,
}

#[derive(Debug)]
struct WaitingEntry {
    locker: LockerId,
    mode: LockMode,
    compatible_first: bool,
}

#[derive(Debug, Default)]
struct HeadState {
    granted: Vec<GrantedEntry>,
    queue: VecDeque<WaitingEntry>,
    granted_counts: [u32; MODE_COUNT],
    queued_counts: [u32; MODE_COUNT],
    /// Granted holders carrying the compatible-first flag.
    compatible_first: u32,
    /// Set when the head has been removed from its shard; lookups that
    /// raced the removal must refetch.
    defunct: bool,
}

impl HeadState {
    fn granted_mask(&self) -> u8 {
        mask_of(&self.granted_counts)
    }

    fn queued_mask(&self) -> u8 {
        mask_of(&self.queued_counts)
    }

    /// Granted mask with `locker`'s own contribution removed; upgrades
    /// conflict only with the *other* holders.
    fn granted_mask_without(&self, locker: LockerId) -> u8 {
        let mut counts = self.granted_counts;
        let own = self
            .granted
            .iter()
            .find(|g| g.locker == locker)
            .expect("locker has a granted entry");
        counts[own.mode as usize] -= 1;
        mask_of(&counts)
    }

    fn position_granted(&self, locker: LockerId) -> Option<usize> {
        self.granted.iter().position(|g| g.locker == locker)
    }

    fn add_granted(&mut self, locker: LockerId, mode: LockMode, compatible_first: bool) {
        self.granted_counts[mode as usize] += 1;
        if compatible_first {
            self.compatible_first += 1;
        }
        self.granted.push(GrantedEntry {
            locker,
            mode,
            converting_to: None,
            compatible_first,
        });
    }

    fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.queue.is_empty()
    }

    /// Grants every request the current state allows: pending upgrades
    /// first, then the queue front-to-back. The walk stops at the first
    /// conflicting waiter unless a compatible-first holder is active, in
    /// which case the waiter is skipped in place. Returns whether any
    /// request was granted.
    fn grant_waiters(&mut self) -> bool {
        let mut granted_any = false;

        loop {
            let mut progressed = false;
            for idx in 0..self.granted.len() {
                let Some(target) = self.granted[idx].converting_to else {
                    continue;
                };
                let others = self.granted_mask_without(self.granted[idx].locker);
                if !target.conflicts_with(others) {
                    let old = self.granted[idx].mode;
                    self.granted[idx].mode = target;
                    self.granted[idx].converting_to = None;
                    self.granted_counts[old as usize] -= 1;
                    self.granted_counts[target as usize] += 1;
                    granted_any = true;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        let mut idx = 0;
        while idx < self.queue.len() {
            if self.queue[idx].mode.conflicts_with(self.granted_mask()) {
                if self.compatible_first == 0 {
                    break;
                }
                idx += 1;
                continue;
            }
            let entry = self.queue.remove(idx).expect("index is in bounds");
            self.queued_counts[entry.mode as usize] -= 1;
            self.add_granted(entry.locker, entry.mode, entry.compatible_first);
            granted_any = true;
        }

        granted_any
    }
}

fn mask_of(counts: &[u32; MODE_COUNT]) -> u8 {
    counts
        .iter()
        .enumerate()
        .fold(0u8, |mask, (idx, &count)| {
            if count > 0 { mask | (1 << idx as u8) } else { mask }
        })
}

struct LockHead {
    state: Mutex<HeadState>,
    granted_change: Condvar,
}

struct Shard {
    heads: Mutex<HashMap<ResourceId, Arc<LockHead>>>,
}

/// The process-wide lock table. Internally thread-safe; shared between
/// all lockers via `Arc`.
pub struct LockTable {
    shards: Vec<Shard>,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(LockTableConfig::default())
    }
}

impl LockTable {
    pub fn new(config: LockTableConfig) -> Self {
        let shard_count = config.shard_count.max(1).next_power_of_two();
        Self {
            shards: (0..shard_count)
                .map(|_| Shard {
                    heads: Mutex::new(HashMap::new()),
                })
                .collect(),
        }
    }

    fn shard(&self, resource: ResourceId) -> &Shard {
        // Skip the type byte so named resources spread by their hash.
        &self.shards[(resource.raw() >> 8) as usize & (self.shards.len() - 1)]
    }

    fn head(&self, resource: ResourceId) -> Arc<LockHead> {
        self.shard(resource)
            .heads
            .lock()
            .entry(resource)
            .or_insert_with(|| {
                Arc::new(LockHead {
                    state: Mutex::new(HeadState::default()),
                    granted_change: Condvar::new(),
                })
            })
            .clone()
    }

    /// Runs `op` on the live head for `resource`, retrying if the lookup
    /// raced a removal, and removes the head afterwards if `op` drained
    /// it.
    fn with_head<R>(&self, resource: ResourceId, op: impl FnOnce(&mut HeadState, &Condvar) -> R) -> R {
        let mut op = Some(op);
        loop {
            let head = self.head(resource);
            let mut state = head.state.lock();
            if state.defunct {
                continue;
            }
            let op = op.take().expect("the defunct retry never consumed the op");
            let result = op(&mut state, &head.granted_change);
            let drained = state.is_empty();
            drop(state);
            if drained {
                self.try_remove(resource, &head);
            }
            return result;
        }
    }

    fn try_remove(&self, resource: ResourceId, head: &Arc<LockHead>) {
        let mut heads = self.shard(resource).heads.lock();
        if let Some(current) = heads.get(&resource)
            && Arc::ptr_eq(current, head)
        {
            let mut state = head.state.lock();
            if state.is_empty() {
                state.defunct = true;
                drop(state);
                heads.remove(&resource);
            }
        }
    }

    /// Issues a fresh request. The caller must not already hold
    /// `resource`; same-holder re-requests go through [`convert`].
    ///
    /// [`convert`]: Self::convert
    pub(crate) fn lock(
        &self,
        locker: LockerId,
        resource: ResourceId,
        mode: LockMode,
        flags: RequestFlags,
    ) -> LockRequestStatus {
        debug_assert!(mode != LockMode::None);
        self.with_head(resource, |state, _| {
            debug_assert!(
                state.position_granted(locker).is_none(),
                "fresh request for a resource this locker already holds"
            );
            let compatible = !mode.conflicts_with(state.granted_mask());
            let bypass_queue = state.compatible_first > 0;
            if compatible && (bypass_queue || !mode.conflicts_with(state.queued_mask())) {
                state.add_granted(locker, mode, flags.compatible_first);
                trace!(resource = ?resource, %mode, locker, "lock granted");
                LockRequestStatus::Granted
            } else {
                let entry = WaitingEntry {
                    locker,
                    mode,
                    compatible_first: flags.compatible_first,
                };
                if flags.enqueue_at_front {
                    state.queue.push_front(entry);
                } else {
                    state.queue.push_back(entry);
                }
                state.queued_counts[mode as usize] += 1;
                trace!(
                    resource = ?resource, %mode, locker,
                    granted = ?ModeMask(state.granted_mask()),
                    queued = ?ModeMask(state.queued_mask()),
                    "lock request queued"
                );
                LockRequestStatus::Waiting
            }
        })
    }

    /// Upgrades `locker`'s existing grant to `target`. Conflicts are
    /// evaluated against the other holders only.
    pub(crate) fn convert(
        &self,
        locker: LockerId,
        resource: ResourceId,
        target: LockMode,
    ) -> LockRequestStatus {
        self.with_head(resource, |state, _| {
            let idx = state
                .position_granted(locker)
                .expect("conversion of a resource that is not held");
            debug_assert!(
                state.granted[idx].converting_to.is_none(),
                "a conversion is already in flight"
            );
            debug_assert!(target.covers(state.granted[idx].mode));
            let others = state.granted_mask_without(locker);
            if !target.conflicts_with(others) {
                let old = state.granted[idx].mode;
                state.granted[idx].mode = target;
                state.granted_counts[old as usize] -= 1;
                state.granted_counts[target as usize] += 1;
                trace!(resource = ?resource, from = %old, to = %target, locker, "lock converted");
                LockRequestStatus::Granted
            } else {
                state.granted[idx].converting_to = Some(target);
                trace!(resource = ?resource, to = %target, locker, "conversion pending");
                LockRequestStatus::Waiting
            }
        })
    }

    /// Parks until `locker`'s outstanding request on `resource` is
    /// granted or `deadline` passes. On timeout the request is removed
    /// (or the upgrade reverted) atomically with the last status check.
    pub(crate) fn wait(
        &self,
        locker: LockerId,
        resource: ResourceId,
        deadline: Option<Instant>,
    ) -> WaitOutcome {
        let head = self.head(resource);
        let mut state = head.state.lock();
        loop {
            if let Some(mode) = Self::granted_mode(&state, locker) {
                return WaitOutcome::Granted(mode);
            }
            let timed_out = match deadline {
                Some(deadline) => head
                    .granted_change
                    .wait_until(&mut state, deadline)
                    .timed_out(),
                None => {
                    head.granted_change.wait(&mut state);
                    false
                }
            };
            if timed_out {
                // A grant may have raced the timeout.
                if let Some(mode) = Self::granted_mode(&state, locker) {
                    return WaitOutcome::Granted(mode);
                }
                Self::rollback_pending(&mut state, &head.granted_change, locker);
                let drained = state.is_empty();
                drop(state);
                if drained {
                    self.try_remove(resource, &head);
                }
                return WaitOutcome::TimedOut;
            }
        }
    }

    /// Withdraws `locker`'s outstanding request without waiting.
    pub(crate) fn cancel(&self, locker: LockerId, resource: ResourceId) -> CancelOutcome {
        self.with_head(resource, |state, cv| {
            if let Some(idx) = state.queue.iter().position(|w| w.locker == locker) {
                let entry = state.queue.remove(idx).expect("position comes from the queue");
                state.queued_counts[entry.mode as usize] -= 1;
                if state.grant_waiters() {
                    cv.notify_all();
                }
                return CancelOutcome::Cancelled;
            }
            let idx = state
                .position_granted(locker)
                .expect("cancel without an outstanding request");
            if state.granted[idx].converting_to.take().is_some() {
                CancelOutcome::RevertedConversion
            } else {
                CancelOutcome::WasGranted(state.granted[idx].mode)
            }
        })
    }

    /// Removes `locker`'s grant on `resource` and wakes whoever the
    /// departure unblocks.
    pub(crate) fn unlock(&self, locker: LockerId, resource: ResourceId) {
        self.with_head(resource, |state, cv| {
            let idx = state
                .position_granted(locker)
                .expect("unlock of a resource that is not held");
            debug_assert!(
                state.granted[idx].converting_to.is_none(),
                "unlock with a conversion in flight"
            );
            let entry = state.granted.swap_remove(idx);
            state.granted_counts[entry.mode as usize] -= 1;
            if entry.compatible_first {
                state.compatible_first -= 1;
            }
            trace!(resource = ?resource, mode = %entry.mode, locker, "lock released");
            if state.grant_waiters() {
                cv.notify_all();
            }
        })
    }

    /// Weakens `locker`'s grant to `target` without releasing it. The
    /// weaker mode is immediately visible to new requests, and waiters it
    /// unblocks are granted.
    pub(crate) fn downgrade(&self, locker: LockerId, resource: ResourceId, target: LockMode) {
        self.with_head(resource, |state, cv| {
            let idx = state
                .position_granted(locker)
                .expect("downgrade of a resource that is not held");
            debug_assert!(state.granted[idx].converting_to.is_none());
            assert!(
                state.granted[idx].mode.covers(target),
                "downgrade must weaken the held mode"
            );
            let old = state.granted[idx].mode;
            state.granted[idx].mode = target;
            state.granted_counts[old as usize] -= 1;
            state.granted_counts[target as usize] += 1;
            trace!(resource = ?resource, from = %old, to = %target, locker, "lock downgraded");
            if state.grant_waiters() {
                cv.notify_all();
            }
        })
    }

    fn granted_mode(state: &HeadState, locker: LockerId) -> Option<LockMode> {
        if state.queue.iter().any(|w| w.locker == locker) {
            return None;
        }
        let entry = state
            .granted
            .iter()
            .find(|g| g.locker == locker)
            .expect("a waiter has either a queued or a granted entry");
        if entry.converting_to.is_some() {
            None
        } else {
            Some(entry.mode)
        }
    }

    fn rollback_pending(state: &mut HeadState, cv: &Condvar, locker: LockerId) {
        if let Some(idx) = state.queue.iter().position(|w| w.locker == locker) {
            let entry = state.queue.remove(idx).expect("position comes from the queue");
            state.queued_counts[entry.mode as usize] -= 1;
        } else {
            let entry = state
                .granted
                .iter_mut()
                .find(|g| g.locker == locker)
                .expect("timed-out waiter has a pending conversion");
            debug_assert!(entry.converting_to.is_some());
            entry.converting_to = None;
        }
        // The departure may unblock waiters that queued behind it.
        if state.grant_waiters() {
            cv.notify_all();
        }
    }

    /// Renders the current table state, for diagnostics.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for shard in &self.shards {
            for (resource, head) in shard.heads.lock().iter() {
                let state = head.state.lock();
                let granted = state
                    .granted
                    .iter()
                    .map(|g| format!("{}:{}", g.locker, g.mode))
                    .join(", ");
                let queued = state
                    .queue
                    .iter()
                    .map(|w| format!("{}:{}", w.locker, w.mode))
                    .join(", ");
                out.push_str(&format!(
                    "{resource:?} granted [{granted}] queued [{queued}]\n"
                ));
            }
        }
        out
    }
}
