//! Process-wide storage-engine capabilities.
//!
//! The only capability the lock manager cares about is whether the engine
//! synchronizes documents itself. When it does, collection locks pass
//! through in their intent modes; when it does not, the collection is the
//! finest granularity and intent modes harden to their full equivalents
//! (see [`crate::guards::CollectionLock`]).

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};

static SUPPORTS_DOC_LOCKING: AtomicBool = AtomicBool::new(false);
static OVERRIDE_SERIAL: Mutex<()> = Mutex::new(());

/// Whether the storage engine supports document-level locking.
pub fn supports_doc_locking() -> bool {
    SUPPORTS_DOC_LOCKING.load(Ordering::Relaxed)
}

/// Records the engine capability. Called once during process startup,
/// before any locker exists.
pub fn set_supports_doc_locking(enabled: bool) {
    SUPPORTS_DOC_LOCKING.store(enabled, Ordering::Relaxed);
}

/// Scoped override of the capability flag for tests. Holders are
/// serialized against each other, so tests that depend on the flag do not
/// interleave.
pub struct ForceDocLocking {
    previous: bool,
    _serial: MutexGuard<'static, ()>,
}

impl ForceDocLocking {
    pub fn new(enabled: bool) -> Self {
        let serial = OVERRIDE_SERIAL.lock();
        let previous = SUPPORTS_DOC_LOCKING.swap(enabled, Ordering::Relaxed);
        Self {
            previous,
            _serial: serial,
        }
    }
}

impl Drop for ForceDocLocking {
    fn drop(&mut self) {
        SUPPORTS_DOC_LOCKING.store(self.previous, Ordering::Relaxed);
    }
}
