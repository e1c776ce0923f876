//! Retry loop for storage-level write conflicts.

use std::time::Duration;

use crate::base::{WardenError, WardenResult};
use crate::context::OperationContext;

/// Runs `f`, retrying with backoff whenever it fails with
/// [`WardenError::WriteConflict`].
///
/// Inside a write unit of work the conflict propagates instead: the
/// whole transaction has to retry, not just this one operation. Every
/// other error propagates immediately. Retries are unbounded; the caller
/// bounds the overall operation through its own deadline.
pub fn write_conflict_retry<T, F>(
    opctx: &OperationContext,
    op_name: &str,
    ns: &str,
    mut f: F,
) -> WardenResult<T>
where
    F: FnMut() -> WardenResult<T>,
{
    if opctx.locker().in_write_unit_of_work() {
        return f();
    }
    let mut attempts = 0u32;
    loop {
        match f() {
            Err(WardenError::WriteConflict) => {
                attempts += 1;
                opctx.record_write_conflict();
                debug!(op = op_name, ns, attempts, "write conflict, retrying");
                backoff(attempts);
            }
            other => return other,
        }
    }
}

/// Conflicts usually clear as soon as the other writer commits, so the
/// first attempts only yield; after that the sleep doubles, capped at
/// 100ms.
fn backoff(attempts: u32) {
    if attempts <= 3 {
        std::thread::yield_now();
        return;
    }
    let micros = (1u64 << attempts.min(17)).min(100_000);
    std::thread::sleep(Duration::from_micros(micros));
}
