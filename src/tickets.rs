//! Ticket-based admission control.
//!
//! A [`TicketHolder`] bounds how many operations may hold the global lock
//! at once. Lockers take a ticket on their first global reference and
//! return it with their last one; when no ticket is free the acquisition
//! waits, bounded by the same deadline as the lock request itself.

use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// A counting semaphore with deadline-bounded acquisition.
#[derive(Debug)]
pub struct TicketHolder {
    capacity: u32,
    available: Mutex<u32>,
    released: Condvar,
}

impl TicketHolder {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            available: Mutex::new(capacity),
            released: Condvar::new(),
        }
    }

    /// Takes a ticket without blocking. Returns false when none are free.
    pub fn try_acquire(&self) -> bool {
        let mut available = self.available.lock();
        if *available == 0 {
            return false;
        }
        *available -= 1;
        true
    }

    /// Takes a ticket, blocking until one frees up or `deadline` passes.
    /// `None` waits without bound. Returns whether a ticket was taken.
    pub fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut available = self.available.lock();
        loop {
            if *available > 0 {
                *available -= 1;
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if self.released.wait_until(&mut available, deadline).timed_out() {
                        // A release may have raced the timeout.
                        if *available > 0 {
                            *available -= 1;
                            return true;
                        }
                        return false;
                    }
                }
                None => self.released.wait(&mut available),
            }
        }
    }

    pub fn release(&self) {
        let mut available = self.available.lock();
        assert!(
            *available < self.capacity,
            "ticket released that was never acquired"
        );
        *available += 1;
        self.released.notify_one();
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn available(&self) -> u32 {
        *self.available.lock()
    }

    /// Tickets currently handed out.
    pub fn used(&self) -> u32 {
        self.capacity - self.available()
    }
}
