//! Counting semaphore bounding outbound fan-out (e.g. provider version checks).

use std::sync::{Condvar, Mutex, PoisonError};

/// A counting semaphore over `Mutex + Condvar`.
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

/// Releases one permit on drop.
pub struct Permit<'a>(&'a Semaphore);

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits.max(1)),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit is available.
    pub fn acquire(&self) -> Permit<'_> {
        let mut count = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        while *count == 0 {
            count = self
                .cond
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *count -= 1;
        Permit(self)
    }

    /// Take a permit only if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut count = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        if *count == 0 {
            return None;
        }
        *count -= 1;
        Some(Permit(self))
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        *self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut count = self
            .0
            .permits
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *count += 1;
        self.0.cond.notify_one();
    }
}
