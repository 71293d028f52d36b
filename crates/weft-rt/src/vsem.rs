//! Virtual semaphore.
//!
//! A counting semaphore whose count is signed and may start negative:
//! constructed with count `-(n-1)`, the first `n` releases must land
//! before a single acquire succeeds. That latch idiom is how the runtime
//! expresses "all `n` iterations finished" and "this task completed"
//! (count 0, one release) with one primitive.
//!
//! An optional cap bounds the count; a release at the cap is silently
//! dropped, but the wakeup signal is still sent so a waiter registered
//! in between is not lost.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct State {
    count: i64,
    /// 0 means uncapped.
    max: i64,
}

pub struct VSem {
    state: Mutex<State>,
    available: Condvar,
}

impl VSem {
    /// Uncapped semaphore. A negative `initial` is the latch idiom.
    pub fn new(initial: i64) -> Self {
        Self::with_max(initial, 0)
    }

    /// Capped semaphore; `max == 0` means uncapped.
    pub fn with_max(initial: i64, max: i64) -> Self {
        VSem {
            state: Mutex::new(State {
                count: initial,
                max,
            }),
            available: Condvar::new(),
        }
    }

    /// Block while the count is non-positive, then take one unit.
    pub fn acquire(&self) {
        let mut state = self.state.lock();
        while state.count <= 0 {
            self.available.wait(&mut state);
        }
        state.count -= 1;
    }

    /// As [`VSem::acquire`], but give up at the deadline. Returns `true`
    /// if a unit was taken; on timeout the count is untouched.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.count <= 0 {
            if self.available.wait_until(&mut state, deadline).timed_out() {
                // One final check: the signal may have raced the deadline.
                if state.count > 0 {
                    break;
                }
                return false;
            }
        }
        state.count -= 1;
        true
    }

    /// Take one unit if immediately available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.count > 0 {
            state.count -= 1;
            true
        } else {
            false
        }
    }

    /// Add one unit, saturating at the cap when one is set, and wake one
    /// waiter. The wakeup is sent even when the release is dropped at the
    /// cap.
    pub fn release(&self) {
        let mut state = self.state.lock();
        if state.max == 0 || state.count < state.max {
            state.count += 1;
        }
        drop(state);
        self.available.notify_one();
    }

    /// Current count. Meaningful only when no thread is mid-operation;
    /// exists for inspection and tests.
    pub fn count(&self) -> i64 {
        self.state.lock().count
    }
}
