//! Per-display serialization.
//!
//! Operations on one display must never interleave, while operations on
//! different displays run concurrently. Each display reference owns a
//! ticket-ordered lock: waiters are served strictly in arrival order, an
//! optional timeout turns into a display-busy error, and the guard releases
//! on every exit path including panics.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{DdcResult, Status};

#[derive(Debug, Default)]
struct LockState {
    next_ticket: u64,
    now_serving: u64,
    holder_active: bool,
    abandoned: HashSet<u64>,
}

/// Fair mutual-exclusion primitive for one display.
#[derive(Debug, Default)]
pub struct DisplayLock {
    state: Mutex<LockState>,
    cv: Condvar,
}

impl DisplayLock {
    pub fn new() -> DisplayLock {
        DisplayLock::default()
    }

    /// Acquires the lock, waiting at most `timeout` if one is given.
    /// Timeout expiry yields display-busy rather than blocking forever.
    pub fn acquire(&self, timeout: Option<Duration>) -> DdcResult<DisplayLockGuard<'_>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        loop {
            if state.now_serving == ticket && !state.holder_active {
                state.holder_active = true;
                return Ok(DisplayLockGuard { lock: self });
            }
            match deadline {
                None => state = self.cv.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.abandoned.insert(ticket);
                        return Err(Status::DisplayBusy.at("display_lock::acquire"));
                    }
                    let (guard, _) = self.cv.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                }
            }
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.holder_active);
        state.holder_active = false;
        state.now_serving += 1;
        loop {
            let serving = state.now_serving;
            if !state.abandoned.remove(&serving) {
                break;
            }
            state.now_serving += 1;
        }
        drop(state);
        self.cv.notify_all();
    }
}

/// Exclusive access to a display for the duration of one logical operation.
#[derive(Debug)]
pub struct DisplayLockGuard<'a> {
    lock: &'a DisplayLock,
}

impl Drop for DisplayLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Cooperative cancellation flag, checked between retry attempts.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
