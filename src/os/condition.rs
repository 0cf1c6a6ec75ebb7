// src/os/condition.rs

//! Monitor-style condition variable paired with an external lock.
//!
//! A `WaitCondition` carries no predicate of its own. Callers hold a
//! `parking_lot::Mutex` guard over whatever state they care about, call
//! [`WaitCondition::wait`] in a loop until their predicate holds, and the
//! other side mutates that state under the same lock before calling
//! [`WaitCondition::signal`] or [`WaitCondition::broadcast`].
//!
//! ```ignore
//! let mut ready = lock.lock();
//! while !*ready {
//!     cond.wait(&mut ready);
//! }
//! ```
//!
//! Wakeups are not queued: a `signal()` with nobody blocked is lost.

use log::trace;
use parking_lot::{Condvar, MutexGuard};
use std::time::Duration;

/// Condition variable used by the scheduler's termination handshake and by
/// channel doorbells.
#[derive(Debug, Default)]
pub struct WaitCondition {
    cond: Condvar,
}

impl WaitCondition {
    pub const fn new() -> Self {
        Self {
            cond: Condvar::new(),
        }
    }

    /// Releases the lock held by `guard`, blocks until signaled, then
    /// reacquires the lock before returning.
    ///
    /// May return spuriously. Re-check the predicate.
    pub fn wait<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>) {
        self.cond.wait(guard);
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    ///
    /// Returns `true` if the timeout elapsed without a wakeup.
    pub fn wait_timeout<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>, timeout: Duration) -> bool {
        self.cond.wait_for(guard, timeout).timed_out()
    }

    /// Wakes at most one blocked waiter. Returns whether a waiter was woken.
    pub fn signal(&self) -> bool {
        let woke = self.cond.notify_one();
        trace!("WaitCondition::signal woke={}", woke);
        woke
    }

    /// Wakes every blocked waiter. Returns how many were woken.
    pub fn broadcast(&self) -> usize {
        let woken = self.cond.notify_all();
        trace!("WaitCondition::broadcast woke {} waiter(s)", woken);
        woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;
    use test_log::test;

    #[test]
    fn signal_without_waiters_is_not_queued() {
        let cond = WaitCondition::new();
        let lock = Mutex::new(());
        assert!(!cond.signal());

        // A later waiter must not see the earlier signal.
        let mut guard = lock.lock();
        let start = Instant::now();
        assert!(cond.wait_timeout(&mut guard, Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_returns_after_predicate_is_set() {
        let shared = Arc::new((Mutex::new(false), WaitCondition::new()));
        let shared_clone = shared.clone();

        let waiter = thread::spawn(move || {
            let (lock, cond) = &*shared_clone;
            let mut ready = lock.lock();
            while !*ready {
                cond.wait(&mut ready);
            }
            *ready
        });

        thread::sleep(Duration::from_millis(20));
        {
            let (lock, cond) = &*shared;
            *lock.lock() = true;
            cond.signal();
        }
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn signal_wakes_one_broadcast_wakes_rest() {
        const WAITERS: usize = 3;
        // Generation counter: each waiter leaves once it has been handed a ticket.
        let shared = Arc::new((Mutex::new(0usize), WaitCondition::new()));
        let released = Arc::new(AtomicUsize::new(0));
        let parked = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..WAITERS)
            .map(|_| {
                let shared = shared.clone();
                let released = released.clone();
                let parked = parked.clone();
                thread::spawn(move || {
                    let (lock, cond) = &*shared;
                    let mut tickets = lock.lock();
                    parked.fetch_add(1, Ordering::SeqCst);
                    while *tickets == 0 {
                        cond.wait(&mut tickets);
                    }
                    *tickets -= 1;
                    released.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        while parked.load(Ordering::SeqCst) < WAITERS {
            thread::sleep(Duration::from_millis(1));
        }

        // Waiters count themselves under the lock and only drop it inside
        // wait(), so once we hold it every waiter is blocked.
        let (lock, cond) = &*shared;
        {
            let mut tickets = lock.lock();
            *tickets += 1;
            assert!(cond.signal());
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(released.load(Ordering::SeqCst), 1);

        {
            let mut tickets = lock.lock();
            *tickets += WAITERS - 1;
            assert_eq!(cond.broadcast(), WAITERS - 1);
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), WAITERS);
    }
}
