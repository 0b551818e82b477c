//! The blocking half of a sleep lock: parking and waking a caller.
//!
//! `sleep_lock::SleepMutex` holds a [`spin_lock::SpinLock`] around its own
//! `locked` flag and delegates "block until someone releases" to a
//! [`WaitQueue`] implementation. This crate only defines the trait and (under
//! the `std` feature) a hosted implementation suitable for tests; a real
//! kernel supplies its own implementation backed by the process scheduler,
//! the same way the source kernel's `proc::sleep`/`proc::wakeup` back its
//! `SleepLock`.
#![cfg_attr(not(feature = "std"), no_std)]

use cpu::Cpu;
use spin_lock::SpinLockGuard;

/// A queue of execution contexts blocked on some condition.
///
/// `wait` is handed the guard of the spin lock protecting the condition so
/// that it can be released only once the waiter is durably registered to be
/// woken, closing the lost-wakeup window between "check the condition" and
/// "start waiting".
pub trait WaitQueue: Default {
    /// Releases `guard` and blocks the caller until [`WaitQueue::notify_all`]
    /// is called at least once afterwards, then re-acquires the same lock
    /// and returns a fresh guard.
    ///
    /// Spurious wakeups are allowed: callers must re-check their condition
    /// in a loop, exactly as with a condition variable.
    fn wait<'a, T, C>(&self, guard: SpinLockGuard<'a, T, C>) -> SpinLockGuard<'a, T, C>
    where
        C: Cpu;

    /// Wakes every context currently blocked in [`WaitQueue::wait`] on this
    /// queue.
    fn notify_all(&self);
}

#[cfg(feature = "std")]
pub use std_backed::StdWaitQueue;

#[cfg(feature = "std")]
mod std_backed {
    use std::sync::{Condvar, Mutex};

    use super::{Cpu, SpinLockGuard, WaitQueue};

    /// A [`WaitQueue`] backed by a `std::sync::Condvar`, for hosted tests.
    ///
    /// Tracks a generation counter rather than a boolean predicate: the
    /// counter is sampled before the caller's spin lock is released and
    /// compared again after this queue's own internal lock is taken, so a
    /// `notify_all` racing in between is never lost (the standard
    /// generation-counter condvar idiom, the same one the source kernel's
    /// `SpinLockCondVar` uses for exactly this reason).
    #[derive(Default)]
    pub struct StdWaitQueue {
        generation: Mutex<u64>,
        condvar: Condvar,
    }

    impl WaitQueue for StdWaitQueue {
        fn wait<'a, T, C>(&self, guard: SpinLockGuard<'a, T, C>) -> SpinLockGuard<'a, T, C>
        where
            C: Cpu,
        {
            let seen = *self.generation.lock().unwrap();
            let lock = guard.into_lock();

            let mut gen_guard = self.generation.lock().unwrap();
            while *gen_guard == seen {
                gen_guard = self.condvar.wait(gen_guard).unwrap();
            }
            drop(gen_guard);

            lock.lock()
        }

        fn notify_all(&self) {
            let mut gen_guard = self.generation.lock().unwrap();
            *gen_guard = gen_guard.wrapping_add(1);
            self.condvar.notify_all();
        }
    }
}
