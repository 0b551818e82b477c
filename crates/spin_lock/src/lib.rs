//! A busy-waiting mutex that disables local interrupts while held.
//!
//! Generic over a [`Cpu`] binding so this crate never depends on any
//! particular architecture; the source kernel's own `spinlock.rs` hard-codes
//! RISC-V's `tp` register and `sstatus`, this crate instead calls through
//! `C: Cpu` for both, the same genericization `mutex_api`'s own trait already
//! applies to "what kind of lock is this".
#![cfg_attr(not(test), no_std)]

use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use cpu::Cpu;
use mutex_api::Mutex;

const INVALID_CPUID: usize = usize::MAX;

struct RawSpinLock<C> {
    locked: AtomicBool,
    /// CPU id of the current holder, for the `holding` debug assertion.
    holder: AtomicUsize,
    _cpu: PhantomData<C>,
}

unsafe impl<C> Sync for RawSpinLock<C> {}

impl<C> RawSpinLock<C>
where
    C: Cpu,
{
    const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            holder: AtomicUsize::new(INVALID_CPUID),
            _cpu: PhantomData,
        }
    }

    /// Spins until the lock is acquired.
    ///
    /// Disables interrupts on the local CPU first, so that the critical
    /// section can never be re-entered via an interrupt on this core.
    fn acquire(&self) {
        C::push_off();
        assert!(!self.holding(), "spin_lock: acquire on already-held lock");

        // `Ordering::Acquire` keeps loads/stores in the critical section from
        // being reordered before the lock is visibly taken.
        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }

        self.holder.store(C::id(), Ordering::Relaxed);
    }

    fn release(&self) {
        assert!(self.holding(), "spin_lock: release on lock not held here");
        self.holder.store(INVALID_CPUID, Ordering::Relaxed);

        // `Ordering::Release` makes the critical section's stores visible to
        // whoever observes `locked == false` next.
        self.locked.store(false, Ordering::Release);
        C::pop_off();
    }

    /// Reports whether the current CPU holds the lock.
    ///
    /// Only meaningful with interrupts disabled, since otherwise `C::id()`
    /// itself is not well-defined.
    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.holder.load(Ordering::Relaxed) == C::id()
    }
}

/// A spin lock protecting a `T`, generic over the CPU binding `C`.
pub struct SpinLock<T, C> {
    lock: RawSpinLock<C>,
    value: UnsafeCell<T>,
}

unsafe impl<T, C> Sync for SpinLock<T, C> where T: Send {}
unsafe impl<T, C> Send for SpinLock<T, C> where T: Send {}

impl<T, C> SpinLock<T, C>
where
    C: Cpu,
{
    /// Creates a new, unlocked spin lock wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            lock: RawSpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it is available.
    pub fn lock(&self) -> SpinLockGuard<'_, T, C> {
        self.lock.acquire();
        SpinLockGuard { lock: self }
    }
}

impl<T, C> Mutex for SpinLock<T, C>
where
    C: Cpu,
{
    type Data = T;
    type Guard<'a>
        = SpinLockGuard<'a, T, C>
    where
        Self: 'a;

    fn new(data: Self::Data) -> Self {
        Self::new(data)
    }

    fn lock(&self) -> Self::Guard<'_> {
        Self::lock(self)
    }
}

/// RAII guard returned by [`SpinLock::lock`]; releases on drop.
pub struct SpinLockGuard<'a, T, C>
where
    C: Cpu,
{
    lock: &'a SpinLock<T, C>,
}

impl<T, C> Drop for SpinLockGuard<'_, T, C>
where
    C: Cpu,
{
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<'a, T, C> SpinLockGuard<'a, T, C>
where
    C: Cpu,
{
    /// Consumes the guard without releasing the lock, returning the lock it
    /// came from.
    ///
    /// Used by `wait_queue` to release the lock only once the waiter is
    /// safely parked, avoiding a lost-wakeup window between "drop the guard"
    /// and "start waiting".
    pub fn into_lock(self) -> &'a SpinLock<T, C> {
        let lock = self.lock;
        core::mem::forget(self);
        lock.lock.release();
        lock
    }
}

impl<T, C> Deref for SpinLockGuard<'_, T, C>
where
    C: Cpu,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T, C> DerefMut for SpinLockGuard<'_, T, C>
where
    C: Cpu,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, sync::Arc, thread};

    use super::*;

    thread_local! {
        static CURRENT_CPU: Cell<usize> = const { Cell::new(0) };
        static DEPTH: Cell<usize> = const { Cell::new(0) };
    }

    /// A test-only [`Cpu`] binding: "the current CPU" is whatever the test
    /// thread last set it to, and `push_off`/`pop_off` just track nesting
    /// depth (there is no real interrupt state to save in a hosted test).
    struct MockCpu;

    impl MockCpu {
        fn set_current(id: usize) {
            CURRENT_CPU.with(|c| c.set(id));
        }
    }

    impl Cpu for MockCpu {
        fn id() -> usize {
            CURRENT_CPU.with(Cell::get)
        }

        fn push_off() {
            DEPTH.with(|d| d.set(d.get() + 1));
        }

        fn pop_off() {
            DEPTH.with(|d| {
                assert!(d.get() > 0);
                d.set(d.get() - 1);
            });
        }
    }

    #[test]
    fn lock_unlock_roundtrip() {
        let lock: SpinLock<i32, MockCpu> = SpinLock::new(0);
        *lock.lock() = 42;
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    #[should_panic(expected = "already-held")]
    fn recursive_acquire_panics() {
        MockCpu::set_current(0);
        let lock: SpinLock<i32, MockCpu> = SpinLock::new(0);
        let _g1 = lock.lock();
        let _g2 = lock.lock();
    }

    #[test]
    fn contended_across_threads_is_mutually_exclusive() {
        let lock = Arc::new(SpinLock::<u64, MockCpu>::new(0));
        let mut handles = vec![];
        for cpu in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                MockCpu::set_current(cpu);
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }
}
