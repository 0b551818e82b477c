//! A mutex that may block the caller, safe to hold across blocking I/O.
//!
//! Mirrors the source kernel's `SleepLock`: a spin lock protects a `locked`
//! flag, and a [`WaitQueue`] parks the caller instead of spinning when the
//! flag is already set. Unlike `spin_lock::SpinLock`, holding this lock never
//! disables interrupts and never busy-waits, so it is the right choice for
//! the buffer cache's per-block content lock, which may be held across a
//! synchronous disk read.
#![cfg_attr(not(test), no_std)]

use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

use cpu::Cpu;
use mutex_api::Mutex;
use spin_lock::SpinLock;
use wait_queue::WaitQueue;

struct State {
    locked: bool,
}

/// A sleep lock protecting a `T`.
///
/// Generic over the CPU binding `C` (passed through to the internal spin
/// lock) and the wait queue implementation `Q` used to park contended
/// callers.
pub struct SleepMutex<T, C, Q> {
    state: SpinLock<State, C>,
    queue: Q,
    value: UnsafeCell<T>,
    _cpu: PhantomData<C>,
}

unsafe impl<T, C, Q> Sync for SleepMutex<T, C, Q> where T: Send {}
unsafe impl<T, C, Q> Send for SleepMutex<T, C, Q> where T: Send {}

impl<T, C, Q> SleepMutex<T, C, Q>
where
    C: Cpu,
    Q: WaitQueue,
{
    /// Creates a new, unlocked sleep lock wrapping `value`.
    pub fn new(value: T) -> Self {
        Self {
            state: SpinLock::new(State { locked: false }),
            queue: Q::default(),
            value: UnsafeCell::new(value),
            _cpu: PhantomData,
        }
    }

    /// Acquires the lock, blocking (without spinning) until it is available.
    pub fn lock(&self) -> SleepMutexGuard<'_, T, C, Q> {
        let mut guard = self.state.lock();
        while guard.locked {
            guard = self.queue.wait(guard);
        }
        guard.locked = true;
        drop(guard);

        SleepMutexGuard { lock: self }
    }
}

impl<T, C, Q> Mutex for SleepMutex<T, C, Q>
where
    C: Cpu,
    Q: WaitQueue,
{
    type Data = T;
    type Guard<'a>
        = SleepMutexGuard<'a, T, C, Q>
    where
        Self: 'a;

    fn new(data: Self::Data) -> Self {
        Self::new(data)
    }

    fn lock(&self) -> Self::Guard<'_> {
        Self::lock(self)
    }
}

/// RAII guard returned by [`SleepMutex::lock`]; releases and wakes the next
/// waiter on drop.
pub struct SleepMutexGuard<'a, T, C, Q>
where
    C: Cpu,
    Q: WaitQueue,
{
    lock: &'a SleepMutex<T, C, Q>,
}

impl<T, C, Q> Drop for SleepMutexGuard<'_, T, C, Q>
where
    C: Cpu,
    Q: WaitQueue,
{
    fn drop(&mut self) {
        let mut guard = self.lock.state.lock();
        guard.locked = false;
        drop(guard);
        self.lock.queue.notify_all();
    }
}

impl<T, C, Q> Deref for SleepMutexGuard<'_, T, C, Q>
where
    C: Cpu,
    Q: WaitQueue,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T, C, Q> DerefMut for SleepMutexGuard<'_, T, C, Q>
where
    C: Cpu,
    Q: WaitQueue,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, sync::Arc, thread, time::Duration};

    use wait_queue::StdWaitQueue;

    use super::*;

    thread_local! {
        static CURRENT_CPU: Cell<usize> = const { Cell::new(0) };
    }

    struct MockCpu;

    impl Cpu for MockCpu {
        fn id() -> usize {
            CURRENT_CPU.with(Cell::get)
        }

        fn push_off() {}

        fn pop_off() {}
    }

    type TestMutex<T> = SleepMutex<T, MockCpu, StdWaitQueue>;

    #[test]
    fn lock_unlock_roundtrip() {
        let m: TestMutex<i32> = SleepMutex::new(0);
        *m.lock() = 7;
        assert_eq!(*m.lock(), 7);
    }

    #[test]
    fn second_locker_blocks_until_release() {
        let m = Arc::new(TestMutex::new(0));
        let g = m.lock();

        let m2 = Arc::clone(&m);
        let handle = thread::spawn(move || {
            *m2.lock() = 99;
        });

        thread::sleep(Duration::from_millis(30));
        assert_eq!(*g, 0);
        drop(g);

        handle.join().unwrap();
        assert_eq!(*m.lock(), 99);
    }

    #[test]
    fn serializes_many_threads() {
        let m = Arc::new(TestMutex::new(0u64));
        let mut handles = vec![];
        for _ in 0..8 {
            let m = Arc::clone(&m);
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    *m.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 4000);
    }
}
