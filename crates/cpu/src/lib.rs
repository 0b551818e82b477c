//! CPU-id and interrupt-disable facility consumed by the lock primitives.
//!
//! Neither [`spin_lock`](../spin_lock/index.html) nor the allocators in this
//! workspace know how to read a CPU id register or mask interrupts; they are
//! generic over a type implementing [`Cpu`] and call through it. This keeps
//! the hot paths portable between a real RISC-V kernel (see `riscv_cpu`) and
//! a hosted test harness backed by thread-locals.
#![no_std]

/// Per-CPU identity and nestable local-interrupt control.
///
/// Implementors must guarantee that [`Cpu::id`] is only ever read while
/// interrupts are disabled on the calling core (i.e. strictly between a
/// `push_off`/`pop_off` pair), so that the returned id cannot go stale
/// because the scheduler migrated the caller to another core mid-read.
pub trait Cpu {
    /// Returns the id of the CPU currently executing, in `0..NCPU`.
    ///
    /// # Panics
    ///
    /// Implementations should panic (or otherwise signal misuse) if called
    /// while interrupts are enabled.
    fn id() -> usize;

    /// Disables interrupts on the local CPU.
    ///
    /// Calls nest: the local interrupt-enable state is saved on first entry
    /// and restored only once the matching number of [`Cpu::pop_off`] calls
    /// have been made.
    fn push_off();

    /// Undoes one [`Cpu::push_off`].
    ///
    /// Restores the local interrupt-enable state once the nesting depth
    /// returns to zero.
    ///
    /// # Panics
    ///
    /// Implementations should panic if called without a matching prior
    /// `push_off`.
    fn pop_off();
}

/// A monotonic, coarse-grained tick source.
///
/// Used by the buffer cache to timestamp the transition of a buffer's
/// reference count to zero, for LRU victim selection.
pub trait Clock {
    /// Returns the current tick count.
    ///
    /// Ticks are opaque and only meaningfully compared to each other;
    /// wraparound is out of scope (see the buffer cache's design notes).
    fn ticks() -> u64;
}
