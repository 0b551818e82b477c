//! RISC-V binding for the [`cpu::Cpu`] and [`cpu::Clock`] traits.
//!
//! The CPU id lives in the `tp` register, set once per hart at boot by the
//! surrounding kernel's entry code; interrupt enable/disable is the
//! `sstatus.SIE` bit. Both bindings mirror the source kernel's own
//! `cpu.rs`/`interrupt.rs` one-for-one: nothing new is invented here beyond
//! re-exposing the same register accesses through a trait so `spin_lock`,
//! `page_alloc`, and `buffer_cache` need not depend on `riscv` directly.
#![no_std]

use core::{
    arch::asm,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use cpu::{Clock, Cpu};
use kernel_params::NCPU;
use riscv::register::{sstatus, time};

/// Sentinel written into a hart's `tp` register before it has been assigned
/// a CPU id by boot code.
pub const INVALID_CPUID: usize = usize::MAX;

/// Reads the raw CPU id out of `tp`.
///
/// # Panics
///
/// Panics if interrupts are currently enabled: the id is only meaningful
/// while the caller cannot be preempted onto another hart.
fn raw_id() -> usize {
    assert!(!sstatus::read().sie(), "cpu::id called with interrupts enabled");
    let id: usize;
    unsafe { asm!("mv {}, tp", out(reg) id) };
    id
}

/// Stores this hart's CPU id into `tp`.
///
/// Called once by the kernel's boot sequence, before interrupts are ever
/// enabled on this hart.
///
/// # Safety
///
/// Must be called at most once per hart, before any code on this hart reads
/// [`RiscvCpu::id`].
pub unsafe fn set_id(id: usize) {
    unsafe { asm!("mv tp, {}", in(reg) id) };
}

static STATE: [HartState; NCPU] = [const { HartState::new() }; NCPU];

struct HartState {
    /// Depth of nested [`Cpu::push_off`] calls.
    depth: AtomicUsize,
    /// Interrupt-enable state as it was before the outermost `push_off`.
    was_enabled: AtomicBool,
}

impl HartState {
    const fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            was_enabled: AtomicBool::new(false),
        }
    }
}

/// The RISC-V implementation of [`cpu::Cpu`] and [`cpu::Clock`].
///
/// A zero-sized marker type: all state lives in per-hart registers and the
/// static [`STATE`] table, not in `Self`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiscvCpu;

impl Cpu for RiscvCpu {
    fn id() -> usize {
        let id = raw_id();
        assert_ne!(id, INVALID_CPUID, "cpu id not yet assigned on this hart");
        id
    }

    fn push_off() {
        let was_enabled = sstatus::read().sie();
        unsafe {
            sstatus::clear_sie();
        }

        // `id()` asserts interrupts are off, which they now are; read the raw
        // id directly since it may still be `INVALID_CPUID` during very early
        // boot on this hart, which callers of `push_off` must tolerate.
        let id = raw_id();
        let state = &STATE[id];
        let depth = state.depth.fetch_add(1, Ordering::Acquire);
        if depth == 0 {
            state.was_enabled.store(was_enabled, Ordering::Relaxed);
        }
    }

    fn pop_off() {
        assert!(!sstatus::read().sie(), "pop_off called with interrupts enabled");
        let id = raw_id();
        let state = &STATE[id];
        let depth = state.depth.load(Ordering::Relaxed);
        assert!(depth > 0, "pop_off without matching push_off");

        let was_enabled = state.was_enabled.load(Ordering::Relaxed);
        if state.depth.fetch_sub(1, Ordering::Release) == 1 && was_enabled {
            unsafe {
                sstatus::set_sie();
            }
        }
    }
}

impl Clock for RiscvCpu {
    fn ticks() -> u64 {
        time::read64()
    }
}
