//! Per-CPU free-list allocator for fixed-size physical pages, with
//! cross-CPU work stealing.
//!
//! Grounded on the source kernel's `kalloc.c`: one free list and one spin
//! lock per CPU, a page carries its own list node overlaid at its first
//! bytes, and an empty local list is refilled by stealing a bounded batch of
//! pages from the other CPUs' lists before giving up. Generic over the
//! arena's lock type (`M: Mutex`) and the CPU/interrupt binding (`C: Cpu`),
//! the same genericization the source workspace's own `page_alloc` crate
//! already applies to its single-arena allocator.
#![cfg_attr(not(test), no_std)]

use core::ptr::NonNull;

use cpu::Cpu;
use kernel_params::{NCPU, PAGE_SIZE, STEAL_BATCH};
use mutex_api::Mutex;
use once_init::OnceInit;

/// Byte pattern written into a page handed out by [`PageAllocator::alloc_page`].
const JUNK_ALLOCATED: u8 = 0x05;
/// Byte pattern written into a page returned to [`PageAllocator::free_page`].
const JUNK_FREED: u8 = 0x01;

/// A free page's intrusive list node, overlaid at the page's first bytes.
struct Run {
    next: Option<NonNull<Run>>,
}

/// The head of one CPU's free list.
///
/// A thin `Send` wrapper: `NonNull` does not implement `Send` on its own, but
/// a page's ownership genuinely moves with the list, so it is sound for us
/// to assert it here once, rather than push the assertion onto every `M`.
#[derive(Clone, Copy)]
struct FreeList(Option<NonNull<Run>>);

unsafe impl Send for FreeList {}

/// The address of a physical page, as returned by [`PageAllocator::alloc_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAddr(NonNull<u8>);

unsafe impl Send for PageAddr {}

impl PageAddr {
    /// Returns the raw pointer this address refers to.
    #[must_use]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    fn addr(self) -> usize {
        self.0.addr().get()
    }
}

/// A per-CPU free-page allocator.
///
/// `M` is the lock type guarding each arena's free list (typically
/// `spin_lock::SpinLock<FreeList, C>` in a real kernel); `C` is the CPU/
/// interrupt binding used to pick the local arena and to keep interrupts
/// disabled while the CPU id is in use.
pub struct PageAllocator<M, C> {
    arenas: [M; NCPU],
    /// `(start, end)` of the managed region, in addresses; set exactly once
    /// by [`PageAllocator::initialize`].
    bounds: OnceInit<(usize, usize)>,
    _cpu: core::marker::PhantomData<C>,
}

impl<M, C> Default for PageAllocator<M, C>
where
    M: Mutex<Data = FreeList>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M, C> PageAllocator<M, C>
where
    M: Mutex<Data = FreeList>,
{
    /// Creates an allocator with every arena empty.
    ///
    /// Call [`PageAllocator::initialize`] before the first [`alloc_page`]
    /// call; until then every allocation fails.
    ///
    /// [`alloc_page`]: PageAllocator::alloc_page
    #[must_use]
    pub fn new() -> Self {
        Self {
            arenas: core::array::from_fn(|_| M::new(FreeList(None))),
            bounds: OnceInit::new(),
            _cpu: core::marker::PhantomData,
        }
    }
}

impl<M, C> PageAllocator<M, C>
where
    M: Mutex<Data = FreeList>,
    C: Cpu,
{
    /// Seeds the allocator with every page in `[start, end)`, rounding
    /// `start` up to page alignment.
    ///
    /// All pages are seeded into arena 0 (as if a single boot-time CPU had
    /// freed them one at a time); other CPUs acquire them on demand through
    /// the ordinary steal path. Idempotent-or-panic: calling this a second
    /// time panics, matching the one-shot boot sequence the source kernel's
    /// `kinit`/`freerange` run exactly once.
    ///
    /// # Panics
    ///
    /// Panics if called more than once, or if `end` is not after the
    /// page-rounded `start`.
    pub fn initialize(&self, start: NonNull<u8>, end: NonNull<u8>) {
        let pad = start.addr().get().wrapping_neg() & (PAGE_SIZE - 1);
        let rounded_start = unsafe { start.byte_add(pad) };
        let end_addr = end.addr().get();
        assert!(
            rounded_start.addr().get() < end_addr,
            "page_alloc: empty or invalid region"
        );
        self.bounds.init((rounded_start.addr().get(), end_addr));

        let mut arena = self.arenas[0].lock();
        let mut p = rounded_start;
        let mut remaining = end_addr - rounded_start.addr().get();
        while remaining >= PAGE_SIZE {
            let mut node = p.cast::<Run>();
            unsafe {
                node.as_mut().next = arena.0;
            }
            arena.0 = Some(node);
            p = unsafe { p.byte_add(PAGE_SIZE) };
            remaining -= PAGE_SIZE;
        }
    }

    /// Returns a free page, stealing from other CPUs' arenas if the local
    /// one is empty, or `None` if every arena is empty.
    ///
    /// The returned page is filled with a distinguishing junk byte so that a
    /// dangling reference to its previous contents is easy to spot.
    pub fn alloc_page(&self) -> Option<PageAddr> {
        C::push_off();
        let cpu = C::id();

        let popped = {
            let mut local = self.arenas[cpu].lock();

            if local.0.is_none() {
                let mut budget = STEAL_BATCH;
                for victim in (0..NCPU).filter(|&v| v != cpu) {
                    if budget == 0 {
                        break;
                    }
                    let mut victim_list = self.arenas[victim].lock();
                    while budget > 0 {
                        let Some(mut page) = victim_list.0 else {
                            break;
                        };
                        victim_list.0 = unsafe { page.as_ref().next };
                        unsafe {
                            page.as_mut().next = local.0;
                        }
                        local.0 = Some(page);
                        budget -= 1;
                    }
                }
            }

            local.0.map(|mut page| {
                local.0 = unsafe { page.as_ref().next };
                page
            })
        };

        C::pop_off();

        popped.map(|page| {
            let ptr = page.cast::<u8>();
            unsafe {
                ptr.as_ptr().write_bytes(JUNK_ALLOCATED, PAGE_SIZE);
            }
            PageAddr(ptr)
        })
    }

    /// Returns `addr` to the calling CPU's local arena.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not page-aligned or does not lie within the range
    /// passed to [`PageAllocator::initialize`] — either indicates a bug in
    /// the caller, not a recoverable condition.
    pub fn free_page(&self, addr: PageAddr) {
        let (start, end) = *self.bounds.get();
        let a = addr.addr();
        assert_eq!(a % PAGE_SIZE, 0, "free_page: address not page-aligned");
        assert!(
            a >= start && a < end,
            "free_page: address outside managed region"
        );

        unsafe {
            addr.as_ptr().write_bytes(JUNK_FREED, PAGE_SIZE);
        }

        C::push_off();
        let cpu = C::id();
        let mut local = self.arenas[cpu].lock();
        let mut node = addr.0.cast::<Run>();
        unsafe {
            node.as_mut().next = local.0;
        }
        local.0 = Some(node);
        drop(local);
        C::pop_off();
    }
}

#[cfg(test)]
mod tests {
    use std::{alloc::Layout, cell::Cell, collections::HashSet};

    use spin_lock::SpinLock;

    use super::*;

    thread_local! {
        static CURRENT_CPU: Cell<usize> = const { Cell::new(0) };
    }

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

        fn push_off() {}

        fn pop_off() {}
    }

    type TestAllocator = PageAllocator<SpinLock<FreeList, MockCpu>, MockCpu>;

    /// Leaks a page-aligned region backing `pages` pages, for the lifetime
    /// of the test process; fine for a handful of short-lived unit tests.
    fn leak_region(pages: usize) -> (NonNull<u8>, NonNull<u8>) {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let start = unsafe { std::alloc::alloc(layout) };
        let start = NonNull::new(start).unwrap();
        let end = unsafe { start.add(pages * PAGE_SIZE) };
        (start, end)
    }

    #[test]
    fn alloc_and_free_round_trip() {
        MockCpu::set_current(0);
        let allocator = TestAllocator::new();
        let (start, end) = leak_region(4);
        allocator.initialize(start, end);

        let p = allocator.alloc_page().unwrap();
        assert_eq!(p.addr() % PAGE_SIZE, 0);

        unsafe {
            p.as_ptr().write_bytes(0xAB, PAGE_SIZE);
        }
        allocator.free_page(p);

        // drain the remaining pages looking for `p`'s address to come back
        // with the freed junk pattern, not the `0xAB` we wrote.
        let mut seen = false;
        let mut pages = vec![];
        while let Some(q) = allocator.alloc_page() {
            if q == p {
                seen = true;
                let byte = unsafe { *q.as_ptr() };
                assert_eq!(byte, JUNK_FREED);
            }
            pages.push(q);
        }
        assert!(seen, "freed page was never handed back out");
    }

    #[test]
    fn exhaustion_returns_none() {
        MockCpu::set_current(0);
        let allocator = TestAllocator::new();
        let (start, end) = leak_region(2);
        allocator.initialize(start, end);

        assert!(allocator.alloc_page().is_some());
        assert!(allocator.alloc_page().is_some());
        assert!(allocator.alloc_page().is_none());
    }

    #[test]
    fn no_duplicate_addresses_without_intervening_free() {
        MockCpu::set_current(0);
        let allocator = TestAllocator::new();
        let (start, end) = leak_region(50);
        allocator.initialize(start, end);

        let mut seen = HashSet::new();
        while let Some(p) = allocator.alloc_page() {
            assert!(seen.insert(p.addr()), "duplicate page address handed out");
        }
    }

    #[test]
    #[should_panic(expected = "not page-aligned")]
    fn free_unaligned_address_panics() {
        MockCpu::set_current(0);
        let allocator = TestAllocator::new();
        let (start, end) = leak_region(2);
        allocator.initialize(start, end);

        let bad = PageAddr(unsafe { NonNull::new(start.as_ptr().add(1)).unwrap() });
        allocator.free_page(bad);
    }

    #[test]
    #[should_panic(expected = "outside managed region")]
    fn free_out_of_range_address_panics() {
        MockCpu::set_current(0);
        let allocator = TestAllocator::new();
        let (start, end) = leak_region(2);
        allocator.initialize(start, end);

        let far = unsafe { start.byte_add(10 * PAGE_SIZE) };
        allocator.free_page(PageAddr(far));
    }

    #[test]
    fn steal_drains_at_most_steal_batch_from_one_victim() {
        // CPU 0 starts empty; CPU 1 owns a large pool. Draining CPU 0 once
        // should steal exactly `STEAL_BATCH` pages from CPU 1 (there being
        // only one victim, the whole shared budget comes from it).
        let allocator = TestAllocator::new();
        let (start, end) = leak_region(1000);

        MockCpu::set_current(1);
        allocator.initialize(start, end);

        MockCpu::set_current(0);
        let p = allocator.alloc_page();
        assert!(p.is_some());

        // CPU 0 should now hold STEAL_BATCH - 1 pages locally (one was
        // popped straight back out for the caller) and CPU 1 should have
        // lost exactly STEAL_BATCH pages.
        let mut cpu0_remaining = 0;
        while allocator.alloc_page().is_some() {
            cpu0_remaining += 1;
        }
        assert_eq!(cpu0_remaining, STEAL_BATCH - 1);

        MockCpu::set_current(1);
        let mut cpu1_remaining = 0;
        while allocator.alloc_page().is_some() {
            cpu1_remaining += 1;
        }
        assert_eq!(cpu1_remaining, 1000 - STEAL_BATCH);
    }
}
