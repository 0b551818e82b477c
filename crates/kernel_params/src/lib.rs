//! Tunable constants shared by the buffer cache and the physical page allocator.
#![no_std]

/// Number of buffer-cache slots.
pub const NBUF: usize = 30;

/// Number of hash buckets the buffer cache shards its slots across.
///
/// Must be odd so that `hash(dev, blockno) % NBUCKETS` spreads sequential
/// block numbers across buckets reasonably evenly.
pub const NBUCKETS: usize = 13;

/// Size, in bytes, of a single cached disk block.
pub const BLOCK_SIZE: usize = 1024;

/// Size, in bytes, of a single physical page.
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of pages moved from a single victim CPU's free list, and the
/// total budget shared across all victims visited during one steal.
pub const STEAL_BATCH: usize = 64;

/// Number of CPUs the kernel is built for.
pub const NCPU: usize = 8;
