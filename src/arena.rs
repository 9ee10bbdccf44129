//! A monotonic allocator for memtable entries.
//!
//! The arena hands out byte regions that stay pinned for its whole lifetime
//! and frees everything at once on drop.  There is no per-object reclamation:
//! the memtable's lifetime is the reclamation granularity, and readers hold
//! raw pointers into these regions with no further bookkeeping.

use std::sync::atomic::{AtomicUsize, Ordering};

use biometrics::Counter;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static NEW_BLOCK: Counter = Counter::new("memlog.arena.new_block");

/// Register the biometrics for the arena.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&NEW_BLOCK);
}

///////////////////////////////////////////// Constants ////////////////////////////////////////////

const BLOCK_SIZE: usize = 4096;

/////////////////////////////////////////////// Arena //////////////////////////////////////////////

/// A bump allocator over 4KiB blocks.
///
/// Allocations never move and are never individually freed.  Requests larger
/// than a quarter block get a dedicated block so the tail of the current
/// block stays usable for small allocations.
pub struct Arena {
    alloc_ptr: *mut u8,
    alloc_remaining: usize,
    // Blocks are word-backed so a fresh block satisfies allocate_aligned's
    // guarantee no matter what the global allocator does for byte buffers.
    blocks: Vec<Box<[u64]>>,
    memory_usage: AtomicUsize,
}

// SAFETY: alloc_ptr points into a block owned by blocks, so sending the
// arena moves ownership of everything the pointer can reach.
unsafe impl Send for Arena {}

impl Arena {
    /// Create an empty arena.  The first allocation pulls in the first block.
    pub fn new() -> Self {
        Self {
            alloc_ptr: std::ptr::null_mut(),
            alloc_remaining: 0,
            blocks: Vec::new(),
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Allocate exactly `bytes` bytes with no alignment guarantee.
    ///
    /// # Panics
    ///
    /// Will panic if `bytes` is zero.
    pub fn allocate(&mut self, bytes: usize) -> &mut [u8] {
        assert!(bytes > 0);
        if bytes <= self.alloc_remaining {
            let result = self.alloc_ptr;
            // SAFETY: the current block has alloc_remaining bytes at
            // alloc_ptr, and those bytes have never been handed out.
            unsafe {
                self.alloc_ptr = self.alloc_ptr.add(bytes);
                self.alloc_remaining -= bytes;
                std::slice::from_raw_parts_mut(result, bytes)
            }
        } else {
            self.allocate_fallback(bytes)
        }
    }

    /// Allocate exactly `bytes` bytes aligned to the pointer width (at least
    /// eight).
    ///
    /// # Panics
    ///
    /// Will panic if `bytes` is zero.
    pub fn allocate_aligned(&mut self, bytes: usize) -> &mut [u8] {
        assert!(bytes > 0);
        const ALIGN: usize = if std::mem::size_of::<usize>() > 8 {
            std::mem::size_of::<usize>()
        } else {
            8
        };
        let current_mod = self.alloc_ptr as usize & (ALIGN - 1);
        let slop = if current_mod == 0 { 0 } else { ALIGN - current_mod };
        let needed = bytes + slop;
        if needed <= self.alloc_remaining {
            // SAFETY: slop + bytes fit in the current block's remainder.
            unsafe {
                let result = self.alloc_ptr.add(slop);
                self.alloc_ptr = self.alloc_ptr.add(needed);
                self.alloc_remaining -= needed;
                debug_assert_eq!(0, result as usize & (ALIGN - 1));
                std::slice::from_raw_parts_mut(result, bytes)
            }
        } else {
            // Fallback blocks are word-backed and therefore aligned.
            let result = self.allocate_fallback(bytes);
            debug_assert_eq!(0, result.as_ptr() as usize & (ALIGN - 1));
            result
        }
    }

    /// An estimate of the memory held by the arena.  Counts whole blocks
    /// plus a bookkeeping word apiece, so it only ever grows.
    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }

    fn allocate_fallback(&mut self, bytes: usize) -> &mut [u8] {
        if bytes > BLOCK_SIZE / 4 {
            // Dedicated block; the current block's remainder stays usable.
            let result = self.allocate_new_block(bytes);
            // SAFETY: the block was just allocated and holds at least bytes.
            return unsafe { std::slice::from_raw_parts_mut(result, bytes) };
        }
        self.alloc_ptr = self.allocate_new_block(BLOCK_SIZE);
        self.alloc_remaining = BLOCK_SIZE;
        let result = self.alloc_ptr;
        // SAFETY: a standard block always covers a request this small.
        unsafe {
            self.alloc_ptr = self.alloc_ptr.add(bytes);
            self.alloc_remaining -= bytes;
            std::slice::from_raw_parts_mut(result, bytes)
        }
    }

    fn allocate_new_block(&mut self, block_bytes: usize) -> *mut u8 {
        NEW_BLOCK.click();
        let words = block_bytes.div_ceil(std::mem::size_of::<u64>());
        let mut block = vec![0u64; words].into_boxed_slice();
        let result = block.as_mut_ptr() as *mut u8;
        self.blocks.push(block);
        self.memory_usage.fetch_add(
            block_bytes + std::mem::size_of::<usize>(),
            Ordering::Relaxed,
        );
        result
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use guacamole::{FromGuacamole, Guacamole};

    use super::*;

    const PTR_SIZE: usize = std::mem::size_of::<usize>();

    #[test]
    fn empty() {
        let arena = Arena::new();
        assert_eq!(0, arena.memory_usage());
    }

    #[test]
    fn small_allocations_share_a_block() {
        let mut arena = Arena::new();
        let first = arena.allocate(100).as_ptr() as usize;
        assert_eq!(BLOCK_SIZE + PTR_SIZE, arena.memory_usage());
        let second = arena.allocate(100).as_ptr() as usize;
        assert_eq!(first + 100, second);
        assert_eq!(BLOCK_SIZE + PTR_SIZE, arena.memory_usage());
    }

    #[test]
    fn oversize_preserves_the_current_block() {
        let mut arena = Arena::new();
        let first = arena.allocate(100).as_ptr() as usize;
        let big = arena.allocate(BLOCK_SIZE / 4 + 1);
        assert_eq!(BLOCK_SIZE / 4 + 1, big.len());
        assert_eq!(
            BLOCK_SIZE + PTR_SIZE + BLOCK_SIZE / 4 + 1 + PTR_SIZE,
            arena.memory_usage()
        );
        // The remainder of the first block serves the next small request.
        let third = arena.allocate(100).as_ptr() as usize;
        assert_eq!(first + 100, third);
    }

    #[test]
    fn exhausted_block_is_replaced() {
        let mut arena = Arena::new();
        // Four 1000-byte allocations leave 96 bytes; the fifth cannot fit
        // and is not big enough for a dedicated block, so the remainder is
        // wasted and a fresh standard block takes over.
        let mut last = 0;
        for i in 0..4 {
            let ptr = arena.allocate(1000).as_ptr() as usize;
            if i > 0 {
                assert_eq!(last + 1000, ptr);
            }
            last = ptr;
        }
        assert_eq!(BLOCK_SIZE + PTR_SIZE, arena.memory_usage());
        let fifth = arena.allocate(1000).as_ptr() as usize;
        assert_ne!(last + 1000, fifth);
        assert_eq!(2 * (BLOCK_SIZE + PTR_SIZE), arena.memory_usage());
    }

    #[test]
    fn allocations_fill_exactly() {
        let mut arena = Arena::new();
        let region = arena.allocate(BLOCK_SIZE);
        assert_eq!(BLOCK_SIZE, region.len());
        region.fill(0xa5);
        assert!(region.iter().all(|b| *b == 0xa5));
    }

    #[test]
    #[should_panic]
    fn zero_byte_allocations_are_forbidden() {
        let mut arena = Arena::new();
        arena.allocate(0);
    }

    #[test]
    fn aligned() {
        const ALIGN: usize = if PTR_SIZE > 8 { PTR_SIZE } else { 8 };
        let mut arena = Arena::new();
        for sz in [1usize, 2, 3, 7, 8, 9, 13, 63, 64, 65, 1025, 4097] {
            arena.allocate(sz % 5 + 1);
            let aligned = arena.allocate_aligned(sz);
            assert_eq!(0, aligned.as_ptr() as usize & (ALIGN - 1));
            assert_eq!(sz, aligned.len());
        }
    }

    #[test]
    fn guacamole6274736828353173538() {
        let mut guac = Guacamole::new(6274736828353173538);
        let mut arena = Arena::new();
        let mut last_usage = 0;
        let mut regions: Vec<(usize, usize)> = Vec::new();
        for _ in 0..10_000 {
            let sz = u16::from_guacamole(&mut (), &mut guac) as usize % 6000 + 1;
            let region = if u8::from_guacamole(&mut (), &mut guac) % 2 == 0 {
                arena.allocate(sz)
            } else {
                arena.allocate_aligned(sz)
            };
            let start = region.as_ptr() as usize;
            regions.push((start, sz));
            let usage = arena.memory_usage();
            assert!(usage >= last_usage);
            last_usage = usage;
        }
        // No two regions overlap.
        regions.sort();
        for w in regions.windows(2) {
            assert!(w[0].0 + w[0].1 <= w[1].0);
        }
    }
}
