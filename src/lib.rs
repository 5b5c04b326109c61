//! A boundary-tagged, segregated-fit heap allocator.
//!
//! Blocks carry a boundary tag (`size`/`left_size`) so either physical
//! neighbor is reachable in O(1); free blocks are additionally threaded
//! onto one of `N_LISTS` segregated free lists, indexed by size, with a
//! catch-all list for anything larger than the largest exact bucket.
//! Allocation is best-fit with right-splitting; freeing coalesces
//! immediately with whichever physical neighbors are also free. The heap
//! grows on demand from the OS in fixed-size increments and stitches
//! physically adjacent growths into one logical region. A single
//! process-wide spinlock serializes the whole public surface.
//!
//! See [`allocate`], [`free`], [`zero_allocate`], [`reallocate`], and
//! [`verify`] for the malloc-style surface, or [`HeapAllocator`] to use
//! this crate as a `#[global_allocator]`.

#![cfg_attr(not(test), no_std)]

mod block;
mod chunk;
mod config;
mod engine;
mod freelist;

pub use config::{A, ARENA_SIZE, H, MAX_OS_CHUNKS, N_LISTS};

use chunk::SbrkGrower;
use core::alloc::{GlobalAlloc, Layout};
use engine::HeapState;
use spin::{Mutex, Once};

static HEAP: Once<Mutex<HeapState<SbrkGrower>>> = Once::new();

fn heap() -> &'static Mutex<HeapState<SbrkGrower>> {
    HEAP.call_once(|| Mutex::new(HeapState::new(SbrkGrower)))
}

/// Returns a payload pointer to `n` freshly allocated bytes, or null if
/// `n == 0`. Aborts the process if the OS refuses to grow the heap.
pub fn allocate(n: usize) -> *mut u8 {
    heap().lock().allocate(n)
}

/// Returns `p`, previously obtained from [`allocate`]/[`zero_allocate`]/
/// [`reallocate`], to the heap. A null `p` is a no-op; freeing an
/// already-free pointer is a double free and aborts the process.
pub fn free(p: *mut u8) {
    heap().lock().free(p)
}

/// Allocates `k * n` bytes and zero-fills them, like `calloc`.
pub fn zero_allocate(k: usize, n: usize) -> *mut u8 {
    heap().lock().zero_allocate(k, n)
}

/// Allocates `n` bytes, copies `min(n, old_size)` bytes from `p`, frees
/// `p`, and returns the new pointer. `reallocate(null, n)` behaves as
/// `allocate(n)`; `reallocate(p, 0)` behaves as `free(p)` and returns null.
pub fn reallocate(p: *mut u8, n: usize) -> *mut u8 {
    heap().lock().reallocate(p, n)
}

/// Walks every block in every known region and every free list, checking
/// the boundary-tag, free-list-link, and fencepost invariants. Intended
/// for tests, not production call sites: it is not cheap, and a failure
/// here means the heap is already corrupt.
pub fn verify() -> bool {
    heap().lock().verify()
}

/// Installs this crate's allocator as the process's `#[global_allocator]`.
/// Only `A`-byte (8-byte) alignment is guaranteed; this is a non-goal for
/// anything stronger.
pub struct HeapAllocator;

unsafe impl GlobalAlloc for HeapAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        debug_assert!(layout.align() <= config::A, "HeapAllocator only guarantees 8-byte alignment");
        allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        debug_assert!(layout.align() <= config::A, "HeapAllocator only guarantees 8-byte alignment");
        zero_allocate(1, layout.size())
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        debug_assert!(layout.align() <= config::A, "HeapAllocator only guarantees 8-byte alignment");
        reallocate(ptr, new_size)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    // These tests share one process-wide heap with every other test in
    // this crate, so they assert properties that hold regardless of what
    // else has already run, rather than exact pre/post states.

    #[test]
    fn allocate_free_round_trip_verifies() {
        let p = allocate(16);
        assert!(!p.is_null());
        assert!(verify());
        free(p);
        assert!(verify());
    }

    #[test]
    fn zero_allocate_zero_fills() {
        let p = zero_allocate(8, 4);
        assert!(!p.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(p, 32) };
        assert!(bytes.iter().all(|&b| b == 0));
        free(p);
    }

    #[test]
    fn global_alloc_layout_round_trips() {
        let layout = Layout::from_size_align(64, 8).unwrap();
        let allocator = HeapAllocator;
        unsafe {
            let p = allocator.alloc(layout);
            assert!(!p.is_null());
            core::ptr::write_bytes(p, 0x42, 64);
            allocator.dealloc(p, layout);
        }
    }

    #[test]
    fn concurrent_allocate_free_keeps_heap_consistent_s5() {
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let mut ptrs = std::vec::Vec::new();
                    for i in 0..250 {
                        let size = 8 + (i % 64);
                        let p = allocate(size);
                        assert!(!p.is_null());
                        ptrs.push(p);
                        if ptrs.len() > 4 {
                            let victim = ptrs.remove(i % ptrs.len());
                            free(victim);
                        }
                    }
                    for p in ptrs {
                        free(p);
                    }
                });
            }
        });
        assert!(verify());
    }
}
