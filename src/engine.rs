//! The allocator core: size normalization, best-fit search with
//! split-on-allocate, four-way coalesce-on-free, heap growth with
//! cross-chunk stitching, and the `verify()` invariant walk. Everything
//! here assumes it runs under the single process-wide mutex that
//! `HeapAllocator` in `lib.rs` provides; none of it is safe to call
//! concurrently on its own.

use crate::block::{BlockHeader, BlockState};
use crate::chunk::{self, ChunkProvider, SbrkGrower};
use crate::config;
use crate::freelist::FreeLists;

/// Normalizes a raw byte request to the smallest block size `s` such that
/// `s >= n + H`, `s >= 2*H`, and `s` is a multiple of `A`.
pub fn normalize_size(n: usize) -> usize {
    let with_header = n.saturating_add(config::H);
    let floor = with_header.max(config::MIN_BLOCK_SIZE);
    (floor + config::A - 1) / config::A * config::A
}

fn write_diagnostic(msg: &[u8]) {
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
    }
}

/// Process-wide allocator state: the segregated free lists, the right
/// fencepost of the most recently grown region (for adjacency detection),
/// the bounded debug region list, and the OS growth primitive itself.
/// Generic over the growth primitive so tests can swap in an in-memory
/// fake instead of real `sbrk`.
pub struct HeapState<P: ChunkProvider = SbrkGrower> {
    free_lists: FreeLists,
    last_fencepost: Option<BlockHeader>,
    regions: chunk::OsRegions,
    provider: P,
}

// SAFETY: every raw pointer reachable from `HeapState` addresses heap
// memory this allocator owns exclusively while the enclosing mutex is
// held; nothing here is aliased outside that lock.
unsafe impl<P: ChunkProvider + Send> Send for HeapState<P> {}

impl<P: ChunkProvider> HeapState<P> {
    /// Initializes sentinels, then grows one initial region — the process
    /// init sequence: mutex construction happens one layer up, in `lib.rs`.
    pub fn new(provider: P) -> Self {
        let mut free_lists = FreeLists::new();
        free_lists.init();
        let mut state = HeapState { free_lists, last_fencepost: None, regions: chunk::OsRegions::new(), provider };
        state.grow_once();
        state
    }

    fn fatal_growth_failure(&self) -> ! {
        write_diagnostic(b"heap: OS growth primitive refused to extend the heap, aborting\n");
        unsafe { libc::abort() }
    }

    fn grow_once(&mut self) {
        let region = match unsafe { chunk::grow(&mut self.provider, config::ARENA_SIZE) } {
            Ok(region) => region,
            Err(_) => self.fatal_growth_failure(),
        };
        log::debug!("grew heap by {} bytes at {:?}", config::ARENA_SIZE, region.left_fencepost.as_ptr());
        self.absorb_region(region);
    }

    fn absorb_region(&mut self, region: chunk::NewRegion) {
        let chunk::NewRegion { left_fencepost, interior, right_fencepost } = region;

        let adjacent = match self.last_fencepost {
            Some(old_fp) => unsafe { old_fp.right() } == left_fencepost,
            None => false,
        };

        if !adjacent {
            self.regions.push(left_fencepost.as_ptr());
            unsafe { self.free_lists.insert_by_size(interior) };
            self.last_fencepost = Some(right_fencepost);
            return;
        }

        log::trace!("new region is adjacent to the previous one, stitching");
        let old_fp = self.last_fencepost.expect("adjacent implies a prior fencepost");
        let left_of_old_fp = unsafe { old_fp.left() };

        match left_of_old_fp.state() {
            BlockState::Unallocated => {
                let old_index = FreeLists::index_for_size(left_of_old_fp.size());
                let new_size = left_of_old_fp.size() + 2 * config::H + interior.size();
                left_of_old_fp.set_size_and_state(new_size, BlockState::Unallocated);
                unsafe {
                    self.free_lists.rehome(left_of_old_fp, old_index);
                    right_fencepost.set_left_size(new_size);
                }
            }
            _ => {
                // The block left of the old fencepost was ALLOCATED: the
                // two fenceposts plus the new interior block become one
                // new free block spanning the whole gap.
                let new_size = 2 * config::H + interior.size();
                let merged = unsafe { BlockHeader::from_block_ptr(old_fp.as_ptr()) };
                merged.set_size_and_state(new_size, BlockState::Unallocated);
                merged.set_left_size(left_of_old_fp.size());
                unsafe {
                    self.free_lists.insert_by_size(merged);
                    right_fencepost.set_left_size(new_size);
                }
            }
        }

        self.last_fencepost = Some(right_fencepost);
    }

    fn find_fit(&self, s: usize) -> Option<BlockHeader> {
        let i0 = FreeLists::index_for_size(s);
        for i in i0..config::N_LISTS - 1 {
            if let Some(b) = self.free_lists.head(i) {
                return Some(b);
            }
        }
        self.free_lists.find_first_fit(config::N_LISTS - 1, s)
    }

    /// Unlinks `block` (whole-size `B`) and, per the split policy, either
    /// marks it wholly ALLOCATED or splits it from the right: the left
    /// remainder keeps `block`'s address, the right remainder (size `s`)
    /// is marked ALLOCATED and returned.
    fn take_block(&mut self, block: BlockHeader, s: usize) -> BlockHeader {
        let old_index = FreeLists::index_for_size(block.size());
        let b_size = block.size();

        if b_size - s < config::MIN_BLOCK_SIZE {
            log::trace!("taking block {:?} whole for size {}", block, s);
            unsafe { self.free_lists.unlink(block) };
            block.set_state(BlockState::Allocated);
            return block;
        }

        let remainder_size = b_size - s;
        log::trace!("splitting block {:?} into remainder {} + allocated {}", block, remainder_size, s);
        block.set_size_and_state(remainder_size, BlockState::Unallocated);
        unsafe { self.free_lists.rehome(block, old_index) };

        let right = unsafe { BlockHeader::from_block_ptr(block.as_ptr().add(remainder_size)) };
        right.set_size_and_state(s, BlockState::Allocated);
        right.set_left_size(remainder_size);
        unsafe { right.right().set_left_size(s) };
        right
    }

    pub fn allocate(&mut self, n: usize) -> *mut u8 {
        if n == 0 {
            return core::ptr::null_mut();
        }
        let s = normalize_size(n);
        loop {
            if let Some(block) = self.find_fit(s) {
                return self.take_block(block, s).payload_ptr();
            }
            self.grow_once();
        }
    }

    pub fn free(&mut self, p: *mut u8) {
        if p.is_null() {
            return;
        }
        let block = unsafe { BlockHeader::from_payload_ptr(p) };
        if block.state() == BlockState::Unallocated {
            write_diagnostic(b"heap: double free detected, aborting\n");
            unsafe { libc::abort() };
        }
        block.set_state(BlockState::Unallocated);

        let left = unsafe { block.left() };
        let right = unsafe { block.right() };
        let left_free = left.state() == BlockState::Unallocated;
        let right_free = right.state() == BlockState::Unallocated;

        match (left_free, right_free) {
            (false, false) => {
                log::trace!("freeing block {:?} with no free neighbors", block);
                unsafe { self.free_lists.insert_by_size(block) }
            }

            (true, false) => {
                log::debug!("coalescing block {:?} into left neighbor {:?}", block, left);
                let old_index = FreeLists::index_for_size(left.size());
                let new_size = left.size() + block.size();
                left.set_size_and_state(new_size, BlockState::Unallocated);
                unsafe {
                    left.right().set_left_size(new_size);
                    self.free_lists.rehome(left, old_index);
                }
            }

            (false, true) => {
                log::debug!("coalescing block {:?} with right neighbor {:?}", block, right);
                let right_index = FreeLists::index_for_size(right.size());
                let new_size = block.size() + right.size();
                block.set_size_and_state(new_size, BlockState::Unallocated);
                unsafe { block.right().set_left_size(new_size) };

                let new_index = FreeLists::index_for_size(new_size);
                if new_index == right_index {
                    unsafe { self.free_lists.splice_replace(right, block) };
                } else {
                    unsafe {
                        self.free_lists.unlink(right);
                        self.free_lists.insert(new_index, block);
                    }
                }
            }

            (true, true) => {
                log::debug!("coalescing block {:?} with both neighbors {:?} and {:?}", block, left, right);
                unsafe { self.free_lists.unlink(right) };
                let old_index = FreeLists::index_for_size(left.size());
                let new_size = left.size() + block.size() + right.size();
                left.set_size_and_state(new_size, BlockState::Unallocated);
                unsafe {
                    left.right().set_left_size(new_size);
                    self.free_lists.rehome(left, old_index);
                }
            }
        }
    }

    pub fn zero_allocate(&mut self, k: usize, n: usize) -> *mut u8 {
        let total = k.checked_mul(n).unwrap_or(0);
        let p = self.allocate(total);
        if !p.is_null() {
            unsafe { core::ptr::write_bytes(p, 0, total) };
        }
        p
    }

    pub fn reallocate(&mut self, p: *mut u8, n: usize) -> *mut u8 {
        if p.is_null() {
            return self.allocate(n);
        }
        if n == 0 {
            self.free(p);
            return core::ptr::null_mut();
        }

        let old_block = unsafe { BlockHeader::from_payload_ptr(p) };
        let old_payload_size = old_block.payload_size();

        let new_p = self.allocate(n);
        if new_p.is_null() {
            return new_p;
        }

        let copy_len = n.min(old_payload_size);
        unsafe { core::ptr::copy_nonoverlapping(p, new_p, copy_len) };
        self.free(p);
        new_p
    }

    pub fn verify(&self) -> bool {
        self.verify_regions() && self.verify_free_lists()
    }

    fn verify_regions(&self) -> bool {
        for region_start in self.regions.iter() {
            let left_fp = unsafe { BlockHeader::from_block_ptr(region_start) };
            if left_fp.state() != BlockState::Fencepost {
                log::error!("region start {:?} is not a fencepost", region_start);
                return false;
            }

            let mut cur = left_fp;
            loop {
                let next = unsafe { cur.right() };

                if next.left_size() != cur.size() {
                    log::error!("boundary tag mismatch: {:?} vs {:?}", cur, next);
                    return false;
                }
                if cur.state() == BlockState::Unallocated && next.state() == BlockState::Unallocated {
                    log::error!("adjacent free blocks: {:?} and {:?}", cur, next);
                    return false;
                }
                if cur.state() == BlockState::Unallocated {
                    let idx = FreeLists::index_for_size(cur.size());
                    if !self.free_lists.contains(idx, cur) {
                        log::error!("free block {:?} unreachable from its free list", cur);
                        return false;
                    }
                }

                if next.state() == BlockState::Fencepost {
                    break;
                }
                cur = next;
            }
        }
        true
    }

    fn verify_free_lists(&self) -> bool {
        for i in 0..config::N_LISTS - 1 {
            for b in self.free_lists.iter(i) {
                if b.state() != BlockState::Unallocated {
                    log::error!("non-free block {:?} found on free list {}", b, i);
                    return false;
                }
                if b.payload_size() != (i + 1) * config::A {
                    log::error!("block {:?} on exact list {} has wrong payload size", b, i);
                    return false;
                }
            }
        }
        for i in 0..config::N_LISTS {
            if !self.free_lists.links_consistent(i) {
                log::error!("inconsistent prev/next links in free list {}", i);
                return false;
            }
            if !self.free_lists.acyclic(i) {
                log::error!("cycle detected in free list {}", i);
                return false;
            }
        }
        true
    }
}


#[cfg(test)]
mod test {
    use super::test_support::TestProvider;
    use super::*;
    use pretty_assertions::assert_eq;
    use test_log::test;

    fn small_heap() -> HeapState<TestProvider> {
        HeapState::new(TestProvider::new(config::ARENA_SIZE * 8))
    }

    #[test]
    fn normalize_size_matches_scenario_s1() {
        assert_eq!(normalize_size(1), 32);
        assert_eq!(normalize_size(8), 32);
    }

    #[test]
    fn allocate_zero_returns_null() {
        let mut heap = small_heap();
        assert!(heap.allocate(0).is_null());
        assert!(heap.verify());
    }

    #[test]
    fn allocate_then_free_restores_verify() {
        let mut heap = small_heap();
        assert!(heap.verify());
        let p = heap.allocate(1);
        assert!(!p.is_null());
        unsafe {
            let header = BlockHeader::from_payload_ptr(p);
            assert_eq!(header.size(), 32);
        }
        assert!(heap.verify());
        heap.free(p);
        assert!(heap.verify());
    }

    #[test]
    fn three_allocations_coalesce_on_free_s2() {
        let mut heap = small_heap();
        let a = heap.allocate(8);
        let b = heap.allocate(8);
        let c = heap.allocate(8);
        assert!(heap.verify());

        // Freeing the middle block inserts a lone size-32 free block.
        heap.free(b);
        assert!(heap.verify());
        let idx = FreeLists::index_for_size(32);
        assert!(heap.free_lists.contains(idx, unsafe { BlockHeader::from_payload_ptr(b) }));

        // Freeing an outer block now coalesces with the middle remnant.
        heap.free(a);
        assert!(heap.verify());
        let merged = unsafe { BlockHeader::from_payload_ptr(a) };
        assert_eq!(merged.size(), 64);

        heap.free(c);
        assert!(heap.verify());
    }

    #[test]
    fn double_free_is_detected_before_abort() {
        let mut heap = small_heap();
        let p = heap.allocate(8);
        let header = unsafe { BlockHeader::from_payload_ptr(p) };
        heap.free(p);
        assert_eq!(header.state(), BlockState::Unallocated);
        // A real second `heap.free(p)` call here aborts the process (S4);
        // exercising that would tear down the test harness, so only the
        // detectable precondition is asserted.
    }

    #[test]
    fn growth_beyond_one_region_keeps_verify_true() {
        let mut heap = small_heap();
        let half = config::ARENA_SIZE / 2;
        let p1 = heap.allocate(half);
        assert!(!p1.is_null());
        let p2 = heap.allocate(half);
        assert!(!p2.is_null(), "second half-arena allocation should force growth");
        assert!(heap.verify());
    }

    #[test]
    fn reallocate_grow_preserves_old_contents_s6() {
        let mut heap = small_heap();
        let p = heap.allocate(8);
        unsafe { core::ptr::write_bytes(p, 0xAB, 8) };
        let grown = heap.reallocate(p, 64);
        assert!(!grown.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(grown, 8) };
        assert_eq!(bytes, &[0xABu8; 8]);
        assert!(heap.verify());
    }

    #[test]
    fn reallocate_null_is_allocate() {
        let mut heap = small_heap();
        let p = heap.reallocate(core::ptr::null_mut(), 8);
        assert!(!p.is_null());
        assert!(heap.verify());
    }

    #[test]
    fn reallocate_zero_is_free() {
        let mut heap = small_heap();
        let p = heap.allocate(8);
        let result = heap.reallocate(p, 0);
        assert!(result.is_null());
        assert!(heap.verify());
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn normalize_size_is_well_formed(n in 0..config::ARENA_SIZE) {
            let s = normalize_size(n);
            prop_assert_eq!(s % config::A, 0, "normalized size must be a multiple of A");
            prop_assert!(s >= config::MIN_BLOCK_SIZE, "normalized size must fit the free-list links");
            prop_assert!(s >= n + config::H, "normalized size must have room for the request plus a header");
        }

        #[test]
        fn normalize_size_is_monotonic(a in 0..config::ARENA_SIZE, b in 0..config::ARENA_SIZE) {
            prop_assume!(a <= b);
            prop_assert!(normalize_size(a) <= normalize_size(b));
        }

        #[test]
        fn normalize_size_is_idempotent_on_its_own_output(n in 0..config::ARENA_SIZE) {
            let s = normalize_size(n);
            // s already has room for a header of s - H payload bytes, so
            // re-normalizing a request for that much payload is a no-op.
            prop_assert_eq!(normalize_size(s - config::H), s);
        }
    }
}
