//! Boundary-tagged block headers.
//!
//! A block's header lives at the block's own start address and is
//! followed immediately by its payload. Rather than a C-style struct with
//! unioned fields, the header is modeled here as a thin handle
//! (`BlockHeader`) over a raw pointer, plus a snapshot enum (`BlockView`)
//! that exposes the sum-type shape described for this layout: an
//! allocated/fencepost block only ever has `size`/`left_size`/`state`, an
//! unallocated one additionally has free-list `prev`/`next`, which share
//! storage with the start of the payload. All unsafe reads and writes of
//! block memory are confined to this module.

use core::ptr::NonNull;

/// Two words: a packed size+state tag, and the physical left neighbor's
/// size. Always 16 bytes on a 64-bit target.
#[repr(C)]
struct RawHeader {
    size_and_state: usize,
    left_size: usize,
}

pub const HEADER_SIZE: usize = core::mem::size_of::<RawHeader>();

const STATE_BITS: u32 = 3;
const STATE_MASK: usize = (1 << STATE_BITS) - 1;

/// Free-list links. While a block is `UNALLOCATED`, these overlay the
/// first `2 * size_of::<*mut u8>()` bytes of its payload. The same layout
/// also backs the free-list sentinels in `freelist`, so list traversal
/// never needs to distinguish "real block" from "sentinel" by type, only
/// by comparing addresses against the known sentinel addresses.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct FreeLinks {
    pub prev: *mut u8,
    pub next: *mut u8,
}

static_assertions::const_assert_eq!(core::mem::size_of::<FreeLinks>(), 2 * core::mem::size_of::<usize>());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum BlockState {
    Unallocated = 0,
    Allocated = 1,
    Fencepost = 2,
}

impl BlockState {
    fn from_tag(tag: usize) -> Self {
        match tag {
            0 => BlockState::Unallocated,
            1 => BlockState::Allocated,
            2 => BlockState::Fencepost,
            other => unreachable!("corrupt block state tag {other}"),
        }
    }
}

/// A snapshot of a block's fields, shaped as the state-dependent sum type
/// described for this layout. Taking a view never mutates anything;
/// `BlockHeader`'s setters are the only way to change a block.
#[derive(Debug, Clone, Copy)]
pub enum BlockView {
    Allocated { size: usize, left_size: usize },
    Unallocated { size: usize, left_size: usize, prev: *mut u8, next: *mut u8 },
    Fencepost { left_size: usize },
}

/// A handle to a block's header, addressed by the block's own start
/// (not its payload). Cheap to copy; all methods read or write through
/// the pointer, so aliasing two `BlockHeader`s over the same block is as
/// unsafe as aliasing two `&mut` references would be.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader(NonNull<u8>);

impl BlockHeader {
    /// # Safety
    /// `ptr` must point to the start of a live block (header address, not
    /// payload address) within a region this allocator manages.
    pub unsafe fn from_block_ptr(ptr: *mut u8) -> Self {
        debug_assert!(!ptr.is_null());
        BlockHeader(NonNull::new_unchecked(ptr))
    }

    /// # Safety
    /// `ptr` must be a payload pointer previously handed out by this
    /// allocator (i.e. `ptr - HEADER_SIZE` is a live block header).
    pub unsafe fn from_payload_ptr(ptr: *mut u8) -> Self {
        Self::from_block_ptr(ptr.sub(HEADER_SIZE))
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn payload_ptr(self) -> *mut u8 {
        unsafe { self.as_ptr().add(HEADER_SIZE) }
    }

    // `'static` is sound here because heap memory, once grown into, is never
    // unmapped or returned to the OS (see chunk::grow) — it outlives every
    // borrow a caller could construct from a `BlockHeader`.
    fn raw(self) -> &'static RawHeader {
        unsafe { &*(self.as_ptr() as *const RawHeader) }
    }

    fn raw_mut(self) -> &'static mut RawHeader {
        unsafe { &mut *(self.as_ptr() as *mut RawHeader) }
    }

    pub fn size(self) -> usize {
        self.raw().size_and_state & !STATE_MASK
    }

    /// Payload capacity: total size minus the header.
    pub fn payload_size(self) -> usize {
        self.size() - HEADER_SIZE
    }

    pub fn state(self) -> BlockState {
        BlockState::from_tag(self.raw().size_and_state & STATE_MASK)
    }

    pub fn left_size(self) -> usize {
        self.raw().left_size
    }

    pub fn set_left_size(self, left_size: usize) {
        self.raw_mut().left_size = left_size;
    }

    pub fn set_size_and_state(self, size: usize, state: BlockState) {
        debug_assert_eq!(size & STATE_MASK, 0, "block size must be a multiple of the alignment unit");
        self.raw_mut().size_and_state = size | (state as usize);
    }

    pub fn set_state(self, state: BlockState) {
        self.set_size_and_state(self.size(), state);
    }

    /// The block physically to the right, reached in O(1) via `size`.
    ///
    /// # Safety
    /// `self` must not be the rightmost block of its region (callers stop
    /// at fenceposts, which are never traversed past).
    pub unsafe fn right(self) -> BlockHeader {
        Self::from_block_ptr(self.as_ptr().add(self.size()))
    }

    /// The block physically to the left, reached in O(1) via `left_size`.
    ///
    /// # Safety
    /// `self` must not be the leftmost block of its region.
    pub unsafe fn left(self) -> BlockHeader {
        Self::from_block_ptr(self.as_ptr().sub(self.left_size()))
    }

    fn links(self) -> &'static FreeLinks {
        debug_assert_eq!(self.state(), BlockState::Unallocated);
        unsafe { &*(self.payload_ptr() as *const FreeLinks) }
    }

    fn links_mut(self) -> &'static mut FreeLinks {
        debug_assert_eq!(self.state(), BlockState::Unallocated);
        unsafe { &mut *(self.payload_ptr() as *mut FreeLinks) }
    }

    /// # Safety
    /// Only meaningful while `self.state() == Unallocated`.
    pub unsafe fn free_next(self) -> *mut u8 {
        self.links().next
    }

    /// # Safety
    /// Only meaningful while `self.state() == Unallocated`.
    pub unsafe fn free_prev(self) -> *mut u8 {
        self.links().prev
    }

    /// # Safety
    /// Only meaningful while `self.state() == Unallocated`.
    pub unsafe fn set_free_next(self, next: *mut u8) {
        self.links_mut().next = next;
    }

    /// # Safety
    /// Only meaningful while `self.state() == Unallocated`.
    pub unsafe fn set_free_prev(self, prev: *mut u8) {
        self.links_mut().prev = prev;
    }

    pub fn view(self) -> BlockView {
        match self.state() {
            BlockState::Fencepost => BlockView::Fencepost { left_size: self.left_size() },
            BlockState::Allocated => BlockView::Allocated { size: self.size(), left_size: self.left_size() },
            BlockState::Unallocated => BlockView::Unallocated {
                size: self.size(),
                left_size: self.left_size(),
                prev: unsafe { self.free_prev() },
                next: unsafe { self.free_next() },
            },
        }
    }
}

impl core::fmt::Debug for BlockHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockHeader")
            .field("addr", &self.as_ptr())
            .field("view", &self.view())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    // Header fields are read/written as `usize`s, so fake block memory
    // needs `usize` alignment, not the bare `u8` alignment a plain array
    // buffer would give it.
    fn aligned_buf64() -> aligned::Aligned<aligned::A8, [u8; 64]> {
        aligned::Aligned([0u8; 64])
    }

    fn aligned_buf128() -> aligned::Aligned<aligned::A8, [u8; 128]> {
        aligned::Aligned([0u8; 128])
    }

    fn make_block(buf: &mut [u8]) -> BlockHeader {
        assert!(buf.len() >= 64);
        unsafe { BlockHeader::from_block_ptr(buf.as_mut_ptr()) }
    }

    #[test]
    fn size_and_state_are_independent() {
        let mut buf = aligned_buf64();
        let b = make_block(&mut *buf);
        b.set_size_and_state(32, BlockState::Allocated);
        assert_eq!(b.size(), 32);
        assert_eq!(b.state(), BlockState::Allocated);
        b.set_state(BlockState::Unallocated);
        assert_eq!(b.size(), 32, "changing state must not disturb size");
        assert_eq!(b.state(), BlockState::Unallocated);
    }

    #[test]
    fn left_size_round_trips() {
        let mut buf = aligned_buf64();
        let b = make_block(&mut *buf);
        b.set_size_and_state(40, BlockState::Fencepost);
        b.set_left_size(24);
        assert_eq!(b.left_size(), 24);
        assert_eq!(b.size(), 40);
    }

    #[test]
    fn free_links_overlay_payload() {
        let mut buf = aligned_buf64();
        let b = make_block(&mut *buf);
        b.set_size_and_state(32, BlockState::Unallocated);
        let sentinel = 0x1234usize as *mut u8;
        unsafe {
            b.set_free_prev(sentinel);
            b.set_free_next(sentinel);
            assert_eq!(b.free_prev(), sentinel);
            assert_eq!(b.free_next(), sentinel);
        }
    }

    #[test]
    fn right_and_left_are_inverses() {
        let mut buf = aligned_buf128();
        let base = (*buf).as_mut_ptr();
        let left = unsafe { BlockHeader::from_block_ptr(base) };
        left.set_size_and_state(32, BlockState::Allocated);
        left.set_left_size(0);
        let right = unsafe { BlockHeader::from_block_ptr(base.add(32)) };
        right.set_size_and_state(32, BlockState::Allocated);
        right.set_left_size(32);

        unsafe {
            assert_eq!(left.right(), right);
            assert_eq!(right.left(), left);
        }
    }
}
