//! The chunk manager: requests fixed-size growth increments from a raw OS
//! primitive, installs fencepost blocks at both ends, and hands the result
//! back to the allocator core for adjacency detection and stitching
//! (engine.rs owns that part, since it needs the rest of the heap state).

use crate::block::{BlockHeader, BlockState};
use crate::config;

/// The one fallible seam in this crate: the OS refusing to grow the
/// process heap. Per the error-handling design, growth failure is fatal
/// at this layer — callers of [`grow`] are expected to treat `Err` as
/// terminal, not to retry.
#[derive(Debug)]
pub struct GrowthError;

/// Abstracts "give me `size` more contiguous bytes at the end of the
/// process heap." Mirrors the shape of a chunk-provider abstraction: a
/// narrow seam an allocator core can be tested against without a real OS
/// underneath it.
///
/// # Safety
/// Implementations must return a region that does not overlap any region
/// returned by a previous call, and that stays mapped for the remaining
/// lifetime of the process (this allocator never returns memory to the OS).
pub unsafe trait ChunkProvider {
    unsafe fn grow(&mut self, size: usize) -> Result<*mut u8, GrowthError>;
}

/// Grows the process heap via `sbrk`, the primitive the source this
/// allocator is modeled on also uses.
pub struct SbrkGrower;

unsafe impl ChunkProvider for SbrkGrower {
    unsafe fn grow(&mut self, size: usize) -> Result<*mut u8, GrowthError> {
        let ptr = libc::sbrk(size as libc::intptr_t);
        if ptr as isize == -1 {
            return Err(GrowthError);
        }
        Ok(ptr as *mut u8)
    }
}

/// The three blocks carved out of a freshly grown region: left fencepost,
/// one interior free block spanning the rest, right fencepost.
pub struct NewRegion {
    pub left_fencepost: BlockHeader,
    pub interior: BlockHeader,
    pub right_fencepost: BlockHeader,
}

/// Lays fenceposts at both ends of `[ptr, ptr + size)` and an interior free
/// block in between. `left_fencepost.left_size` is left as `0`; the caller
/// patches it up if this region turns out to be stitched onto a prior one.
///
/// # Safety
/// `[ptr, ptr + size)` must be freshly obtained, unaliased memory of at
/// least `size` bytes, and `size > 2 * H`.
unsafe fn install_region(ptr: *mut u8, size: usize) -> NewRegion {
    debug_assert!(size > 2 * config::H);

    let left_fencepost = BlockHeader::from_block_ptr(ptr);
    left_fencepost.set_size_and_state(config::H, BlockState::Fencepost);
    left_fencepost.set_left_size(0);

    let interior_size = size - 2 * config::H;
    let interior = BlockHeader::from_block_ptr(ptr.add(config::H));
    interior.set_size_and_state(interior_size, BlockState::Unallocated);
    interior.set_left_size(config::H);

    let right_fencepost = BlockHeader::from_block_ptr(ptr.add(config::H + interior_size));
    right_fencepost.set_size_and_state(config::H, BlockState::Fencepost);
    right_fencepost.set_left_size(interior_size);

    NewRegion { left_fencepost, interior, right_fencepost }
}

/// Requests one growth increment of `size` bytes from `provider` and lays
/// fenceposts around it.
///
/// # Safety
/// Same obligations as [`ChunkProvider::grow`].
pub unsafe fn grow<P: ChunkProvider>(provider: &mut P, size: usize) -> Result<NewRegion, GrowthError> {
    let ptr = provider.grow(size)?;
    Ok(install_region(ptr, size))
}

/// Bounded record of independent (non-stitched) region starts, used only
/// by the verifier's region walk. Exceeding `MAX_OS_CHUNKS` does not stop
/// the allocator from growing further — it only means the verifier can no
/// longer find that region's start to walk it.
pub struct OsRegions {
    starts: [*mut u8; config::MAX_OS_CHUNKS],
    len: usize,
}

impl OsRegions {
    pub const fn new() -> Self {
        Self { starts: [core::ptr::null_mut(); config::MAX_OS_CHUNKS], len: 0 }
    }

    pub fn push(&mut self, left_fencepost: *mut u8) {
        if self.len < config::MAX_OS_CHUNKS {
            self.starts[self.len] = left_fencepost;
            self.len += 1;
        } else {
            log::warn!("MAX_OS_CHUNKS ({}) exceeded; verifier will miss this region", config::MAX_OS_CHUNKS);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = *mut u8> + '_ {
        self.starts[..self.len].iter().copied()
    }
}

// SAFETY: the raw pointers here are region starts handed out once and
// never shared mutably except through the single mutex guarding HeapState.
unsafe impl Send for OsRegions {}
