//! Tunable constants that make up the ABI between the allocator and its
//! tests, mirrored from the external interface table: `A`, `H`,
//! `ARENA_SIZE`, `N_LISTS`, `MAX_OS_CHUNKS`.

use crate::block;

/// Alignment unit. Every block size is a multiple of this.
pub const A: usize = 8;

/// `sizeof(header)`: two `usize` fields (packed size+state, and left_size).
/// Fixed at 16 bytes on a 64-bit target, matching the concrete scenarios
/// in the testable-properties section (H = 16, A = 8).
pub const H: usize = block::HEADER_SIZE;

/// Minimum size of any non-fencepost block: large enough that, when free,
/// its payload holds the two free-list links.
pub const MIN_BLOCK_SIZE: usize = 2 * H;

/// Bytes requested from the OS growth primitive per growth step. Chosen
/// large relative to typical test allocations so that a handful of calls
/// exercise split/coalesce without forcing growth, while still being
/// small enough that growth is exercised deliberately in a dedicated test.
pub const ARENA_SIZE: usize = 1 << 16;

/// Number of segregated free lists. Lists `0..N_LISTS-2` are exact-size
/// buckets in steps of `A`; list `N_LISTS-1` is the large-block catch-all.
/// List 0 is never populated: the smallest bucket width it would need
/// (payload size `A`) is smaller than `MIN_BLOCK_SIZE`'s payload of `H`.
pub const N_LISTS: usize = 59;

/// Ceiling on the number of OS regions tracked for the verifier's region
/// walk. A debug/test aid only; exceeding it does not stop the allocator
/// from growing further, only from being able to verify past this many
/// regions.
pub const MAX_OS_CHUNKS: usize = 1024;

static_assertions::const_assert!(MIN_BLOCK_SIZE >= 2 * core::mem::size_of::<usize>());
static_assertions::const_assert!(ARENA_SIZE > MIN_BLOCK_SIZE * 4);
static_assertions::const_assert_eq!(ARENA_SIZE % A, 0);
