//! Size policy helpers specific to the [`RawMalloc`](super::RawMalloc) allocator.

use super::MIN_BLOCK_SIZE;
use crate::header::{ALIGNMENT, HEADER_SIZE};
use crate::util::round_up;

/// Turns a caller's byte count into a total block footprint: header
/// overhead added, rounded up to the size granularity, floored at the
/// minimum block size so the block can hold the free-list links once it
/// comes back. Returns `None` when the request cannot be represented.
#[inline]
pub(super) fn request_size(n: usize) -> Option<usize> {
    let padded = n.checked_add(HEADER_SIZE)?;
    let size = round_up(padded, ALIGNMENT)?.max(MIN_BLOCK_SIZE);
    // Rust allocated objects may not exceed isize::MAX bytes.
    // https://doc.rust-lang.org/std/ptr/index.html#allocated-object
    (size as isize > 0).then_some(size)
}
