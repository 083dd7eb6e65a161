//! [`Grower`] trait and structures that implement it.
//!
//! A grower is the allocator's window onto the OS heap-extension primitive:
//! a monotonically advancing frontier that can only move forward. The
//! chunk-management layer asks it for whole arenas and fenceposts whatever
//! comes back; anything that behaves like such a frontier (the process
//! break, a fixed test arena) can stand in.

use crate::header::HEADER_ALIGN;
use crate::util::round_up;

use core::ptr::NonNull;

use libc::{brk, sbrk};

/// Bumps a frontier up to the next address a block header may start at,
/// or `None` when the address computation would wrap. Chunks are carved
/// straight from the frontier, so whatever a grower reports must already
/// be fit to hold a fencepost.
#[inline]
pub(crate) fn align_for_headers(ptr: *mut u8) -> Option<*mut u8> {
    let aligned = round_up(ptr as usize, HEADER_ALIGN)?;
    Some(ptr.wrapping_add(aligned - ptr as usize))
}

/// Moves a frontier forward by `bytes`, or `None` when the end of the
/// address space is in the way.
#[inline]
pub(crate) fn advance(ptr: *mut u8, bytes: usize) -> Option<*mut u8> {
    (ptr as usize).checked_add(bytes)?;
    Some(ptr.wrapping_add(bytes))
}

/// A trait for types that hand out memory from an advancing frontier.
///
/// # Safety
/// * Implementors must return regions that start exactly where the previous
///   one ended whenever the frontier has not been moved by anyone else;
///   the chunk layer relies on this to detect physically contiguous chunks.
/// * The returned size must be at least the requested size and a multiple
///   of [`HEADER_ALIGN`], and the returned base must be
///   [`HEADER_ALIGN`]-aligned.
/// * Copying, cloning, or moving the grower must not invalidate pointers to
///   memory it has already handed out. This generally means that growers
///   should not own but reference their underlying storage.
pub unsafe trait Grower {
    /// Advances the frontier by at least `size` bytes.
    /// Returns the old frontier and the actual advance,
    /// or `Err(())` if the growth failed.
    ///
    /// # Safety
    /// Implementors should ensure that `grow(0)` does not advance the
    /// frontier and merely reports its current position.
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), ()>;
}

/// A grower that advances the end of the process's data segment
/// through [`libc::brk`].
#[derive(Debug)]
pub struct BrkGrower {
    heap_end: Option<NonNull<u8>>,
    min_increment: usize,
}

impl BrkGrower {
    /// Creates a grower that never moves the break by less than
    /// `min_increment` bytes at a time, batching small extensions into
    /// fewer system calls.
    #[inline(always)]
    pub const fn new(min_increment: usize) -> Self {
        BrkGrower {
            heap_end: None,
            min_increment,
        }
    }

    /// Queries `sbrk(0)` for the current break and rounds it up to header
    /// alignment; the first real `brk` swallows the rounding gap.
    ///
    /// # Safety
    /// This function assumes the grower wasn't previously initialised and
    /// that no other object manages the program break.
    unsafe fn try_init(&mut self) -> Result<(), ()> {
        debug_assert!(self.heap_end.is_none());
        let heap_end = unsafe { sbrk(0) };
        debug_assert_ne!(heap_end as isize, -1, "Calling sbrk(0) should never fail.");
        debug_assert_ne!(heap_end as usize, 0);
        let aligned = align_for_headers(heap_end.cast()).ok_or(())?;
        self.heap_end = Some(NonNull::new(aligned).ok_or(())?);
        Ok(())
    }
}

unsafe impl Grower for BrkGrower {
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), ()> {
        if self.heap_end.is_none() {
            unsafe { self.try_init()? };
        }
        let heap_end = self.heap_end.unwrap();
        if size == 0 {
            return Ok((heap_end, 0));
        }
        let size = round_up(size.max(self.min_increment), HEADER_ALIGN).ok_or(())?;
        let new_heap_end = advance(heap_end.as_ptr(), size).ok_or(())?;
        if unsafe { brk(new_heap_end.cast()) == -1 } {
            return Err(());
        }
        self.heap_end = unsafe { Some(NonNull::new_unchecked(new_heap_end)) };
        Ok((heap_end, size))
    }
}


unsafe impl<T: Grower + ?Sized> Grower for &mut T {
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), ()> {
        (*self).grow(size)
    }
}
