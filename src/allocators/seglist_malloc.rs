//! A multithreaded memory allocator.

use crate::allocators::RawMalloc;
use crate::diagnostics::{Corruption, HeapStats};
use crate::growers::Grower;

use core::alloc::{GlobalAlloc, Layout};
use std::io::{self, Write};
use std::sync::Mutex;

/// A multithreaded memory allocator.
///
/// This allocator is a `Mutex` wrapper over [`RawMalloc`]: every public
/// operation holds the lock for its full duration, heap growth included,
/// so the linearisation order of allocation events is the order of lock
/// acquisition.
#[repr(C)]
pub struct SeglistMalloc<T: Grower> {
    inner: Mutex<RawMalloc<T>>,
}

impl<T: Grower> SeglistMalloc<T> {
    /// # Safety
    /// Callers must make sure that the provided grower will be the only
    /// object managing its underlying memory for the lifetime of the
    /// returned allocator, and that the allocator is not moved after its
    /// first operation.
    pub const unsafe fn with_grower(grower: T) -> Self {
        SeglistMalloc {
            inner: Mutex::new(RawMalloc::with_grower(grower)),
        }
    }

    /// Like [`with_grower`](SeglistMalloc::with_grower), with heap
    /// extensions rounded up to a multiple of `arena_size` bytes.
    ///
    /// # Safety
    /// Same as [`with_grower`](SeglistMalloc::with_grower).
    pub const unsafe fn with_grower_and_arena(grower: T, arena_size: usize) -> Self {
        SeglistMalloc {
            inner: Mutex::new(RawMalloc::with_grower_and_arena(grower, arena_size)),
        }
    }

    /// See [`RawMalloc::allocate`].
    pub fn allocate(&self, n: usize) -> *mut u8 {
        unsafe { self.inner.lock().unwrap().allocate(n) }
    }

    /// See [`RawMalloc::callocate`].
    pub fn callocate(&self, nmemb: usize, size: usize) -> *mut u8 {
        unsafe { self.inner.lock().unwrap().callocate(nmemb, size) }
    }

    /// See [`RawMalloc::reallocate`].
    ///
    /// # Safety
    /// `p` must be null or a live pointer previously returned by this
    /// allocator.
    pub unsafe fn reallocate(&self, p: *mut u8, n: usize) -> *mut u8 {
        self.inner.lock().unwrap().reallocate(p, n)
    }

    /// See [`RawMalloc::deallocate`].
    ///
    /// # Safety
    /// `p` must be null or a pointer previously returned by this allocator
    /// and not deallocated since.
    pub unsafe fn deallocate(&self, p: *mut u8) {
        self.inner.lock().unwrap().deallocate(p)
    }

    /// See [`RawMalloc::usable_size`].
    ///
    /// # Safety
    /// `p` must be a live pointer previously returned by this allocator.
    pub unsafe fn usable_size(&self, p: *mut u8) -> usize {
        self.inner.lock().unwrap().usable_size(p)
    }

    /// See [`RawMalloc::owns`].
    pub fn owns(&self, p: *const u8) -> bool {
        unsafe { self.inner.lock().unwrap().owns(p) }
    }

    /// Runs the heap integrity walk under the allocator lock.
    pub fn verify(&self) -> Result<HeapStats, Corruption> {
        unsafe { self.inner.lock().unwrap().verify() }
    }

    /// Writes the block map to `out` under the allocator lock.
    pub fn dump<W: Write>(&self, out: &mut W) -> io::Result<()> {
        unsafe { self.inner.lock().unwrap().dump(out) }
    }
}

unsafe impl<T: Grower> Sync for SeglistMalloc<T> {}

//---------------impl GlobalAlloc for SeglistMalloc---------------//

unsafe impl<T: Grower> GlobalAlloc for SeglistMalloc<T> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.inner.lock().unwrap().alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.inner.lock().unwrap().dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.inner.lock().unwrap().realloc(ptr, layout, new_size)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.inner.lock().unwrap().alloc_zeroed(layout)
    }
}
