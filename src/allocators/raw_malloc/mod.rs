//! A singlethreaded memory allocator.
//!
// For a general view of the allocator's operational semantics see the [`crate`] level documentation.
//
// # Additional implementation notes
// All heap metadata is in-band: block headers carry the boundary tags and
// free blocks carry their own list links. The only out-of-band state is the
// segregated list sentinels, the chunk table and the cursor to the last
// installed fencepost, all of which live inside the allocator value. The
// sentinels are self-referential once the heap is initialised, which is why
// an initialised allocator must not move.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::{Cell, UnsafeCell};
use core::ptr::{copy_nonoverlapping, null_mut, write_bytes, NonNull};
use std::fmt::Debug;
use std::io::{self, Write};

use static_assertions::{const_assert, const_assert_eq};
use tracing::{debug, error, instrument, Level};

use crate::chunks::ChunkTable;
use crate::diagnostics::{self, Corruption, HeapStats};
use crate::freelist::{self, FreelistSet, NODE_SIZE};
use crate::growers::Grower;
use crate::header::{self, Header, State, ALIGNMENT, FENCEPOST_SIZE, HEADER_SIZE};
use crate::util::round_up;

mod util;

/// Minimum bytes requested per heap extension. The chunk footprint of every
/// extension is rounded up to a multiple of the configured arena size.
pub const DEFAULT_ARENA_SIZE: usize = 4096;

/// Smallest legal block: a header plus room for the free-list link pair.
/// Allocation sizes are floored here so that every block can re-enter a
/// free list when it comes back.
pub(crate) const MIN_BLOCK_SIZE: usize = HEADER_SIZE + NODE_SIZE;

const_assert_eq!(MIN_BLOCK_SIZE % ALIGNMENT, 0);
const_assert_eq!(MIN_BLOCK_SIZE, 32);
const_assert!(FENCEPOST_SIZE <= MIN_BLOCK_SIZE);

/// A singlethreaded memory allocator over segregated free lists.
#[repr(C)]
pub struct RawMalloc<T: Grower> {
    lists: UnsafeCell<FreelistSet>,
    chunks: UnsafeCell<ChunkTable>,
    last_fencepost: Cell<*mut Header>,
    grower: UnsafeCell<T>,
    arena_size: usize,
    ready: Cell<bool>,
}

impl<T: Grower> Debug for RawMalloc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawMalloc")
            .field("arena_size", &self.arena_size)
            .field("ready", &self.ready.get())
            .finish_non_exhaustive()
    }
}

impl<T: Grower> RawMalloc<T> {
    /// Creates an allocator instance with the specified grower and the
    /// default arena size.
    ///
    /// # Safety
    /// Callers must make sure that the provided grower will be the only
    /// object managing its underlying memory for the lifetime of the
    /// returned allocator, and that the allocator is not moved after its
    /// first operation (the list sentinels are address-sensitive).
    pub const unsafe fn with_grower(grower: T) -> Self {
        Self::with_grower_and_arena(grower, DEFAULT_ARENA_SIZE)
    }

    /// Creates an allocator whose heap extensions are rounded up to a
    /// multiple of `arena_size` bytes.
    ///
    /// # Safety
    /// Same as [`with_grower`](RawMalloc::with_grower).
    pub const unsafe fn with_grower_and_arena(grower: T, arena_size: usize) -> Self {
        RawMalloc {
            lists: UnsafeCell::new(FreelistSet::new()),
            chunks: UnsafeCell::new(ChunkTable::new()),
            last_fencepost: Cell::new(null_mut()),
            grower: UnsafeCell::new(grower),
            arena_size,
            ready: Cell::new(false),
        }
    }
}

impl<T: Grower> RawMalloc<T> {
    /// Returns a pointer to at least `n` writable bytes aligned to 8,
    /// valid until passed to [`deallocate`](RawMalloc::deallocate),
    /// or null when the heap cannot grow to satisfy the request.
    ///
    /// A zero-size request returns a distinct minimum-size allocation that
    /// may be deallocated like any other.
    ///
    /// # Safety
    /// Callers must serialise all operations on this allocator.
    pub unsafe fn allocate(&self, n: usize) -> *mut u8 {
        self.__allocate(n).map_or(null_mut(), NonNull::as_ptr)
    }

    /// Allocates zero-initialised memory for an `nmemb * size` byte array,
    /// or returns null when the product overflows or the heap cannot grow.
    ///
    /// # Safety
    /// Callers must serialise all operations on this allocator.
    pub unsafe fn callocate(&self, nmemb: usize, size: usize) -> *mut u8 {
        let Some(total) = nmemb.checked_mul(size) else {
            error!(nmemb, size, "requested array size overflows");
            return null_mut();
        };
        let p = self.allocate(total);
        if !p.is_null() {
            write_bytes(p, 0, total);
        }
        p
    }

    /// Moves the allocation at `p` to a block of at least `n` bytes,
    /// copying the overlapping prefix. A null `p` behaves as `allocate(n)`;
    /// a zero `n` deallocates and returns null. On failure the original
    /// allocation is left untouched and null is returned.
    ///
    /// # Safety
    /// Callers must serialise all operations on this allocator; `p` must be
    /// null or a live pointer previously returned by this allocator.
    #[instrument(level = "info")]
    pub unsafe fn reallocate(&self, p: *mut u8, n: usize) -> *mut u8 {
        if p.is_null() {
            return self.allocate(n);
        }
        if n == 0 {
            self.deallocate(p);
            return null_mut();
        }
        let old = self.usable_size(p);
        let fresh = self.allocate(n);
        if fresh.is_null() {
            return null_mut();
        }
        copy_nonoverlapping(p, fresh, old.min(n));
        self.deallocate(p);
        fresh
    }

    /// Returns the allocation at `p` to the heap, coalescing with whichever
    /// physical neighbours are free.
    ///
    /// A null `p` is a no-op.
    ///
    /// # Panics
    /// Panics when `p` lies outside every tracked chunk, when the block is
    /// not currently allocated (double free) or when its header is corrupt.
    /// The detection is best-effort; the heap invariants are unrecoverable
    /// once any of these hold.
    ///
    /// # Safety
    /// Callers must serialise all operations on this allocator; `p` must be
    /// null or a pointer previously returned by this allocator.
    #[instrument(level = "info")]
    pub unsafe fn deallocate(&self, p: *mut u8) {
        if p.is_null() {
            return;
        }
        if !self.ready.get() || p as usize % ALIGNMENT != 0 || !(*self.chunks.get()).owns(p) {
            error!(ptr = ?p, "pointer does not belong to this heap");
            panic!("deallocate of foreign pointer {p:?}");
        }

        let mut block = header::of_user_ptr(p);
        match (*block).try_state() {
            Some(State::Allocated) => {}
            Some(_) => {
                error!(ptr = ?p, "block is not allocated");
                panic!("double free of {p:?}");
            }
            None => {
                error!(ptr = ?p, "illegal state tag");
                panic!("corrupt block header at {block:?}");
            }
        }

        (*block).set_state(State::Unallocated);

        let right = header::right_of(block);
        if (*right).state() == State::Unallocated {
            FreelistSet::remove(freelist::node_of(right));
            (*block).set_size((*block).size() + (*right).size());
        }

        let left = header::left_of(block);
        if (*left).state() == State::Unallocated {
            FreelistSet::remove(freelist::node_of(left));
            (*left).set_size((*left).size() + (*block).size());
            block = left;
        }

        (*header::right_of(block)).set_left_size((*block).size());
        FreelistSet::insert(self.lists.get(), block);
    }

    /// Returns the payload capacity of the live allocation at `p`, which is
    /// at least what was asked for and reflects rounding and split
    /// suppression.
    ///
    /// # Safety
    /// `p` must be a live pointer previously returned by this allocator,
    /// and callers must serialise all operations on this allocator.
    pub unsafe fn usable_size(&self, p: *mut u8) -> usize {
        debug_assert!((*self.chunks.get()).owns(p));
        (*header::of_user_ptr(p)).size() - HEADER_SIZE
    }

    /// Returns whether `p` falls inside memory this allocator obtained from
    /// its grower.
    ///
    /// # Safety
    /// Callers must serialise all operations on this allocator.
    pub unsafe fn owns(&self, p: *const u8) -> bool {
        (*self.chunks.get()).owns(p)
    }

    /// Walks the whole heap and every free list, re-checking the allocator
    /// invariants. Returns heap-wide tallies on success.
    ///
    /// # Safety
    /// Callers must serialise all operations on this allocator.
    pub unsafe fn verify(&self) -> Result<HeapStats, Corruption> {
        if !self.ready.get() {
            return Ok(HeapStats::default());
        }
        diagnostics::verify_heap(&*self.chunks.get(), self.lists.get())
    }

    /// Writes the block map of every chunk to `out`. Colour is enabled by
    /// the [`MALLOC_DEBUG_COLOR`](crate::diagnostics::DEBUG_COLOR_ENV)
    /// sentinel.
    ///
    /// # Safety
    /// Callers must serialise all operations on this allocator.
    pub unsafe fn dump<W: Write>(&self, out: &mut W) -> io::Result<()> {
        diagnostics::dump_heap(&*self.chunks.get(), out)
    }

    #[instrument(level = "info", ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    unsafe fn __allocate(&self, n: usize) -> Result<NonNull<u8>, ()> {
        self.ensure_ready()?;
        let size = util::request_size(n).ok_or(())?;
        let idx = freelist::list_index(size);
        let lists = self.lists.get();

        let block = match FreelistSet::first_fit(lists, idx, size) {
            Some(block) => block,
            None => {
                debug!(size, "no fit, extending the heap");
                let fresh = self.acquire_chunk(size)?;
                FreelistSet::insert(lists, fresh);
                FreelistSet::first_fit(lists, idx, size).ok_or(())?
            }
        };
        Ok(self.carve(block, size))
    }

    /// Installs the list sentinels and the initial chunk on the first
    /// operation. Doing this lazily keeps construction `const` (the
    /// sentinel self-links need a fixed address) and is race-free because
    /// callers already serialise every operation.
    unsafe fn ensure_ready(&self) -> Result<(), ()> {
        if self.ready.get() {
            return Ok(());
        }
        FreelistSet::init(self.lists.get());
        let block = self.acquire_chunk(MIN_BLOCK_SIZE)?;
        FreelistSet::insert(self.lists.get(), block);
        self.ready.set(true);
        debug!("heap initialised");
        Ok(())
    }

    /// Takes `size` bytes out of a free `block`, splitting off the tail
    /// when a conforming remainder would survive, and returns the user
    /// pointer of the allocated portion.
    ///
    /// # Safety
    /// `block` must be an unallocated block of at least `size` bytes,
    /// currently threaded into the free-list set.
    unsafe fn carve(&self, block: *mut Header, size: usize) -> NonNull<u8> {
        let found = (*block).size();
        debug_assert!(found >= size);
        debug_assert_eq!((*block).state(), State::Unallocated);

        let alloc = if found - size >= MIN_BLOCK_SIZE {
            // Tail split: the remainder keeps the original base address,
            // so when its class does not change it can stay where it is
            // and the address order of the variable-size list survives.
            let remainder = found - size;
            let moves = freelist::list_index(remainder) != freelist::list_index(found);
            if moves {
                FreelistSet::remove(freelist::node_of(block));
            }
            (*block).set_size(remainder);
            if moves {
                FreelistSet::insert(self.lists.get(), block);
            }

            let alloc: *mut Header = header::right_of(block);
            alloc.write(Header::new(size, remainder, State::Allocated));
            debug!(?block, remainder, size, "block split");
            alloc
        } else {
            FreelistSet::remove(freelist::node_of(block));
            (*block).set_state(State::Allocated);
            block
        };

        (*header::right_of(alloc)).set_left_size((*alloc).size());
        NonNull::new_unchecked(header::user_ptr(alloc))
    }

    /// Obtains a fresh span from the grower and shapes it into chunk form,
    /// returning its unallocated block for the caller to thread in. When
    /// the span begins exactly where the previous chunk ended, the joining
    /// fenceposts are demoted and the previous chunk absorbs the span.
    #[instrument(level = "debug", err(Debug, level = Level::ERROR))]
    unsafe fn acquire_chunk(&self, min_bytes: usize) -> Result<*mut Header, ()> {
        let footprint = min_bytes
            .checked_add(2 * FENCEPOST_SIZE)
            .and_then(|bytes| round_up(bytes, self.arena_size))
            .ok_or(())?;

        let (base, got) = (*self.grower.get()).grow(footprint).map_err(|()| {
            error!(footprint, "heap extension failed");
        })?;
        let base = base.as_ptr();
        debug_assert!(got >= footprint);
        debug_assert_eq!(base as usize % header::HEADER_ALIGN, 0);
        debug_assert_eq!(got % ALIGNMENT, 0);

        let chunks = self.chunks.get();
        let last = self.last_fencepost.get();

        if !last.is_null() && base == last.cast::<u8>().add(FENCEPOST_SIZE) {
            let fencepost: *mut Header = base.add(got - FENCEPOST_SIZE).cast();
            let left = header::left_of(last);

            let block = if (*left).state() == State::Unallocated {
                FreelistSet::remove(freelist::node_of(left));
                (*left).set_size((*left).size() + got);
                left
            } else {
                (*last).set_size(got);
                (*last).set_state(State::Unallocated);
                last
            };
            fencepost.write(Header::new(FENCEPOST_SIZE, (*block).size(), State::Fencepost));
            (*chunks).extend_last(base, base.add(got));
            self.last_fencepost.set(fencepost);
            debug!(span = ?base, got, fused = true, "heap grown");
            Ok(block)
        } else {
            if (*chunks).is_full() {
                error!("chunk table full, cannot track another heap extension");
                return Err(());
            }
            let left_fencepost: *mut Header = base.cast();
            left_fencepost.write(Header::new(FENCEPOST_SIZE, 0, State::Fencepost));

            let block: *mut Header = base.add(FENCEPOST_SIZE).cast();
            let block_size = got - 2 * FENCEPOST_SIZE;
            block.write(Header::new(block_size, FENCEPOST_SIZE, State::Unallocated));

            let right_fencepost: *mut Header = base.add(got - FENCEPOST_SIZE).cast();
            right_fencepost.write(Header::new(FENCEPOST_SIZE, block_size, State::Fencepost));

            (*chunks).insert(base, base.add(got));
            self.last_fencepost.set(right_fencepost);
            debug!(span = ?base, got, fused = false, "heap grown");
            Ok(block)
        }
    }
}

//---------------impl GlobalAlloc for RawMalloc---------------//

unsafe impl<T: Grower> GlobalAlloc for RawMalloc<T> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.deallocate(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.reallocate(ptr, new_size)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.callocate(layout.size(), 1)
    }
}

impl<T: Grower> PartialEq for RawMalloc<T> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self, other)
    }
}

impl<T: Grower> Eq for RawMalloc<T> {}

#[cfg(test)]
mod tests;
