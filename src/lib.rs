//! A segregated-freelist memory allocator written in Rust.
//!
//! This crate implements the classic `malloc`/`free`/`calloc`/`realloc`
//! family on top of memory obtained from the operating system in chunks:
//! in-band block headers with boundary tags, fifty-nine segregated free
//! lists, best-fit allocation with tail splitting, bidirectional
//! coalescing on free, and fencepost markers that let physically adjacent
//! chunks fuse into one.
//!
//! # Usage
//! To use this crate you can add `seglist_malloc` as a dependency in your
//! project's `Cargo.toml`.
//! ```toml
//! [dependencies]
//! seglist_malloc = "0.1"
//! ```
//!
//! ```
//! use seglist_malloc::SeglistMalloc;
//! use seglist_malloc::growers::BrkGrower;
//!
//! #[global_allocator]
//! static ALLOCATOR: SeglistMalloc<BrkGrower> =
//!     unsafe { SeglistMalloc::with_grower(BrkGrower::new(4096)) };
//!
//! fn main() {
//!     let v1: Vec<u32> = vec![1, 2, 3];
//!     println!("Brk is cool {:?}", v1);
//! }
//! ```
//!
//! # Allocators
//! Two allocators are exported by this crate - [`RawMalloc`]
//! and [`SeglistMalloc`]. Use [`RawMalloc`] if you are after a
//! single-threaded allocator and can serialise calls yourself;
//! [`SeglistMalloc`] is a `Mutex` wrapper over it that holds the lock for
//! the whole of every operation, heap growth included.
//!
//! # Mode of operation
//! - An allocation request is rounded up to a multiple of 8 (plus header
//!   overhead, floored at the minimum block size) and mapped onto a size
//!   class. The search walks the free lists from that class upward and
//!   takes the first fit; on the variable-size list, which is kept in
//!   ascending address order, first fit doubles as address-ordered fit.
//! - When the fit leaves a conforming remainder the block is split from
//!   the tail, so the surviving free block keeps its address and the
//!   variable-size list keeps its order. Too-small remainders ride along
//!   with the allocation instead.
//! - When nothing fits, the allocator asks its [grower](#growers) for at
//!   least one more arena, fenceposts the new chunk, and retries once.
//! - On free, the block's physical neighbours are inspected through the
//!   boundary tags and free ones are fused with it before it re-enters
//!   the list matching its (possibly grown) size.
//!
//! ## Blocks
//! The heap is divided into blocks. Every block starts with a fixed-size
//! [header](#headers); the bytes after it are either the caller's payload
//! or, while the block is free, the links threading it into a free list.
//!
//! ## Headers
//! A header packs the block's total size and its state (unallocated,
//! allocated, or fencepost) into one word, and mirrors the size of the
//! physically preceding block in a second word. The mirror is the boundary
//! tag: it makes the left neighbour reachable in O(1), the way the size
//! makes the right one.
//!
//! ## Fenceposts
//! Each chunk is bracketed by two minimum-size marker blocks that are
//! never allocated and never coalesced. They spare every walk a bounds
//! check; and when a fresh chunk turns out to start exactly where the
//! previous one ended, the two markers in the middle are demoted and the
//! chunks fuse into one span.
//!
//! ## Chunks
//! A chunk is the memory obtained in one growth call, always a multiple
//! of the arena size (4096 bytes by default). Up to 1024 distinct chunks
//! are tracked; the table also backs the best-effort foreign-pointer
//! detection on the free path.
//!
//! ## Growers
//! A grower is the allocator's source of raw memory: anything that acts
//! as a monotonically advancing frontier implements
//! [`Grower`](growers::Grower). [`BrkGrower`](growers::BrkGrower) advances
//! the process break through `libc`; tests substitute an arena over a
//! plain buffer.
//!
//! # Diagnostics
//! [`SeglistMalloc::verify`] re-derives every heap invariant and returns
//! block tallies; [`SeglistMalloc::dump`] prints the block map of every
//! chunk. Setting `MALLOC_DEBUG_COLOR=1337_CoLoRs` colours the dump:
//! green for unallocated blocks, blue for allocated ones, yellow for
//! fenceposts.
//!
//! # Limits
//! Alignment guarantees stop at 8 bytes ([`GlobalAlloc`](core::alloc::GlobalAlloc)
//! requests with larger alignments are refused with null), memory is never
//! returned to the OS, and a double free or foreign pointer is met with a
//! diagnostic and a panic - the heap invariants are global and
//! un-repairable once violated.

pub use crate::allocators::raw_malloc::DEFAULT_ARENA_SIZE;
pub use crate::allocators::RawMalloc;
pub use crate::allocators::SeglistMalloc;
pub use crate::freelist::N_LISTS;

pub mod allocators;
mod chunks;
pub mod diagnostics;
mod freelist;
pub mod growers;
mod header;
mod util;
