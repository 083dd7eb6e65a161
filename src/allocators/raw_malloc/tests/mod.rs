#![allow(unused_imports)]

use crate::freelist::{self, FreelistSet, N_LISTS};
use crate::growers::arena_grower::ArenaGrower;
use crate::growers::{advance, align_for_headers, Grower};
use crate::header::{Header, State, ALIGNMENT, FENCEPOST_SIZE, HEADER_SIZE};

use self::format::OpTrace;

use super::*;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};


/// A grower that leaves a hole before every span after the first, so no
/// span is ever physically contiguous with the previous chunk.
struct GappedGrower {
    frontier: *mut u8,
    arena_end: *mut u8,
    gap: usize,
    used: bool,
}

impl GappedGrower {
    fn new(buf: *mut u8, size: usize, gap: usize) -> Self {
        assert_eq!(gap % ALIGNMENT, 0);
        GappedGrower {
            frontier: align_for_headers(buf).unwrap(),
            arena_end: unsafe { buf.add(size) },
            gap,
            used: false,
        }
    }
}

unsafe impl Grower for GappedGrower {
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), ()> {
        if size == 0 {
            return Ok((NonNull::new(self.frontier).ok_or(())?, 0));
        }
        let size = crate::util::round_up(size, ALIGNMENT).ok_or(())?;
        let skip = if self.used { self.gap } else { 0 };
        let base = advance(self.frontier, skip).ok_or(())?;
        let new_frontier = advance(base, size).ok_or(())?;
        if new_frontier > self.arena_end {
            return Err(());
        }
        self.frontier = new_frontier;
        self.used = true;
        Ok((NonNull::new(base).ok_or(())?, size))
    }
}

#[test]
fn test_1() {
    // Pointers are 8-aligned, writable and non-overlapping; a full free
    // collapses the (fused) heap back to one block.
    let mut buf = vec![0_u8; 16 * 1024];
    let grower = ArenaGrower::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { RawMalloc::with_grower_and_arena(grower, 1024) };

    let sizes = [0, 1, 7, 8, 15, 16, 17, 31, 32, 100, 200, 333, 464, 500, 1000];
    let mut objects: Vec<(*mut u8, usize)> = vec![];
    unsafe {
        for (i, &n) in sizes.iter().enumerate() {
            let p = allocator.allocate(n);
            assert!(!p.is_null());
            assert_eq!(p as usize % ALIGNMENT, 0);
            p.write_bytes(i as u8, n.max(1));
            objects.push((p, n));
        }

        for (i, &(p, n)) in objects.iter().enumerate() {
            for off in 0..n {
                assert_eq!(p.add(off).read(), i as u8, "object {i} was clobbered");
            }
        }

        allocator.verify().unwrap();
        for &(p, _) in &objects {
            allocator.deallocate(p);
        }

        let stats = allocator.verify().unwrap();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.allocated_blocks, 0);
        assert_eq!(stats.free_blocks, 1);
    }
}

#[test]
fn test_2() {
    // allocate(8); deallocate: one non-fencepost block per chunk remains,
    // sized at the arena minus the two fenceposts.
    let mut buf = vec![0_u8; 4096];
    let grower = ArenaGrower::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { RawMalloc::with_grower_and_arena(grower, 1024) };

    unsafe {
        let a = allocator.allocate(8);
        assert!(!a.is_null());
        let stats = allocator.verify().unwrap();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.allocated_blocks, 1);
        assert_eq!(stats.free_blocks, 1);

        allocator.deallocate(a);
        let stats = allocator.verify().unwrap();
        assert_eq!(stats.allocated_blocks, 0);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, 1024 - 2 * FENCEPOST_SIZE);
        assert_eq!(stats.fencepost_blocks, 2);
    }
}

#[test]
fn test_3() {
    // Freeing the middle of three allocations coalesces with neither
    // neighbour, and the freed block is reused exactly.
    let mut buf = vec![0_u8; 8192];
    let grower = ArenaGrower::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { RawMalloc::with_grower_and_arena(grower, 4096) };

    unsafe {
        let a = allocator.allocate(100);
        let b = allocator.allocate(100);
        let c = allocator.allocate(100);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());

        allocator.deallocate(b);
        let stats = allocator.verify().unwrap();
        assert_eq!(stats.allocated_blocks, 2);
        assert_eq!(stats.free_blocks, 2); // b and the chunk remainder

        // b's neighbours are live, so its exact class serves it back.
        assert_eq!(allocator.allocate(100), b);

        allocator.deallocate(a);
        allocator.deallocate(b);
        allocator.deallocate(c);
        let stats = allocator.verify().unwrap();
        assert_eq!(stats.free_blocks, 1);
    }
}

#[test]
fn test_4() {
    // Two adjacent frees merge with each other and the chunk remainder.
    let mut buf = vec![0_u8; 8192];
    let grower = ArenaGrower::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { RawMalloc::with_grower_and_arena(grower, 4096) };

    unsafe {
        let a = allocator.allocate(100);
        let b = allocator.allocate(100);
        assert!(!a.is_null() && !b.is_null());

        allocator.deallocate(a);
        let stats = allocator.verify().unwrap();
        assert_eq!(stats.free_blocks, 2);

        allocator.deallocate(b);
        let stats = allocator.verify().unwrap();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, 4096 - 2 * FENCEPOST_SIZE);
    }
}

#[test]
fn test_5() {
    // A request spanning several arenas grows the heap; the contiguous
    // span fuses with the existing chunk instead of opening a new one.
    let mut buf = vec![0_u8; 16 * 1024];
    let grower = ArenaGrower::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { RawMalloc::with_grower_and_arena(grower, 1024) };

    unsafe {
        let a = allocator.allocate(3 * 1024);
        assert!(!a.is_null());

        let stats = allocator.verify().unwrap();
        assert_eq!(stats.chunks, 1, "adjacent spans should fuse");
        assert_eq!(stats.fencepost_blocks, 2, "joining fenceposts are demoted");
        assert_eq!(stats.allocated_blocks, 1);
        assert_eq!(stats.heap_bytes, 1024 + 4096);

        allocator.deallocate(a);
        let stats = allocator.verify().unwrap();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, stats.heap_bytes - 2 * FENCEPOST_SIZE);
    }
}

#[test]
fn test_6() {
    // Non-contiguous spans stay separate chunks with their own fenceposts,
    // and frees coalesce down to one block per chunk.
    let mut buf = vec![0_u8; 16 * 1024];
    let grower = GappedGrower::new(buf.as_mut_ptr(), buf.len(), 16);
    let allocator = unsafe { RawMalloc::with_grower_and_arena(grower, 1024) };

    unsafe {
        let small = allocator.allocate(100);
        let big = allocator.allocate(2048);
        assert!(!small.is_null() && !big.is_null());

        let stats = allocator.verify().unwrap();
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.fencepost_blocks, 4);

        allocator.deallocate(small);
        allocator.deallocate(big);
        let stats = allocator.verify().unwrap();
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.free_blocks, 2, "one coalesced block per chunk");
    }
}

#[test]
fn test_7() {
    // Many same-sized allocations freed in scrambled order leave a single
    // coalesced block.
    let mut buf = vec![0_u8; 96 * 1024];
    let grower = ArenaGrower::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { RawMalloc::with_grower_and_arena(grower, 4096) };

    const COUNT: usize = 1000;
    unsafe {
        let mut ptrs = Vec::with_capacity(COUNT);
        for _ in 0..COUNT {
            let p = allocator.allocate(40);
            assert!(!p.is_null());
            ptrs.push(p);
        }
        allocator.verify().unwrap();

        // 7 is coprime with 1000, so this visits every slot once.
        for i in 0..COUNT {
            allocator.deallocate(ptrs[(i * 7 + 3) % COUNT]);
            if i == COUNT / 2 {
                allocator.verify().unwrap();
            }
        }

        let stats = allocator.verify().unwrap();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.allocated_blocks, 0);
        assert_eq!(stats.free_blocks, 1);
    }
}

#[test]
#[should_panic(expected = "double free")]
fn test_8() {
    let mut buf = vec![0_u8; 4096];
    let grower = ArenaGrower::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { RawMalloc::with_grower_and_arena(grower, 1024) };

    unsafe {
        let a = allocator.allocate(16);
        assert!(!a.is_null());
        allocator.deallocate(a);
        allocator.deallocate(a);
    }
}

#[test]
#[should_panic(expected = "foreign pointer")]
fn test_9() {
    let mut buf = vec![0_u8; 4096];
    let grower = ArenaGrower::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { RawMalloc::with_grower_and_arena(grower, 1024) };

    let mut elsewhere = [0_u64; 8];
    unsafe {
        let a = allocator.allocate(16);
        assert!(!a.is_null());
        allocator.deallocate(elsewhere.as_mut_ptr().add(2).cast());
    }
}

#[test]
fn test_10() {
    // Splitting is suppressed when the remainder could not hold a free
    // block; the caller gets the whole block and usable_size says so.
    let mut buf = vec![0_u8; 4096];
    let grower = ArenaGrower::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { RawMalloc::with_grower_and_arena(grower, 1024) };

    unsafe {
        let a = allocator.allocate(48); // 64-byte block at the tail
        let _guard = allocator.allocate(48); // keeps a's left neighbour live
        allocator.deallocate(a);

        // 40 rounds to a 56-byte block; the 8-byte remainder of the free
        // 64-byte block cannot survive as a block, so no split happens.
        let c = allocator.allocate(40);
        assert_eq!(c, a);
        assert_eq!(allocator.usable_size(c), 64 - HEADER_SIZE);
        allocator.verify().unwrap();
    }
}

#[test]
fn test_11() {
    // Zero-size allocations are real, distinct and freeable.
    let mut buf = vec![0_u8; 4096];
    let grower = ArenaGrower::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { RawMalloc::with_grower_and_arena(grower, 1024) };

    unsafe {
        let p1 = allocator.allocate(0);
        let p2 = allocator.allocate(0);
        assert!(!p1.is_null());
        assert!(!p2.is_null());
        assert_ne!(p1, p2);
        assert_eq!(allocator.usable_size(p1), MIN_BLOCK_SIZE - HEADER_SIZE);

        allocator.deallocate(p1);
        allocator.deallocate(p2);
        let stats = allocator.verify().unwrap();
        assert_eq!(stats.free_blocks, 1);
    }
}

#[test]
fn test_12() {
    // 472-byte blocks park on the last exact class, 480-byte blocks on the
    // variable-size list, and the exact class serves identical requests
    // back even while a larger block sits on the variable list.
    let mut buf = vec![0_u8; 8192];
    let grower = ArenaGrower::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { RawMalloc::with_grower_and_arena(grower, 4096) };

    unsafe {
        let lists = allocator.lists.get();

        let a = allocator.allocate(456); // 472-byte block
        let _guard_a = allocator.allocate(8);
        allocator.deallocate(a);

        let s57 = FreelistSet::sentinel(lists, 57);
        assert_ne!((*s57).next, s57, "472-byte block should sit on list 57");

        let c = allocator.allocate(464); // 480-byte block
        let _guard_c = allocator.allocate(8);
        allocator.deallocate(c);

        let s58 = FreelistSet::sentinel(lists, N_LISTS - 1);
        let mut nodes = 0;
        let mut at = (*s58).next;
        while at != s58 {
            nodes += 1;
            at = (*at).next;
        }
        assert_eq!(nodes, 2, "remainder and the 480-byte block share list 58");

        assert_eq!(allocator.allocate(456), a, "exact class is checked first");
        allocator.verify().unwrap();
    }
}

#[test]
fn test_13() {
    // reallocate: grows preserve the prefix, null behaves as allocate,
    // zero size behaves as deallocate.
    let mut buf = vec![0_u8; 8192];
    let grower = ArenaGrower::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { RawMalloc::with_grower_and_arena(grower, 4096) };

    unsafe {
        let p = allocator.allocate(64);
        assert!(!p.is_null());
        for i in 0..64 {
            p.add(i).write(i as u8);
        }

        let q = allocator.reallocate(p, 128);
        assert!(!q.is_null());
        assert_ne!(q, p, "resizing always moves");
        for i in 0..64 {
            assert_eq!(q.add(i).read(), i as u8);
        }
        let stats = allocator.verify().unwrap();
        assert_eq!(stats.allocated_blocks, 1);

        assert!(allocator.reallocate(q, 0).is_null());
        let stats = allocator.verify().unwrap();
        assert_eq!(stats.allocated_blocks, 0);
        assert_eq!(stats.free_blocks, 1);

        let s = allocator.reallocate(core::ptr::null_mut(), 16);
        assert!(!s.is_null());
        allocator.deallocate(s);
    }
}

#[test]
fn test_14() {
    // callocate zeroes reused memory and refuses overflowing products.
    let mut buf = vec![0_u8; 8192];
    let grower = ArenaGrower::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { RawMalloc::with_grower_and_arena(grower, 4096) };

    unsafe {
        let dirty = allocator.allocate(100);
        dirty.write_bytes(0xAA, 100);
        allocator.deallocate(dirty);

        let p = allocator.callocate(4, 25);
        assert_eq!(p, dirty, "tail carving lands on the dirtied bytes again");
        for i in 0..100 {
            assert_eq!(p.add(i).read(), 0);
        }
        allocator.deallocate(p);

        assert!(allocator.callocate(usize::MAX, 2).is_null());
        assert!(allocator.callocate(usize::MAX / 2, 3).is_null());
        allocator.verify().unwrap();
    }
}

#[test]
fn test_15() {
    // Exhausting the grower surfaces as a null return and changes nothing.
    let mut buf = vec![0_u8; 2048];
    let grower = ArenaGrower::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { RawMalloc::with_grower_and_arena(grower, 1024) };

    unsafe {
        assert!(allocator.allocate(4000).is_null());

        let stats = allocator.verify().unwrap();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.allocated_blocks, 0);

        let p = allocator.allocate(100);
        assert!(!p.is_null());
        allocator.deallocate(p);
    }
}

#[test]
fn test_16() {
    // The chunk table bounds the number of non-contiguous extensions;
    // hitting the cap is out-of-memory, not corruption.
    let mut buf = vec![0_u8; 96 * 1024];
    let grower = GappedGrower::new(buf.as_mut_ptr(), buf.len(), 16);
    let allocator = unsafe { RawMalloc::with_grower_and_arena(grower, 64) };

    unsafe {
        let mut count = 0;
        loop {
            let p = allocator.allocate(8);
            if p.is_null() {
                break;
            }
            count += 1;
        }
        assert_eq!(count, crate::chunks::MAX_CHUNKS);

        let stats = allocator.verify().unwrap();
        assert_eq!(stats.chunks, crate::chunks::MAX_CHUNKS);
        assert_eq!(stats.allocated_blocks, count);
    }
}

#[test]
fn test_17() {
    // The allocator's spans and events render through the test formatter.
    let subscriber = Registry::default()
        .with(EnvFilter::new("seglist_malloc=debug"))
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(OpTrace)
                .with_test_writer(),
        );
    let _guard = tracing::subscriber::set_default(subscriber);

    let mut buf = vec![0_u8; 8192];
    let grower = ArenaGrower::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { RawMalloc::with_grower_and_arena(grower, 4096) };

    unsafe {
        let p = allocator.allocate(100);
        assert!(!p.is_null());
        let q = allocator.reallocate(p, 300);
        allocator.deallocate(q);
        allocator.verify().unwrap();
    }
}

#[test]
fn test_18() {
    // The GlobalAlloc surface: alignments beyond 8 are refused, the rest
    // maps onto the malloc family.
    let mut buf = vec![0_u8; 8192];
    let grower = ArenaGrower::new(buf.as_mut_ptr(), buf.len());
    let allocator = unsafe { RawMalloc::with_grower_and_arena(grower, 4096) };

    unsafe {
        let over_aligned = Layout::from_size_align(64, 16).unwrap();
        assert!(allocator.alloc(over_aligned).is_null());

        let layout = Layout::from_size_align(24, 8).unwrap();
        let p = allocator.alloc(layout);
        assert!(!p.is_null());
        assert_eq!(p as usize % ALIGNMENT, 0);

        let z = allocator.alloc_zeroed(layout);
        for i in 0..24 {
            assert_eq!(z.add(i).read(), 0);
        }

        let grown = allocator.realloc(p, layout, 200);
        assert!(!grown.is_null());

        allocator.dealloc(grown, Layout::from_size_align(200, 8).unwrap());
        allocator.dealloc(z, layout);
        allocator.verify().unwrap();
    }
}
