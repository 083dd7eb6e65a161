//! Heap integrity walks and the block-map dump.
//!
//! The walk re-derives every invariant the allocator maintains (boundary
//! tags, the coalescing invariant, fencepost placement, free-list
//! membership) and reports the first violation it finds. The dump renders
//! the block map of every chunk, in colour when the
//! [`MALLOC_DEBUG_COLOR`](DEBUG_COLOR_ENV) sentinel is set.

use std::io::{self, Write};

use nu_ansi_term::Color;

use crate::chunks::ChunkTable;
use crate::freelist::{self, FreelistSet, NODE_SIZE, N_LISTS};
use crate::header::{self, Header, State, ALIGNMENT, HEADER_SIZE};

/// Environment variable gating colour in [`dump_heap`].
pub const DEBUG_COLOR_ENV: &str = "MALLOC_DEBUG_COLOR";

/// The exact value that enables colour; anything else disables it.
pub const DEBUG_COLOR_SENTINEL: &str = "1337_CoLoRs";

/// A violated heap invariant, with the addresses involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Corruption {
    /// A header's size is zero, unaligned, or runs past its chunk.
    BadSize { block: usize, size: usize },
    /// The state bits of a header decode to no legal state.
    BadStateTag { block: usize, bits: usize },
    /// A block's left-size disagrees with its left neighbour's size.
    TagMismatch {
        block: usize,
        left_size: usize,
        neighbor_size: usize,
    },
    /// Two physically adjacent blocks are both unallocated.
    AdjacentFree { left: usize, right: usize },
    /// A chunk does not begin or end with a fencepost.
    MissingFencepost { chunk: usize },
    /// An unallocated block is absent from the list its size maps to.
    NotInFreelist { block: usize, index: usize },
    /// A list node's block is not unallocated or sized for that list.
    ForeignNode { index: usize, block: usize },
    /// A list's links are inconsistent or form a cycle.
    BrokenList { index: usize },
    /// The lists hold more nodes than the heap has free blocks.
    ExtraNodes { counted: usize, expected: usize },
}

/// Heap-wide tallies computed by a successful integrity walk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub chunks: usize,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
    pub fencepost_blocks: usize,
    pub free_bytes: usize,
    pub heap_bytes: usize,
}

/// Walks every chunk and every free list, checking the heap invariants.
///
/// # Safety
/// `lists` must be an initialised free-list set, and together with `chunks`
/// must describe a heap that no other thread is mutating (callers hold the
/// allocator lock or are otherwise serialised).
pub(crate) unsafe fn verify_heap(
    chunks: &ChunkTable,
    lists: *mut FreelistSet,
) -> Result<HeapStats, Corruption> {
    let mut stats = HeapStats {
        chunks: chunks.len(),
        heap_bytes: chunks.spans().iter().map(|s| s.len()).sum(),
        ..HeapStats::default()
    };
    // No honest list holds more nodes than the heap holds minimal blocks.
    let node_budget = stats.heap_bytes / HEADER_SIZE + 1;

    for span in chunks.spans() {
        let base = span.base;
        let end = span.end as usize;

        let first: *mut Header = base.cast();
        if (*first).try_state() != Some(State::Fencepost) || (*first).left_size() != 0 {
            return Err(Corruption::MissingFencepost {
                chunk: base as usize,
            });
        }

        let mut block = first;
        let mut prev_size = 0;
        let mut prev_free = false;
        loop {
            let addr = block as usize;
            let size = (*block).size();
            if size < HEADER_SIZE || size % ALIGNMENT != 0 || size > end - addr {
                return Err(Corruption::BadSize { block: addr, size });
            }
            if (*block).left_size() != prev_size {
                return Err(Corruption::TagMismatch {
                    block: addr,
                    left_size: (*block).left_size(),
                    neighbor_size: prev_size,
                });
            }
            let state = match (*block).try_state() {
                Some(state) => state,
                None => {
                    return Err(Corruption::BadStateTag {
                        block: addr,
                        bits: (*block).tag_bits(),
                    })
                }
            };
            match state {
                State::Unallocated => {
                    if prev_free {
                        return Err(Corruption::AdjacentFree {
                            left: addr - prev_size,
                            right: addr,
                        });
                    }
                    if size < HEADER_SIZE + NODE_SIZE {
                        return Err(Corruption::BadSize { block: addr, size });
                    }
                    let index = freelist::list_index(size);
                    if !list_contains(lists, index, block, node_budget) {
                        return Err(Corruption::NotInFreelist { block: addr, index });
                    }
                    stats.free_blocks += 1;
                    stats.free_bytes += size;
                    prev_free = true;
                }
                State::Allocated => {
                    stats.allocated_blocks += 1;
                    prev_free = false;
                }
                State::Fencepost => {
                    stats.fencepost_blocks += 1;
                    prev_free = false;
                    if addr + size == end {
                        break;
                    }
                }
            }
            prev_size = size;
            block = header::right_of(block);
            if block as usize >= end {
                return Err(Corruption::MissingFencepost {
                    chunk: base as usize,
                });
            }
        }
    }

    // Second pass over the lists: every node must describe a free block of
    // the right class, and the node total must match the walk's tally so
    // each free block appears exactly once.
    let mut counted = 0;
    for index in 0..N_LISTS {
        let sentinel = FreelistSet::sentinel(lists, index);
        let mut at = (*sentinel).next;
        let mut steps = 0;
        while at != sentinel {
            if steps > stats.free_blocks || (*(*at).next).prev != at || (*(*at).prev).next != at {
                return Err(Corruption::BrokenList { index });
            }
            let block = freelist::block_of(at);
            if (*block).try_state() != Some(State::Unallocated)
                || freelist::list_index((*block).size()) != index
            {
                return Err(Corruption::ForeignNode {
                    index,
                    block: block as usize,
                });
            }
            counted += 1;
            steps += 1;
            at = (*at).next;
        }
    }
    if counted != stats.free_blocks {
        return Err(Corruption::ExtraNodes {
            counted,
            expected: stats.free_blocks,
        });
    }

    Ok(stats)
}

/// Bounded membership scan of list `index` for `block`.
unsafe fn list_contains(
    lists: *mut FreelistSet,
    index: usize,
    block: *mut Header,
    budget: usize,
) -> bool {
    let sentinel = FreelistSet::sentinel(lists, index);
    let node = freelist::node_of(block);
    let mut at = (*sentinel).next;
    let mut steps = 0;
    while at != sentinel && steps < budget {
        if at == node {
            return true;
        }
        steps += 1;
        at = (*at).next;
    }
    false
}

fn color_enabled() -> bool {
    std::env::var(DEBUG_COLOR_ENV).map_or(false, |v| v == DEBUG_COLOR_SENTINEL)
}

fn paint(state: Option<State>, colored: bool) -> String {
    let (label, color) = match state {
        Some(State::Unallocated) => ("UNALLOCATED", Color::Green),
        Some(State::Allocated) => ("ALLOCATED", Color::Blue),
        Some(State::Fencepost) => ("FENCEPOST", Color::Yellow),
        None => ("CORRUPT", Color::Red),
    };
    if colored {
        color.paint(label).to_string()
    } else {
        label.to_string()
    }
}

/// Writes the block map of every chunk to `out`.
///
/// # Safety
/// Same as [`verify_heap`]: the heap must not be mutated concurrently.
pub(crate) unsafe fn dump_heap<W: Write>(chunks: &ChunkTable, out: &mut W) -> io::Result<()> {
    let colored = color_enabled();
    for (i, span) in chunks.spans().iter().enumerate() {
        writeln!(
            out,
            "chunk {} [{:p}..{:p}) {} bytes",
            i,
            span.base,
            span.end,
            span.len()
        )?;
        let end = span.end as usize;
        let mut block: *mut Header = span.base.cast();
        while (block as usize) < end {
            let size = (*block).size();
            writeln!(
                out,
                "  {:p} size {:>8} {}",
                block,
                size,
                paint((*block).try_state(), colored)
            )?;
            if size == 0 || size % ALIGNMENT != 0 || size > end - block as usize {
                writeln!(out, "  ... walk stopped: bad size")?;
                break;
            }
            block = header::right_of(block);
        }
    }
    Ok(())
}
