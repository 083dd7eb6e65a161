//! The segregated set of free lists and the link nodes embedded in free blocks.
//!
//! Fifty-nine circular doubly-linked lists, each headed by an in-place
//! sentinel node. A sentinel links to itself when its list is empty, which
//! keeps splice and unsplice free of null branches. Lists `0..N_LISTS-1`
//! hold blocks of one exact size each; the last list holds everything
//! larger, kept in ascending address order.
//!
//! The nodes live inside the blocks they describe: the first 16 payload
//! bytes of an unallocated block are reinterpreted as a [`Node`], and those
//! same bytes become the caller's payload once the block is allocated.

use core::mem::size_of;
use core::ptr::{addr_of_mut, null_mut};

use crate::header::{self, Header, State, ALIGNMENT, HEADER_SIZE};

/// Number of segregated lists. The last index is always the variable-size,
/// address-ordered list.
pub const N_LISTS: usize = 59;

pub(crate) const NODE_SIZE: usize = size_of::<Node>();

/// Free-list links, stored in the payload of an unallocated block.
#[repr(C)]
pub(crate) struct Node {
    pub next: *mut Node,
    pub prev: *mut Node,
}

/// Computes the list index for a block (or request) of total size `size`.
///
/// Exact-size lists cover sizes `(i + 2) * 8`; everything that would map
/// past the last index is clamped onto the variable-size list.
#[inline]
pub(crate) fn list_index(size: usize) -> usize {
    debug_assert_eq!(size % ALIGNMENT, 0);
    debug_assert!(size >= 2 * ALIGNMENT);
    (size / ALIGNMENT - 2).min(N_LISTS - 1)
}

/// Returns the link node embedded in an unallocated block's payload.
///
/// # Safety
/// `block` must point to a valid header with at least [`NODE_SIZE`] payload
/// bytes, and those bytes must currently be list links (the block is
/// unallocated or in the process of changing state).
#[inline(always)]
pub(crate) unsafe fn node_of(block: *mut Header) -> *mut Node {
    header::user_ptr(block).cast()
}

/// Recovers the block header from an embedded link node.
///
/// # Safety
/// `node` must have been produced by [`node_of`].
#[inline(always)]
pub(crate) unsafe fn block_of(node: *mut Node) -> *mut Header {
    node.cast::<u8>().sub(HEADER_SIZE).cast()
}

/// The segregated free-list set.
///
/// The sentinel nodes are self-referential once [`init`](FreelistSet::init)
/// has run, so a set must not move afterwards. All operations therefore
/// take the set by raw pointer; the owning allocator keeps it behind an
/// `UnsafeCell` at a stable address.
#[repr(C)]
pub(crate) struct FreelistSet {
    sentinels: [Node; N_LISTS],
}

impl FreelistSet {
    /// Creates a set with unlinked sentinels. [`init`](FreelistSet::init)
    /// must run before any other operation.
    pub const fn new() -> Self {
        const EMPTY: Node = Node {
            next: null_mut(),
            prev: null_mut(),
        };
        FreelistSet {
            sentinels: [EMPTY; N_LISTS],
        }
    }

    /// Links every sentinel to itself, making all lists empty.
    ///
    /// # Safety
    /// `set` must point to a valid `FreelistSet` that no node of any live
    /// block currently links into.
    pub unsafe fn init(set: *mut FreelistSet) {
        for i in 0..N_LISTS {
            let sentinel = Self::sentinel(set, i);
            (*sentinel).next = sentinel;
            (*sentinel).prev = sentinel;
        }
    }

    /// Returns the sentinel node of list `idx`.
    ///
    /// # Safety
    /// `set` must point to a valid `FreelistSet` and `idx` must be below
    /// [`N_LISTS`].
    #[inline(always)]
    pub unsafe fn sentinel(set: *mut FreelistSet, idx: usize) -> *mut Node {
        addr_of_mut!((*set).sentinels[idx])
    }

    /// Threads `block` into the list matching its size. On the exact-size
    /// lists insertion is at the head; on the variable-size list the walk
    /// maintains ascending address order.
    ///
    /// # Safety
    /// `set` must be initialised and must not already contain `block`;
    /// `block` must be a valid unallocated block header.
    pub unsafe fn insert(set: *mut FreelistSet, block: *mut Header) {
        debug_assert_eq!((*block).state(), State::Unallocated);

        let idx = list_index((*block).size());
        let sentinel = Self::sentinel(set, idx);
        let node = node_of(block);

        let mut at = (*sentinel).next;
        if idx == N_LISTS - 1 {
            while at != sentinel && (at as usize) < (node as usize) {
                at = (*at).next;
            }
        }

        let prev = (*at).prev;
        (*node).next = at;
        (*node).prev = prev;
        (*prev).next = node;
        (*at).prev = node;
    }

    /// Unlinks `node` from whatever list holds it.
    ///
    /// # Safety
    /// `node` must currently be threaded into an initialised list.
    pub unsafe fn remove(node: *mut Node) {
        let prev = (*node).prev;
        let next = (*node).next;
        (*prev).next = next;
        (*next).prev = prev;
    }

    /// Returns the first block of size at least `size` in lists
    /// `[idx..N_LISTS)`, or `None`. Heads of the exact-size lists qualify
    /// by construction; the variable-size list gets a first-fit scan,
    /// which its address ordering turns into an address-ordered fit.
    ///
    /// The block stays threaded; the caller unlinks it (or its carved
    /// remainder) as part of the state change.
    ///
    /// # Safety
    /// `set` must be initialised and `idx` below [`N_LISTS`].
    pub unsafe fn first_fit(set: *mut FreelistSet, idx: usize, size: usize) -> Option<*mut Header> {
        for i in idx..N_LISTS {
            let sentinel = Self::sentinel(set, i);
            let first = (*sentinel).next;

            if i < N_LISTS - 1 {
                if first != sentinel {
                    debug_assert!((*block_of(first)).size() >= size);
                    return Some(block_of(first));
                }
                continue;
            }

            let mut at = first;
            while at != sentinel {
                let block = block_of(at);
                if (*block).size() >= size {
                    return Some(block);
                }
                at = (*at).next;
            }
        }
        None
    }
}
