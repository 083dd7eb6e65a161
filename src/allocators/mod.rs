//! The [`RawMalloc`] and [`SeglistMalloc`] allocators.

pub mod raw_malloc;
pub mod seglist_malloc;

pub use raw_malloc::RawMalloc;
pub use seglist_malloc::SeglistMalloc;
