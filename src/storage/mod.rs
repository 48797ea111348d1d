//! Storage layer
//!
//! Fixed-size slotted pages and the in-memory page cache that owns them.

pub mod buffer_pool;
pub mod checksum;
pub mod page;

pub use buffer_pool::{AllocDirection, Frame, PageCache, PageCacheStats, Reservation};
pub use checksum::{Checksum, ChecksumError};
pub use page::{Page, PageOp, HEADER_SIZE, SLOT_SIZE};

/// Page number within a tablespace
pub type PageNo = u32;

/// Null page reference (no prev/next sibling)
pub const FIL_NULL: PageNo = u32::MAX;
