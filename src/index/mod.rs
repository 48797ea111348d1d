//! Index layer
//!
//! B-tree indexes, the tablespace they live in and the adaptive hash index
//! that shortcuts their point lookups.

pub mod ahi;
pub mod btree;
pub mod space;

pub use ahi::{AdaptiveHashIndex, AhiStats};
pub use btree::{BTree, BTreeStats, BtrCursor, Intention, LatchMode, SearchMode, SplitPoint};
pub use space::Space;
