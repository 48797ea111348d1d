//! MoteDB B-tree engine
//!
//! A page-organized B+Tree index with:
//! - latch-coupled descents under a per-tree latch
//! - optimistic leaf changes and pessimistic structural changes (split,
//!   root raise, merge, discard, lift) with up-front page reservation
//! - mini-transactions that log every page change to a redo log
//! - record lock migration and an adaptive hash index kept in step with
//!   record moves
//!
//! ## Architecture
//! ```text
//! BTree ──> Mtr ──> PageCache (Frame = RwLock<Page>)
//!   │         └───> RedoLog ──> recovery
//!   ├─────> LockManager
//!   └─────> AdaptiveHashIndex
//! ```

pub mod config;
pub mod index;
pub mod record;
pub mod storage;
pub mod txn;

mod error;

pub use config::{BTreeConfig, RedoConfig};
pub use error::{Result, StorageError};
pub use index::{BTree, BTreeStats, Space};
pub use record::{IndexDesc, RowFormat, Tuple};
pub use storage::{PageNo, FIL_NULL};
pub use txn::{LockMode, TransactionId};
