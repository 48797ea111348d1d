//! Transaction layer implementation
//!
//! Mini-transactions, the redo log they commit into, crash recovery, and
//! the row lock manager the B-tree keeps informed about record moves.

pub mod lock_manager;
pub mod mtr;
pub mod recovery;
pub mod redo;

pub use lock_manager::{LockManager, LockManagerStats, LockMode, TransactionId};
pub use mtr::{LatchKind, Mtr, Savepoint};
pub use recovery::{recover, replay_into, RecoveryStats};
pub use redo::{parse_log, Lsn, RedoLog, RedoRecord, RedoStats};
