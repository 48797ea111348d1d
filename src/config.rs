//! B-tree engine configuration
//!
//! Tuning constants for page size, compression threshold and the
//! "could this page restructure" margins used during latched descents.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{Result, StorageError};

/// Default page size (16KB)
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Smallest supported page size
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest supported page size. Slot and heap offsets are u16, so a full
/// 64KB page is out of range.
pub const MAX_PAGE_SIZE: usize = 64 * 1024 - 1;

/// Redo log configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedoConfig {
    /// fsync the log file on every mini-transaction commit
    pub sync_on_commit: bool,

    /// Optional file sink; the log is always kept in memory as well
    pub path: Option<PathBuf>,
}

/// B-tree configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BTreeConfig {
    /// Page size in bytes
    pub page_size: usize,

    /// Compress a page once its data size falls below this share of the
    /// page (percent).
    pub merge_threshold_pct: usize,

    /// A non-leaf page with less free space than this may split when a
    /// child splits, so its latch is kept during a tree-modify descent.
    pub split_margin_bytes: usize,

    /// A non-leaf page whose data size minus this margin falls under the
    /// merge threshold may be compressed when a child is merged away.
    pub merge_margin_bytes: usize,

    /// Capacity of the page cache in pages
    pub max_pages: usize,

    /// Reorganize the page and retry once when an optimistic insert fails
    pub reorganize_on_insert_failure: bool,

    /// Redo log settings
    pub redo: RedoConfig,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            merge_threshold_pct: 50,
            split_margin_bytes: 2 * 1024,
            merge_margin_bytes: 2 * 1024,
            max_pages: 1 << 20,
            reorganize_on_insert_failure: true,
            redo: RedoConfig::default(),
        }
    }
}

impl BTreeConfig {
    /// Small pages so tests hit splits and merges after a few records
    pub fn for_testing() -> Self {
        Self {
            page_size: 1024,
            split_margin_bytes: 256,
            merge_margin_bytes: 256,
            max_pages: 1 << 16,
            ..Default::default()
        }
    }

    /// Durable configuration writing the redo log to `path`
    pub fn with_redo_file(path: PathBuf) -> Self {
        Self {
            redo: RedoConfig {
                sync_on_commit: true,
                path: Some(path),
            },
            ..Default::default()
        }
    }

    /// Data size under which a page becomes a compression candidate
    pub fn merge_threshold_bytes(&self) -> usize {
        self.page_size * self.merge_threshold_pct / 100
    }

    /// Check the configuration for values the page format cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE || self.page_size > MAX_PAGE_SIZE {
            return Err(StorageError::InvalidArgument(format!(
                "page_size {} outside {}..={}",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        if self.merge_threshold_pct == 0 || self.merge_threshold_pct > 50 {
            return Err(StorageError::InvalidArgument(format!(
                "merge_threshold_pct {} outside 1..=50",
                self.merge_threshold_pct
            )));
        }
        if self.split_margin_bytes >= self.page_size / 2
            || self.merge_margin_bytes >= self.page_size / 2
        {
            return Err(StorageError::InvalidArgument(
                "restructure margins must be below half a page".into(),
            ));
        }
        if self.max_pages < 4 {
            return Err(StorageError::InvalidArgument(format!(
                "max_pages {} too small",
                self.max_pages
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(BTreeConfig::default().validate().is_ok());
        assert!(BTreeConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_page_size_bounds() {
        let at = |page_size| BTreeConfig { page_size, ..BTreeConfig::for_testing() }.validate();
        assert!(at(MIN_PAGE_SIZE).is_ok());
        assert!(at(MAX_PAGE_SIZE).is_ok());
        assert!(at(32 * 1024).is_ok());
        assert!(matches!(at(64 * 1024), Err(StorageError::InvalidArgument(_))));
    }

    #[test]
    fn test_rejects_bad_values() {
        let config = BTreeConfig {
            page_size: 512,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BTreeConfig {
            merge_threshold_pct: 80,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_threshold_bytes() {
        let config = BTreeConfig::default();
        assert_eq!(config.merge_threshold_bytes(), 8 * 1024);
    }
}
