//! Tablespace
//!
//! Bundles the services every tree in one space shares: the page cache,
//! the redo log, the record lock manager, the adaptive hash index and the
//! store for externally kept fields.

use std::sync::Arc;

use log::info;

use super::ahi::{AdaptiveHashIndex, DEFAULT_AHI_CAPACITY};
use crate::config::BTreeConfig;
use crate::record::{CountingExternalStore, ExternalFieldStore};
use crate::storage::PageCache;
use crate::txn::{recover, LockManager, RecoveryStats, RedoLog, RedoRecord};
use crate::Result;

pub struct Space {
    space_id: u32,
    cache: PageCache,
    log: RedoLog,
    locks: LockManager,
    ahi: AdaptiveHashIndex,
    external: Arc<dyn ExternalFieldStore>,
}

impl Space {
    /// Empty space with an in-memory external field store
    pub fn new(space_id: u32, config: &BTreeConfig) -> Result<Arc<Self>> {
        Self::with_external(space_id, config, Arc::new(CountingExternalStore::default()))
    }

    pub fn with_external(
        space_id: u32,
        config: &BTreeConfig,
        external: Arc<dyn ExternalFieldStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            space_id,
            cache: PageCache::new(config.page_size, config.max_pages),
            log: RedoLog::new(&config.redo)?,
            locks: LockManager::new(),
            ahi: AdaptiveHashIndex::new(DEFAULT_AHI_CAPACITY),
            external,
        }))
    }

    /// Rebuild a space by replaying `records`. New mini-transactions are
    /// logged after the last replayed LSN.
    pub fn recover(
        space_id: u32,
        config: &BTreeConfig,
        records: &[RedoRecord],
    ) -> Result<(Arc<Self>, RecoveryStats)> {
        config.validate()?;
        let (cache, stats) = recover(records, config.page_size, config.max_pages)?;
        let log = RedoLog::new(&config.redo)?;
        if let Some(last) = records.last() {
            log.advance_to(last.lsn + 1);
        }
        info!(
            "space {}: recovered {} pages, {} records applied",
            space_id, stats.pages, stats.applied
        );
        let space = Arc::new(Self {
            space_id,
            cache,
            log,
            locks: LockManager::new(),
            ahi: AdaptiveHashIndex::new(DEFAULT_AHI_CAPACITY),
            external: Arc::new(CountingExternalStore::default()),
        });
        Ok((space, stats))
    }

    pub fn space_id(&self) -> u32 {
        self.space_id
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn log(&self) -> &RedoLog {
        &self.log
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn ahi(&self) -> &AdaptiveHashIndex {
        &self.ahi
    }

    pub fn external(&self) -> &dyn ExternalFieldStore {
        self.external.as_ref()
    }
}
