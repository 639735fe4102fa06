//! Application context
//!
//! Owns the process-wide handles (store, identifier sequence, display buffer)
//! and hands shared references to whoever needs them. Built once at startup.

use crate::config::StoreConfig;
use crate::display::DisplayBuffer;
use crate::error::Result;
use crate::item::ITEM_SEQUENCE_KEY;
use crate::repository::ItemRepository;
use crate::storage::{Sequence, Store};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
pub struct AppContext {
    store: Arc<Store>,
    ids: Arc<Sequence>,
    items: ItemRepository,
    display: Arc<DisplayBuffer>,
    shut_down: AtomicBool,
}

impl AppContext {
    /// Open the store and wire up everything that depends on it
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let store = Arc::new(Store::open(config)?);
        let ids = Arc::new(Sequence::new(
            Arc::clone(&store),
            ITEM_SEQUENCE_KEY,
            config.sequence_bandwidth,
        )?);
        let items = ItemRepository::new(Arc::clone(&store), Arc::clone(&ids));

        info!(
            mode = %config.mode,
            bandwidth = config.sequence_bandwidth,
            "Application context ready"
        );

        Ok(Self {
            store,
            ids,
            items,
            display: Arc::new(DisplayBuffer::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn items(&self) -> &ItemRepository {
        &self.items
    }

    pub fn display(&self) -> &Arc<DisplayBuffer> {
        &self.display
    }

    /// Hand the unused identifier block back, then close the store.
    ///
    /// Only the first call does anything; later calls return `Ok(())`.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Err(e) = self.ids.release() {
            warn!(error = %e, "Failed to release identifier lease");
        }
        self.store.close()?;
        info!("Application context shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::item::ItemInput;

    #[test]
    fn test_open_in_memory() -> Result<()> {
        let ctx = AppContext::open(&StoreConfig::in_memory())?;
        let item = ctx.items().create(ItemInput::new("A", ""))?;
        assert_eq!(item.id, 1);
        assert_eq!(ctx.display().get().as_ref(), b"{}");
        ctx.shutdown()
    }

    #[test]
    fn test_shutdown_is_idempotent() -> Result<()> {
        let ctx = AppContext::open(&StoreConfig::in_memory())?;
        ctx.shutdown()?;
        ctx.shutdown()?;
        assert!(ctx.store().is_closed());
        assert!(matches!(
            ctx.items().create(ItemInput::new("late", "")),
            Err(Error::Closed)
        ));
        Ok(())
    }

    #[test]
    fn test_durable_context_survives_restart() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::Storage(e.to_string()))?;
        let config = StoreConfig::durable(dir.path()).with_sequence_bandwidth(10);

        let first = {
            let ctx = AppContext::open(&config)?;
            let first = ctx.items().create(ItemInput::new("persisted", "x"))?;
            ctx.shutdown()?;
            first
        };

        let ctx = AppContext::open(&config)?;
        assert_eq!(ctx.items().get(first.id)?, first);
        let second = ctx.items().create(ItemInput::new("next", ""))?;
        assert!(second.id > first.id);
        ctx.shutdown()
    }
}
