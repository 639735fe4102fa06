//! Item repository
//!
//! Create/read/update/delete/list over the `item:` namespace. Every call is
//! one self-contained unit; no state is carried between calls.
//!
//! Delete runs as two transactions (an existence check, then the
//! removal). Two concurrent deletes of the same id can therefore both report
//! success for one physical removal; only the caller whose own transaction
//! removed the key gets `true` back. The end state is identical either way
//! and ids are never reissued, so nothing can reappear under a deleted id.

use crate::error::{Error, Result};
use crate::item::{item_key, Item, ItemInput, ITEM_KEY_PREFIX};
use crate::storage::{Sequence, Store};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone)]
pub struct ItemRepository {
    store: Arc<Store>,
    ids: Arc<Sequence>,
}

impl ItemRepository {
    pub fn new(store: Arc<Store>, ids: Arc<Sequence>) -> Self {
        Self { store, ids }
    }

    /// Store a new item under a freshly allocated id
    #[instrument(skip(self, input), fields(name_len = input.name.len()))]
    pub fn create(&self, input: ItemInput) -> Result<Item> {
        validate(&input)?;

        let raw_id = self.ids.next()?;
        let id = i64::try_from(raw_id)
            .map_err(|_| Error::Storage(format!("identifier {} out of range", raw_id)))?;

        let item = Item {
            id,
            name: input.name,
            description: input.description,
            created_at: Utc::now(),
        };
        let value = encode(&item)?;

        self.store.update(|txn| {
            txn.set(item.key(), value);
            Ok(())
        })?;

        debug!(id, "Created item");
        Ok(item)
    }

    /// Fetch one item
    #[instrument(skip(self))]
    pub fn get(&self, id: i64) -> Result<Item> {
        self.store.view(|txn| {
            let raw = txn.get(&item_key(id)).ok_or_else(|| not_found(id))?;
            decode(raw)
        })
    }

    /// Replace name and description, keeping `id` and `created_at`.
    ///
    /// Read and write happen in one write transaction, so no other writer can
    /// slip in between them.
    #[instrument(skip(self, input), fields(name_len = input.name.len()))]
    pub fn update(&self, id: i64, input: ItemInput) -> Result<Item> {
        validate(&input)?;
        let key = item_key(id);

        let item = self.store.update(|txn| {
            let raw = txn.get(&key).ok_or_else(|| not_found(id))?;
            let mut item = decode(raw)?;
            item.name = input.name;
            item.description = input.description;
            let value = encode(&item)?;
            txn.set(key.clone(), value);
            Ok(item)
        })?;

        debug!(id, "Updated item");
        Ok(item)
    }

    /// Remove an item.
    ///
    /// Returns whether this call's write transaction removed the record.
    /// `false` means a concurrent delete got there between the check and the
    /// removal.
    #[instrument(skip(self))]
    pub fn delete(&self, id: i64) -> Result<bool> {
        let key = item_key(id);

        let exists = self.store.view(|txn| Ok(txn.contains_key(&key)))?;
        if !exists {
            return Err(not_found(id));
        }

        let removed = self.store.update(|txn| {
            let present = txn.contains_key(&key);
            txn.delete(key.clone());
            Ok(present)
        })?;

        debug!(id, removed, "Deleted item");
        Ok(removed)
    }

    /// Every decodable item, in key (= id) order.
    ///
    /// A record that fails to decode is logged and skipped rather than
    /// failing the whole listing.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<Item>> {
        self.store.view(|txn| {
            let mut items = Vec::new();
            for (key, value) in txn.scan_prefix(ITEM_KEY_PREFIX.as_bytes()) {
                match decode(value) {
                    Ok(item) => items.push(item),
                    Err(e) => warn!(
                        key = %String::from_utf8_lossy(key),
                        error = %e,
                        "Skipping malformed item"
                    ),
                }
            }
            Ok(items)
        })
    }

    /// Number of stored item records
    pub fn count(&self) -> Result<usize> {
        self.store
            .view(|txn| Ok(txn.scan_prefix(ITEM_KEY_PREFIX.as_bytes()).count()))
    }
}

fn validate(input: &ItemInput) -> Result<()> {
    if input.name.is_empty() {
        return Err(Error::InvalidArgument("name is required".to_string()));
    }
    Ok(())
}

fn not_found(id: i64) -> Error {
    Error::NotFound(format!("item {}", id))
}

fn encode(item: &Item) -> Result<Vec<u8>> {
    serde_json::to_vec(item)
        .map_err(|e| Error::Serialization(format!("Failed to serialize item: {}", e)))
}

fn decode(raw: &[u8]) -> Result<Item> {
    serde_json::from_slice(raw)
        .map_err(|e| Error::Serialization(format!("Failed to deserialize item: {}", e)))
}
