//! Item record and its key schema

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Namespace prefix of every item key
pub const ITEM_KEY_PREFIX: &str = "item:";

/// Key holding the item identifier lease boundary
pub const ITEM_SEQUENCE_KEY: &str = "seq:items";

/// A generic stored record
///
/// `id` and `created_at` are assigned once at creation and never change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Item {
    /// Storage key for this item
    pub fn key(&self) -> Vec<u8> {
        item_key(self.id)
    }
}

/// Storage key for item `id`.
///
/// The identifier is zero-padded to 20 digits so that byte order of keys
/// matches numeric order of identifiers (`item:…02` sorts before `item:…10`).
pub fn item_key(id: i64) -> Vec<u8> {
    format!("{}{:020}", ITEM_KEY_PREFIX, id).into_bytes()
}

/// Input accepted by create and update
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemInput {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl ItemInput {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}
