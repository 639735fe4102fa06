//! Store configuration
//!
//! The storage core consumes exactly one environmental input: where the data
//! lives. Everything else has a sensible default.

use std::path::PathBuf;

/// Marker path that selects the volatile backend.
pub const MEMORY_MARKER: &str = ":memory:";

/// Default number of identifiers reserved per allocator lease.
pub const DEFAULT_SEQUENCE_BANDWIDTH: u64 = 100;

/// Default commit-log size that triggers a compaction.
pub const DEFAULT_COMPACTION_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Where the key space lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageMode {
    /// Memory only, discarded when the store is dropped
    InMemory,
    /// Directory-backed, survives restarts
    Durable(PathBuf),
}

impl StorageMode {
    /// Interpret a `DB_PATH`-style value.
    ///
    /// An empty string or `:memory:` selects [`StorageMode::InMemory`].
    pub fn from_path(path: &str) -> Self {
        let path = path.trim();
        if path.is_empty() || path == MEMORY_MARKER {
            StorageMode::InMemory
        } else {
            StorageMode::Durable(PathBuf::from(path))
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(self, StorageMode::Durable(_))
    }
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageMode::InMemory => f.write_str(MEMORY_MARKER),
            StorageMode::Durable(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Volatile or durable backend
    pub mode: StorageMode,
    /// Identifiers reserved per allocator lease
    pub sequence_bandwidth: u64,
    /// Commit-log size (bytes) after which the log is compacted
    pub compaction_threshold: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::InMemory,
            sequence_bandwidth: DEFAULT_SEQUENCE_BANDWIDTH,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn durable(path: impl Into<PathBuf>) -> Self {
        Self {
            mode: StorageMode::Durable(path.into()),
            ..Self::default()
        }
    }

    pub fn with_sequence_bandwidth(mut self, bandwidth: u64) -> Self {
        self.sequence_bandwidth = bandwidth.max(1);
        self
    }

    pub fn with_compaction_threshold(mut self, bytes: u64) -> Self {
        self.compaction_threshold = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_path() {
        assert_eq!(StorageMode::from_path(""), StorageMode::InMemory);
        assert_eq!(StorageMode::from_path(":memory:"), StorageMode::InMemory);
        assert_eq!(
            StorageMode::from_path("/var/lib/itemkv"),
            StorageMode::Durable(PathBuf::from("/var/lib/itemkv"))
        );
        assert!(!StorageMode::InMemory.is_durable());
    }

    #[test]
    fn test_bandwidth_floor() {
        let config = StoreConfig::in_memory().with_sequence_bandwidth(0);
        assert_eq!(config.sequence_bandwidth, 1);
    }
}
