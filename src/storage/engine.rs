//! Transactional key-value engine
//!
//! The published key space is an immutable `Arc<BTreeMap>`. Readers clone the
//! `Arc` and keep a consistent snapshot for as long as they like; the single
//! writer buffers its mutations and publishes a new version on commit with
//! `Arc::make_mut`, which only copies the map while older snapshots are still
//! alive.

use super::log::{CommitBatch, CommitLog, LogOp};
use super::scan::PrefixScan;
use crate::config::{StorageMode, StoreConfig};
use crate::error::{Error, Result};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) type KvMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// Storage handle
///
/// Owns the key space and, in durable mode, the commit log. Shared by every
/// caller through `Arc<Store>`; the transaction API is the only
/// synchronization callers need.
pub struct Store {
    mode: StorageMode,
    current: RwLock<Arc<KvMap>>,
    /// Held for the whole lifetime of a write transaction
    writer: Mutex<Option<CommitLog>>,
    closed: AtomicBool,
    commits: AtomicU64,
    compaction_threshold: u64,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("mode", &self.mode)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Store {
    /// Open a store in the mode selected by `config`
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let (log, map) = match &config.mode {
            StorageMode::InMemory => (None, KvMap::new()),
            StorageMode::Durable(path) => {
                let (log, map) = CommitLog::open(path)?;
                (Some(log), map)
            }
        };

        info!(mode = %config.mode, keys = map.len(), "Opened store");

        Ok(Self {
            mode: config.mode.clone(),
            current: RwLock::new(Arc::new(map)),
            writer: Mutex::new(log),
            closed: AtomicBool::new(false),
            commits: AtomicU64::new(0),
            compaction_threshold: config.compaction_threshold,
        })
    }

    /// Volatile store with default settings
    pub fn in_memory() -> Self {
        Self {
            mode: StorageMode::InMemory,
            current: RwLock::new(Arc::new(KvMap::new())),
            writer: Mutex::new(None),
            closed: AtomicBool::new(false),
            commits: AtomicU64::new(0),
            compaction_threshold: 0,
        }
    }

    pub fn mode(&self) -> &StorageMode {
        &self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Start a read-only transaction over the current snapshot
    pub fn begin_read(&self) -> Result<ReadTxn> {
        self.ensure_open()?;
        let snapshot = Arc::clone(&*self.current.read());
        Ok(ReadTxn { snapshot })
    }

    /// Start a read-write transaction, waiting for any in-flight writer
    pub fn begin_write(&self) -> Result<WriteTxn<'_>> {
        self.ensure_open()?;
        let log = self.writer.lock();
        // close() may have won the race for the writer lock
        self.ensure_open()?;
        let base = Arc::clone(&*self.current.read());
        Ok(WriteTxn {
            store: self,
            log,
            base,
            pending: BTreeMap::new(),
        })
    }

    /// Run `f` inside a read-only transaction
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReadTxn) -> Result<T>,
    {
        let txn = self.begin_read()?;
        f(&txn)
    }

    /// Run `f` inside a read-write transaction.
    ///
    /// Commits when `f` returns `Ok`; any error discards every buffered write.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTxn<'_>) -> Result<T>,
    {
        let mut txn = self.begin_write()?;
        let out = f(&mut txn)?;
        txn.commit()?;
        Ok(out)
    }

    /// Flush and release the store. Every later transaction fails with
    /// [`Error::Closed`], as does a second `close()`.
    pub fn close(&self) -> Result<()> {
        let mut log = self.writer.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }

        if let Some(mut log) = log.take() {
            let snapshot = Arc::clone(&*self.current.read());
            log.compact(&snapshot)?;
        }

        info!(mode = %self.mode, commits = self.commits.load(Ordering::Relaxed), "Closed store");
        Ok(())
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> StoreStats {
        let key_count = self.current.read().len();
        let log_bytes = self.writer.lock().as_ref().map(|log| log.len_bytes());
        StoreStats {
            mode: self.mode.clone(),
            key_count,
            log_bytes,
            commits: self.commits.load(Ordering::Relaxed),
        }
    }

    fn publish(&self, ops: Vec<LogOp>) {
        let mut current = self.current.write();
        let map = Arc::make_mut(&mut *current);
        for op in ops {
            op.apply(map);
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if self.mode.is_durable() && !self.is_closed() {
            warn!(mode = %self.mode, "Store dropped without close; log left uncompacted");
        }
    }
}

/// Store statistics
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub mode: StorageMode,
    pub key_count: usize,
    /// Commit-log size, `None` for volatile stores
    pub log_bytes: Option<u64>,
    pub commits: u64,
}

/// Read-only transaction
///
/// Holds a snapshot; concurrent commits are invisible to it.
#[derive(Debug, Clone)]
pub struct ReadTxn {
    snapshot: Arc<KvMap>,
}

impl ReadTxn {
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.snapshot.get(key).map(Vec::as_slice)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.snapshot.contains_key(key)
    }

    /// Iterate every key starting with `prefix`, in key order
    pub fn scan_prefix(&self, prefix: &[u8]) -> PrefixScan<'_> {
        PrefixScan::new(&self.snapshot, prefix)
    }

    /// Number of keys in the snapshot
    pub fn len(&self) -> usize {
        self.snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }
}

/// Read-write transaction
///
/// Exclusive against other writers, invisible to readers until committed.
/// Dropping it without [`commit`](WriteTxn::commit) discards every write.
pub struct WriteTxn<'a> {
    store: &'a Store,
    log: MutexGuard<'a, Option<CommitLog>>,
    base: Arc<KvMap>,
    /// `None` marks a delete
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> WriteTxn<'a> {
    /// Read through this transaction's own writes
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        match self.pending.get(key) {
            Some(Some(value)) => Some(value.as_slice()),
            Some(None) => None,
            None => self.base.get(key).map(Vec::as_slice),
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.pending.insert(key.into(), Some(value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.pending.insert(key.into(), None);
    }

    /// Number of buffered mutations
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Persist (durable mode) and publish the buffered writes
    pub fn commit(self) -> Result<()> {
        let WriteTxn {
            store,
            mut log,
            base,
            pending,
        } = self;
        drop(base);

        if pending.is_empty() {
            return Ok(());
        }

        let mut ops: Vec<LogOp> = pending
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => LogOp::Put { key, value },
                None => LogOp::Delete { key },
            })
            .collect();

        if let Some(log) = log.as_mut() {
            let batch = CommitBatch::new(log.next_sequence(), ops);
            log.append(&batch)?;
            ops = batch.ops;
        }

        let op_count = ops.len();
        store.publish(ops);
        store.commits.fetch_add(1, Ordering::Relaxed);
        debug!(ops = op_count, "Committed write transaction");

        if let Some(log) = log.as_mut() {
            if log.needs_compaction(store.compaction_threshold) {
                let snapshot = Arc::clone(&*store.current.read());
                // The batch is already durable; a failed compaction only
                // leaves a longer log behind
                if let Err(e) = log.compact(&snapshot) {
                    warn!(error = %e, "Commit log compaction failed");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_read_sees_committed_writes() -> Result<()> {
        let store = Store::in_memory();

        store.update(|txn| {
            txn.set(b"key1".to_vec(), b"value1".to_vec());
            txn.set(b"key2".to_vec(), b"value2".to_vec());
            Ok(())
        })?;

        store.view(|txn| {
            assert_eq!(txn.get(b"key1"), Some(b"value1".as_slice()));
            assert_eq!(txn.get(b"key2"), Some(b"value2".as_slice()));
            assert_eq!(txn.get(b"key3"), None);
            Ok(())
        })
    }

    #[test]
    fn test_snapshot_isolation() -> Result<()> {
        let store = Store::in_memory();
        store.update(|txn| {
            txn.set(b"k".to_vec(), b"old".to_vec());
            Ok(())
        })?;

        let before = store.begin_read()?;
        store.update(|txn| {
            txn.set(b"k".to_vec(), b"new".to_vec());
            txn.set(b"extra".to_vec(), b"x".to_vec());
            Ok(())
        })?;

        assert_eq!(before.get(b"k"), Some(b"old".as_slice()));
        assert!(!before.contains_key(b"extra"));
        assert_eq!(store.begin_read()?.get(b"k"), Some(b"new".as_slice()));
        Ok(())
    }

    #[test]
    fn test_write_reads_own_writes() -> Result<()> {
        let store = Store::in_memory();
        store.update(|txn| {
            txn.set(b"a".to_vec(), b"1".to_vec());
            assert_eq!(txn.get(b"a"), Some(b"1".as_slice()));
            txn.delete(b"a".to_vec());
            assert!(!txn.contains_key(b"a"));
            Ok(())
        })?;
        assert!(store.begin_read()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_error_discards_writes() {
        let store = Store::in_memory();
        let result: Result<()> = store.update(|txn| {
            txn.set(b"a".to_vec(), b"1".to_vec());
            Err(Error::InvalidArgument("abort".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(store.stats().key_count, 0);
        assert_eq!(store.stats().commits, 0);
    }

    #[test]
    fn test_readers_not_blocked_by_open_writer() -> Result<()> {
        let store = Store::in_memory();
        let mut writer = store.begin_write()?;
        writer.set(b"a".to_vec(), b"1".to_vec());

        // Same thread: would deadlock if readers waited on the writer lock
        let reader = store.begin_read()?;
        assert!(!reader.contains_key(b"a"));

        writer.commit()?;
        assert!(store.begin_read()?.contains_key(b"a"));
        Ok(())
    }

    #[test]
    fn test_concurrent_writers_serialize() -> Result<()> {
        let store = Arc::new(Store::in_memory());

        thread::scope(|scope| {
            for _ in 0..8 {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    for _ in 0..25 {
                        store
                            .update(|txn| {
                                let current = txn
                                    .get(b"counter")
                                    .map(|v| u64::from_be_bytes(v.try_into().unwrap()))
                                    .unwrap_or(0);
                                txn.set(b"counter".to_vec(), (current + 1).to_be_bytes().to_vec());
                                Ok(())
                            })
                            .unwrap();
                    }
                });
            }
        });

        let value = store.begin_read()?.get(b"counter").map(|v| u64::from_be_bytes(v.try_into().unwrap()));
        assert_eq!(value, Some(200));
        Ok(())
    }

    #[test]
    fn test_close_rejects_further_use() -> Result<()> {
        let store = Store::in_memory();
        let held = store.begin_read()?;
        store.close()?;

        assert!(matches!(store.begin_read(), Err(Error::Closed)));
        assert!(matches!(store.begin_write(), Err(Error::Closed)));
        assert!(matches!(store.close(), Err(Error::Closed)));
        // Snapshots taken before close stay readable
        assert!(held.is_empty());
        Ok(())
    }

    #[test]
    fn test_durable_reopen() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::Storage(e.to_string()))?;
        let config = StoreConfig::durable(dir.path());

        {
            let store = Store::open(&config)?;
            store.update(|txn| {
                txn.set(b"key1".to_vec(), b"value1".to_vec());
                txn.set(b"key2".to_vec(), b"value2".to_vec());
                Ok(())
            })?;
            store.update(|txn| {
                txn.delete(b"key2".to_vec());
                Ok(())
            })?;
            store.close()?;
        }

        let store = Store::open(&config)?;
        store.view(|txn| {
            assert_eq!(txn.get(b"key1"), Some(b"value1".as_slice()));
            assert!(!txn.contains_key(b"key2"));
            Ok(())
        })?;
        store.close()
    }

    #[test]
    fn test_durable_survives_missing_close() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::Storage(e.to_string()))?;
        let config = StoreConfig::durable(dir.path());

        {
            let store = Store::open(&config)?;
            store.update(|txn| {
                txn.set(b"crash".to_vec(), b"safe".to_vec());
                Ok(())
            })?;
        }

        let store = Store::open(&config)?;
        assert_eq!(store.begin_read()?.get(b"crash"), Some(b"safe".as_slice()));
        store.close()
    }

    #[test]
    fn test_compaction_threshold() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::Storage(e.to_string()))?;
        let config = StoreConfig::durable(dir.path()).with_compaction_threshold(1024);
        let store = Store::open(&config)?;

        for i in 0..100u32 {
            store.update(|txn| {
                txn.set(b"hot".to_vec(), i.to_string().into_bytes());
                Ok(())
            })?;
        }

        let log_bytes = store.stats().log_bytes.unwrap_or(u64::MAX);
        assert!(log_bytes <= 1024 + 512, "log was not compacted: {} bytes", log_bytes);
        store.close()?;

        let store = Store::open(&config)?;
        assert_eq!(store.begin_read()?.get(b"hot"), Some(b"99".as_slice()));
        store.close()
    }

    #[test]
    fn test_log_grows_between_compactions() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::Storage(e.to_string()))?;
        let config = StoreConfig::durable(dir.path()).with_compaction_threshold(1024);
        let store = Store::open(&config)?;

        // xorshift noise so the checkpoint stays larger than the threshold
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        let noise: Vec<u8> = (0..8192)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        store.update(|txn| {
            txn.set(b"big".to_vec(), noise);
            Ok(())
        })?;

        let mut sizes = vec![store.stats().log_bytes.unwrap_or_default()];
        assert!(sizes[0] > 1024);
        for i in 0..10u32 {
            store.update(|txn| {
                txn.set(b"small".to_vec(), i.to_string().into_bytes());
                Ok(())
            })?;
            sizes.push(store.stats().log_bytes.unwrap_or_default());
        }

        assert!(
            sizes.windows(2).all(|w| w[1] > w[0]),
            "checkpoint rewritten on a small commit: {:?}",
            sizes
        );
        store.close()?;

        let store = Store::open(&config)?;
        assert_eq!(store.begin_read()?.get(b"small"), Some(b"9".as_slice()));
        assert_eq!(store.begin_read()?.get(b"big").map(<[u8]>::len), Some(8192));
        store.close()
    }

    #[test]
    fn test_second_open_of_same_dir_fails() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::Storage(e.to_string()))?;
        let config = StoreConfig::durable(dir.path());

        let first = Store::open(&config)?;
        first.update(|txn| {
            txn.set(b"k1".to_vec(), b"1".to_vec());
            Ok(())
        })?;
        assert!(matches!(Store::open(&config), Err(Error::Storage(_))));
        first.close()?;

        // close() releases the directory
        let reopened = Store::open(&config)?;
        assert_eq!(reopened.begin_read()?.get(b"k1"), Some(b"1".as_slice()));
        reopened.close()
    }

    #[test]
    fn test_open_fails_on_unusable_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        // A regular file cannot host the store directory
        let config = StoreConfig::durable(file.path().join("nested"));
        assert!(matches!(Store::open(&config), Err(Error::Storage(_))));
    }
}
