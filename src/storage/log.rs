//! Commit log for durable stores
//!
//! No pages and no in-place updates: every committed write transaction is
//! appended as one self-contained frame, and the key space is rebuilt on open
//! by replaying frames in order (last write wins).
//!
//! # Frame format
//!
//! ```text
//! [length: u32 LE][codec: u8][payload][crc32: u32 LE]
//! ```
//!
//! - **length**: size of codec + payload + crc (not including length itself)
//! - **codec**: 0 = raw, 1 = zstd
//! - **payload**: JSON-encoded [`CommitBatch`], keys and values in base64
//! - **crc32**: over \[codec\]\[payload\]
//!
//! Recovery stops at the first frame that is incomplete or fails its checksum.
//! Everything after that point is truncated away, so a crash in the middle of
//! an append costs at most the transaction being written.

use crate::error::{Error, Result};
use crc32fast::Hasher;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Log file name inside the store directory
pub const LOG_FILE: &str = "commit.log";

/// Held exclusively by the one process that has the store open
pub const LOCK_FILE: &str = "LOCK";

const FRAME_HEADER: usize = 4;
const FRAME_OVERHEAD: usize = 1 + 4;
const ZSTD_LEVEL: i32 = 3;

/// Payload codec of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    None,
    Zstd,
}

impl Codec {
    fn tag(self) -> u8 {
        match self {
            Codec::None => 0,
            Codec::Zstd => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Codec::None),
            1 => Ok(Codec::Zstd),
            other => Err(Error::Storage(format!("Unknown frame codec {}", other))),
        }
    }

    fn encode(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::None => Ok(data.to_vec()),
            Codec::Zstd => {
                let mut encoder = zstd::Encoder::new(Vec::new(), ZSTD_LEVEL)
                    .map_err(|e| Error::Storage(format!("Failed to create zstd encoder: {}", e)))?;
                encoder
                    .write_all(data)
                    .map_err(|e| Error::Storage(format!("Failed to compress: {}", e)))?;
                encoder
                    .finish()
                    .map_err(|e| Error::Storage(format!("Failed to finish compression: {}", e)))
            }
        }
    }

    fn decode(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::None => Ok(data.to_vec()),
            Codec::Zstd => zstd::decode_all(data)
                .map_err(|e| Error::Storage(format!("Failed to decompress: {}", e))),
        }
    }
}

/// A single mutation inside a committed batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogOp {
    Put {
        #[serde(with = "base64_bytes")]
        key: Vec<u8>,
        #[serde(with = "base64_bytes")]
        value: Vec<u8>,
    },
    Delete {
        #[serde(with = "base64_bytes")]
        key: Vec<u8>,
    },
}

impl LogOp {
    /// Apply the mutation to a key space
    pub fn apply(self, map: &mut BTreeMap<Vec<u8>, Vec<u8>>) {
        match self {
            LogOp::Put { key, value } => {
                map.insert(key, value);
            }
            LogOp::Delete { key } => {
                map.remove(&key);
            }
        }
    }
}

/// All mutations of one committed write transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitBatch {
    /// Batch sequence number (monotonically increasing)
    pub sequence: u64,
    /// Commit time (milliseconds since epoch)
    pub timestamp_ms: u64,
    pub ops: Vec<LogOp>,
}

impl CommitBatch {
    pub fn new(sequence: u64, ops: Vec<LogOp>) -> Self {
        Self {
            sequence,
            timestamp_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
            ops,
        }
    }

    /// Encode as a length-prefixed, checksummed frame
    pub fn to_frame(&self, codec: Codec) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize batch: {}", e)))?;
        let payload = codec.encode(&json)?;

        let mut hasher = Hasher::new();
        hasher.update(&[codec.tag()]);
        hasher.update(&payload);
        let crc = hasher.finalize();

        let len = u32::try_from(payload.len() + FRAME_OVERHEAD)
            .map_err(|_| Error::Storage("Batch too large for one frame".to_string()))?;

        let mut frame = Vec::with_capacity(FRAME_HEADER + len as usize);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.push(codec.tag());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }

    /// Decode the frame at the start of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds only part of a frame, otherwise the
    /// batch and the number of bytes consumed.
    pub fn from_frame(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < FRAME_HEADER {
            return Ok(None);
        }
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len < FRAME_OVERHEAD {
            return Err(Error::Storage(format!("Frame length {} below minimum", len)));
        }
        if buf.len() < FRAME_HEADER + len {
            return Ok(None);
        }

        let body = &buf[FRAME_HEADER..FRAME_HEADER + len];
        let (head, crc_bytes) = body.split_at(len - 4);
        let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);

        let mut hasher = Hasher::new();
        hasher.update(head);
        let computed_crc = hasher.finalize();
        if stored_crc != computed_crc {
            return Err(Error::Storage(format!(
                "CRC mismatch: expected {:08x}, got {:08x}",
                stored_crc, computed_crc
            )));
        }

        let codec = Codec::from_tag(head[0])?;
        let json = codec.decode(&head[1..])?;
        let batch = serde_json::from_slice(&json)
            .map_err(|e| Error::Serialization(format!("Failed to deserialize batch: {}", e)))?;

        Ok(Some((batch, FRAME_HEADER + len)))
    }
}

/// Append-only commit log
#[derive(Debug)]
pub struct CommitLog {
    path: PathBuf,
    file: File,
    /// Released when the log is dropped
    _lock: File,
    next_sequence: u64,
    bytes: u64,
    /// Size of the last checkpoint frame, 0 until the first compaction
    checkpoint_bytes: u64,
}

impl CommitLog {
    /// Open (or create) the log in `dir` and rebuild the key space from it
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<(Self, BTreeMap<Vec<u8>, Vec<u8>>)> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::Storage(format!("Failed to create store dir {}: {}", dir.display(), e)))?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::Storage(format!("Failed to open lock file {}: {}", lock_path.display(), e)))?;
        lock.try_lock_exclusive().map_err(|_| {
            Error::Storage(format!("Store at {} is already open elsewhere", dir.display()))
        })?;

        let path = dir.join(LOG_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("Failed to open log {}: {}", path.display(), e)))?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| Error::Storage(format!("Failed to read log: {}", e)))?;

        let mut map = BTreeMap::new();
        let mut offset = 0usize;
        let mut max_sequence = 0u64;
        let mut batches = 0usize;

        while offset < buf.len() {
            match CommitBatch::from_frame(&buf[offset..]) {
                Ok(Some((batch, consumed))) => {
                    max_sequence = max_sequence.max(batch.sequence);
                    for op in batch.ops {
                        op.apply(&mut map);
                    }
                    offset += consumed;
                    batches += 1;
                }
                Ok(None) => {
                    warn!(offset, "Incomplete frame at end of commit log");
                    break;
                }
                Err(e) => {
                    warn!(offset, error = %e, "Corrupt frame in commit log");
                    break;
                }
            }
        }

        if offset < buf.len() {
            warn!(
                discarded = buf.len() - offset,
                "Truncating commit log to last valid frame"
            );
            file.set_len(offset as u64)
                .map_err(|e| Error::Storage(format!("Failed to truncate log: {}", e)))?;
            file.sync_all()
                .map_err(|e| Error::Storage(format!("Failed to sync log: {}", e)))?;
        }

        info!(
            path = %path.display(),
            batches,
            keys = map.len(),
            "Commit log recovered"
        );

        let log = Self {
            path,
            file,
            _lock: lock,
            next_sequence: max_sequence + 1,
            bytes: offset as u64,
            checkpoint_bytes: 0,
        };
        Ok((log, map))
    }

    /// Sequence number the next appended batch will carry
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Current on-disk size of the log
    pub fn len_bytes(&self) -> u64 {
        self.bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the log has outgrown `threshold`.
    ///
    /// Growth is measured against the last checkpoint: the log must exceed
    /// both `threshold` and twice the checkpoint size, so a key space larger
    /// than `threshold` is not rewritten on every commit.
    pub fn needs_compaction(&self, threshold: u64) -> bool {
        threshold > 0 && self.bytes > threshold.max(self.checkpoint_bytes.saturating_mul(2))
    }

    /// Append a batch and fsync before returning
    pub fn append(&mut self, batch: &CommitBatch) -> Result<()> {
        let frame = batch.to_frame(Codec::None)?;

        let written = self
            .file
            .write_all(&frame)
            .and_then(|_| self.file.sync_data());
        if let Err(e) = written {
            // Drop any partial frame so later appends stay replayable
            if let Err(truncate_err) = self.file.set_len(self.bytes) {
                warn!(error = %truncate_err, "Failed to roll back partial frame");
            }
            return Err(Error::Storage(format!("Failed to append batch: {}", e)));
        }

        self.bytes += frame.len() as u64;
        self.next_sequence = self.next_sequence.max(batch.sequence + 1);

        debug!(sequence = batch.sequence, ops = batch.ops.len(), "Appended commit batch");
        Ok(())
    }

    /// Replace the log with a single compressed checkpoint of `map`
    pub fn compact(&mut self, map: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<()> {
        let before = self.bytes;

        let ops = map
            .iter()
            .map(|(key, value)| LogOp::Put {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        let checkpoint = CommitBatch::new(self.next_sequence, ops);
        let frame = checkpoint.to_frame(Codec::Zstd)?;

        let temp_path = self.path.with_extension("log.tmp");
        {
            let mut temp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(|e| Error::Storage(format!("Failed to create temp log: {}", e)))?;
            temp.write_all(&frame)
                .map_err(|e| Error::Storage(format!("Failed to write checkpoint: {}", e)))?;
            temp.sync_all()
                .map_err(|e| Error::Storage(format!("Failed to sync checkpoint: {}", e)))?;
        }

        std::fs::rename(&temp_path, &self.path)
            .map_err(|e| Error::Storage(format!("Failed to replace log: {}", e)))?;

        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::Storage(format!("Failed to reopen log: {}", e)))?;
        self.bytes = frame.len() as u64;
        self.checkpoint_bytes = self.bytes;
        self.next_sequence += 1;

        info!(before, after = self.bytes, keys = map.len(), "Commit log compacted");
        Ok(())
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, value: &str) -> LogOp {
        LogOp::Put {
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_frame_codecs() -> Result<()> {
        let batch = CommitBatch::new(7, vec![put("key1", "value1"), LogOp::Delete { key: b"key2".to_vec() }]);

        for codec in [Codec::None, Codec::Zstd] {
            let frame = batch.to_frame(codec)?;
            let (decoded, consumed) = CommitBatch::from_frame(&frame)?.expect("complete frame");
            assert_eq!(consumed, frame.len());
            assert_eq!(decoded.sequence, 7);
            assert_eq!(decoded.ops, batch.ops);
        }
        Ok(())
    }

    #[test]
    fn test_partial_frame_is_incomplete() -> Result<()> {
        let frame = CommitBatch::new(1, vec![put("a", "b")]).to_frame(Codec::None)?;
        assert!(CommitBatch::from_frame(&frame[..frame.len() - 1])?.is_none());
        assert!(CommitBatch::from_frame(&frame[..2])?.is_none());
        Ok(())
    }

    #[test]
    fn test_checksum_mismatch() -> Result<()> {
        let mut frame = CommitBatch::new(1, vec![put("a", "b")]).to_frame(Codec::None)?;
        frame[6] ^= 0xff;
        assert!(CommitBatch::from_frame(&frame).is_err());
        Ok(())
    }

    #[test]
    fn test_log_recovery() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::Storage(e.to_string()))?;

        {
            let (mut log, map) = CommitLog::open(dir.path())?;
            assert!(map.is_empty());
            log.append(&CommitBatch::new(log.next_sequence(), vec![put("key1", "v1"), put("key2", "v2")]))?;
            log.append(&CommitBatch::new(log.next_sequence(), vec![put("key1", "v3")]))?;
            log.append(&CommitBatch::new(log.next_sequence(), vec![LogOp::Delete { key: b"key2".to_vec() }]))?;
        }

        let (log, map) = CommitLog::open(dir.path())?;
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(b"key1".as_slice()), Some(&b"v3".to_vec()));
        assert_eq!(log.next_sequence(), 4);
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_truncated() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::Storage(e.to_string()))?;

        let valid_len = {
            let (mut log, _) = CommitLog::open(dir.path())?;
            log.append(&CommitBatch::new(1, vec![put("key1", "v1")]))?;
            log.len_bytes()
        };

        // Half of a second frame, as left behind by a crash mid-append
        let partial = CommitBatch::new(2, vec![put("key2", "v2")]).to_frame(Codec::None)?;
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.path().join(LOG_FILE))
                .map_err(|e| Error::Storage(e.to_string()))?;
            file.write_all(&partial[..partial.len() / 2])
                .map_err(|e| Error::Storage(e.to_string()))?;
        }

        let (mut log, map) = CommitLog::open(dir.path())?;
        assert_eq!(map.len(), 1);
        assert_eq!(log.len_bytes(), valid_len);

        // Appends after recovery land right after the valid prefix
        log.append(&CommitBatch::new(log.next_sequence(), vec![put("key3", "v3")]))?;
        drop(log);
        let (_, map) = CommitLog::open(dir.path())?;
        assert_eq!(map.len(), 2);
        assert!(map.contains_key(b"key3".as_slice()));
        Ok(())
    }

    #[test]
    fn test_compaction() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::Storage(e.to_string()))?;
        let (mut log, _) = CommitLog::open(dir.path())?;

        let mut map = BTreeMap::new();
        for i in 0..50u32 {
            let op = put("hot", &format!("value-{}", i));
            log.append(&CommitBatch::new(log.next_sequence(), vec![op.clone()]))?;
            op.apply(&mut map);
        }

        let size_before = log.len_bytes();
        log.compact(&map)?;
        assert!(log.len_bytes() < size_before);

        log.append(&CommitBatch::new(log.next_sequence(), vec![put("cold", "x")]))?;
        drop(log);

        let (_, recovered) = CommitLog::open(dir.path())?;
        assert_eq!(recovered.get(b"hot".as_slice()), Some(&b"value-49".to_vec()));
        assert_eq!(recovered.get(b"cold".as_slice()), Some(&b"x".to_vec()));
        Ok(())
    }
}
