//! Storage layer
//!
//! # Architecture
//!
//! ```text
//! Store (one per process)
//!   ├─→ current: Arc<BTreeMap<key, value>>   ← published version
//!   ├─→ writer:  Mutex<Option<CommitLog>>    ← one write txn at a time
//!   └─→ commit.log (durable mode only)
//!
//! ReadTxn  = Arc clone of the current version (never blocks, never blocked)
//! WriteTxn = writer lock + buffered ops, published on commit
//! ```
//!
//! ## Key space
//!
//! The key space is flat. Logical tables are carved out with prefixes:
//! - `item:{id:020}` → JSON-encoded [`crate::Item`]
//! - `seq:items`     → identifier lease boundary (big-endian u64)
//!
//! ## Durability
//!
//! Durable stores append every committed batch to a checksummed commit log
//! before publishing it, and replay the log when reopened. The log is
//! compacted into a single compressed checkpoint frame on close and when it
//! grows past the configured threshold.

pub mod engine;
pub mod log;
pub mod scan;
pub mod sequence;

pub use engine::{ReadTxn, Store, StoreStats, WriteTxn};
pub use log::{Codec, CommitBatch, CommitLog, LogOp};
pub use scan::PrefixScan;
pub use sequence::Sequence;
