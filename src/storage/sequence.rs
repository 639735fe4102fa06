//! Leased identifier sequence
//!
//! Persisting a counter on every call would put a write transaction in front
//! of every insert. Instead the sequence leases a block of `bandwidth`
//! identifiers in one transaction and hands them out from memory.
//!
//! ```text
//! persisted "seq:items" = 201        (exclusive end of the current lease)
//! in memory: next = 157, leased = 201
//!   next() → 157, 158, ... 200, then lease [201, 301)
//! ```
//!
//! Identifiers are strictly increasing and never reused, across restarts too.
//! They are not contiguous: a process that dies mid-lease abandons the rest of
//! its block. [`Sequence::release`] hands the unused tail back on a clean
//! shutdown.

use super::engine::Store;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// First identifier handed out by a fresh sequence
pub const FIRST_ID: u64 = 1;

#[derive(Debug)]
struct Lease {
    next: u64,
    leased: u64,
}

/// Batched, persistent, monotonic identifier allocator
#[derive(Debug)]
pub struct Sequence {
    store: Arc<Store>,
    key: Vec<u8>,
    bandwidth: u64,
    lease: Mutex<Lease>,
}

impl Sequence {
    /// Bind a sequence to `key` and take its first lease
    pub fn new(store: Arc<Store>, key: impl Into<Vec<u8>>, bandwidth: u64) -> Result<Self> {
        if bandwidth == 0 {
            return Err(Error::InvalidArgument("sequence bandwidth must be positive".to_string()));
        }
        let seq = Self {
            store,
            key: key.into(),
            bandwidth,
            lease: Mutex::new(Lease { next: 0, leased: 0 }),
        };
        {
            let mut lease = seq.lease.lock();
            seq.renew(&mut lease)?;
        }
        Ok(seq)
    }

    /// Next identifier. Safe to call from any number of threads.
    pub fn next(&self) -> Result<u64> {
        let mut lease = self.lease.lock();
        if lease.next >= lease.leased {
            self.renew(&mut lease)?;
        }
        let id = lease.next;
        lease.next += 1;
        Ok(id)
    }

    /// Persist the first unissued identifier so the rest of the current block
    /// is not lost. A later `next()` simply takes a new lease.
    pub fn release(&self) -> Result<()> {
        let mut lease = self.lease.lock();
        let next = lease.next;
        self.store.update(|txn| {
            txn.set(self.key.clone(), next.to_be_bytes().to_vec());
            Ok(())
        })?;
        lease.leased = next;
        info!(key = %String::from_utf8_lossy(&self.key), next, "Released sequence lease");
        Ok(())
    }

    pub fn bandwidth(&self) -> u64 {
        self.bandwidth
    }

    fn renew(&self, lease: &mut Lease) -> Result<()> {
        let bandwidth = self.bandwidth;
        let (start, end) = self.store.update(|txn| {
            let start = match txn.get(&self.key) {
                Some(raw) => decode_boundary(raw)?,
                None => FIRST_ID,
            };
            let end = start
                .checked_add(bandwidth)
                .ok_or_else(|| Error::Storage("identifier space exhausted".to_string()))?;
            txn.set(self.key.clone(), end.to_be_bytes().to_vec());
            Ok((start, end))
        })?;

        lease.next = start;
        lease.leased = end;
        debug!(key = %String::from_utf8_lossy(&self.key), start, end, "Leased identifier block");
        Ok(())
    }
}

fn decode_boundary(raw: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| Error::Serialization(format!("sequence boundary has {} bytes, expected 8", raw.len())))?;
    Ok(u64::from_be_bytes(bytes))
}
