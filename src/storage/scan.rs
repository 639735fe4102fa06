//! Prefix iteration over a snapshot

use std::collections::btree_map;
use std::ops::Bound;

use super::engine::KvMap;

/// Forward-only iterator over every key starting with a prefix.
///
/// Borrowed from a single [`ReadTxn`](super::ReadTxn) snapshot, so it sees
/// exactly the keys that existed when the transaction began. Lazy: entries are
/// produced on demand and iteration stops at the first key outside the
/// prefix. Not restartable; open a new transaction to scan again.
pub struct PrefixScan<'a> {
    range: btree_map::Range<'a, Vec<u8>, Vec<u8>>,
    prefix: Vec<u8>,
    done: bool,
}

impl<'a> PrefixScan<'a> {
    pub(crate) fn new(map: &'a KvMap, prefix: &[u8]) -> Self {
        let range = map.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded));
        Self {
            range,
            prefix: prefix.to_vec(),
            done: false,
        }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }
}

impl<'a> Iterator for PrefixScan<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.range.next() {
            Some((key, value)) if key.starts_with(&self.prefix) => {
                Some((key.as_slice(), value.as_slice()))
            }
            _ => {
                self.done = true;
                None
            }
        }
    }
}

impl std::iter::FusedIterator for PrefixScan<'_> {}
