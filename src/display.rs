//! Ephemeral display buffer
//!
//! One process-wide slot holding the most recently submitted JSON document,
//! exactly as submitted. Not persisted, no history: every `set` replaces the
//! whole value and a restart empties it.

use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::IgnoredAny;
use tracing::debug;

use crate::error::{Error, Result};

/// Returned by [`DisplayBuffer::get`] until something has been stored
pub const EMPTY_DISPLAY: &[u8] = b"{}";

#[derive(Debug, Default)]
pub struct DisplayBuffer {
    slot: RwLock<Option<Bytes>>,
}

impl DisplayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current payload, or `{}` when nothing has been set
    pub fn get(&self) -> Bytes {
        self.slot
            .read()
            .clone()
            .unwrap_or_else(|| Bytes::from_static(EMPTY_DISPLAY))
    }

    /// Replace the payload after checking that it is well-formed JSON of any
    /// shape. Returns the stored bytes.
    pub fn set(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        let payload = payload.into();
        serde_json::from_slice::<IgnoredAny>(&payload)
            .map_err(|e| Error::InvalidArgument(format!("invalid json: {}", e)))?;

        *self.slot.write() = Some(payload.clone());
        debug!(bytes = payload.len(), "Display payload replaced");
        Ok(payload)
    }

    pub fn is_set(&self) -> bool {
        self.slot.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_default_is_empty_object() {
        let buffer = DisplayBuffer::new();
        assert_eq!(buffer.get(), Bytes::from_static(b"{}"));
        assert!(!buffer.is_set());
    }

    #[test]
    fn test_set_then_get_is_byte_identical() -> Result<()> {
        let buffer = DisplayBuffer::new();
        let stored = buffer.set(Bytes::from_static(b"{\"a\":1}"))?;
        assert_eq!(stored, Bytes::from_static(b"{\"a\":1}"));
        assert_eq!(buffer.get(), stored);
        Ok(())
    }

    #[test]
    fn test_any_json_shape_accepted() -> Result<()> {
        let buffer = DisplayBuffer::new();
        for payload in ["[1,2,3]", "42", "\"text\"", "null", "{\"nested\":{\"x\":[true]}}"] {
            buffer.set(payload.as_bytes().to_vec())?;
            assert_eq!(buffer.get(), payload.as_bytes());
        }
        Ok(())
    }

    #[test]
    fn test_invalid_json_keeps_previous_value() -> Result<()> {
        let buffer = DisplayBuffer::new();
        buffer.set(Bytes::from_static(b"{\"keep\":true}"))?;

        for bad in ["", "{", "{\"a\":}", "{} trailing"] {
            let err = buffer.set(bad.as_bytes().to_vec()).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
        }
        assert_eq!(buffer.get(), Bytes::from_static(b"{\"keep\":true}"));
        Ok(())
    }

    #[test]
    fn test_concurrent_readers_see_whole_values() {
        let buffer = Arc::new(DisplayBuffer::new());
        let payloads: Vec<String> = (0..4)
            .map(|i| format!("{{\"writer\":{},\"fill\":\"{}\"}}", i, "x".repeat(4096)))
            .collect();

        thread::scope(|scope| {
            for payload in &payloads {
                let buffer = Arc::clone(&buffer);
                scope.spawn(move || {
                    for _ in 0..200 {
                        buffer.set(payload.clone().into_bytes()).unwrap();
                    }
                });
            }
            for _ in 0..4 {
                let buffer = Arc::clone(&buffer);
                let payloads = &payloads;
                scope.spawn(move || {
                    for _ in 0..500 {
                        let seen = buffer.get();
                        assert!(
                            seen.as_ref() == EMPTY_DISPLAY
                                || payloads.iter().any(|p| p.as_bytes() == seen.as_ref())
                        );
                    }
                });
            }
        });
    }
}
