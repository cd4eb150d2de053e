//! Translating user items to and from the length-prefixable byte strings that the chunk log
//! stores.
//!
//! A [`Serializer`] is paired with a queue at open time and its [`Serializer::VERSION`] travels in
//! the info record (see [`crate::info`]). Reopening a queue directory with a different serializer
//! is a [`QueueError::ConfigMismatch`], not a silent reinterpretation of old bytes.

use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::QueueError;

/// Encodes and decodes a single item to and from an owned byte buffer.
///
/// Implementations are not required to be streaming; they must produce (or consume) the full
/// byte string for one item at a time. `VERSION` identifies the wire format this implementation
/// produces; bumping it is how a breaking change to the encoding is communicated to existing queue
/// directories, which will refuse to open with [`QueueError::ConfigMismatch`] instead of
/// misinterpreting old records.
pub trait Serializer<T>: Send + Sync + 'static {
    /// Version tag for the wire format this serializer produces, persisted in the info record.
    const VERSION: u32;

    /// Encodes `value` into a fresh byte buffer.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Io`]-wrapped or otherwise descriptive errors via the queue's error
    /// type when encoding fails; most implementations only fail on allocation failure or, for
    /// schema-checked formats, on a value that cannot be represented at all.
    fn encode(&self, value: &T) -> Result<Vec<u8>, QueueError>;

    /// Decodes a value from the exact bytes previously produced by [`Serializer::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not a valid encoding for `T`, which for a non-corrupt queue
    /// directory should never happen -- the chunk log itself guarantees the boundaries of
    /// `bytes`, so a decode failure here points at data corruption rather than a framing bug.
    fn decode(&self, bytes: &[u8]) -> Result<T, QueueError>;
}

/// Default serializer for any item that implements `serde`'s `Serialize`/`DeserializeOwned`.
///
/// This is the serializer used when a queue is built without specifying one explicitly, covering
/// the common case where the item type already derives `Serialize`/`Deserialize`.
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonSerializer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Serializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    const VERSION: u32 = 1;

    fn encode(&self, value: &T) -> Result<Vec<u8>, QueueError> {
        serde_json::to_vec(value)
            .map_err(|e| QueueError::config_mismatch(format!("failed to encode item: {e}")))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, QueueError> {
        serde_json::from_slice(bytes)
            .map_err(|e| QueueError::config_mismatch(format!("failed to decode item: {e}")))
    }
}

/// Serializer that treats the item type as an opaque, already-encoded byte buffer.
///
/// Useful when callers have their own encoding scheme upstream of the queue and just want the
/// chunk log to carry raw bytes without an extra layer of framing.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawBytesSerializer;

impl Serializer<Vec<u8>> for RawBytesSerializer {
    const VERSION: u32 = 1;

    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>, QueueError> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, QueueError> {
        Ok(bytes.to_vec())
    }
}
