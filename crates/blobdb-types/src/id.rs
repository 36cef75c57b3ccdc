use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Content-addressed identifier of a BLOB.
///
/// A `BlobId` is the digest of the BLOB's bytes under the store's configured
/// digest algorithm. Its length therefore depends on that algorithm, but is
/// constant for every id produced by one store. Equality and hashing are by
/// value over the raw bytes. A `BlobId` is never mutated after construction.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId(Box<[u8]>);

impl BlobId {
    /// Create a `BlobId` from raw digest bytes.
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Result<Self, TypeError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(TypeError::EmptyId);
        }
        Ok(Self(bytes))
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of digest bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`; ids are validated non-empty at construction.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowercase hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..self.0.len().min(4)])
    }

    /// Parse from a hex string of any non-zero even length.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::new(bytes)
    }

    /// Parse from a hex string, requiring exactly `len` decoded bytes.
    pub fn from_hex_with_len(s: &str, len: usize) -> Result<Self, TypeError> {
        let id = Self::from_hex(s)?;
        if id.len() != len {
            return Err(TypeError::InvalidLength {
                expected: len,
                actual: id.len(),
            });
        }
        Ok(id)
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.short_hex())
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for BlobId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<Vec<u8>> for BlobId {
    type Error = TypeError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        Self::new(bytes)
    }
}
