use std::fmt;
use std::str::FromStr;

use blobdb_types::BlobId;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;

/// Digest algorithms understood by blobdb.
///
/// A store uses exactly one of these for BLOB identity over its whole
/// lifetime. Any of them may be requested ad hoc through
/// `BlobStore::get_digest`, which never changes a BLOB's identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DigestType {
    /// BLAKE3 with a 256-bit output.
    #[serde(rename = "blake3-256")]
    Blake3,
    /// SHA-2 with a 256-bit output.
    #[serde(rename = "sha-256")]
    Sha256,
    /// SHA-2 with a 512-bit output.
    #[serde(rename = "sha-512")]
    Sha512,
}

impl DigestType {
    /// Every supported digest type.
    pub const ALL: [DigestType; 3] = [Self::Blake3, Self::Sha256, Self::Sha512];

    /// Stable numeric identifier.
    pub const fn id(&self) -> u8 {
        match self {
            Self::Sha256 => 0x11,
            Self::Sha512 => 0x12,
            Self::Blake3 => 0x32,
        }
    }

    /// Look up a digest type by its numeric identifier.
    pub fn from_id(id: u8) -> Result<Self, DigestError> {
        Self::ALL
            .into_iter()
            .find(|t| t.id() == id)
            .ok_or(DigestError::UnknownId(id))
    }

    /// Digest length in bits.
    pub const fn digest_length(&self) -> usize {
        match self {
            Self::Blake3 | Self::Sha256 => 256,
            Self::Sha512 => 512,
        }
    }

    /// Digest length in bytes.
    pub const fn digest_length_bytes(&self) -> usize {
        self.digest_length() / 8
    }

    /// Canonical kebab-case name (as used in configuration files).
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Blake3 => "blake3-256",
            Self::Sha256 => "sha-256",
            Self::Sha512 => "sha-512",
        }
    }

    /// Common names accepted when parsing.
    pub const fn common_names(&self) -> &'static [&'static str] {
        match self {
            Self::Blake3 => &["BLAKE3-256", "BLAKE3"],
            Self::Sha256 => &["SHA-256", "SHA256"],
            Self::Sha512 => &["SHA-512", "SHA512"],
        }
    }

    /// Start a new streaming digest of this type.
    pub fn streaming(&self) -> StreamingDigest {
        let state = match self {
            Self::Blake3 => DigestState::Blake3(Box::new(blake3::Hasher::new())),
            Self::Sha256 => DigestState::Sha256(sha2::Sha256::new()),
            Self::Sha512 => DigestState::Sha512(sha2::Sha512::new()),
        };
        StreamingDigest {
            digest_type: *self,
            state,
        }
    }

    /// One-shot digest of an in-memory buffer.
    pub fn digest(&self, data: &[u8]) -> MessageDigest {
        let mut digest = self.streaming();
        digest.update(data);
        digest.finalize()
    }
}

impl Default for DigestType {
    fn default() -> Self {
        Self::Blake3
    }
}

impl fmt::Display for DigestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestType {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| {
                t.name().eq_ignore_ascii_case(s)
                    || t.common_names().iter().any(|cn| cn.eq_ignore_ascii_case(s))
            })
            .ok_or_else(|| DigestError::UnknownName(s.to_string()))
    }
}

enum DigestState {
    Blake3(Box<blake3::Hasher>),
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
}

/// Incremental digest over a byte stream.
pub struct StreamingDigest {
    digest_type: DigestType,
    state: DigestState,
}

impl StreamingDigest {
    /// Feed more bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            DigestState::Blake3(h) => {
                h.update(data);
            }
            DigestState::Sha256(h) => h.update(data),
            DigestState::Sha512(h) => h.update(data),
        }
    }

    /// The algorithm being computed.
    pub fn digest_type(&self) -> DigestType {
        self.digest_type
    }

    /// Consume the digest and produce its value.
    pub fn finalize(self) -> MessageDigest {
        let value = match self.state {
            DigestState::Blake3(h) => h.finalize().as_bytes().to_vec(),
            DigestState::Sha256(h) => h.finalize().to_vec(),
            DigestState::Sha512(h) => h.finalize().to_vec(),
        };
        MessageDigest {
            digest_type: self.digest_type,
            value,
        }
    }
}

impl fmt::Debug for StreamingDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingDigest")
            .field("digest_type", &self.digest_type)
            .finish_non_exhaustive()
    }
}

/// A computed digest value tagged with its algorithm.
///
/// Distinct from [`BlobId`]: a `MessageDigest` may be of any algorithm, while
/// a `BlobId` is always of the store's configured one.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageDigest {
    digest_type: DigestType,
    value: Vec<u8>,
}

impl MessageDigest {
    pub fn digest_type(&self) -> DigestType {
        self.digest_type
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.value)
    }

    /// Reinterpret as a blob identifier.
    pub fn into_blob_id(self) -> BlobId {
        // Every supported algorithm produces a non-empty digest.
        BlobId::new(self.value).unwrap_or_else(|_| unreachable!("digest output is never empty"))
    }
}

impl fmt::Debug for MessageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageDigest({}:{})", self.digest_type, self.to_hex())
    }
}

impl fmt::Display for MessageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.digest_type, self.to_hex())
    }
}

/// Errors from digest lookups.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("unknown digest type id: {0:#04x}")]
    UnknownId(u8),

    #[error("unknown digest type name: {0}")]
    UnknownName(String),
}
