//! Digest engine for blobdb.
//!
//! A store computes every [`BlobId`](blobdb_types::BlobId) with one
//! [`DigestType`] chosen at configuration time. Hashing is streaming so that a
//! payload is digested in the same pass that writes it to its staging file.

pub mod digest;
pub mod stream;

pub use digest::{DigestError, DigestType, MessageDigest, StreamingDigest};
pub use stream::{DigestingReader, DigestingWriter};
