use std::path::PathBuf;

use blobdb_crypto::DigestType;
use blobdb_journal::JournalError;
use blobdb_types::{BlobId, TypeError};

/// Errors from blob store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error from the payload directory or the metadata file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The metadata file does not start with the blob store magic number.
    #[error("{path} is not recognised as a valid blob store")]
    NotABlobStore { path: PathBuf },

    /// The metadata file was written by an unknown format version.
    #[error("unsupported blob store format version {found} (supported: {supported})")]
    UnsupportedVersion { found: u16, supported: u16 },

    /// Recovery was requested but no metadata file exists.
    #[error("no persistent blob store file to recover at {path}")]
    NoPersistentFile { path: PathBuf },

    /// The store was created with a different digest algorithm.
    #[error("blob store is not consistent with digest type {configured}: {reason}")]
    DigestMismatch {
        configured: DigestType,
        reason: String,
    },

    /// The metadata file is structurally invalid.
    #[error("corrupt blob store metadata: {0}")]
    CorruptMetadata(String),

    /// A reference count would exceed `u32::MAX`.
    #[error("reference count overflow for {0}")]
    RefCountOverflow(BlobId),

    /// A journal record owned by the store could not be decoded.
    #[error("invalid blob log record type {log_type:#04x}: {reason}")]
    InvalidLogRecord { log_type: u8, reason: String },

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// Journal failure.
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
