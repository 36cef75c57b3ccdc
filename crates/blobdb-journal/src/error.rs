use std::io;

use blobdb_types::TxnId;

use crate::loggable::Lsn;

/// Errors produced by the journal subsystem.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// I/O error during journal file operations.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// CRC check failed for a record that is followed by further data.
    ///
    /// A checksum failure on the final record is a torn write and is
    /// tolerated; anywhere else it means the journal is corrupt.
    #[error("CRC integrity check failed at {lsn}: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { lsn: Lsn, expected: u32, actual: u32 },

    /// A loggable wrote a different number of bytes than it declared.
    #[error("log record type {log_type:#04x} declared {declared} bytes but wrote {actual}")]
    SizeMismatch {
        log_type: u8,
        declared: usize,
        actual: usize,
    },

    /// A record could not be decoded.
    #[error("malformed journal record at {lsn}: {reason}")]
    MalformedRecord { lsn: Lsn, reason: String },

    /// A recovery handler failed to redo or undo a record.
    #[error("recovery handler failed at {lsn}: {source}")]
    Handler {
        lsn: Lsn,
        #[source]
        source: crate::recovery::BoxError,
    },

    /// The transaction is not known to the transaction manager.
    #[error("unknown transaction: {0}")]
    UnknownTransaction(TxnId),
}

/// Convenience alias used throughout the journal crate.
pub type JournalResult<T> = std::result::Result<T, JournalError>;
