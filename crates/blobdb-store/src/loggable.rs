use std::io;

use blobdb_journal::{JournalEntry, Loggable};
use blobdb_types::{BlobId, TxnId};
use blobdb_vbe::{VariableByteRead, VariableByteWrite};

use crate::error::{StoreError, StoreResult};

/// Log type of [`BlobLoggable::StoreBlobFile`].
pub const LOG_STORE_BLOB_FILE: u8 = 0x50;
/// Log type of [`BlobLoggable::UpdateBlobRefCount`].
pub const LOG_UPDATE_BLOB_REF_COUNT: u8 = 0x51;

/// Journal records written by the blob store.
///
/// Both share a `[u32 id length][id bytes]` prefix, followed by:
///
/// ```text
/// StoreBlobFile:      [u32 uuid length][uuid utf-8]
/// UpdateBlobRefCount: [u32 current count][u32 new count]
/// ```
///
/// All integers are fixed-width big-endian.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlobLoggable {
    /// A staged file was promoted into the payload directory.
    StoreBlobFile {
        txn: TxnId,
        blob_id: BlobId,
        staged_uuid: String,
    },
    /// A reference count changed.
    UpdateBlobRefCount {
        txn: TxnId,
        blob_id: BlobId,
        current_count: u32,
        new_count: u32,
    },
}

impl BlobLoggable {
    pub fn blob_id(&self) -> &BlobId {
        match self {
            Self::StoreBlobFile { blob_id, .. } | Self::UpdateBlobRefCount { blob_id, .. } => {
                blob_id
            }
        }
    }

    /// Returns `true` if the store owns records of `log_type`.
    pub fn is_blob_log_type(log_type: u8) -> bool {
        matches!(log_type, LOG_STORE_BLOB_FILE | LOG_UPDATE_BLOB_REF_COUNT)
    }

    /// Reconstruct a record from a journal entry.
    pub fn from_entry(entry: &JournalEntry) -> StoreResult<Self> {
        let invalid = |reason: String| StoreError::InvalidLogRecord {
            log_type: entry.log_type,
            reason,
        };
        let io_invalid = |e: io::Error| invalid(e.to_string());

        let mut body = entry.body.as_slice();
        let id_len = body.read_fixed_int().map_err(io_invalid)?;
        if id_len <= 0 || id_len as usize > body.len() {
            return Err(invalid(format!("bad blob id length {id_len}")));
        }
        let (id_bytes, mut rest) = body.split_at(id_len as usize);
        let blob_id = BlobId::new(id_bytes)?;

        let record = match entry.log_type {
            LOG_STORE_BLOB_FILE => {
                let uuid_len = rest.read_fixed_int().map_err(io_invalid)?;
                if uuid_len < 0 || uuid_len as usize != rest.len() {
                    return Err(invalid(format!("bad staged uuid length {uuid_len}")));
                }
                let staged_uuid = String::from_utf8(rest.to_vec())
                    .map_err(|e| invalid(format!("staged uuid is not UTF-8: {e}")))?;
                rest = &[];
                Self::StoreBlobFile {
                    txn: entry.txn_id,
                    blob_id,
                    staged_uuid,
                }
            }
            LOG_UPDATE_BLOB_REF_COUNT => {
                let current_count = rest.read_fixed_int().map_err(io_invalid)? as u32;
                let new_count = rest.read_fixed_int().map_err(io_invalid)? as u32;
                Self::UpdateBlobRefCount {
                    txn: entry.txn_id,
                    blob_id,
                    current_count,
                    new_count,
                }
            }
            other => return Err(invalid(format!("not a blob log type: {other:#04x}"))),
        };

        if !rest.is_empty() {
            return Err(invalid(format!("{} trailing bytes", rest.len())));
        }
        Ok(record)
    }
}

impl Loggable for BlobLoggable {
    fn log_type(&self) -> u8 {
        match self {
            Self::StoreBlobFile { .. } => LOG_STORE_BLOB_FILE,
            Self::UpdateBlobRefCount { .. } => LOG_UPDATE_BLOB_REF_COUNT,
        }
    }

    fn transaction_id(&self) -> TxnId {
        match self {
            Self::StoreBlobFile { txn, .. } | Self::UpdateBlobRefCount { txn, .. } => *txn,
        }
    }

    fn log_size(&self) -> usize {
        let prefix = 4 + self.blob_id().len();
        match self {
            Self::StoreBlobFile { staged_uuid, .. } => prefix + 4 + staged_uuid.len(),
            Self::UpdateBlobRefCount { .. } => prefix + 8,
        }
    }

    fn write(&self, out: &mut Vec<u8>) -> io::Result<()> {
        let id = self.blob_id().as_bytes();
        out.write_fixed_int(id.len() as i32)?;
        out.extend_from_slice(id);
        match self {
            Self::StoreBlobFile { staged_uuid, .. } => {
                out.write_fixed_int(staged_uuid.len() as i32)?;
                out.extend_from_slice(staged_uuid.as_bytes());
            }
            Self::UpdateBlobRefCount {
                current_count,
                new_count,
                ..
            } => {
                out.write_fixed_int(*current_count as i32)?;
                out.write_fixed_int(*new_count as i32)?;
            }
        }
        Ok(())
    }
}
