use std::fmt;
use std::io;

use blobdb_types::TxnId;
use blobdb_vbe::{VariableByteRead, VariableByteWrite, MAX_LONG_LEN};

use crate::error::{JournalError, JournalResult};

/// Log sequence number: the position of a record within its journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lsn(u64);

impl Lsn {
    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsn:{}", self.0)
    }
}

/// A journal record describing one mutation.
///
/// Implementations must be reconstructable purely from the bytes produced by
/// [`write`](Loggable::write), and [`log_size`](Loggable::log_size) must equal
/// the exact number of bytes `write` produces.
pub trait Loggable {
    /// Record type tag. Tags `0x01..=0x0f` are reserved for the journal.
    fn log_type(&self) -> u8;

    /// Transaction that produced this record.
    fn transaction_id(&self) -> TxnId;

    /// Exact size in bytes of the body written by [`write`](Loggable::write).
    fn log_size(&self) -> usize;

    /// Serialize the record body.
    fn write(&self, out: &mut Vec<u8>) -> io::Result<()>;
}

/// A record as read back from a journal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub log_type: u8,
    pub body: Vec<u8>,
}

/// Encode a record as `[VBE txn id][type][body]`, enforcing its declared size.
pub(crate) fn encode_payload(record: &dyn Loggable) -> JournalResult<Vec<u8>> {
    let declared = record.log_size();
    let mut body = Vec::with_capacity(declared);
    record.write(&mut body)?;
    if body.len() != declared {
        return Err(JournalError::SizeMismatch {
            log_type: record.log_type(),
            declared,
            actual: body.len(),
        });
    }

    let mut payload = Vec::with_capacity(MAX_LONG_LEN + 1 + declared);
    payload.write_varint(record.transaction_id().get())?;
    payload.write_byte(record.log_type())?;
    payload.extend_from_slice(&body);
    Ok(payload)
}

/// Decode a payload produced by [`encode_payload`].
pub(crate) fn decode_payload(lsn: Lsn, payload: &[u8]) -> JournalResult<JournalEntry> {
    let malformed = |e: io::Error| JournalError::MalformedRecord {
        lsn,
        reason: e.to_string(),
    };
    let mut input = payload;
    let txn_id = input.read_varint(MAX_LONG_LEN).map_err(malformed)?;
    let log_type = input.read_byte().map_err(malformed)?;
    Ok(JournalEntry {
        lsn,
        txn_id: TxnId::new(txn_id),
        log_type,
        body: input.to_vec(),
    })
}
