use std::collections::HashSet;
use std::io;

use blobdb_types::TxnId;
use blobdb_vbe::{VariableByteRead, VariableByteWrite};

use crate::error::{JournalError, JournalResult};
use crate::loggable::{JournalEntry, Loggable, Lsn};

/// Log type of a [`Compensation`] record.
pub const LOG_COMPENSATION: u8 = 0x04;

/// Redo-only record written when an earlier record is undone.
///
/// ```text
/// [u64 undone lsn][type][body]   compensating change to reapply on redo
/// [u64 undone lsn]               nothing to reapply
/// ```
///
/// Recovery never undoes a record that has a compensation, and redoes the
/// compensating change in log order like any other record.
pub struct Compensation<'a> {
    txn: TxnId,
    undone: Lsn,
    redo: Option<&'a dyn Loggable>,
}

impl<'a> Compensation<'a> {
    /// Compensate `undone` with a change that `redo` reapplies.
    pub fn new(undone: &JournalEntry, redo: &'a dyn Loggable) -> Self {
        Self {
            txn: undone.txn_id,
            undone: undone.lsn,
            redo: Some(redo),
        }
    }

    /// Compensate `undone` without any state to reapply.
    pub fn empty(undone: &JournalEntry) -> Self {
        Self {
            txn: undone.txn_id,
            undone: undone.lsn,
            redo: None,
        }
    }
}

impl Loggable for Compensation<'_> {
    fn log_type(&self) -> u8 {
        LOG_COMPENSATION
    }

    fn transaction_id(&self) -> TxnId {
        self.txn
    }

    fn log_size(&self) -> usize {
        8 + self.redo.map_or(0, |r| 1 + r.log_size())
    }

    fn write(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_fixed_long(self.undone.get() as i64)?;
        if let Some(redo) = self.redo {
            out.write_byte(redo.log_type())?;
            redo.write(out)?;
        }
        Ok(())
    }
}

/// A [`Compensation`] as read back from a journal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompensationEntry {
    pub undone: Lsn,
    /// The compensating change, framed as an entry of its own type.
    pub redo: Option<JournalEntry>,
}

impl CompensationEntry {
    pub fn decode(entry: &JournalEntry) -> JournalResult<Self> {
        let mut body = entry.body.as_slice();
        let undone = body
            .read_fixed_long()
            .map_err(|e| JournalError::MalformedRecord {
                lsn: entry.lsn,
                reason: format!("compensation: {e}"),
            })?;
        let redo = body.split_first().map(|(&log_type, rest)| JournalEntry {
            lsn: entry.lsn,
            txn_id: entry.txn_id,
            log_type,
            body: rest.to_vec(),
        });
        Ok(Self {
            undone: Lsn::new(undone as u64),
            redo,
        })
    }
}

/// LSNs of every record in `entries` that has already been compensated.
pub(crate) fn undone_lsns(entries: &[JournalEntry]) -> JournalResult<HashSet<Lsn>> {
    entries
        .iter()
        .filter(|e| e.log_type == LOG_COMPENSATION)
        .map(|e| CompensationEntry::decode(e).map(|c| c.undone))
        .collect()
}
