use blobdb_types::TxnId;

use crate::error::JournalResult;
use crate::loggable::{JournalEntry, Loggable, Lsn};

/// Append-only write-ahead journal.
///
/// All implementations must satisfy these invariants:
/// - `append` is durable according to the journal's sync mode before it
///   returns, so callers may mutate their own files afterwards.
/// - `entries` returns records in append order with increasing LSNs.
/// - A record whose declared size disagrees with its body is rejected and
///   nothing is written.
pub trait Journal: Send + Sync {
    /// Append a record and return its LSN.
    fn append(&self, record: &dyn Loggable) -> JournalResult<Lsn>;

    /// Read every record currently in the journal.
    fn entries(&self) -> JournalResult<Vec<JournalEntry>>;

    /// Remove every record (checkpoint after a completed recovery).
    fn truncate(&self) -> JournalResult<()>;

    /// Force buffered records to stable storage.
    fn sync(&self) -> JournalResult<()>;

    /// Returns `true` if the journal holds no records.
    fn is_empty(&self) -> JournalResult<bool> {
        Ok(self.entries()?.is_empty())
    }

    /// Records belonging to a single transaction, in append order.
    fn entries_for(&self, txn: TxnId) -> JournalResult<Vec<JournalEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.txn_id == txn)
            .collect())
    }
}
