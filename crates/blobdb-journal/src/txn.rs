use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use blobdb_types::TxnId;
use tracing::{debug, info};

use crate::compensation::{undone_lsns, LOG_COMPENSATION};
use crate::error::{JournalError, JournalResult};
use crate::loggable::Loggable;
use crate::recovery::RecoveryHandler;
use crate::traits::Journal;

/// Log type of the record opening a transaction.
pub const LOG_TXN_START: u8 = 0x01;
/// Log type of the record committing a transaction.
pub const LOG_TXN_COMMIT: u8 = 0x02;
/// Log type of the record closing an aborted transaction.
pub const LOG_TXN_ABORT: u8 = 0x03;

/// Returns `true` for the journal's own transaction marker types.
pub fn is_marker(log_type: u8) -> bool {
    matches!(log_type, LOG_TXN_START | LOG_TXN_COMMIT | LOG_TXN_ABORT)
}

/// Body-less record marking a transaction boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxnMarker {
    log_type: u8,
    txn: TxnId,
}

impl TxnMarker {
    pub fn start(txn: TxnId) -> Self {
        Self {
            log_type: LOG_TXN_START,
            txn,
        }
    }

    pub fn commit(txn: TxnId) -> Self {
        Self {
            log_type: LOG_TXN_COMMIT,
            txn,
        }
    }

    pub fn abort(txn: TxnId) -> Self {
        Self {
            log_type: LOG_TXN_ABORT,
            txn,
        }
    }
}

impl Loggable for TxnMarker {
    fn log_type(&self) -> u8 {
        self.log_type
    }

    fn transaction_id(&self) -> TxnId {
        self.txn
    }

    fn log_size(&self) -> usize {
        0
    }

    fn write(&self, _out: &mut Vec<u8>) -> io::Result<()> {
        Ok(())
    }
}

/// Handle on an open transaction.
///
/// Consumed by [`TransactionManager::commit`] or
/// [`TransactionManager::abort`], so a transaction cannot be finished twice.
#[derive(Debug, PartialEq, Eq)]
pub struct Txn {
    id: TxnId,
}

impl Txn {
    /// Wrap an id allocated elsewhere (for embedders with their own
    /// transaction manager).
    pub fn new(id: TxnId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }
}

/// Minimal transaction manager over a [`Journal`].
///
/// Allocates transaction ids and writes the start/commit/abort markers that
/// recovery uses to decide which records to redo and which to undo.
pub struct TransactionManager {
    journal: Arc<dyn Journal>,
    next_id: AtomicU64,
    active: Mutex<HashSet<TxnId>>,
}

impl TransactionManager {
    /// Create a manager whose ids continue after any already in the journal.
    pub fn new(journal: Arc<dyn Journal>) -> JournalResult<Self> {
        let last = journal
            .entries()?
            .iter()
            .map(|e| e.txn_id.get())
            .max()
            .unwrap_or(0);
        Ok(Self {
            journal,
            next_id: AtomicU64::new(last + 1),
            active: Mutex::new(HashSet::new()),
        })
    }

    /// The journal this manager writes to.
    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    /// Begin a new transaction.
    pub fn begin(&self) -> JournalResult<Txn> {
        let id = TxnId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.journal.append(&TxnMarker::start(id))?;
        self.active.lock().expect("txn mutex poisoned").insert(id);
        debug!(txn = %id, "transaction started");
        Ok(Txn { id })
    }

    /// Commit a transaction, making its records durable, then tell
    /// `handler` so it can release what the transaction gave up.
    pub fn commit(&self, txn: Txn, handler: &dyn RecoveryHandler) -> JournalResult<()> {
        self.finish(txn.id)?;
        self.journal.append(&TxnMarker::commit(txn.id))?;
        self.journal.sync()?;
        debug!(txn = %txn.id, "transaction committed");
        handler.committed(txn.id);
        Ok(())
    }

    /// Abort a transaction, undoing its records newest-first.
    ///
    /// Records that already have a compensation are left alone.
    pub fn abort(&self, txn: Txn, handler: &dyn RecoveryHandler) -> JournalResult<()> {
        self.finish(txn.id)?;
        let entries = self.journal.entries_for(txn.id)?;
        let undone_before = undone_lsns(&entries)?;
        let mut undone = 0usize;
        for entry in entries.iter().rev() {
            if is_marker(entry.log_type)
                || entry.log_type == LOG_COMPENSATION
                || undone_before.contains(&entry.lsn)
                || !handler.handles(entry.log_type)
            {
                continue;
            }
            handler
                .undo(entry, &*self.journal)
                .map_err(|source| JournalError::Handler {
                    lsn: entry.lsn,
                    source,
                })?;
            undone += 1;
        }
        self.journal.append(&TxnMarker::abort(txn.id))?;
        self.journal.sync()?;
        info!(txn = %txn.id, undone, "transaction aborted");
        Ok(())
    }

    /// Number of transactions begun but not yet finished.
    pub fn active_count(&self) -> usize {
        self.active.lock().expect("txn mutex poisoned").len()
    }

    fn finish(&self, id: TxnId) -> JournalResult<()> {
        if !self.active.lock().expect("txn mutex poisoned").remove(&id) {
            return Err(JournalError::UnknownTransaction(id));
        }
        Ok(())
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .field("active", &self.active_count())
            .finish()
    }
}
