use std::collections::{BTreeSet, HashSet};

use blobdb_types::TxnId;
use tracing::{debug, info, warn};

use crate::compensation::{undone_lsns, CompensationEntry, LOG_COMPENSATION};
use crate::error::{JournalError, JournalResult};
use crate::loggable::JournalEntry;
use crate::traits::Journal;
use crate::txn::{is_marker, TxnMarker, LOG_TXN_ABORT, LOG_TXN_COMMIT};

/// Error type returned by recovery handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A subsystem able to replay its own journal records.
///
/// `redo` must be idempotent: recovery may be interrupted and run again over
/// the same journal. `undo` runs at most once per record because it leaves a
/// [`Compensation`](crate::Compensation) behind.
pub trait RecoveryHandler {
    /// Returns `true` if this handler owns records of `log_type`.
    fn handles(&self, log_type: u8) -> bool;

    /// Reapply the effect of a record.
    fn redo(&self, entry: &JournalEntry) -> Result<(), BoxError>;

    /// Revert the effect of a record from a transaction that will not commit.
    ///
    /// Implementations must append a [`Compensation`](crate::Compensation)
    /// for `entry` to `journal` before changing any state.
    fn undo(&self, entry: &JournalEntry, journal: &dyn Journal) -> Result<(), BoxError>;

    /// Called once the commit marker of `txn` is durable.
    fn committed(&self, _txn: TxnId) {}
}

/// Outcome of a [`recover`] run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub entries_scanned: usize,
    pub redone: usize,
    pub undone: usize,
    /// Records the handler does not own.
    pub skipped: usize,
    pub committed: usize,
    /// Transactions that had neither committed nor aborted.
    pub rolled_back: Vec<TxnId>,
}

/// Replay a journal through `handler`.
///
/// Every record is redone in log order whatever its transaction's outcome,
/// compensations included, which rebuilds the state as of the crash. The
/// records of unfinished transactions that have no compensation yet are then
/// undone newest-first. Each rolled-back transaction gets an abort marker.
pub fn recover(journal: &dyn Journal, handler: &dyn RecoveryHandler) -> JournalResult<RecoveryReport> {
    let entries = journal.entries()?;
    let mut report = RecoveryReport {
        entries_scanned: entries.len(),
        ..Default::default()
    };

    // Pass 1: classify transactions.
    let mut seen = BTreeSet::new();
    let mut committed = HashSet::new();
    let mut aborted = HashSet::new();
    for entry in &entries {
        seen.insert(entry.txn_id);
        match entry.log_type {
            LOG_TXN_COMMIT => {
                committed.insert(entry.txn_id);
            }
            LOG_TXN_ABORT => {
                aborted.insert(entry.txn_id);
            }
            _ => {}
        }
    }
    let unfinished: HashSet<TxnId> = seen
        .iter()
        .copied()
        .filter(|t| !committed.contains(t) && !aborted.contains(t))
        .collect();
    let undone = undone_lsns(&entries)?;
    report.committed = committed.len();
    debug!(
        transactions = seen.len(),
        committed = committed.len(),
        aborted = aborted.len(),
        unfinished = unfinished.len(),
        compensated = undone.len(),
        "journal analysis complete"
    );

    // Pass 2: repeat history.
    for entry in &entries {
        if is_marker(entry.log_type) {
            continue;
        }
        let compensating;
        let target = if entry.log_type == LOG_COMPENSATION {
            match CompensationEntry::decode(entry)?.redo {
                Some(redo) => {
                    compensating = redo;
                    &compensating
                }
                None => continue,
            }
        } else {
            entry
        };
        if !handler.handles(target.log_type) {
            report.skipped += 1;
            continue;
        }
        handler.redo(target).map_err(|source| JournalError::Handler {
            lsn: entry.lsn,
            source,
        })?;
        report.redone += 1;
    }

    // Pass 3: undo unfinished work newest-first.
    for entry in entries.iter().rev().filter(|e| unfinished.contains(&e.txn_id)) {
        if is_marker(entry.log_type)
            || entry.log_type == LOG_COMPENSATION
            || undone.contains(&entry.lsn)
            || !handler.handles(entry.log_type)
        {
            continue;
        }
        handler
            .undo(entry, journal)
            .map_err(|source| JournalError::Handler {
                lsn: entry.lsn,
                source,
            })?;
        report.undone += 1;
    }

    // Iterate the ordered set so markers go out in txn order.
    for txn in seen.iter().filter(|t| unfinished.contains(t)) {
        journal.append(&TxnMarker::abort(*txn))?;
        report.rolled_back.push(*txn);
    }
    if !report.rolled_back.is_empty() {
        warn!(count = report.rolled_back.len(), "rolled back unfinished transactions");
        journal.sync()?;
    }

    info!(
        scanned = report.entries_scanned,
        redone = report.redone,
        undone = report.undone,
        skipped = report.skipped,
        "journal recovery complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex;

    use super::*;
    use crate::compensation::Compensation;
    use crate::loggable::Loggable;
    use crate::memory::InMemoryJournal;

    const LOG_SET: u8 = 0x40;
    const LOG_FOREIGN: u8 = 0x41;

    /// Sets a register from `old` to `new`.
    struct Set {
        txn: TxnId,
        log_type: u8,
        old: u8,
        new: u8,
    }

    impl Loggable for Set {
        fn log_type(&self) -> u8 {
            self.log_type
        }
        fn transaction_id(&self) -> TxnId {
            self.txn
        }
        fn log_size(&self) -> usize {
            2
        }
        fn write(&self, out: &mut Vec<u8>) -> io::Result<()> {
            out.extend_from_slice(&[self.old, self.new]);
            Ok(())
        }
    }

    fn set(txn: u64, old: u8, new: u8) -> Set {
        Set {
            txn: TxnId::new(txn),
            log_type: LOG_SET,
            old,
            new,
        }
    }

    #[derive(Default)]
    struct Register {
        value: Mutex<u8>,
        fail: bool,
    }

    impl Register {
        fn get(&self) -> u8 {
            *self.value.lock().unwrap()
        }
    }

    impl RecoveryHandler for Register {
        fn handles(&self, log_type: u8) -> bool {
            log_type == LOG_SET
        }
        fn redo(&self, entry: &JournalEntry) -> Result<(), BoxError> {
            if self.fail {
                return Err("boom".into());
            }
            *self.value.lock().unwrap() = entry.body[1];
            Ok(())
        }
        fn undo(&self, entry: &JournalEntry, journal: &dyn Journal) -> Result<(), BoxError> {
            let mut value = self.value.lock().unwrap();
            let restore = Set {
                txn: entry.txn_id,
                log_type: LOG_SET,
                old: *value,
                new: entry.body[0],
            };
            journal.append(&Compensation::new(entry, &restore))?;
            *value = entry.body[0];
            Ok(())
        }
    }

    #[test]
    fn committed_work_is_redone() {
        let journal = InMemoryJournal::new();
        journal.append(&TxnMarker::start(TxnId::new(1))).unwrap();
        journal.append(&set(1, 0, 5)).unwrap();
        journal.append(&set(1, 5, 7)).unwrap();
        journal.append(&TxnMarker::commit(TxnId::new(1))).unwrap();

        let register = Register::default();
        let report = recover(&journal, &register).unwrap();
        assert_eq!(register.get(), 7);
        assert_eq!(report.redone, 2);
        assert_eq!(report.committed, 1);
        assert!(report.rolled_back.is_empty());
    }

    #[test]
    fn unfinished_work_is_undone_newest_first() {
        let journal = InMemoryJournal::new();
        journal.append(&TxnMarker::start(TxnId::new(1))).unwrap();
        journal.append(&set(1, 0, 3)).unwrap();
        journal.append(&TxnMarker::commit(TxnId::new(1))).unwrap();
        journal.append(&TxnMarker::start(TxnId::new(2))).unwrap();
        journal.append(&set(2, 3, 8)).unwrap();
        journal.append(&set(2, 8, 9)).unwrap();

        let register = Register::default();
        let report = recover(&journal, &register).unwrap();
        assert_eq!(register.get(), 3);
        assert_eq!(report.redone, 3);
        assert_eq!(report.undone, 2);
        assert_eq!(report.rolled_back, vec![TxnId::new(2)]);

        let undone: Vec<_> = journal
            .entries()
            .unwrap()
            .into_iter()
            .filter(|e| e.log_type == LOG_COMPENSATION)
            .map(|e| CompensationEntry::decode(&e).unwrap().undone.get())
            .collect();
        assert_eq!(undone, vec![5, 4]);
    }

    #[test]
    fn rolled_back_transactions_get_abort_marker() {
        let journal = InMemoryJournal::new();
        journal.append(&TxnMarker::start(TxnId::new(4))).unwrap();
        journal.append(&set(4, 0, 1)).unwrap();

        let register = Register::default();
        recover(&journal, &register).unwrap();
        let last = journal.entries().unwrap().pop().unwrap();
        assert_eq!(last.log_type, LOG_TXN_ABORT);
        assert_eq!(last.txn_id, TxnId::new(4));

        // A second run replays the write and its compensation, nothing more.
        *register.value.lock().unwrap() = 42;
        let again = recover(&journal, &register).unwrap();
        assert_eq!(again.undone, 0);
        assert_eq!(again.redone, 2);
        assert!(again.rolled_back.is_empty());
        assert_eq!(register.get(), 0);
    }

    #[test]
    fn aborted_transactions_replay_their_compensations() {
        let journal = InMemoryJournal::new();
        journal.append(&TxnMarker::start(TxnId::new(1))).unwrap();
        let lsn = journal.append(&set(1, 0, 5)).unwrap();
        let written = journal.entries().unwrap().into_iter().find(|e| e.lsn == lsn).unwrap();
        journal
            .append(&Compensation::new(&written, &set(1, 5, 0)))
            .unwrap();
        journal.append(&TxnMarker::abort(TxnId::new(1))).unwrap();

        let register = Register::default();
        let report = recover(&journal, &register).unwrap();
        assert_eq!(report.undone, 0);
        assert_eq!(report.redone, 2);
        assert_eq!(register.get(), 0);
    }

    #[test]
    fn compensated_records_are_not_undone_again() {
        // Interrupted abort: the newest record was already compensated.
        let journal = InMemoryJournal::new();
        journal.append(&set(2, 0, 3)).unwrap();
        let lsn = journal.append(&set(2, 3, 4)).unwrap();
        let written = journal.entries().unwrap().into_iter().find(|e| e.lsn == lsn).unwrap();
        journal
            .append(&Compensation::new(&written, &set(2, 4, 3)))
            .unwrap();

        let register = Register::default();
        let report = recover(&journal, &register).unwrap();
        assert_eq!(report.undone, 1);
        assert_eq!(register.get(), 0);
        assert_eq!(report.rolled_back, vec![TxnId::new(2)]);
    }

    #[test]
    fn empty_compensations_redo_nothing() {
        let journal = InMemoryJournal::new();
        let lsn = journal.append(&set(1, 0, 2)).unwrap();
        let written = journal.entries().unwrap().into_iter().find(|e| e.lsn == lsn).unwrap();
        journal.append(&Compensation::empty(&written)).unwrap();
        journal.append(&TxnMarker::abort(TxnId::new(1))).unwrap();

        let register = Register::default();
        let report = recover(&journal, &register).unwrap();
        assert_eq!(report.redone, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(register.get(), 2);
    }

    #[test]
    fn recovery_is_idempotent_for_committed_work() {
        let journal = InMemoryJournal::new();
        journal.append(&set(1, 0, 5)).unwrap();
        journal.append(&TxnMarker::commit(TxnId::new(1))).unwrap();

        let register = Register::default();
        recover(&journal, &register).unwrap();
        recover(&journal, &register).unwrap();
        assert_eq!(register.get(), 5);
    }

    #[test]
    fn foreign_records_are_skipped() {
        let journal = InMemoryJournal::new();
        journal
            .append(&Set {
                txn: TxnId::new(1),
                log_type: LOG_FOREIGN,
                old: 0,
                new: 1,
            })
            .unwrap();
        journal.append(&TxnMarker::commit(TxnId::new(1))).unwrap();

        let register = Register::default();
        let report = recover(&journal, &register).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.redone, 0);
    }

    #[test]
    fn handler_failure_is_fatal() {
        let journal = InMemoryJournal::new();
        journal.append(&set(1, 0, 5)).unwrap();
        journal.append(&TxnMarker::commit(TxnId::new(1))).unwrap();

        let register = Register {
            fail: true,
            ..Default::default()
        };
        let err = recover(&journal, &register).unwrap_err();
        assert!(matches!(err, JournalError::Handler { .. }));
    }

    #[test]
    fn empty_journal_recovers_trivially() {
        let journal = InMemoryJournal::new();
        let report = recover(&journal, &Register::default()).unwrap();
        assert_eq!(report, RecoveryReport::default());
    }
}
