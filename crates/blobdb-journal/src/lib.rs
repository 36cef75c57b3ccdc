//! Write-ahead journal for blobdb.
//!
//! Subsystems describe each mutation as a [`Loggable`] record and append it to
//! a [`Journal`] *before* touching their persistent files. Undoing a record
//! appends a [`Compensation`], so every state change is in the log. After a
//! crash, [`recover`] replays the journal through the owning subsystem's
//! [`RecoveryHandler`]: every record is redone in log order, then the
//! uncompensated records of unfinished transactions are undone newest-first.
//!
//! The journal never interprets the bodies of subsystem records; it only
//! frames them, checksums them and groups them by transaction.

pub mod compensation;
pub mod config;
pub mod error;
pub mod file;
pub mod loggable;
pub mod memory;
pub mod recovery;
pub mod traits;
pub mod txn;

pub use compensation::{Compensation, CompensationEntry, LOG_COMPENSATION};
pub use config::{JournalConfig, SyncMode};
pub use error::{JournalError, JournalResult};
pub use file::FileJournal;
pub use loggable::{JournalEntry, Loggable, Lsn};
pub use memory::InMemoryJournal;
pub use recovery::{recover, BoxError, RecoveryHandler, RecoveryReport};
pub use traits::Journal;
pub use txn::{TransactionManager, Txn, TxnMarker, LOG_TXN_ABORT, LOG_TXN_COMMIT, LOG_TXN_START};
