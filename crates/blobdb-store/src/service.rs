use std::sync::Arc;

use blobdb_journal::{
    recover, FileJournal, Journal, JournalConfig, RecoveryReport, TransactionManager, Txn,
};
use tracing::{info, warn};

use crate::config::BlobStoreConfig;
use crate::error::StoreResult;
use crate::store::BlobStore;

/// A blob store wired to its journal and transaction manager.
///
/// Startup replays a non-empty journal before the store is handed out; a
/// clean [`shutdown`](Self::shutdown) checkpoints the journal so the next
/// start has nothing to replay.
pub struct BlobStoreService {
    store: Arc<BlobStore>,
    journal: Arc<FileJournal>,
    transactions: TransactionManager,
    recovery: Option<RecoveryReport>,
}

impl BlobStoreService {
    pub fn start(config: BlobStoreConfig, journal_config: JournalConfig) -> StoreResult<Self> {
        let journal = Arc::new(FileJournal::open(&config.journal_file(), journal_config)?);
        let dyn_journal: Arc<dyn Journal> = journal.clone();

        let (store, recovery) = if journal.is_empty()? {
            (BlobStore::open(config, dyn_journal.clone())?, None)
        } else {
            info!(path = %journal.path().display(), "journal not empty, running recovery");
            let store = BlobStore::open_for_recovery(config, dyn_journal.clone())?;
            let report = recover(&*journal, &store)?;
            store.finish_recovery()?;
            store.sync()?;
            journal.truncate()?;
            (store, Some(report))
        };

        let transactions = TransactionManager::new(dyn_journal)?;
        Ok(Self {
            store: Arc::new(store),
            journal,
            transactions,
            recovery,
        })
    }

    pub fn store(&self) -> &Arc<BlobStore> {
        &self.store
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Report of the recovery run at startup, if one was needed.
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    pub fn begin(&self) -> StoreResult<Txn> {
        Ok(self.transactions.begin()?)
    }

    pub fn commit(&self, txn: Txn) -> StoreResult<()> {
        Ok(self.transactions.commit(txn, &*self.store)?)
    }

    /// Abort a transaction, undoing its store mutations.
    pub fn abort(&self, txn: Txn) -> StoreResult<()> {
        Ok(self.transactions.abort(txn, &*self.store)?)
    }

    /// Flush everything and checkpoint the journal if no transaction is open.
    ///
    /// The metadata file is synced before the journal is truncated, even when
    /// other handles to the store are still alive.
    pub fn shutdown(self) -> StoreResult<()> {
        self.store.sync()?;
        let active = self.transactions.active_count();
        if active == 0 {
            self.journal.truncate()?;
        } else {
            warn!(active, "shutting down with open transactions; journal kept for recovery");
        }
        match Arc::try_unwrap(self.store) {
            Ok(store) => store.close()?,
            Err(_) => self.journal.sync()?,
        }
        info!("blob store service stopped");
        Ok(())
    }
}

impl std::fmt::Debug for BlobStoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStoreService")
            .field("store", &self.store)
            .field("transactions", &self.transactions)
            .field("recovered", &self.recovery.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use blobdb_journal::SyncMode;

    use super::*;

    #[test]
    fn fresh_start_needs_no_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let service =
            BlobStoreService::start(BlobStoreConfig::new(dir.path()), JournalConfig::default())
                .unwrap();
        assert!(service.recovery_report().is_none());
        assert!(dir.path().join("blob.dbx").exists());
        service.shutdown().unwrap();
    }

    #[test]
    fn clean_shutdown_checkpoints_journal() {
        let dir = tempfile::tempdir().unwrap();
        let config = BlobStoreConfig::new(dir.path());
        let id = {
            let service = BlobStoreService::start(config.clone(), JournalConfig::default()).unwrap();
            let txn = service.begin().unwrap();
            let (id, _) = service.store().add(&txn, &b"kept"[..]).unwrap();
            service.commit(txn).unwrap();
            service.shutdown().unwrap();
            id
        };

        let service = BlobStoreService::start(config, JournalConfig::default()).unwrap();
        assert!(service.recovery_report().is_none());
        assert_eq!(service.store().ref_count(&id), Some(1));
    }

    #[test]
    fn shutdown_with_shared_store_keeps_committed_counts() {
        let dir = tempfile::tempdir().unwrap();
        let config = BlobStoreConfig {
            sync_mode: SyncMode::OsDefault,
            ..BlobStoreConfig::new(dir.path())
        };
        let id = {
            let service = BlobStoreService::start(config.clone(), JournalConfig::default()).unwrap();
            let shared = Arc::clone(service.store());
            let txn = service.begin().unwrap();
            let (id, _) = shared.add(&txn, &b"shared handle"[..]).unwrap();
            service.commit(txn).unwrap();
            service.shutdown().unwrap();
            assert_eq!(shared.ref_count(&id), Some(1));
            id
        };
        assert_eq!(std::fs::metadata(config.journal_file()).unwrap().len(), 0);

        let service = BlobStoreService::start(config, JournalConfig::default()).unwrap();
        assert!(service.recovery_report().is_none());
        assert_eq!(service.store().ref_count(&id), Some(1));
    }

    #[test]
    fn aborted_removal_through_service_keeps_blob() {
        let dir = tempfile::tempdir().unwrap();
        let service =
            BlobStoreService::start(BlobStoreConfig::new(dir.path()), JournalConfig::default())
                .unwrap();
        let t1 = service.begin().unwrap();
        let (id, _) = service.store().add(&t1, &b"stays"[..]).unwrap();
        service.commit(t1).unwrap();

        let t2 = service.begin().unwrap();
        service.store().remove(&t2, &id).unwrap();
        service.abort(t2).unwrap();

        let t3 = service.begin().unwrap();
        assert!(service.store().get(&t3, &id).unwrap().is_some());
        service.commit(t3).unwrap();
        service.shutdown().unwrap();
    }

    #[test]
    fn abort_through_service() {
        let dir = tempfile::tempdir().unwrap();
        let service =
            BlobStoreService::start(BlobStoreConfig::new(dir.path()), JournalConfig::default())
                .unwrap();
        let txn = service.begin().unwrap();
        let (id, _) = service.store().add(&txn, &b"gone"[..]).unwrap();
        service.abort(txn).unwrap();
        assert_eq!(service.store().ref_count(&id), None);
    }

    #[test]
    fn crash_with_open_transaction_is_rolled_back_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let config = BlobStoreConfig::new(dir.path());
        let (kept, lost) = {
            let service = BlobStoreService::start(config.clone(), JournalConfig::default()).unwrap();
            let t1 = service.begin().unwrap();
            let (kept, _) = service.store().add(&t1, &b"committed"[..]).unwrap();
            service.commit(t1).unwrap();
            let t2 = service.begin().unwrap();
            let (lost, _) = service.store().add(&t2, &b"in flight"[..]).unwrap();
            // Simulate a crash: no commit, no shutdown.
            std::mem::forget(t2);
            (kept, lost)
        };

        let service = BlobStoreService::start(config.clone(), JournalConfig::default()).unwrap();
        let report = service.recovery_report().unwrap();
        assert_eq!(report.rolled_back.len(), 1);
        assert_eq!(service.store().ref_count(&kept), Some(1));
        assert_eq!(service.store().ref_count(&lost), None);
        assert!(!service.store().payload_path(&lost).exists());
        assert!(std::fs::metadata(config.journal_file()).unwrap().len() == 0);
    }
}
