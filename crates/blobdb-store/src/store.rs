use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use blobdb_crypto::{DigestType, DigestingReader, DigestingWriter, MessageDigest};
use blobdb_journal::{
    BoxError, Compensation, Journal, JournalEntry, RecoveryHandler, SyncMode, Txn,
};
use blobdb_types::{BlobId, TxnId};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::backup::RawDataBackup;
use crate::config::{BlobStoreConfig, ReclaimPolicy, BLOB_DIR_NAME, PERSISTENT_FILE_NAME};
use crate::error::{StoreError, StoreResult};
use crate::index::{IndexEntry, RefCountIndex};
use crate::loggable::BlobLoggable;
use crate::metadata::{MetadataRecord, PersistentFile};

/// Summary of the store's contents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub live_blobs: usize,
    pub tombstones: usize,
    pub total_references: u64,
}

/// Result of a [`BlobStore::vacuum`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VacuumReport {
    /// Payloads of tombstoned records that were deleted.
    pub payloads_removed: usize,
    /// Payload files with no metadata record that were deleted.
    pub orphans_removed: usize,
    /// Tombstoned payloads left alone because they are pinned or their
    /// removal has not committed yet.
    pub in_use_skipped: usize,
}

/// Result of a [`BlobStore::backup_to_archive`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BackupReport {
    pub payloads: usize,
    pub bytes: u64,
}

struct StoreState {
    file: PersistentFile,
    index: RefCountIndex,
    /// Blobs whose count dropped to zero in a transaction that has not
    /// committed yet. Their payloads must survive a possible abort.
    pending: HashMap<TxnId, Vec<BlobId>>,
}

impl StoreState {
    fn is_pending(&self, blob_id: &BlobId) -> bool {
        self.pending.values().any(|ids| ids.contains(blob_id))
    }

    /// Pinned by a reader or awaiting the commit of its removal.
    fn in_use(&self, blob_id: &BlobId) -> bool {
        self.index.is_pinned(blob_id) || self.is_pending(blob_id)
    }

    fn drop_pending(&mut self, txn: TxnId, blob_id: &BlobId) {
        if let Some(ids) = self.pending.get_mut(&txn) {
            ids.retain(|id| id != blob_id);
            if ids.is_empty() {
                self.pending.remove(&txn);
            }
        }
    }
}

/// A payload written to the staging directory and digested.
struct Staged {
    uuid: String,
    path: PathBuf,
    blob_id: BlobId,
    size: u64,
}

/// De-duplicating, content-addressed BLOB store.
///
/// Payloads are stored once per distinct digest under
/// `<data_dir>/blob/<hex[..2]>/<hex>` and reference counted in `blob.dbx`.
/// Every count change is journaled before the metadata file is touched, and
/// [`RecoveryHandler`] replays those records after a crash.
///
/// Staging and digesting happen outside the store lock; the index and the
/// metadata file are only mutated while it is held.
pub struct BlobStore {
    config: BlobStoreConfig,
    journal: Arc<dyn Journal>,
    state: Mutex<StoreState>,
}

impl BlobStore {
    /// Open (or create) a store. Leftover staging files are discarded.
    pub fn open(config: BlobStoreConfig, journal: Arc<dyn Journal>) -> StoreResult<Self> {
        let store = Self::open_with(config, journal, false)?;
        store.purge_staging()?;
        Ok(store)
    }

    /// Open an existing store for journal replay.
    ///
    /// Staging files are kept because redoing a `StoreBlobFile` record may
    /// need them; call [`finish_recovery`](Self::finish_recovery) afterwards.
    pub fn open_for_recovery(config: BlobStoreConfig, journal: Arc<dyn Journal>) -> StoreResult<Self> {
        Self::open_with(config, journal, true)
    }

    fn open_with(config: BlobStoreConfig, journal: Arc<dyn Journal>, recovery: bool) -> StoreResult<Self> {
        let path = config.persistent_file();
        let (file, records) = if recovery {
            PersistentFile::open_for_recovery(&path, config.digest_type, config.sync_mode)?
        } else {
            fs::create_dir_all(&config.data_dir)?;
            PersistentFile::open(&path, config.digest_type, config.sync_mode)?
        };

        let staging = config.staging_dir();
        fs::create_dir_all(&staging)?;
        check_writable(&staging)?;

        if config.verify_digest_on_open {
            verify_digest(&config, &records)?;
        }

        let index = RefCountIndex::from_records(records);
        info!(
            path = %path.display(),
            digest = %config.digest_type,
            records = index.len(),
            recovery,
            "blob store opened"
        );
        Ok(Self {
            config,
            journal,
            state: Mutex::new(StoreState {
                file,
                index,
                pending: HashMap::new(),
            }),
        })
    }

    /// Reclaim payloads whose count ended at zero and discard staging files
    /// left behind by replay. Returns how many staging files were removed.
    pub fn finish_recovery(&self) -> StoreResult<usize> {
        let reclaimed = self.reclaim_tombstones()?;
        if reclaimed > 0 {
            info!(reclaimed, "reclaimed unreferenced payloads after replay");
        }
        self.purge_staging()
    }

    pub fn config(&self) -> &BlobStoreConfig {
        &self.config
    }

    pub fn digest_type(&self) -> DigestType {
        self.config.digest_type
    }

    /// Location of a payload file, whether or not it exists.
    pub fn payload_path(&self, blob_id: &BlobId) -> PathBuf {
        payload_path_in(&self.config.blob_dir(), blob_id)
    }

    /// Current reference count; `None` if unknown or tombstoned.
    pub fn ref_count(&self, blob_id: &BlobId) -> Option<u32> {
        self.lock().index.live_count(blob_id)
    }

    /// Store a payload, returning its id and size.
    ///
    /// Identical content is stored once: adding it again only increments the
    /// reference count.
    #[instrument(skip_all, fields(txn = %txn.id()), level = "debug")]
    pub fn add<R: Read>(&self, txn: &Txn, data: R) -> StoreResult<(BlobId, u64)> {
        let staged = self.stage(data)?;

        let mut state = self.lock();
        if let Err(e) = self.add_staged(&mut state, txn.id(), &staged) {
            drop(state);
            if let Err(cleanup) = remove_if_exists(&staged.path) {
                warn!(path = %staged.path.display(), error = %cleanup, "failed to discard staging file");
            }
            return Err(e);
        }

        debug!(blob_id = %staged.blob_id, size = staged.size, "blob added");
        Ok((staged.blob_id, staged.size))
    }

    fn stage<R: Read>(&self, mut data: R) -> StoreResult<Staged> {
        let uuid = Uuid::now_v7().to_string();
        let path = self.config.staging_dir().join(&uuid);

        match write_staged(&path, &mut data, self.config.digest_type, self.config.sync_mode) {
            Ok((digest, size)) => Ok(Staged {
                uuid,
                path,
                blob_id: digest.into_blob_id(),
                size,
            }),
            Err(e) => {
                if let Err(cleanup) = remove_if_exists(&path) {
                    warn!(path = %path.display(), error = %cleanup, "failed to discard staging file");
                }
                Err(e)
            }
        }
    }

    fn add_staged(&self, state: &mut StoreState, txn: TxnId, staged: &Staged) -> StoreResult<()> {
        let blob_id = &staged.blob_id;
        let current = state.index.get(blob_id).map(|e| e.count).unwrap_or(0);
        let new = current
            .checked_add(1)
            .ok_or_else(|| StoreError::RefCountOverflow(blob_id.clone()))?;

        let payload = self.payload_path(blob_id);
        if current == 0 && !payload.exists() {
            self.journal.append(&BlobLoggable::StoreBlobFile {
                txn,
                blob_id: blob_id.clone(),
                staged_uuid: staged.uuid.clone(),
            })?;
            promote(&staged.path, &payload)?;
        } else {
            remove_if_exists(&staged.path)?;
        }

        self.log_count_change(state, txn, blob_id, current, new)
    }

    /// Add another reference to an existing blob without re-reading it.
    ///
    /// Returns `None` if the blob is unknown.
    #[instrument(skip_all, fields(txn = %txn.id(), blob_id = %blob_id), level = "debug")]
    pub fn copy(&self, txn: &Txn, blob_id: &BlobId) -> StoreResult<Option<BlobId>> {
        let mut state = self.lock();
        let Some(current) = state.index.live_count(blob_id) else {
            return Ok(None);
        };
        let new = current
            .checked_add(1)
            .ok_or_else(|| StoreError::RefCountOverflow(blob_id.clone()))?;
        self.log_count_change(&mut state, txn.id(), blob_id, current, new)?;
        Ok(Some(blob_id.clone()))
    }

    /// Open a payload for reading. The caller owns the returned file.
    #[instrument(skip_all, fields(txn = %txn.id(), blob_id = %blob_id), level = "debug")]
    pub fn get(&self, txn: &Txn, blob_id: &BlobId) -> StoreResult<Option<File>> {
        let state = self.lock();
        if state.index.live_count(blob_id).is_none() {
            return Ok(None);
        }
        // Opened under the lock so a concurrent removal cannot delete the
        // file between the check and the open.
        match File::open(self.payload_path(blob_id)) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(blob_id = %blob_id, "payload missing for referenced blob");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Digest a payload with an arbitrary algorithm. Identity is unaffected.
    pub fn get_digest(
        &self,
        txn: &Txn,
        blob_id: &BlobId,
        digest_type: DigestType,
    ) -> StoreResult<Option<MessageDigest>> {
        let Some(file) = self.get(txn, blob_id)? else {
            return Ok(None);
        };
        let (digest, _) = DigestingReader::new(BufReader::new(file), digest_type).digest_to_end()?;
        Ok(Some(digest))
    }

    /// Run `f` with the filesystem path of a payload.
    ///
    /// The payload is pinned until `f` returns, so a removal in the meantime
    /// defers its deletion. `f` must treat the file as read-only; writing to
    /// it corrupts the store. Returns `None` if the blob is unknown.
    pub fn with<T>(&self, txn: &Txn, blob_id: &BlobId, f: impl FnOnce(&Path) -> T) -> StoreResult<Option<T>> {
        let path = self.payload_path(blob_id);
        {
            let mut state = self.lock();
            if state.index.live_count(blob_id).is_none() || !path.exists() {
                return Ok(None);
            }
            state.index.pin(blob_id);
        }
        debug!(txn = %txn.id(), blob_id = %blob_id, "payload pinned");
        let _pin = PinGuard {
            store: self,
            blob_id: blob_id.clone(),
        };
        Ok(Some(f(&path)))
    }

    /// Drop one reference. Unknown ids are ignored.
    ///
    /// When the last reference goes, the payload is kept until `txn`
    /// commits, so an abort can bring the blob back.
    #[instrument(skip_all, fields(txn = %txn.id(), blob_id = %blob_id), level = "debug")]
    pub fn remove(&self, txn: &Txn, blob_id: &BlobId) -> StoreResult<()> {
        let mut state = self.lock();
        let Some(current) = state.index.live_count(blob_id) else {
            debug!("remove of unknown blob ignored");
            return Ok(());
        };
        let new = current - 1;
        self.log_count_change(&mut state, txn.id(), blob_id, current, new)?;
        if new == 0 {
            state.pending.entry(txn.id()).or_default().push(blob_id.clone());
        }
        Ok(())
    }

    /// Delete payloads that are no longer referenced.
    ///
    /// Covers tombstoned records (left behind under
    /// [`ReclaimPolicy::Deferred`] or while pinned) and payload files with no
    /// record at all. Tombstones whose removal has not committed are skipped.
    pub fn vacuum(&self) -> StoreResult<VacuumReport> {
        let state = self.lock();
        let mut report = VacuumReport::default();

        for blob_id in state.index.tombstones() {
            if state.in_use(&blob_id) {
                report.in_use_skipped += 1;
                continue;
            }
            if remove_if_exists(&self.payload_path(&blob_id))? {
                report.payloads_removed += 1;
            }
        }

        let staging = self.config.staging_dir();
        let digest_len = self.config.digest_type.digest_length_bytes();
        for entry in WalkDir::new(self.config.blob_dir()).min_depth(2).max_depth(2) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() || entry.path().starts_with(&staging) {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let Ok(blob_id) = BlobId::from_hex_with_len(&name, digest_len) else {
                warn!(path = %entry.path().display(), "unexpected file in blob directory");
                continue;
            };
            if state.index.contains(&blob_id) || state.in_use(&blob_id) {
                continue;
            }
            fs::remove_file(entry.path())?;
            report.orphans_removed += 1;
        }

        info!(
            payloads_removed = report.payloads_removed,
            orphans_removed = report.orphans_removed,
            in_use_skipped = report.in_use_skipped,
            "vacuum complete"
        );
        Ok(report)
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.lock();
        let mut stats = StoreStats::default();
        for (_, entry) in state.index.iter() {
            if entry.count == 0 {
                stats.tombstones += 1;
            } else {
                stats.live_blobs += 1;
                stats.total_references += u64::from(entry.count);
            }
        }
        stats
    }

    /// Stream `blob.dbx` and every live payload into `backup`.
    ///
    /// The metadata file and the live id list are captured together under
    /// the lock; payloads are then streamed without it while pinned.
    #[instrument(skip_all, level = "debug")]
    pub fn backup_to_archive(&self, backup: &mut dyn RawDataBackup) -> StoreResult<BackupReport> {
        let (snapshot, mut ids) = {
            let mut state = self.lock();
            let snapshot = state.file.snapshot()?;
            let ids = state.index.live_ids();
            for blob_id in &ids {
                state.index.pin(blob_id);
            }
            (snapshot, ids)
        };
        let _pins: Vec<PinGuard<'_>> = ids
            .iter()
            .map(|blob_id| PinGuard {
                store: self,
                blob_id: blob_id.clone(),
            })
            .collect();
        ids.sort();

        let mut report = BackupReport {
            payloads: 0,
            bytes: snapshot.len() as u64,
        };
        backup.write_entry(PERSISTENT_FILE_NAME, snapshot.len() as u64, &mut snapshot.as_slice())?;

        for blob_id in &ids {
            let mut file = match File::open(self.payload_path(blob_id)) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(blob_id = %blob_id, "payload missing during backup");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let size = file.metadata()?.len();
            backup.write_entry(&archive_name(blob_id), size, &mut file)?;
            report.payloads += 1;
            report.bytes += size;
        }

        info!(payloads = report.payloads, bytes = report.bytes, "backup complete");
        Ok(report)
    }

    /// Reapply a journal record. Safe to repeat.
    ///
    /// Payloads left unreferenced by replay are deleted by
    /// [`finish_recovery`](Self::finish_recovery), once the outcome of every
    /// transaction is known.
    pub fn redo(&self, record: &BlobLoggable) -> StoreResult<()> {
        let mut state = self.lock();
        match record {
            BlobLoggable::StoreBlobFile {
                blob_id,
                staged_uuid,
                ..
            } => {
                let payload = self.payload_path(blob_id);
                if payload.exists() {
                    return Ok(());
                }
                let staged = self.config.staging_dir().join(staged_uuid);
                if staged.exists() {
                    promote(&staged, &payload)?;
                    debug!(blob_id = %blob_id, "redo: payload promoted from staging");
                } else {
                    warn!(blob_id = %blob_id, uuid = %staged_uuid, "redo: staged payload is gone");
                }
            }
            BlobLoggable::UpdateBlobRefCount {
                blob_id, new_count, ..
            } => {
                self.set_count(&mut state, blob_id, *new_count)?;
            }
        }
        Ok(())
    }

    /// Compensate for a journal record. Safe to repeat.
    ///
    /// A count change is taken back by its delta, so references added by
    /// other transactions in the meantime survive. If the count already reads
    /// `current_count` the record is treated as undone. A payload is only
    /// deleted once nothing references it.
    pub fn undo(&self, record: &BlobLoggable) -> StoreResult<()> {
        self.compensate(record, None)
    }

    /// Undo `record`, logging the compensation to `log` when given.
    ///
    /// Journal-driven undo runs once per record, so it applies the delta
    /// unconditionally; the standalone form guards against repeats instead.
    fn compensate(
        &self,
        record: &BlobLoggable,
        log: Option<(&dyn Journal, &JournalEntry)>,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        match record {
            BlobLoggable::StoreBlobFile { blob_id, .. } => {
                if let Some((journal, entry)) = log {
                    journal.append(&Compensation::empty(entry))?;
                }
                if let Some(count) = state.index.live_count(blob_id) {
                    debug!(blob_id = %blob_id, count, "undo: payload still referenced");
                } else if state.in_use(blob_id) {
                    warn!(blob_id = %blob_id, "undo: payload in use, leaving it for vacuum");
                } else {
                    remove_if_exists(&self.payload_path(blob_id))?;
                }
            }
            BlobLoggable::UpdateBlobRefCount {
                txn,
                blob_id,
                current_count,
                new_count,
            } => {
                if *new_count == 0 {
                    state.drop_pending(*txn, blob_id);
                }
                let live = state.index.live_count(blob_id).unwrap_or(0);
                let target = if log.is_none() && live == *current_count {
                    live
                } else {
                    compensated_count(live, *current_count, *new_count)
                };
                if let Some((journal, entry)) = log {
                    let restore = BlobLoggable::UpdateBlobRefCount {
                        txn: *txn,
                        blob_id: blob_id.clone(),
                        current_count: live,
                        new_count: target,
                    };
                    journal.append(&Compensation::new(entry, &restore))?;
                }
                if target != live {
                    self.set_count(&mut state, blob_id, target)?;
                    debug!(blob_id = %blob_id, from = live, to = target, "undo: count restored");
                }
                if target == 0 {
                    self.reclaim(&mut state, blob_id)?;
                }
            }
        }
        Ok(())
    }

    /// Flush the metadata file.
    pub fn sync(&self) -> StoreResult<()> {
        self.lock().file.sync()
    }

    /// Flush the metadata file and the journal.
    pub fn close(self) -> StoreResult<()> {
        self.lock().file.sync()?;
        self.journal.sync()?;
        debug!("blob store closed");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().expect("blob store mutex poisoned")
    }

    fn log_count_change(
        &self,
        state: &mut StoreState,
        txn: TxnId,
        blob_id: &BlobId,
        current_count: u32,
        new_count: u32,
    ) -> StoreResult<()> {
        self.journal.append(&BlobLoggable::UpdateBlobRefCount {
            txn,
            blob_id: blob_id.clone(),
            current_count,
            new_count,
        })?;
        self.set_count(state, blob_id, new_count)
    }

    /// Write `count` for `blob_id`, appending a record if there is none.
    fn set_count(&self, state: &mut StoreState, blob_id: &BlobId, count: u32) -> StoreResult<()> {
        match state.index.get(blob_id) {
            Some(entry) if entry.count == count => {}
            Some(entry) => {
                state.file.write_count(entry.offset, count)?;
                state.index.set_count(blob_id, count);
            }
            None => {
                let offset = state.file.append(blob_id, count)?;
                state.index.insert(blob_id.clone(), IndexEntry { offset, count });
            }
        }
        Ok(())
    }

    /// Delete an unreferenced payload if the policy allows it now.
    fn reclaim(&self, state: &mut StoreState, blob_id: &BlobId) -> StoreResult<()> {
        if self.config.reclaim != ReclaimPolicy::Immediate
            || state.index.live_count(blob_id).is_some()
            || state.in_use(blob_id)
        {
            return Ok(());
        }
        if remove_if_exists(&self.payload_path(blob_id))? {
            debug!(blob_id = %blob_id, "payload reclaimed");
        }
        Ok(())
    }

    fn reclaim_committed(&self, txn: TxnId) {
        let mut state = self.lock();
        let Some(ids) = state.pending.remove(&txn) else {
            return;
        };
        for blob_id in ids {
            if let Err(e) = self.reclaim(&mut state, &blob_id) {
                warn!(blob_id = %blob_id, error = %e, "failed to reclaim payload after commit");
            }
        }
    }

    fn reclaim_tombstones(&self) -> StoreResult<usize> {
        if self.config.reclaim != ReclaimPolicy::Immediate {
            return Ok(0);
        }
        let state = self.lock();
        let mut reclaimed = 0;
        for blob_id in state.index.tombstones() {
            if !state.in_use(&blob_id) && remove_if_exists(&self.payload_path(&blob_id))? {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    fn release_pin(&self, blob_id: &BlobId) {
        let mut state = self.lock();
        if state.index.unpin(blob_id) {
            if let Err(e) = self.reclaim(&mut state, blob_id) {
                warn!(blob_id = %blob_id, error = %e, "failed to reclaim payload after unpin");
            }
        }
    }

    fn purge_staging(&self) -> StoreResult<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(self.config.staging_dir())? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "discarded leftover staging files");
        }
        Ok(removed)
    }
}

impl RecoveryHandler for BlobStore {
    fn handles(&self, log_type: u8) -> bool {
        BlobLoggable::is_blob_log_type(log_type)
    }

    fn redo(&self, entry: &JournalEntry) -> Result<(), BoxError> {
        let record = BlobLoggable::from_entry(entry)?;
        BlobStore::redo(self, &record)?;
        Ok(())
    }

    fn undo(&self, entry: &JournalEntry, journal: &dyn Journal) -> Result<(), BoxError> {
        let record = BlobLoggable::from_entry(entry)?;
        self.compensate(&record, Some((journal, entry)))?;
        Ok(())
    }

    fn committed(&self, txn: TxnId) {
        self.reclaim_committed(txn);
    }
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("data_dir", &self.config.data_dir)
            .field("digest_type", &self.config.digest_type)
            .finish_non_exhaustive()
    }
}

/// Releases a payload pin when dropped.
struct PinGuard<'a> {
    store: &'a BlobStore,
    blob_id: BlobId,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.store.release_pin(&self.blob_id);
    }
}

fn payload_path_in(blob_dir: &Path, blob_id: &BlobId) -> PathBuf {
    let hex = blob_id.to_hex();
    blob_dir.join(&hex[..2]).join(hex)
}

fn archive_name(blob_id: &BlobId) -> String {
    let hex = blob_id.to_hex();
    format!("{BLOB_DIR_NAME}/{}/{hex}", &hex[..2])
}

fn write_staged(
    path: &Path,
    data: &mut dyn Read,
    digest_type: DigestType,
    sync_mode: SyncMode,
) -> StoreResult<(MessageDigest, u64)> {
    let file = File::create(path)?;
    let mut writer = DigestingWriter::new(BufWriter::new(file), digest_type);
    io::copy(data, &mut writer)?;
    let (buffered, digest, size) = writer.finish();
    let file = buffered.into_inner().map_err(|e| e.into_error())?;
    if sync_mode == SyncMode::EveryWrite {
        file.sync_all()?;
    }
    Ok((digest, size))
}

/// Move a staged file to its content address.
fn promote(staged: &Path, payload: &Path) -> io::Result<()> {
    if let Some(parent) = payload.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(staged, payload)
}

/// Count after taking back the change `current -> new` from `live`.
fn compensated_count(live: u32, current: u32, new: u32) -> u32 {
    let delta = i64::from(new) - i64::from(current);
    (i64::from(live) - delta).clamp(0, i64::from(u32::MAX)) as u32
}

/// Create and delete a file in `dir`.
fn check_writable(dir: &Path) -> io::Result<()> {
    let path = dir.join(format!(".write-check-{}", Uuid::now_v7()));
    File::create(&path).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("staging directory {} is not writable: {e}", dir.display()),
        )
    })?;
    fs::remove_file(&path)
}

fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Re-hash the first live payload to catch a store opened with the wrong
/// digest algorithm.
fn verify_digest(config: &BlobStoreConfig, records: &[MetadataRecord]) -> StoreResult<()> {
    let blob_dir = config.blob_dir();
    for record in records.iter().filter(|r| r.count > 0) {
        let file = match File::open(payload_path_in(&blob_dir, &record.blob_id)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        let (digest, _) =
            DigestingReader::new(BufReader::new(file), config.digest_type).digest_to_end()?;
        if digest.value() != record.blob_id.as_bytes() {
            return Err(StoreError::DigestMismatch {
                configured: config.digest_type,
                reason: format!("payload {} re-hashes to {}", record.blob_id, digest.to_hex()),
            });
        }
        return Ok(());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use blobdb_journal::{InMemoryJournal, TransactionManager};

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: BlobStoreConfig,
        journal: Arc<InMemoryJournal>,
        store: BlobStore,
        tm: TransactionManager,
    }

    fn fixture_with(reclaim: ReclaimPolicy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = BlobStoreConfig {
            reclaim,
            ..BlobStoreConfig::new(dir.path())
        };
        let journal = Arc::new(InMemoryJournal::new());
        let store = BlobStore::open(config.clone(), journal.clone()).unwrap();
        let tm = TransactionManager::new(journal.clone()).unwrap();
        Fixture {
            _dir: dir,
            config,
            journal,
            store,
            tm,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ReclaimPolicy::Immediate)
    }

    fn staging_is_empty(config: &BlobStoreConfig) -> bool {
        fs::read_dir(config.staging_dir()).unwrap().next().is_none()
    }

    #[test]
    fn add_returns_digest_and_size() {
        let f = fixture();
        let txn = f.tm.begin().unwrap();
        let (id, size) = f.store.add(&txn, &b"hello"[..]).unwrap();
        assert_eq!(size, 5);
        assert_eq!(id, DigestType::Blake3.digest(b"hello").into_blob_id());
        assert_eq!(f.store.ref_count(&id), Some(1));
        assert_eq!(fs::read(f.store.payload_path(&id)).unwrap(), b"hello");
        assert!(staging_is_empty(&f.config));
    }

    #[test]
    fn payload_is_fanned_out_by_hex_prefix() {
        let f = fixture();
        let txn = f.tm.begin().unwrap();
        let (id, _) = f.store.add(&txn, &b"fan"[..]).unwrap();
        let hex = id.to_hex();
        assert_eq!(
            f.store.payload_path(&id),
            f.config.blob_dir().join(&hex[..2]).join(&hex)
        );
    }

    #[test]
    fn new_content_logs_store_then_update() {
        let f = fixture();
        let txn = f.tm.begin().unwrap();
        let (id, _) = f.store.add(&txn, &b"x"[..]).unwrap();

        let records: Vec<BlobLoggable> = f
            .journal
            .entries_for(txn.id())
            .unwrap()
            .iter()
            .filter(|e| BlobLoggable::is_blob_log_type(e.log_type))
            .map(|e| BlobLoggable::from_entry(e).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[0], BlobLoggable::StoreBlobFile { blob_id, .. } if *blob_id == id));
        assert!(matches!(
            &records[1],
            BlobLoggable::UpdateBlobRefCount {
                current_count: 0,
                new_count: 1,
                ..
            }
        ));
    }

    #[test]
    fn copy_increments_and_rejects_unknown() {
        let f = fixture();
        let txn = f.tm.begin().unwrap();
        let (id, _) = f.store.add(&txn, &b"copy me"[..]).unwrap();
        assert_eq!(f.store.copy(&txn, &id).unwrap(), Some(id.clone()));
        assert_eq!(f.store.ref_count(&id), Some(2));

        let unknown = DigestType::Blake3.digest(b"nope").into_blob_id();
        assert_eq!(f.store.copy(&txn, &unknown).unwrap(), None);
    }

    #[test]
    fn remove_unknown_is_noop() {
        let f = fixture();
        let txn = f.tm.begin().unwrap();
        let unknown = DigestType::Blake3.digest(b"nope").into_blob_id();
        f.store.remove(&txn, &unknown).unwrap();
        assert_eq!(f.store.stats(), StoreStats::default());
    }

    #[test]
    fn get_digest_uses_requested_algorithm() {
        let f = fixture();
        let txn = f.tm.begin().unwrap();
        let (id, _) = f.store.add(&txn, &b"hello"[..]).unwrap();
        let digest = f.store.get_digest(&txn, &id, DigestType::Sha256).unwrap().unwrap();
        assert_eq!(digest, DigestType::Sha256.digest(b"hello"));
        // Identity is still the store's own digest.
        assert_eq!(f.store.ref_count(&id), Some(1));
    }

    #[test]
    fn get_reads_payload() {
        let f = fixture();
        let txn = f.tm.begin().unwrap();
        let (id, _) = f.store.add(&txn, &b"read back"[..]).unwrap();
        let mut out = String::new();
        f.store
            .get(&txn, &id)
            .unwrap()
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "read back");
    }

    #[test]
    fn removal_while_pinned_defers_deletion() {
        let f = fixture();
        let t1 = f.tm.begin().unwrap();
        let (id, _) = f.store.add(&t1, &b"pinned"[..]).unwrap();
        f.tm.commit(t1, &f.store).unwrap();
        let path = f.store.payload_path(&id);

        let reader = f.tm.begin().unwrap();
        let remover = f.tm.begin().unwrap();
        let seen = f
            .store
            .with(&reader, &id, |p| {
                f.store.remove(&remover, &id).unwrap();
                f.tm.commit(remover, &f.store).unwrap();
                assert!(p.exists());
                fs::read(p).unwrap()
            })
            .unwrap();
        assert_eq!(seen, Some(b"pinned".to_vec()));
        assert!(!path.exists());
    }

    #[test]
    fn removal_is_reclaimed_only_at_commit() {
        let f = fixture();
        let t1 = f.tm.begin().unwrap();
        let (id, _) = f.store.add(&t1, &b"gone later"[..]).unwrap();
        f.tm.commit(t1, &f.store).unwrap();

        let t2 = f.tm.begin().unwrap();
        f.store.remove(&t2, &id).unwrap();
        assert_eq!(f.store.ref_count(&id), None);
        assert!(f.store.payload_path(&id).exists());

        f.tm.commit(t2, &f.store).unwrap();
        assert!(!f.store.payload_path(&id).exists());
    }

    #[test]
    fn aborted_removal_keeps_payload_readable() {
        let f = fixture();
        let t1 = f.tm.begin().unwrap();
        let (id, _) = f.store.add(&t1, &b"keep me"[..]).unwrap();
        f.tm.commit(t1, &f.store).unwrap();

        let t2 = f.tm.begin().unwrap();
        f.store.remove(&t2, &id).unwrap();
        f.tm.abort(t2, &f.store).unwrap();

        assert_eq!(f.store.ref_count(&id), Some(1));
        let reader = f.tm.begin().unwrap();
        let mut out = String::new();
        f.store
            .get(&reader, &id)
            .unwrap()
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "keep me");
        assert!(f.store.lock().pending.is_empty());
    }

    #[test]
    fn abort_keeps_references_of_committed_transactions() {
        let f = fixture();
        let t1 = f.tm.begin().unwrap();
        let t2 = f.tm.begin().unwrap();
        let (id, _) = f.store.add(&t1, &b"same bytes"[..]).unwrap();
        f.store.add(&t2, &b"same bytes"[..]).unwrap();
        assert_eq!(f.store.ref_count(&id), Some(2));

        f.tm.commit(t2, &f.store).unwrap();
        f.tm.abort(t1, &f.store).unwrap();

        assert_eq!(f.store.ref_count(&id), Some(1));
        assert!(f.store.payload_path(&id).exists());
    }

    #[test]
    fn abort_logs_compensations() {
        let f = fixture();
        let t1 = f.tm.begin().unwrap();
        let id = t1.id();
        f.store.add(&t1, &b"logged"[..]).unwrap();
        f.tm.abort(t1, &f.store).unwrap();

        let compensations = f
            .journal
            .entries_for(id)
            .unwrap()
            .into_iter()
            .filter(|e| e.log_type == blobdb_journal::LOG_COMPENSATION)
            .count();
        assert_eq!(compensations, 2);
    }

    #[test]
    fn compensated_count_takes_back_the_delta() {
        assert_eq!(compensated_count(2, 0, 1), 1);
        assert_eq!(compensated_count(0, 1, 0), 1);
        assert_eq!(compensated_count(0, 0, 1), 0);
        assert_eq!(compensated_count(u32::MAX, 2, 0), u32::MAX);
    }

    #[test]
    fn with_unknown_blob_is_none() {
        let f = fixture();
        let txn = f.tm.begin().unwrap();
        let unknown = DigestType::Blake3.digest(b"nope").into_blob_id();
        assert_eq!(f.store.with(&txn, &unknown, |_| ()).unwrap(), None);
    }

    #[test]
    fn deferred_policy_keeps_payload_until_vacuum() {
        let f = fixture_with(ReclaimPolicy::Deferred);
        let txn = f.tm.begin().unwrap();
        let (id, _) = f.store.add(&txn, &b"later"[..]).unwrap();
        f.store.remove(&txn, &id).unwrap();
        f.tm.commit(txn, &f.store).unwrap();
        assert_eq!(f.store.ref_count(&id), None);
        assert!(f.store.payload_path(&id).exists());

        let report = f.store.vacuum().unwrap();
        assert_eq!(report.payloads_removed, 1);
        assert!(!f.store.payload_path(&id).exists());
    }

    #[test]
    fn vacuum_skips_uncommitted_removals() {
        let f = fixture_with(ReclaimPolicy::Deferred);
        let t1 = f.tm.begin().unwrap();
        let (id, _) = f.store.add(&t1, &b"undecided"[..]).unwrap();
        f.tm.commit(t1, &f.store).unwrap();

        let t2 = f.tm.begin().unwrap();
        f.store.remove(&t2, &id).unwrap();
        let report = f.store.vacuum().unwrap();
        assert_eq!(report.in_use_skipped, 1);
        assert_eq!(report.payloads_removed, 0);
        assert!(f.store.payload_path(&id).exists());

        f.tm.abort(t2, &f.store).unwrap();
        assert_eq!(f.store.ref_count(&id), Some(1));
    }

    #[test]
    fn failed_upload_leaves_staging_empty() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "upload cut off"))
            }
        }

        let f = fixture();
        let txn = f.tm.begin().unwrap();
        assert!(f.store.add(&txn, Broken).is_err());
        assert!(staging_is_empty(&f.config));
        assert_eq!(f.store.stats(), StoreStats::default());
    }

    #[cfg(unix)]
    #[test]
    fn open_rejects_read_only_staging() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture();
        drop(f.store);
        let staging = f.config.staging_dir();
        fs::set_permissions(&staging, fs::Permissions::from_mode(0o555)).unwrap();
        // Privileged users can write regardless of mode bits.
        let writable = check_writable(&staging).is_ok();

        let result = BlobStore::open(f.config.clone(), f.journal.clone());
        fs::set_permissions(&staging, fs::Permissions::from_mode(0o755)).unwrap();
        if writable {
            return;
        }
        let err = result.unwrap_err();
        assert!(matches!(err, StoreError::Io(e) if e.kind() == io::ErrorKind::PermissionDenied));
    }

    #[test]
    fn tombstone_slot_is_reused() {
        let f = fixture();
        let txn = f.tm.begin().unwrap();
        let (id, _) = f.store.add(&txn, &b"again"[..]).unwrap();
        f.store.remove(&txn, &id).unwrap();
        f.tm.commit(txn, &f.store).unwrap();
        let len = f.store.lock().file.len();

        let txn = f.tm.begin().unwrap();
        let (again, _) = f.store.add(&txn, &b"again"[..]).unwrap();
        assert_eq!(again, id);
        assert_eq!(f.store.ref_count(&id), Some(1));
        assert_eq!(f.store.lock().file.len(), len);
        assert!(f.store.payload_path(&id).exists());
    }

    #[test]
    fn vacuum_removes_orphans() {
        let f = fixture();
        let orphan = DigestType::Blake3.digest(b"orphan").into_blob_id();
        let path = f.store.payload_path(&orphan);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"orphan").unwrap();

        let report = f.store.vacuum().unwrap();
        assert_eq!(report.orphans_removed, 1);
        assert!(!path.exists());
    }

    #[test]
    fn stats_count_live_and_tombstones() {
        let f = fixture();
        let txn = f.tm.begin().unwrap();
        let (a, _) = f.store.add(&txn, &b"a"[..]).unwrap();
        f.store.add(&txn, &b"a"[..]).unwrap();
        let (b, _) = f.store.add(&txn, &b"b"[..]).unwrap();
        f.store.remove(&txn, &b).unwrap();

        let stats = f.store.stats();
        assert_eq!(stats.live_blobs, 1);
        assert_eq!(stats.tombstones, 1);
        assert_eq!(stats.total_references, 2);
        assert_eq!(f.store.ref_count(&a), Some(2));
    }

    #[test]
    fn open_discards_leftover_staging() {
        let f = fixture();
        fs::write(f.config.staging_dir().join("leftover"), b"junk").unwrap();
        drop(f.store);
        let store = BlobStore::open(f.config.clone(), f.journal.clone()).unwrap();
        assert!(staging_is_empty(store.config()));
    }

    #[test]
    fn open_detects_wrong_digest_of_same_length() {
        let f = fixture();
        let txn = f.tm.begin().unwrap();
        f.store.add(&txn, &b"hash me"[..]).unwrap();
        drop(f.store);

        let config = BlobStoreConfig {
            digest_type: DigestType::Sha256,
            ..f.config.clone()
        };
        let err = BlobStore::open(config, f.journal.clone()).unwrap_err();
        assert!(matches!(err, StoreError::DigestMismatch { .. }));
    }

    #[test]
    fn abort_rolls_back_new_blob() {
        let f = fixture();
        let txn = f.tm.begin().unwrap();
        let (id, _) = f.store.add(&txn, &b"doomed"[..]).unwrap();
        f.tm.abort(txn, &f.store).unwrap();
        assert_eq!(f.store.ref_count(&id), None);
        assert!(!f.store.payload_path(&id).exists());
    }

    #[test]
    fn abort_restores_previous_count() {
        let f = fixture();
        let t1 = f.tm.begin().unwrap();
        let (id, _) = f.store.add(&t1, &b"shared"[..]).unwrap();
        f.tm.commit(t1, &f.store).unwrap();

        let t2 = f.tm.begin().unwrap();
        f.store.copy(&t2, &id).unwrap();
        f.store.copy(&t2, &id).unwrap();
        assert_eq!(f.store.ref_count(&id), Some(3));
        f.tm.abort(t2, &f.store).unwrap();

        assert_eq!(f.store.ref_count(&id), Some(1));
        assert!(f.store.payload_path(&id).exists());
    }

    #[test]
    fn backup_streams_metadata_and_payloads() {
        #[derive(Default)]
        struct Collect(Vec<(String, Vec<u8>)>);
        impl RawDataBackup for Collect {
            fn write_entry(&mut self, name: &str, size: u64, data: &mut dyn Read) -> io::Result<()> {
                let mut buf = Vec::new();
                data.read_to_end(&mut buf)?;
                assert_eq!(buf.len() as u64, size);
                self.0.push((name.to_string(), buf));
                Ok(())
            }
        }

        let f = fixture();
        let txn = f.tm.begin().unwrap();
        let (id, _) = f.store.add(&txn, &b"backed up"[..]).unwrap();

        let mut sink = Collect::default();
        let report = f.store.backup_to_archive(&mut sink).unwrap();
        assert_eq!(report.payloads, 1);
        assert_eq!(sink.0[0].0, "blob.dbx");
        assert_eq!(sink.0[0].1, fs::read(f.config.persistent_file()).unwrap());
        assert_eq!(sink.0[1], (archive_name(&id), b"backed up".to_vec()));
        assert!(!f.store.lock().index.is_pinned(&id));
    }
}
