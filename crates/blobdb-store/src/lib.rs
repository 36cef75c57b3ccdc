//! De-duplicating, content-addressed BLOB storage for blobdb.
//!
//! A payload is identified by the digest of its bytes ([`BlobId`]) and stored
//! once no matter how many documents reference it. References are counted in
//! the persistent metadata file `blob.dbx`, and every count change is written
//! to the journal first so it can be redone or undone after a crash.
//!
//! # Layout
//!
//! ```text
//! <data_dir>/blob.dbx             metadata: header + fixed-stride records
//! <data_dir>/blob/ab/abcdef...    payload files, named by hex digest
//! <data_dir>/blob/staging/<uuid>  payloads being written
//! <data_dir>/journal/blob.log     write-ahead journal
//! ```
//!
//! # Design Rules
//!
//! 1. Payload files are written once by rename and never modified.
//! 2. Journal first: a record is appended before the metadata file changes.
//! 3. Digesting happens outside the store lock; index and file updates inside.
//! 4. A record whose count reaches zero stays as a tombstone and is reused.
//! 5. Redo and undo are idempotent.
//! 6. Unknown ids are `Ok(None)`, never errors.
//!
//! [`BlobId`]: blobdb_types::BlobId

pub mod backup;
pub mod config;
pub mod dump;
pub mod error;
pub mod index;
pub mod loggable;
pub mod metadata;
pub mod service;
pub mod store;

pub use backup::{RawDataBackup, TarBackup};
pub use config::{BlobStoreConfig, ReclaimPolicy};
pub use dump::{dump, read_persistent_file, PersistentFileDump};
pub use error::{StoreError, StoreResult};
pub use loggable::{BlobLoggable, LOG_STORE_BLOB_FILE, LOG_UPDATE_BLOB_REF_COUNT};
pub use metadata::{MetadataRecord, FORMAT_VERSION, MAGIC};
pub use service::BlobStoreService;
pub use store::{BackupReport, BlobStore, StoreStats, VacuumReport};
