use std::fs;
use std::path::{Path, PathBuf};

use blobdb_crypto::DigestType;
use blobdb_journal::SyncMode;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Name of the persistent metadata file inside the data directory.
pub const PERSISTENT_FILE_NAME: &str = "blob.dbx";
/// Name of the payload directory inside the data directory.
pub const BLOB_DIR_NAME: &str = "blob";
/// Name of the staging directory inside the payload directory.
pub const STAGING_DIR_NAME: &str = "staging";

/// When payload files of unreferenced blobs are deleted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReclaimPolicy {
    /// Delete the payload as soon as its count reaches zero.
    #[default]
    Immediate,
    /// Leave the payload in place until [`BlobStore::vacuum`](crate::BlobStore::vacuum).
    Deferred,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobStoreConfig {
    pub data_dir: PathBuf,
    pub digest_type: DigestType,
    pub reclaim: ReclaimPolicy,
    /// Governs fsync of staged payloads and the metadata file.
    pub sync_mode: SyncMode,
    /// Re-hash the first live payload at open to detect a digest change.
    pub verify_digest_on_open: bool,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            digest_type: DigestType::default(),
            reclaim: ReclaimPolicy::default(),
            sync_mode: SyncMode::default(),
            verify_digest_on_open: true,
        }
    }
}

impl BlobStoreConfig {
    /// Default configuration rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> StoreResult<Self> {
        toml::from_str(s).map_err(|e| StoreError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> StoreResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn persistent_file(&self) -> PathBuf {
        self.data_dir.join(PERSISTENT_FILE_NAME)
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join(BLOB_DIR_NAME)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.blob_dir().join(STAGING_DIR_NAME)
    }

    /// Location of the store's journal.
    pub fn journal_file(&self) -> PathBuf {
        self.data_dir.join("journal").join("blob.log")
    }
}
