use serde::{Deserialize, Serialize};

/// Flush/sync strategy for journal and metadata writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// `fsync` after every write (safest, highest latency).
    #[default]
    EveryWrite,
    /// Rely on OS page-cache buffering (fastest, least durable).
    OsDefault,
}

/// Configuration for a [`FileJournal`](crate::FileJournal).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Sync/flush strategy.
    #[serde(default)]
    pub sync_mode: SyncMode,
}
