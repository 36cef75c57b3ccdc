use std::collections::HashMap;

use blobdb_types::BlobId;

use crate::metadata::MetadataRecord;

/// Cached location and count of one metadata record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub count: u32,
}

/// In-memory mirror of the metadata file: `BlobId -> (offset, count)`.
///
/// Also tracks pins taken by [`BlobStore::with`](crate::BlobStore::with) and
/// backups, so that a payload is not reclaimed while someone is reading it.
#[derive(Debug, Default)]
pub struct RefCountIndex {
    entries: HashMap<BlobId, IndexEntry>,
    pins: HashMap<BlobId, usize>,
}

impl RefCountIndex {
    pub fn from_records(records: impl IntoIterator<Item = MetadataRecord>) -> Self {
        let entries = records
            .into_iter()
            .map(|r| {
                (
                    r.blob_id,
                    IndexEntry {
                        offset: r.offset,
                        count: r.count,
                    },
                )
            })
            .collect();
        Self {
            entries,
            pins: HashMap::new(),
        }
    }

    pub fn get(&self, id: &BlobId) -> Option<IndexEntry> {
        self.entries.get(id).copied()
    }

    /// Count of a blob, treating tombstones as absent.
    pub fn live_count(&self, id: &BlobId) -> Option<u32> {
        self.get(id).map(|e| e.count).filter(|&c| c > 0)
    }

    pub fn insert(&mut self, id: BlobId, entry: IndexEntry) {
        self.entries.insert(id, entry);
    }

    /// Update the count of an existing entry. Returns `false` if absent.
    pub fn set_count(&mut self, id: &BlobId, count: u32) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.count = count;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &BlobId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BlobId, &IndexEntry)> {
        self.entries.iter()
    }

    /// Ids with a non-zero count.
    pub fn live_ids(&self) -> Vec<BlobId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.count > 0)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Ids whose count has dropped to zero.
    pub fn tombstones(&self) -> Vec<BlobId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.count == 0)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pin(&mut self, id: &BlobId) {
        *self.pins.entry(id.clone()).or_insert(0) += 1;
    }

    /// Release one pin. Returns `true` if that was the last one.
    pub fn unpin(&mut self, id: &BlobId) -> bool {
        match self.pins.get_mut(id) {
            Some(n) if *n > 1 => {
                *n -= 1;
                false
            }
            Some(_) => {
                self.pins.remove(id);
                true
            }
            None => false,
        }
    }

    pub fn is_pinned(&self, id: &BlobId) -> bool {
        self.pins.contains_key(id)
    }
}
