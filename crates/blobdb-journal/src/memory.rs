use std::sync::RwLock;

use crate::error::JournalResult;
use crate::loggable::{decode_payload, encode_payload, JournalEntry, Loggable, Lsn};
use crate::traits::Journal;

/// In-memory journal.
///
/// Intended for tests and embedding. Records go through the same encoding as
/// [`FileJournal`](crate::FileJournal), so size mismatches are caught here
/// too; LSNs are sequence numbers rather than byte offsets.
#[derive(Default)]
pub struct InMemoryJournal {
    payloads: RwLock<Vec<Vec<u8>>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.payloads.read().expect("journal lock poisoned").len()
    }
}

impl Journal for InMemoryJournal {
    fn append(&self, record: &dyn Loggable) -> JournalResult<Lsn> {
        let payload = encode_payload(record)?;
        let mut payloads = self.payloads.write().expect("journal lock poisoned");
        let lsn = Lsn::new(payloads.len() as u64);
        payloads.push(payload);
        Ok(lsn)
    }

    fn entries(&self) -> JournalResult<Vec<JournalEntry>> {
        self.payloads
            .read()
            .expect("journal lock poisoned")
            .iter()
            .enumerate()
            .map(|(i, p)| decode_payload(Lsn::new(i as u64), p))
            .collect()
    }

    fn truncate(&self) -> JournalResult<()> {
        self.payloads.write().expect("journal lock poisoned").clear();
        Ok(())
    }

    fn sync(&self) -> JournalResult<()> {
        Ok(())
    }

    fn is_empty(&self) -> JournalResult<bool> {
        Ok(self.len() == 0)
    }
}

impl std::fmt::Debug for InMemoryJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJournal")
            .field("records", &self.len())
            .finish()
    }
}
