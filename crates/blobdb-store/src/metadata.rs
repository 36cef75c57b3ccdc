//! The persistent metadata file, `blob.dbx`.
//!
//! ```text
//! Header:  [4 bytes magic][2 bytes version]             (big-endian)
//! Record*: [digest_len bytes digest][4 bytes ref count] (big-endian, fixed stride)
//! ```
//!
//! A record's offset never changes once written, so the in-memory index can
//! cache it. A record whose count drops to zero stays in place as a
//! tombstone and is reused if the same content is added again.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use blobdb_crypto::DigestType;
use blobdb_journal::SyncMode;
use blobdb_types::{BlobId, TypeError};
use blobdb_vbe::{VariableByteRead, VariableByteWrite};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Magic number identifying a blob store metadata file.
pub const MAGIC: [u8; 4] = [0x0E, 0x0D, 0x0B, 0x0E];
/// Current (and only) metadata format version.
pub const FORMAT_VERSION: u16 = 1;
/// Header length in bytes.
pub const HEADER_LEN: u64 = 6;
/// Width of the reference count field.
pub const COUNT_LEN: usize = 4;

/// Distance between consecutive records for a digest of `digest_len` bytes.
pub const fn record_stride(digest_len: usize) -> u64 {
    (digest_len + COUNT_LEN) as u64
}

/// One record as read from the metadata file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataRecord {
    pub offset: u64,
    pub blob_id: BlobId,
    pub count: u32,
}

fn header_bytes() -> [u8; HEADER_LEN as usize] {
    let v = FORMAT_VERSION.to_be_bytes();
    [MAGIC[0], MAGIC[1], MAGIC[2], MAGIC[3], v[0], v[1]]
}

/// Read and validate the header, returning the format version.
pub fn read_header<R: Read>(reader: &mut R, path: &Path) -> StoreResult<u16> {
    let mut magic = [0u8; 4];
    match reader.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(StoreError::NotABlobStore {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(e.into()),
    }
    if magic != MAGIC {
        return Err(StoreError::NotABlobStore {
            path: path.to_path_buf(),
        });
    }

    let version = match reader.read_fixed_short() {
        Ok(v) => v as u16,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(StoreError::NotABlobStore {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(e.into()),
    };
    if version != FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion {
            found: version,
            supported: FORMAT_VERSION,
        });
    }
    Ok(version)
}

/// Read consecutive records starting at `offset` until end of input.
///
/// Returns the records and the number of trailing bytes that did not form a
/// whole record.
pub fn read_records<R: Read>(
    reader: &mut R,
    digest_len: usize,
    mut offset: u64,
) -> StoreResult<(Vec<MetadataRecord>, u64)> {
    let stride = record_stride(digest_len) as usize;
    let mut buf = vec![0u8; stride];
    let mut records = Vec::new();

    loop {
        let n = fill(reader, &mut buf)?;
        if n < stride {
            return Ok((records, n as u64));
        }
        let blob_id = BlobId::new(&buf[..digest_len])?;
        let count = (&buf[digest_len..]).read_fixed_int()? as u32;
        records.push(MetadataRecord {
            offset,
            blob_id,
            count,
        });
        offset += stride as u64;
    }
}

/// Read until `buf` is full or the input ends; returns bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn check_unique(records: &[MetadataRecord]) -> StoreResult<()> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        if !seen.insert(&record.blob_id) {
            return Err(StoreError::CorruptMetadata(format!(
                "duplicate record for {} at offset {}",
                record.blob_id, record.offset
            )));
        }
    }
    Ok(())
}

/// Handle on an open `blob.dbx`.
#[derive(Debug)]
pub struct PersistentFile {
    path: PathBuf,
    file: File,
    digest_len: usize,
    len: u64,
    sync_mode: SyncMode,
}

impl PersistentFile {
    /// Open the metadata file, creating and initialising it if needed.
    ///
    /// A record region that is not a whole number of records means the file
    /// was written with a different digest length.
    pub fn open(
        path: &Path,
        digest_type: DigestType,
        sync_mode: SyncMode,
    ) -> StoreResult<(Self, Vec<MetadataRecord>)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mut this = Self {
            path: path.to_path_buf(),
            len: file.metadata()?.len(),
            file,
            digest_len: digest_type.digest_length_bytes(),
            sync_mode,
        };

        if this.len == 0 {
            this.init_header()?;
            debug!(path = %path.display(), "initialised blob store metadata file");
            return Ok((this, Vec::new()));
        }

        let (records, trailing) = this.scan()?;
        if trailing != 0 {
            return Err(StoreError::DigestMismatch {
                configured: digest_type,
                reason: format!(
                    "record region of {} bytes is not a multiple of the {}-byte record stride",
                    this.len - HEADER_LEN,
                    this.stride()
                ),
            });
        }
        check_unique(&records)?;
        Ok((this, records))
    }

    /// Open an existing metadata file after a crash.
    ///
    /// A partial trailing record is a torn append and is truncated.
    pub fn open_for_recovery(
        path: &Path,
        digest_type: DigestType,
        sync_mode: SyncMode,
    ) -> StoreResult<(Self, Vec<MetadataRecord>)> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NoPersistentFile {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let mut this = Self {
            path: path.to_path_buf(),
            len: file.metadata()?.len(),
            file,
            digest_len: digest_type.digest_length_bytes(),
            sync_mode,
        };

        if this.len < HEADER_LEN {
            // Crashed while writing the header of a brand-new store.
            let mut existing = Vec::new();
            this.file.seek(SeekFrom::Start(0))?;
            this.file.read_to_end(&mut existing)?;
            if !header_bytes().starts_with(&existing) {
                return Err(StoreError::NotABlobStore {
                    path: path.to_path_buf(),
                });
            }
            warn!(path = %path.display(), len = this.len, "rewriting torn metadata header");
            this.init_header()?;
            return Ok((this, Vec::new()));
        }

        let (records, trailing) = this.scan()?;
        if trailing != 0 {
            let valid = this.len - trailing;
            warn!(
                path = %path.display(),
                trailing,
                valid_len = valid,
                "truncating torn metadata record"
            );
            this.file.set_len(valid)?;
            this.file.sync_all()?;
            this.len = valid;
        }
        check_unique(&records)?;
        Ok((this, records))
    }

    fn init_header(&mut self) -> StoreResult<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_bytes())?;
        self.file.sync_all()?;
        self.len = HEADER_LEN;
        Ok(())
    }

    fn scan(&mut self) -> StoreResult<(Vec<MetadataRecord>, u64)> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&self.file);
        read_header(&mut reader, &self.path)?;
        read_records(&mut reader, self.digest_len, HEADER_LEN)
    }

    /// Append a new record and return its offset.
    pub fn append(&mut self, blob_id: &BlobId, count: u32) -> StoreResult<u64> {
        if blob_id.len() != self.digest_len {
            return Err(TypeError::InvalidLength {
                expected: self.digest_len,
                actual: blob_id.len(),
            }
            .into());
        }
        let offset = self.len;
        let mut record = Vec::with_capacity(self.stride() as usize);
        record.extend_from_slice(blob_id.as_bytes());
        record.write_fixed_int(count as i32)?;

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&record)?;
        self.sync_after_write()?;
        self.len += self.stride();
        Ok(offset)
    }

    /// Rewrite the count field of the record at `offset` in place.
    pub fn write_count(&mut self, offset: u64, count: u32) -> StoreResult<()> {
        self.file
            .seek(SeekFrom::Start(offset + self.digest_len as u64))?;
        self.file.write_fixed_int(count as i32)?;
        self.sync_after_write()
    }

    /// Read the count field of the record at `offset`.
    pub fn read_count(&mut self, offset: u64) -> StoreResult<u32> {
        self.file
            .seek(SeekFrom::Start(offset + self.digest_len as u64))?;
        Ok(self.file.read_fixed_int()? as u32)
    }

    /// Copy of the whole file, for point-in-time backups.
    pub fn snapshot(&mut self) -> StoreResult<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.len as usize);
        self.file.seek(SeekFrom::Start(0))?;
        (&self.file).take(self.len).read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    pub fn sync(&self) -> StoreResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn sync_after_write(&self) -> StoreResult<()> {
        if matches!(self.sync_mode, SyncMode::EveryWrite) {
            self.file.sync_data()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` if the file holds no records.
    pub fn is_empty(&self) -> bool {
        self.len <= HEADER_LEN
    }

    pub fn stride(&self) -> u64 {
        record_stride(self.digest_len)
    }
}
