use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::config::{JournalConfig, SyncMode};
use crate::error::{JournalError, JournalResult};
use crate::loggable::{decode_payload, encode_payload, JournalEntry, Loggable, Lsn};
use crate::traits::Journal;

/// Frame header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// Internal mutable state for the journal writer.
struct JournalWriter {
    writer: BufWriter<File>,
    /// Current write offset, which is also the next LSN.
    offset: u64,
}

/// Crash-recoverable journal file.
///
/// On-disk frame:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload = VBE txn id, 1 byte log type, record body]
/// ```
///
/// A record's LSN is the byte offset of its frame. A frame that is cut short
/// or fails its checksum at the very end of the file is a torn write from a
/// crash; it is trimmed when the journal is opened. A checksum failure
/// anywhere else is reported as corruption.
pub struct FileJournal {
    path: PathBuf,
    writer: Mutex<JournalWriter>,
    config: JournalConfig,
}

impl FileJournal {
    /// Open (or create) a journal file, trimming any torn trailing frame.
    pub fn open(path: &Path, config: JournalConfig) -> JournalResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let file_len = file.metadata()?.len();

        let (_, valid_len) = scan(path)?;
        if valid_len < file_len {
            warn!(
                path = %path.display(),
                valid_len,
                file_len,
                "trimming torn journal tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(JournalWriter {
                writer: BufWriter::new(file),
                offset: valid_len,
            }),
            config,
        })
    }

    /// Current write offset.
    pub fn offset(&self) -> u64 {
        self.writer.lock().expect("journal mutex poisoned").offset
    }

    /// Path to the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Journal for FileJournal {
    fn append(&self, record: &dyn Loggable) -> JournalResult<Lsn> {
        let payload = encode_payload(record)?;
        let length = payload.len() as u32;
        let crc = crc32fast::hash(&payload);

        let mut w = self.writer.lock().expect("journal mutex poisoned");
        let lsn = Lsn::new(w.offset);

        w.writer.write_all(&length.to_le_bytes())?;
        w.writer.write_all(&crc.to_le_bytes())?;
        w.writer.write_all(&payload)?;
        w.writer.flush()?;
        if matches!(self.config.sync_mode, SyncMode::EveryWrite) {
            w.writer.get_ref().sync_data()?;
        }

        w.offset += HEADER_SIZE as u64 + payload.len() as u64;

        debug!(%lsn, log_type = record.log_type(), len = payload.len(), "journal append");
        Ok(lsn)
    }

    fn entries(&self) -> JournalResult<Vec<JournalEntry>> {
        // Hold the writer lock so no frame is half-written while we read.
        let mut w = self.writer.lock().expect("journal mutex poisoned");
        w.writer.flush()?;
        let (entries, _) = scan(&self.path)?;
        debug!(count = entries.len(), "journal read");
        Ok(entries)
    }

    fn truncate(&self) -> JournalResult<()> {
        let mut w = self.writer.lock().expect("journal mutex poisoned");
        w.writer.flush()?;
        let file = w.writer.get_ref();
        file.set_len(0)?;
        file.sync_all()?;
        w.offset = 0;

        debug!("journal truncated");
        Ok(())
    }

    fn sync(&self) -> JournalResult<()> {
        let mut w = self.writer.lock().expect("journal mutex poisoned");
        w.writer.flush()?;
        w.writer.get_ref().sync_data()?;
        Ok(())
    }

    fn is_empty(&self) -> JournalResult<bool> {
        Ok(self.offset() == 0)
    }
}

/// Read every complete frame. Returns the entries and the length of the
/// valid prefix of the file.
fn scan(path: &Path) -> JournalResult<(Vec<JournalEntry>, u64)> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut offset: u64 = 0;

    while offset + HEADER_SIZE as u64 <= file_len {
        let mut header = [0u8; HEADER_SIZE];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let frame_end = offset + HEADER_SIZE as u64 + length as u64;

        if length == 0 || frame_end > file_len {
            warn!(offset, length, file_len, "incomplete journal frame; stopping");
            break;
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload)?;

        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            if frame_end == file_len {
                warn!(offset, "torn final journal frame; stopping");
                break;
            }
            return Err(JournalError::CrcMismatch {
                lsn: Lsn::new(offset),
                expected: expected_crc,
                actual: actual_crc,
            });
        }

        entries.push(decode_payload(Lsn::new(offset), &payload)?);
        offset = frame_end;
    }

    Ok((entries, offset))
}
