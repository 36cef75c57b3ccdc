use std::io::{self, Read, Write};

/// Sink for raw store files during a backup.
pub trait RawDataBackup {
    /// Write one file of exactly `size` bytes read from `data`.
    fn write_entry(&mut self, name: &str, size: u64, data: &mut dyn Read) -> io::Result<()>;
}

/// Writes a backup as a tar archive.
///
/// Headers are normalised (zero mtime, uid and gid, mode `0644`, empty owner
/// names) so that identical store contents produce identical archives.
pub struct TarBackup<W: Write> {
    builder: tar::Builder<W>,
    entries: usize,
}

impl<W: Write> TarBackup<W> {
    pub fn new(writer: W) -> Self {
        Self {
            builder: tar::Builder::new(writer),
            entries: 0,
        }
    }

    /// Number of entries written so far.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Write the archive trailer and return the underlying writer.
    pub fn finish(self) -> io::Result<W> {
        self.builder.into_inner()
    }
}

impl<W: Write> RawDataBackup for TarBackup<W> {
    fn write_entry(&mut self, name: &str, size: u64, data: &mut dyn Read) -> io::Result<()> {
        let mut header = tar::Header::new_ustar();
        header.set_size(size);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(0o644);
        header
            .set_username("")
            .map_err(|e| io::Error::other(format!("set_username: {e}")))?;
        header
            .set_groupname("")
            .map_err(|e| io::Error::other(format!("set_groupname: {e}")))?;
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        self.builder.append_data(&mut header, name, data.take(size))?;
        self.entries += 1;
        Ok(())
    }
}
