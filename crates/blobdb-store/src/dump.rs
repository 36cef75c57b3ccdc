use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;

use blobdb_crypto::DigestType;
use tracing::warn;

use crate::error::StoreResult;
use crate::metadata::{read_header, read_records, MetadataRecord, HEADER_LEN};

/// Contents of a metadata file as read by [`read_persistent_file`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistentFileDump {
    pub version: u16,
    pub digest_type: DigestType,
    pub records: Vec<MetadataRecord>,
}

/// Read a `blob.dbx` without opening a store.
///
/// Read-only: a partial trailing record is reported and ignored.
pub fn read_persistent_file(digest_type: DigestType, path: &Path) -> StoreResult<PersistentFileDump> {
    let mut reader = BufReader::new(File::open(path)?);
    let version = read_header(&mut reader, path)?;
    let (records, trailing) =
        read_records(&mut reader, digest_type.digest_length_bytes(), HEADER_LEN)?;
    if trailing != 0 {
        warn!(path = %path.display(), trailing, "ignoring partial trailing record");
    }
    Ok(PersistentFileDump {
        version,
        digest_type,
        records,
    })
}

/// Print a `blob.dbx` as CSV.
///
/// ```text
/// *** Blob Store file format version: 1
/// Digest Type: blake3-256
///
/// blobId,referenceCount
/// af1349b9...,2
/// ```
pub fn dump(digest_type: DigestType, path: &Path, out: &mut dyn Write) -> StoreResult<usize> {
    let contents = read_persistent_file(digest_type, path)?;
    writeln!(out, "*** Blob Store file format version: {}", contents.version)?;
    writeln!(out, "Digest Type: {}", contents.digest_type)?;
    writeln!(out)?;
    writeln!(out, "blobId,referenceCount")?;
    for record in &contents.records {
        writeln!(out, "{},{}", record.blob_id, record.count)?;
    }
    Ok(contents.records.len())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use blobdb_journal::SyncMode;
    use blobdb_types::BlobId;

    use super::*;
    use crate::error::StoreError;
    use crate::metadata::PersistentFile;

    #[test]
    fn empty_store_prints_table_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.dbx");
        PersistentFile::open(&path, DigestType::Blake3, SyncMode::EveryWrite).unwrap();

        let mut out = Vec::new();
        let n = dump(DigestType::Blake3, &path, &mut out).unwrap();
        assert_eq!(n, 0);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "*** Blob Store file format version: 1\nDigest Type: blake3-256\n\nblobId,referenceCount\n"
        );
    }

    #[test]
    fn records_are_listed_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.dbx");
        let (mut file, _) =
            PersistentFile::open(&path, DigestType::Sha256, SyncMode::EveryWrite).unwrap();
        file.append(&BlobId::new(vec![0x11; 32]).unwrap(), 2).unwrap();
        file.append(&BlobId::new(vec![0x22; 32]).unwrap(), 0).unwrap();

        let mut out = Vec::new();
        dump(DigestType::Sha256, &path, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().skip(4).collect();
        assert_eq!(lines, vec![
            format!("{},2", "11".repeat(32)),
            format!("{},0", "22".repeat(32)),
        ]);
    }

    #[test]
    fn bad_magic_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.dbx");
        fs::write(&path, b"not a store").unwrap();
        let err = dump(DigestType::Blake3, &path, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, StoreError::NotABlobStore { .. }));
    }
}
