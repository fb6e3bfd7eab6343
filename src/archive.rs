//! Photos Backup - Archive Container
//!
//! Zip container helpers shared by the builder, validator and reconciler.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zip::ZipArchive;

use crate::error::{BackupError, BackupResult};
use crate::manifest::{Manifest, ManifestCodec};

/// Well-known name of the manifest entry
pub const MANIFEST_ENTRY: &str = "manifest.json";

/// Directory inside the archive holding photo binaries
pub const PHOTOS_DIR: &str = "photos";

/// Upper bound on buffer pre-allocation from a (possibly forged) zip header size
const MAX_PRESIZE: u64 = 64 << 20;

/// Location of a finalized archive on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveHandle(PathBuf);

impl ArchiveHandle {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self(path.as_ref().to_path_buf())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// Archive-relative path for a photo: `photos/<id>.<ext>`
pub fn photo_entry_name(photo_id: i64, stored_path: &str) -> String {
    let ext = Path::new(stored_path)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .unwrap_or("jpg");
    format!("{}/{}.{}", PHOTOS_DIR, photo_id, ext.to_lowercase())
}

/// Open an archive read-only
pub fn open_archive(path: &Path) -> BackupResult<ZipArchive<File>> {
    if !path.exists() {
        return Err(BackupError::FileNotFound(path.display().to_string()));
    }
    let file = File::open(path)?;
    Ok(ZipArchive::new(file)?)
}

/// Locate and decode the manifest entry
pub fn read_manifest<R: io::Read + io::Seek>(
    archive: &mut ZipArchive<R>,
    codec: &ManifestCodec,
) -> BackupResult<Manifest> {
    codec.decode(&read_manifest_bytes(archive)?)
}

/// Like `read_manifest`, leaving the content checksum to the caller
pub fn read_manifest_unverified<R: io::Read + io::Seek>(
    archive: &mut ZipArchive<R>,
    codec: &ManifestCodec,
) -> BackupResult<Manifest> {
    codec.decode_unverified(&read_manifest_bytes(archive)?)
}

fn read_manifest_bytes<R: io::Read + io::Seek>(archive: &mut ZipArchive<R>) -> BackupResult<Vec<u8>> {
    let mut entry = archive.by_name(MANIFEST_ENTRY).map_err(|_| {
        BackupError::ManifestInvalid(format!("archive has no {} entry", MANIFEST_ENTRY))
    })?;
    let mut bytes = Vec::with_capacity(presize(entry.size()));
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Read one binary entry fully (one photo at a time)
pub fn read_entry<R: io::Read + io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> BackupResult<Vec<u8>> {
    let mut entry = archive
        .by_name(name)
        .map_err(|_| BackupError::FileNotFound(name.to_string()))?;
    let mut bytes = Vec::with_capacity(presize(entry.size()));
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn presize(declared: u64) -> usize {
    declared.min(MAX_PRESIZE) as usize
}

/// SHA-256 of a byte slice, hex encoded
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a reader's contents, streamed
pub fn hash_reader<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_photo_entry_name() {
        assert_eq!(photo_entry_name(12, "photos/IMG_0001.JPG"), "photos/12.jpg");
        assert_eq!(photo_entry_name(3, "raw/no_extension"), "photos/3.jpg");
    }

    #[test]
    fn test_sha256_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let mut reader: &[u8] = b"abc";
        assert_eq!(hash_reader(&mut reader).unwrap(), sha256_hex(b"abc"));
    }

    #[test]
    fn test_presize_ignores_huge_declared_sizes() {
        assert_eq!(presize(1024), 1024);
        assert_eq!(presize(u64::MAX), MAX_PRESIZE as usize);
    }

    #[test]
    fn test_open_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let result = open_archive(&dir.path().join("missing.zip"));
        assert!(matches!(result, Err(BackupError::FileNotFound(_))));
    }
}
