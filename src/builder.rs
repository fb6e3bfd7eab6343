//! Photos Backup - Archive Builder
//!
//! Walks the live library and writes categories, photo metadata and photo
//! binaries into a single zip archive. Photos are read once and streamed
//! into a scratch zip; the final archive gets the manifest first and the
//! photo entries copied over raw. It is assembled in a temp file next to
//! the destination and renamed into place only once every entry has been
//! written.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::archive::{photo_entry_name, sha256_hex, ArchiveHandle, MANIFEST_ENTRY};
use crate::config::ArchiveCompression;
use crate::error::{BackupError, BackupResult};
use crate::manifest::{BackupMode, Manifest, ManifestCategory, ManifestCodec, ManifestPhoto, CURRENT_VERSION};
use crate::model::Photo;
use crate::operation::CancellationToken;
use crate::progress::ProgressRecord;
use crate::store::{LibraryStore, PhotoStorage};

/// Reference point for an incremental export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Baseline {
    /// Photos created strictly after this timestamp (epoch millis)
    Since(i64),
    /// Photos created after the given backup (history entry id) was taken
    Backup(String),
}

/// Which photos an export covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportMode {
    Full,
    Incremental(Baseline),
}

/// Result of a successful build
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveSummary {
    pub backup_id: String,
    pub handle: ArchiveHandle,
    pub size_bytes: u64,
    pub category_count: usize,
    pub photo_count: usize,
    /// Photos left out because their file could not be read
    pub omitted: usize,
    pub mode: BackupMode,
    pub baseline: Option<i64>,
    pub created_at: i64,
    pub errors: Vec<String>,
}

/// A photo written to the scratch zip
struct Included<'p> {
    photo: &'p Photo,
    entry: String,
    checksum: String,
}

/// Archive Builder
pub struct ArchiveBuilder<'a> {
    store: &'a dyn LibraryStore,
    storage: &'a dyn PhotoStorage,
    codec: ManifestCodec,
    compression: ArchiveCompression,
    /// Required headroom for the free-space check; `None` skips the check
    free_space_margin: Option<u64>,
}

impl<'a> ArchiveBuilder<'a> {
    pub fn new(store: &'a dyn LibraryStore, storage: &'a dyn PhotoStorage) -> Self {
        Self {
            store,
            storage,
            codec: ManifestCodec::default(),
            compression: ArchiveCompression::Deflated,
            free_space_margin: None,
        }
    }

    pub fn with_codec(mut self, codec: ManifestCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_compression(mut self, compression: ArchiveCompression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_free_space_check(mut self, margin: Option<u64>) -> Self {
        self.free_space_margin = margin;
        self
    }

    /// Build an archive at `dest`.
    ///
    /// `since` is the incremental cutoff; `None` means a full export.
    pub fn build(
        &self,
        since: Option<i64>,
        dest: &Path,
        progress: &mut ProgressRecord,
        cancel: &CancellationToken,
    ) -> BackupResult<ArchiveSummary> {
        let mode = if since.is_some() { BackupMode::Incremental } else { BackupMode::Full };
        log::info!("Building {:?} archive at {}", mode, dest.display());

        // Categories are always exported in full, whatever the mode
        let categories = self.store.list_categories()?;
        let photos = self.store.list_photos()?;
        let selected: Vec<&Photo> = photos
            .iter()
            .filter(|p| since.map_or(true, |cutoff| p.created_at > cutoff))
            .collect();

        progress.set_total(selected.len());
        progress.set_operation("Archiving photos");

        let dest_dir = destination_dir(dest);
        std::fs::create_dir_all(&dest_dir)?;
        // Scratch and final archive coexist until the scratch file is dropped
        let selected_bytes: u64 = selected.iter().map(|p| p.file_size).sum();
        self.check_free_space(&dest_dir, selected_bytes.saturating_mul(2))?;

        let options = SimpleFileOptions::default().compression_method(self.compression.method());
        let scratch = tempfile::tempfile_in(&dest_dir)?;
        let (included, omitted, scratch) = self.stream_photos(&selected, scratch, options, progress, cancel)?;
        let mut scratch = ZipArchive::new(scratch)?;

        let backup_id = Uuid::new_v4().to_string();
        let created_at = Utc::now().timestamp_millis();
        let manifest = Manifest::new(
            CURRENT_VERSION,
            created_at,
            categories.iter().map(ManifestCategory::from).collect(),
            included
                .iter()
                .map(|i| ManifestPhoto::from_photo(i.photo, i.entry.clone(), Some(i.checksum.clone())))
                .collect(),
        )?
        .with_export_info(backup_id.clone(), mode, since);
        let manifest_bytes = self.codec.encode(&manifest)?;

        // Dropping the temp file on any early return removes the partial archive
        let mut tmp = tempfile::Builder::new()
            .prefix(".photos-backup-")
            .suffix(".partial")
            .tempfile_in(&dest_dir)?;

        {
            let mut zip = ZipWriter::new(tmp.as_file_mut());

            zip.start_file(MANIFEST_ENTRY, options)?;
            zip.write_all(&manifest_bytes)?;

            // Scratch entries are already compressed; copy them byte for byte
            for index in 0..included.len() {
                if cancel.is_cancelled() {
                    log::info!("Archive build cancelled");
                    return Err(BackupError::Cancelled { committed: 0 });
                }
                zip.raw_copy_file(scratch.by_index_raw(index)?)?;
            }

            zip.finish()?;
        }

        tmp.as_file().sync_all()?;
        let file = tmp.persist(dest)?;
        let size_bytes = file.metadata()?.len();

        progress.finish("Backup complete");
        let errors = progress.take_errors();

        log::info!(
            "Archive {} written: {} categories, {} photos, {} omitted, {} bytes",
            backup_id,
            categories.len(),
            included.len(),
            omitted,
            size_bytes
        );

        Ok(ArchiveSummary {
            backup_id,
            handle: ArchiveHandle::new(dest),
            size_bytes,
            category_count: categories.len(),
            photo_count: included.len(),
            omitted,
            mode,
            baseline: since,
            created_at,
            errors,
        })
    }

    /// Read each photo once, hashing it and writing it into the scratch zip.
    /// Unreadable photos are omitted.
    fn stream_photos<'p>(
        &self,
        selected: &[&'p Photo],
        scratch: File,
        options: SimpleFileOptions,
        progress: &mut ProgressRecord,
        cancel: &CancellationToken,
    ) -> BackupResult<(Vec<Included<'p>>, usize, File)> {
        let mut zip = ZipWriter::new(scratch);
        let mut included = Vec::with_capacity(selected.len());
        let mut omitted = 0;

        for &photo in selected {
            if cancel.is_cancelled() {
                log::info!("Archive build cancelled");
                return Err(BackupError::Cancelled { committed: 0 });
            }

            match self.storage.read(&photo.path) {
                Ok(bytes) => {
                    let entry = photo_entry_name(photo.id, &photo.path);
                    zip.start_file(entry.as_str(), options)?;
                    zip.write_all(&bytes)?;
                    included.push(Included {
                        photo,
                        entry,
                        checksum: sha256_hex(&bytes),
                    });
                    progress.advance(format!("Archived {}", photo.name));
                }
                Err(e) => {
                    omitted += 1;
                    progress.record_error(format!(
                        "Photo {} ({}) omitted: {}",
                        photo.id, photo.path, e
                    ));
                    progress.advance(format!("Skipped {}", photo.name));
                }
            }
        }

        Ok((included, omitted, zip.finish()?))
    }

    fn check_free_space(&self, dir: &Path, needed: u64) -> BackupResult<()> {
        let Some(margin) = self.free_space_margin else {
            return Ok(());
        };
        let needed = needed.saturating_add(margin);
        let available = fs2::available_space(dir)?;
        if available < needed {
            return Err(BackupError::InsufficientSpace { needed, available });
        }
        Ok(())
    }
}

fn destination_dir(dest: &Path) -> PathBuf {
    match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{hash_reader, open_archive, read_manifest};
    use crate::test_support::{collecting_progress, FaultyStorage, Fixture};
    use std::sync::Arc;

    #[test]
    fn test_full_build_writes_manifest_first() {
        let fx = Fixture::new();
        fx.seed_family_library();
        let dest = fx.out("full.zip");

        let summary = ArchiveBuilder::new(&*fx.store, &*fx.storage)
            .build(None, &dest, &mut ProgressRecord::silent(), &CancellationToken::new())
            .unwrap();

        assert_eq!(summary.category_count, 3);
        assert_eq!(summary.photo_count, 12);
        assert_eq!(summary.omitted, 0);
        assert_eq!(summary.mode, BackupMode::Full);
        assert!(summary.size_bytes > 0);

        let mut archive = open_archive(&dest).unwrap();
        assert_eq!(archive.by_index(0).unwrap().name(), MANIFEST_ENTRY);

        let manifest = read_manifest(&mut archive, &ManifestCodec::default()).unwrap();
        assert_eq!(manifest.backup_id.as_deref(), Some(summary.backup_id.as_str()));
        for photo in &manifest.photos {
            assert!(photo.relative_path.starts_with("photos/"));
            let mut entry = archive.by_name(&photo.relative_path).unwrap();
            let checksum = hash_reader(&mut entry).unwrap();
            assert_eq!(Some(checksum), photo.checksum);
        }
    }

    #[test]
    fn test_incremental_selects_newer_photos_only() {
        let fx = Fixture::new();
        fx.seed_family_library();
        let dest = fx.out("incr.zip");

        // seeded photos are created at 1000, 2000, ..., 12000
        let summary = ArchiveBuilder::new(&*fx.store, &*fx.storage)
            .build(Some(9_000), &dest, &mut ProgressRecord::silent(), &CancellationToken::new())
            .unwrap();

        assert_eq!(summary.mode, BackupMode::Incremental);
        assert_eq!(summary.category_count, 3);
        assert_eq!(summary.photo_count, 3);

        let mut archive = open_archive(&dest).unwrap();
        let manifest = read_manifest(&mut archive, &ManifestCodec::default()).unwrap();
        assert_eq!(manifest.baseline, Some(9_000));
        assert!(manifest.photos.iter().all(|p| p.created_at > 9_000));
    }

    #[test]
    fn test_vanished_photo_is_omitted() {
        let fx = Fixture::new();
        fx.seed_family_library();
        let victim = fx.store.list_photos().unwrap()[4].clone();
        fx.storage.delete(&victim.path).unwrap();
        let dest = fx.out("partial.zip");

        let (mut progress, seen) = collecting_progress();
        let summary = ArchiveBuilder::new(&*fx.store, &*fx.storage)
            .build(None, &dest, &mut progress, &CancellationToken::new())
            .unwrap();

        assert_eq!(summary.photo_count, 11);
        assert_eq!(summary.omitted, 1);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].contains(&victim.path));

        let mut archive = open_archive(&dest).unwrap();
        let manifest = read_manifest(&mut archive, &ManifestCodec::default()).unwrap();
        assert!(manifest.photos.iter().all(|p| p.id != victim.id));

        let seen = seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last.processed, last.total);
        assert_eq!(last.total, 12);
        assert!(seen.windows(2).all(|w| w[0].processed <= w[1].processed));
    }

    #[test]
    fn test_photo_vanishing_mid_build_is_omitted() {
        let fx = Fixture::new();
        fx.seed_family_library();
        let victim = fx.store.list_photos().unwrap()[4].clone();
        // the victim disappears right after the first photo has been read
        let storage = FaultyStorage::new(Arc::clone(&fx.storage)).vanishing(&victim.path);
        let dest = fx.out("racy.zip");

        let summary = ArchiveBuilder::new(&*fx.store, &storage)
            .build(None, &dest, &mut ProgressRecord::silent(), &CancellationToken::new())
            .unwrap();

        assert_eq!(summary.photo_count, 11);
        assert_eq!(summary.omitted, 1);
        assert!(summary.errors[0].contains(&victim.path));
        // one read per photo
        assert_eq!(storage.reads(), 12);

        let mut archive = open_archive(&dest).unwrap();
        assert_eq!(archive.by_index(0).unwrap().name(), MANIFEST_ENTRY);
        let manifest = read_manifest(&mut archive, &ManifestCodec::default()).unwrap();
        assert_eq!(manifest.photos.len(), 11);
        for photo in &manifest.photos {
            let mut entry = archive.by_name(&photo.relative_path).unwrap();
            assert_eq!(Some(hash_reader(&mut entry).unwrap()), photo.checksum);
        }
    }

    #[test]
    fn test_cancelled_build_leaves_nothing() {
        let fx = Fixture::new();
        fx.seed_family_library();
        let dest = fx.out("cancelled.zip");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = ArchiveBuilder::new(&*fx.store, &*fx.storage).build(
            None,
            &dest,
            &mut ProgressRecord::silent(),
            &cancel,
        );

        assert!(matches!(result, Err(BackupError::Cancelled { committed: 0 })));
        assert!(!dest.exists());
    }

    #[test]
    fn test_insufficient_space_leaves_nothing() {
        let fx = Fixture::new();
        fx.seed_family_library();
        let dest = fx.out("huge.zip");

        let result = ArchiveBuilder::new(&*fx.store, &*fx.storage)
            .with_free_space_check(Some(u64::MAX / 2))
            .build(None, &dest, &mut ProgressRecord::silent(), &CancellationToken::new());

        assert!(matches!(result, Err(BackupError::InsufficientSpace { .. })));
        assert!(!dest.exists());
        let leftovers = std::fs::read_dir(dest.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_empty_library_builds_valid_archive() {
        let fx = Fixture::new();
        let dest = fx.out("empty.zip");

        let (mut progress, seen) = collecting_progress();
        let summary = ArchiveBuilder::new(&*fx.store, &*fx.storage)
            .build(None, &dest, &mut progress, &CancellationToken::new())
            .unwrap();

        assert_eq!(summary.photo_count, 0);
        assert!(dest.exists());
        let last = seen.lock().unwrap().last().cloned().unwrap();
        assert_eq!((last.processed, last.total), (0, 0));
    }
}
