//! Shared fixtures for unit tests

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::error::{BackupError, BackupResult};
use crate::model::{EncryptedFields, NewCategory, NewPhoto, Photo};
use crate::progress::{ProgressRecord, ProgressUpdate};
use crate::sqlite_store::SqliteLibrary;
use crate::storage::FsPhotoStorage;
use crate::store::{LibraryStore, PhotoStorage};

/// In-memory library plus on-disk photo storage in a temp dir
pub(crate) struct Fixture {
    pub dir: TempDir,
    pub store: Arc<SqliteLibrary>,
    pub storage: Arc<FsPhotoStorage>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsPhotoStorage::new(&dir.path().join("library")).unwrap();
        Self {
            store: Arc::new(SqliteLibrary::open_in_memory().unwrap()),
            storage: Arc::new(storage),
            dir,
        }
    }

    /// Second library sharing nothing with this one
    pub fn sibling(&self, name: &str) -> Self {
        let dir = tempfile::tempdir_in(self.dir.path()).unwrap();
        let storage = FsPhotoStorage::new(&dir.path().join(name)).unwrap();
        Self {
            store: Arc::new(SqliteLibrary::open_in_memory().unwrap()),
            storage: Arc::new(storage),
            dir,
        }
    }

    pub fn add_category(&self, name: &str, color: &str, position: i64) -> i64 {
        self.store
            .insert_category(&NewCategory::new(name, color, position))
            .unwrap()
    }

    pub fn add_photo(&self, category_id: i64, file: &str, created_at: i64, bytes: &[u8]) -> Photo {
        let path = format!("photos/{}", file);
        self.storage.save(&path, bytes).unwrap();
        let id = self
            .store
            .insert_photo(&NewPhoto {
                path: path.clone(),
                category_id,
                name: file.to_string(),
                created_at,
                file_size: bytes.len() as u64,
                width: 800,
                height: 600,
                is_favorite: created_at % 3000 == 0,
                encrypted: EncryptedFields::new(),
            })
            .unwrap();
        self.store.photo_by_path(&path).unwrap().filter(|p| p.id == id).unwrap()
    }

    /// Family/Friends/Pets with 12 photos spread 5/4/3, created at 1000..=12000
    pub fn seed_family_library(&self) -> Vec<i64> {
        let family = self.add_category("Family", "#E91E63", 0);
        let friends = self.add_category("Friends", "#2196F3", 1);
        let pets = self.add_category("Pets", "#795548", 2);

        for i in 1..=12i64 {
            let category = match i {
                1..=5 => family,
                6..=9 => friends,
                _ => pets,
            };
            let bytes = format!("photo-{}-pixels", i).repeat(i as usize * 10);
            self.add_photo(category, &format!("IMG_{:04}.jpg", i), i * 1000, bytes.as_bytes());
        }

        vec![family, friends, pets]
    }

    /// Path under a dedicated output directory
    pub fn out(&self, name: &str) -> PathBuf {
        let dir = self.dir.path().join("out");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }
}

/// `PhotoStorage` over a real one, with injectable faults
pub(crate) struct FaultyStorage {
    inner: Arc<FsPhotoStorage>,
    /// `save` fails for paths ending in this suffix
    fail_save: Option<String>,
    /// Deleted from the inner storage right after the first read
    vanish: Mutex<Option<String>>,
    reads: AtomicUsize,
}

impl FaultyStorage {
    pub fn new(inner: Arc<FsPhotoStorage>) -> Self {
        Self {
            inner,
            fail_save: None,
            vanish: Mutex::new(None),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn failing_save(mut self, suffix: &str) -> Self {
        self.fail_save = Some(suffix.to_string());
        self
    }

    pub fn vanishing(self, path: &str) -> Self {
        *self.vanish.lock().unwrap() = Some(path.to_string());
        self
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl PhotoStorage for FaultyStorage {
    fn save(&self, path: &str, bytes: &[u8]) -> BackupResult<()> {
        if self.fail_save.as_deref().is_some_and(|s| path.ends_with(s)) {
            return Err(BackupError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.save(path, bytes)
    }

    fn delete(&self, path: &str) -> BackupResult<()> {
        self.inner.delete(path)
    }

    fn read(&self, path: &str) -> BackupResult<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let result = self.inner.read(path);
        if let Some(victim) = self.vanish.lock().unwrap().take() {
            self.inner.delete(&victim)?;
        }
        result
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.exists(path)
    }

    fn available_space(&self) -> BackupResult<u64> {
        self.inner.available_space()
    }
}

/// Progress record that keeps every update
pub(crate) fn collecting_progress() -> (ProgressRecord, Arc<Mutex<Vec<ProgressUpdate>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let record = ProgressRecord::new(move |u| sink.lock().unwrap().push(u.clone()));
    (record, seen)
}

/// Write a zip by hand: `entries` in order, names and bytes verbatim
pub(crate) fn write_raw_archive(path: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = ZipWriter::new(file);
    for (name, bytes) in entries {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(bytes).unwrap();
    }
    zip.finish().unwrap();
}

/// Rewrite an archive, passing each entry through `edit` (returning `None` drops it)
pub(crate) fn rewrite_archive<F>(src: &Path, dest: &Path, mut edit: F)
where
    F: FnMut(&str, Vec<u8>) -> Option<Vec<u8>>,
{
    let mut archive = crate::archive::open_archive(src).unwrap();
    let names: Vec<String> = archive.file_names().map(String::from).collect();
    let mut entries = Vec::new();
    for name in &names {
        let bytes = crate::archive::read_entry(&mut archive, name).unwrap();
        if let Some(bytes) = edit(name, bytes) {
            entries.push((name.clone(), bytes));
        }
    }
    let borrowed: Vec<(&str, &[u8])> = entries
        .iter()
        .map(|(n, b)| (n.as_str(), b.as_slice()))
        .collect();
    write_raw_archive(dest, &borrowed);
}
