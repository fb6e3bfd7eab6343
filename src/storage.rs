//! Photos Backup - Filesystem Photo Storage
//!
//! Reference `PhotoStorage`: photo files under a root directory, written
//! atomically.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use crate::error::{BackupError, BackupResult};
use crate::store::PhotoStorage;

/// Photo files below a root directory
pub struct FsPhotoStorage {
    /// Root directory
    root: PathBuf,
}

impl FsPhotoStorage {
    /// Create storage rooted at `root` (created if missing)
    pub fn new(root: &Path) -> BackupResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path, refusing anything that escapes the root
    fn full_path(&self, relative: &str) -> BackupResult<PathBuf> {
        let rel = Path::new(relative);
        let escapes = relative.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(BackupError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid storage path: {}", relative),
            )));
        }
        Ok(self.root.join(rel))
    }
}

impl PhotoStorage for FsPhotoStorage {
    /// Write file atomically
    fn save(&self, path: &str, bytes: &[u8]) -> BackupResult<()> {
        let path = self.full_path(path)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        let result = (|| {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&temp_path, &path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        Ok(())
    }

    fn delete(&self, path: &str) -> BackupResult<()> {
        let path = self.full_path(path)?;
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn read(&self, path: &str) -> BackupResult<Vec<u8>> {
        let full = self.full_path(path)?;
        if !full.is_file() {
            return Err(BackupError::FileNotFound(path.to_string()));
        }
        Ok(fs::read(&full)?)
    }

    fn exists(&self, path: &str) -> bool {
        self.full_path(path).map(|p| p.exists()).unwrap_or(false)
    }

    fn available_space(&self) -> BackupResult<u64> {
        Ok(fs2::available_space(&self.root)?)
    }
}
