//! Photos Backup - Collaborator Interfaces
//!
//! The engine never owns the library database, the photo files or the
//! authentication UI. It talks to them through these traits.

use crate::error::BackupResult;
use crate::model::{Category, NewCategory, NewPhoto, Photo};
use crate::operation::OperationKind;

/// Category/photo CRUD over the live library
pub trait LibraryStore: Send + Sync {
    fn list_categories(&self) -> BackupResult<Vec<Category>>;
    fn insert_category(&self, category: &NewCategory) -> BackupResult<i64>;
    fn update_category(&self, category: &Category) -> BackupResult<()>;
    fn delete_category(&self, id: i64) -> BackupResult<()>;

    fn list_photos(&self) -> BackupResult<Vec<Photo>>;
    fn insert_photo(&self, photo: &NewPhoto) -> BackupResult<i64>;
    fn update_photo(&self, photo: &Photo) -> BackupResult<()>;
    fn delete_photo(&self, id: i64) -> BackupResult<()>;
    fn photo_by_path(&self, path: &str) -> BackupResult<Option<Photo>>;

    /// Start an all-or-nothing batch of writes
    fn begin_batch(&self) -> BackupResult<()>;
    /// Make the batch durable
    fn commit_batch(&self) -> BackupResult<()>;
    /// Discard every write since `begin_batch`
    fn rollback_batch(&self) -> BackupResult<()>;
}

/// On-disk photo file storage, addressed by relative path
pub trait PhotoStorage: Send + Sync {
    fn save(&self, path: &str, bytes: &[u8]) -> BackupResult<()>;
    fn delete(&self, path: &str) -> BackupResult<()>;
    fn read(&self, path: &str) -> BackupResult<Vec<u8>>;
    fn exists(&self, path: &str) -> bool;
    /// Free bytes on the volume holding the photos
    fn available_space(&self) -> BackupResult<u64>;
}

/// PIN/biometric gate, consulted once before a build or restore starts
pub trait AuthorizationGate: Send + Sync {
    fn may_proceed(&self, kind: OperationKind) -> bool;
}

/// Gate for hosts that authenticate elsewhere
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthorizationGate for AllowAll {
    fn may_proceed(&self, _kind: OperationKind) -> bool {
        true
    }
}
