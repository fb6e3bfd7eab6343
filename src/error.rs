//! Photos Backup - Error Types

use thiserror::Error;

use crate::operation::OperationKind;

/// Result type for backup operations
pub type BackupResult<T> = Result<T, BackupError>;

/// Backup engine error types
#[derive(Error, Debug)]
pub enum BackupError {
    // ═══════════════════════════════════════════════════════════════
    // FILE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Not enough free space: {needed} bytes needed, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    // ═══════════════════════════════════════════════════════════════
    // MANIFEST ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Malformed manifest: field `{field}` {detail}")]
    MalformedManifest { field: String, detail: String },

    #[error("Unsupported manifest version {found} (supported: 1..={supported})")]
    UnsupportedVersion { found: i64, supported: u32 },

    #[error("Manifest checksum mismatch: expected {expected}, got {actual}")]
    ManifestChecksumMismatch { expected: String, actual: String },

    #[error("Manifest does not match archive contents: {0}")]
    ManifestInvalid(String),

    // ═══════════════════════════════════════════════════════════════
    // OPERATION ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Another backup operation is already running: {running}")]
    Busy { running: OperationKind },

    #[error("Operation not authorized")]
    Unauthorized,

    #[error("Operation cancelled ({committed} photos committed)")]
    Cancelled { committed: usize },

    #[error("Photo {photo_id} references unknown category {category_id}")]
    UnresolvableCategoryReference { photo_id: i64, category_id: i64 },

    #[error("Backup history entry not found: {0}")]
    HistoryEntryNotFound(String),

    #[error("Background worker exited without a result")]
    WorkerLost,

    // ═══════════════════════════════════════════════════════════════
    // STORE / SERIALIZATION ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BackupError {
    /// Errors coming from the manifest itself; restore never proceeds past these
    pub fn is_manifest_error(&self) -> bool {
        matches!(
            self,
            BackupError::MalformedManifest { .. }
                | BackupError::UnsupportedVersion { .. }
                | BackupError::ManifestChecksumMismatch { .. }
                | BackupError::ManifestInvalid(_)
                | BackupError::UnresolvableCategoryReference { .. }
        )
    }

    /// Whether the caller may simply try again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackupError::Busy { .. } | BackupError::InsufficientSpace { .. })
    }

    pub(crate) fn malformed(field: impl Into<String>, detail: impl Into<String>) -> Self {
        BackupError::MalformedManifest {
            field: field.into(),
            detail: detail.into(),
        }
    }
}

impl From<rusqlite::Error> for BackupError {
    fn from(e: rusqlite::Error) -> Self {
        BackupError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(e: serde_json::Error) -> Self {
        BackupError::Serialization(e.to_string())
    }
}

impl From<zip::result::ZipError> for BackupError {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(io) => BackupError::Io(io),
            other => BackupError::Archive(other.to_string()),
        }
    }
}

impl From<tempfile::PersistError> for BackupError {
    fn from(e: tempfile::PersistError) -> Self {
        BackupError::Io(e.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(BackupError::malformed("photos", "is missing").is_manifest_error());
        assert!(BackupError::UnsupportedVersion { found: 99, supported: 1 }.is_manifest_error());
        assert!(BackupError::Busy { running: OperationKind::Build }.is_retryable());
        assert!(!BackupError::Unauthorized.is_retryable());
    }

    #[test]
    fn test_malformed_names_field() {
        let err = BackupError::malformed("photos[3].relativePath", "is missing");
        assert!(err.to_string().contains("photos[3].relativePath"));
    }
}
