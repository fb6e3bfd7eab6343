//! Photos Backup - Engine Configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BackupError, BackupResult};
use crate::manifest::CURRENT_VERSION;

/// What to do with a photo whose category reference resolves to nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedCategoryPolicy {
    /// Abort the restore before any write
    Fail,
    /// Import into the default category (created as "Uncategorized" if none exists)
    FallbackToDefault,
}

/// Compression used for photo entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveCompression {
    Deflated,
    Stored,
}

impl ArchiveCompression {
    pub(crate) fn method(self) -> zip::CompressionMethod {
        match self {
            ArchiveCompression::Deflated => zip::CompressionMethod::Deflated,
            ArchiveCompression::Stored => zip::CompressionMethod::Stored,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding schedule and history state
    pub state_dir: PathBuf,
    /// History entries kept (oldest dropped first)
    pub history_limit: usize,
    /// Handling of unresolvable category references during restore
    pub unresolved_category: UnresolvedCategoryPolicy,
    /// Check free space before building or restoring
    pub check_free_space: bool,
    /// Headroom required on top of the estimated size
    pub free_space_margin_bytes: u64,
    /// Compression for archive entries
    pub compression: ArchiveCompression,
    /// Highest manifest version accepted on read
    pub max_manifest_version: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./backup-state"),
            history_limit: 20,
            unresolved_category: UnresolvedCategoryPolicy::Fail,
            check_free_space: true,
            free_space_margin_bytes: 16 * 1024 * 1024,
            compression: ArchiveCompression::Deflated,
            max_manifest_version: CURRENT_VERSION,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; a missing file means defaults
    pub fn load_or_default(path: &Path) -> BackupResult<Self> {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| {
            BackupError::Serialization(format!("config {}: {}", path.display(), e))
        })
    }

    /// Config with state kept under `state_dir`
    pub fn with_state_dir<P: AsRef<Path>>(state_dir: P) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}
