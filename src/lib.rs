//! # Photos Backup
//!
//! Backup, export and restore engine for a family photo library.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     BACKUP ENGINE                        │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────┐   │
//! │  │  ARCHIVE    │  │  ARCHIVE    │  │  RECONCILIATION │   │
//! │  │  BUILDER    │  │  VALIDATOR  │  │  ENGINE         │   │
//! │  └──────┬──────┘  └──────┬──────┘  └────────┬────────┘   │
//! │         │                │                  │            │
//! │  ┌──────┴────────────────┴──────────────────┴─────────┐  │
//! │  │        MANIFEST CODEC  +  ZIP CONTAINER            │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                                                          │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────┐   │
//! │  │  OPERATION  │  │  PROGRESS   │  │  SCHEDULE       │   │
//! │  │  LOCK       │  │  STREAM     │  │  TRACKER        │   │
//! │  └─────────────┘  └─────────────┘  └─────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//!           │                 │                  │
//!     LibraryStore      PhotoStorage     AuthorizationGate
//! ```
//!
//! ## Guarantees
//!
//! - Archives are written to a temp file and renamed into place
//! - Manifests are checksummed and version-gated
//! - Restores are planned before the first write and applied in one batch
//! - One build or restore per engine at a time

pub mod api;
pub mod archive;
pub mod builder;
pub mod config;
pub mod error;
pub mod manifest;
pub mod model;
pub mod operation;
pub mod progress;
pub mod reconcile;
pub mod schedule;
pub mod sqlite_store;
pub mod storage;
pub mod store;
pub mod validator;

#[cfg(test)]
mod test_support;

pub use api::BackupEngine;
pub use archive::ArchiveHandle;
pub use builder::{ArchiveSummary, Baseline, ExportMode};
pub use config::{EngineConfig, UnresolvedCategoryPolicy};
pub use error::{BackupError, BackupResult};
pub use manifest::{Manifest, ManifestCodec};
pub use operation::{CancellationToken, OperationKind};
pub use progress::{OperationHandle, ProgressEvent, ProgressUpdate};
pub use reconcile::{ImportPolicy, RestoreSummary};
pub use schedule::{BackupHistoryEntry, Frequency, Schedule};
pub use sqlite_store::SqliteLibrary;
pub use storage::FsPhotoStorage;
pub use store::{AllowAll, AuthorizationGate, LibraryStore, PhotoStorage};
pub use validator::ValidationReport;

/// Photos Backup version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
