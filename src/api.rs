//! Photos Backup - Engine API
//!
//! Single entry point for build, validate, restore and scheduled runs.
//! Owns the operation lock, so at most one build or restore is in flight
//! per engine.

use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use crate::archive::ArchiveHandle;
use crate::builder::{ArchiveBuilder, ArchiveSummary, Baseline, ExportMode};
use crate::config::EngineConfig;
use crate::error::{BackupError, BackupResult};
use crate::manifest::{BackupMode, ManifestCodec};
use crate::operation::{CancellationToken, OperationGuard, OperationKind, OperationLock};
use crate::progress::{self, OperationHandle, ProgressRecord};
use crate::reconcile::{ImportPolicy, Reconciler, RestoreSummary};
use crate::schedule::{BackupHistoryEntry, Schedule, ScheduleTracker};
use crate::store::{AuthorizationGate, LibraryStore, PhotoStorage};
use crate::validator::{ArchiveValidator, ValidationReport};

/// Backup engine
///
/// ```rust,ignore
/// let engine = Arc::new(BackupEngine::new(store, storage, Arc::new(AllowAll), config)?);
///
/// let summary = engine.build_archive(ExportMode::Full, Path::new("family.zip"))?.wait()?;
/// let report = engine.validate_archive(&summary.handle);
/// if report.is_valid {
///     engine.restore_archive(&summary.handle, ImportPolicy::MergeSkipDuplicates)?.wait()?;
/// }
/// ```
pub struct BackupEngine {
    store: Arc<dyn LibraryStore>,
    storage: Arc<dyn PhotoStorage>,
    gate: Arc<dyn AuthorizationGate>,
    config: EngineConfig,
    /// "Operation in progress" flag
    lock: Arc<OperationLock>,
    tracker: ScheduleTracker,
}

impl BackupEngine {
    // ═══════════════════════════════════════════════════════════════
    // INITIALIZATION
    // ═══════════════════════════════════════════════════════════════

    pub fn new(
        store: Arc<dyn LibraryStore>,
        storage: Arc<dyn PhotoStorage>,
        gate: Arc<dyn AuthorizationGate>,
        config: EngineConfig,
    ) -> BackupResult<Self> {
        let tracker = ScheduleTracker::load_or_create(&config.state_dir, config.history_limit)?;
        log::debug!("Backup engine ready, state in {}", config.state_dir.display());

        Ok(Self {
            store,
            storage,
            gate,
            config,
            lock: OperationLock::new(),
            tracker,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ═══════════════════════════════════════════════════════════════
    // BUILD
    // ═══════════════════════════════════════════════════════════════

    /// Start a build on a worker thread
    pub fn build_archive(
        self: &Arc<Self>,
        mode: ExportMode,
        dest: &Path,
    ) -> BackupResult<OperationHandle<ArchiveSummary>> {
        let guard = self.claim(OperationKind::Build)?;
        let since = self.resolve_since(&mode)?;

        let (sender, stream) = progress::channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let engine = Arc::clone(self);
        let dest = dest.to_path_buf();

        std::thread::Builder::new()
            .name("photos-backup-build".into())
            .spawn(move || {
                let mut progress = ProgressRecord::for_sender(sender.clone());
                let result = engine.run_build(since, &dest, false, &mut progress, &token);
                drop(guard);
                sender.finish(result);
            })?;

        Ok(OperationHandle::new(stream, cancel))
    }

    /// Build on the caller's thread
    pub fn build_archive_blocking(
        &self,
        mode: ExportMode,
        dest: &Path,
        progress: &mut ProgressRecord,
        cancel: &CancellationToken,
    ) -> BackupResult<ArchiveSummary> {
        let _guard = self.claim(OperationKind::Build)?;
        let since = self.resolve_since(&mode)?;
        self.run_build(since, dest, false, progress, cancel)
    }

    // ═══════════════════════════════════════════════════════════════
    // VALIDATE / RESTORE
    // ═══════════════════════════════════════════════════════════════

    /// Read-only check; runs alongside anything else
    pub fn validate_archive(&self, handle: &ArchiveHandle) -> ValidationReport {
        ArchiveValidator::new(self.codec()).validate(handle.path())
    }

    /// Start a restore on a worker thread
    pub fn restore_archive(
        self: &Arc<Self>,
        handle: &ArchiveHandle,
        policy: ImportPolicy,
    ) -> BackupResult<OperationHandle<RestoreSummary>> {
        let guard = self.claim(OperationKind::Restore)?;

        let (sender, stream) = progress::channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let engine = Arc::clone(self);
        let path = handle.path().to_path_buf();

        std::thread::Builder::new()
            .name("photos-backup-restore".into())
            .spawn(move || {
                let mut progress = ProgressRecord::for_sender(sender.clone());
                let result = engine.run_restore(&path, policy, &mut progress, &token);
                drop(guard);
                sender.finish(result);
            })?;

        Ok(OperationHandle::new(stream, cancel))
    }

    /// Restore on the caller's thread
    pub fn restore_archive_blocking(
        &self,
        handle: &ArchiveHandle,
        policy: ImportPolicy,
        progress: &mut ProgressRecord,
        cancel: &CancellationToken,
    ) -> BackupResult<RestoreSummary> {
        let _guard = self.claim(OperationKind::Restore)?;
        self.run_restore(handle.path(), policy, progress, cancel)
    }

    // ═══════════════════════════════════════════════════════════════
    // SCHEDULE / HISTORY
    // ═══════════════════════════════════════════════════════════════

    pub fn backup_history(&self) -> Vec<BackupHistoryEntry> {
        self.tracker.history()
    }

    pub fn schedule(&self) -> Schedule {
        self.tracker.get_schedule()
    }

    pub fn set_schedule(&self, schedule: Schedule) -> BackupResult<()> {
        self.tracker.set_schedule(schedule)
    }

    pub fn is_busy(&self) -> bool {
        self.lock.is_busy()
    }

    pub fn current_operation(&self) -> Option<OperationKind> {
        self.lock.current()
    }

    /// Schedule enabled and no operation in flight
    pub fn is_run_now_allowed(&self) -> bool {
        self.tracker.is_run_now_allowed(&self.lock)
    }

    /// Run the scheduled backup if one is due at `now`.
    ///
    /// Writes `backup_<YYYYMMDD>_<HHMMSS>.zip` under `dest_dir`. Returns
    /// `None` when nothing is due or another operation is running.
    pub fn run_scheduled_backup(&self, dest_dir: &Path, now: i64) -> BackupResult<Option<ArchiveSummary>> {
        let schedule = self.tracker.get_schedule();
        if !schedule.is_due(now) {
            return Ok(None);
        }
        if !self.is_run_now_allowed() {
            log::info!("Scheduled backup due but {:?} is running", self.current_operation());
            return Ok(None);
        }

        let _guard = self.claim(OperationKind::ScheduledBuild)?;
        let since = if schedule.incremental {
            self.tracker.last_successful().map(|e| e.created_at)
        } else {
            None
        };

        let stamp = Utc
            .timestamp_millis_opt(now)
            .single()
            .unwrap_or_else(Utc::now)
            .format("backup_%Y%m%d_%H%M%S.zip")
            .to_string();
        let dest = dest_dir.join(stamp);

        self.tracker.mark_run(now)?;
        log::info!("Running scheduled backup to {}", dest.display());

        self.run_build(
            since,
            &dest,
            true,
            &mut ProgressRecord::silent(),
            &CancellationToken::new(),
        )
        .map(Some)
    }

    // ═══════════════════════════════════════════════════════════════
    // INTERNALS
    // ═══════════════════════════════════════════════════════════════

    /// Busy check first, then the authorization gate, exactly once
    fn claim(&self, kind: OperationKind) -> BackupResult<OperationGuard> {
        let guard = self.lock.try_acquire(kind)?;
        if !self.gate.may_proceed(kind) {
            log::warn!("{} refused by authorization gate", kind);
            return Err(BackupError::Unauthorized);
        }
        Ok(guard)
    }

    fn resolve_since(&self, mode: &ExportMode) -> BackupResult<Option<i64>> {
        match mode {
            ExportMode::Full => Ok(None),
            ExportMode::Incremental(Baseline::Since(ts)) => Ok(Some(*ts)),
            ExportMode::Incremental(Baseline::Backup(id)) => self
                .tracker
                .find(id)
                .filter(|e| e.success)
                .map(|e| Some(e.created_at))
                .ok_or_else(|| BackupError::HistoryEntryNotFound(id.clone())),
        }
    }

    fn codec(&self) -> ManifestCodec {
        ManifestCodec::new(self.config.max_manifest_version)
    }

    fn free_space_margin(&self) -> Option<u64> {
        self.config
            .check_free_space
            .then_some(self.config.free_space_margin_bytes)
    }

    fn run_build(
        &self,
        since: Option<i64>,
        dest: &Path,
        scheduled: bool,
        progress: &mut ProgressRecord,
        cancel: &CancellationToken,
    ) -> BackupResult<ArchiveSummary> {
        let result = ArchiveBuilder::new(&*self.store, &*self.storage)
            .with_codec(self.codec())
            .with_compression(self.config.compression)
            .with_free_space_check(self.free_space_margin())
            .build(since, dest, progress, cancel);

        let entry = match &result {
            Ok(summary) => Some(BackupHistoryEntry::succeeded(summary, scheduled)),
            Err(BackupError::Cancelled { .. }) => None,
            Err(e) => {
                let mode = if since.is_some() { BackupMode::Incremental } else { BackupMode::Full };
                Some(BackupHistoryEntry::failed(dest, mode, e, scheduled))
            }
        };
        if let Some(entry) = entry {
            if let Err(e) = self.tracker.record(entry) {
                log::warn!("Could not record backup history: {}", e);
            }
        }

        result
    }

    fn run_restore(
        &self,
        path: &Path,
        policy: ImportPolicy,
        progress: &mut ProgressRecord,
        cancel: &CancellationToken,
    ) -> BackupResult<RestoreSummary> {
        Reconciler::new(&*self.store, &*self.storage)
            .with_codec(self.codec())
            .with_unresolved_policy(self.config.unresolved_category)
            .with_free_space_check(self.free_space_margin())
            .restore(path, policy, progress, cancel)
    }
}
