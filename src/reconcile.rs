//! Photos Backup - Reconciliation Engine
//!
//! Restores an archive into the live library under a caller-selected policy.
//! A restore is planned in full (remap table, photo targets, free space)
//! before the first write, then applied inside a single store batch.
//!
//! State machine: Planning → ApplyingCategories → ApplyingPhotos →
//! Finalizing → Succeeded | Failed.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{Read, Seek};
use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zip::ZipArchive;

use crate::archive::{open_archive, read_entry, read_manifest, sha256_hex};
use crate::config::UnresolvedCategoryPolicy;
use crate::error::{BackupError, BackupResult};
use crate::manifest::{Manifest, ManifestCodec, ManifestPhoto};
use crate::model::{basename, normalize_name, Category, NewCategory, NewPhoto};
use crate::operation::CancellationToken;
use crate::progress::ProgressRecord;
use crate::store::{LibraryStore, PhotoStorage};

/// Directory in photo storage that restored photos are written under
const LIBRARY_PHOTOS_DIR: &str = "photos";

/// Category created when an unresolved reference has no default to fall back to
const FALLBACK_CATEGORY_NAME: &str = "Uncategorized";
const FALLBACK_CATEGORY_COLOR: &str = "#9E9E9E";

// ═══════════════════════════════════════════════════════════════
// POLICY / SUMMARY
// ═══════════════════════════════════════════════════════════════

/// Conflict-resolution mode for a restore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportPolicy {
    /// Wipe the library, then import everything
    Replace,
    /// Keep existing data, add what is new
    Merge,
    /// Like `Merge`, skipping photos already present (same basename and size) in the target category
    MergeSkipDuplicates,
}

impl fmt::Display for ImportPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImportPolicy::Replace => "replace",
            ImportPolicy::Merge => "merge",
            ImportPolicy::MergeSkipDuplicates => "merge-skip-duplicates",
        };
        f.write_str(name)
    }
}

impl FromStr for ImportPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "replace" => Ok(ImportPolicy::Replace),
            "merge" => Ok(ImportPolicy::Merge),
            "merge-skip-duplicates" => Ok(ImportPolicy::MergeSkipDuplicates),
            other => Err(format!(
                "unknown policy '{}' (expected replace, merge or merge-skip-duplicates)",
                other
            )),
        }
    }
}

/// Restore lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreState {
    Planning,
    ApplyingCategories,
    ApplyingPhotos,
    Finalizing,
    Succeeded,
    Failed,
}

/// Result of a successful restore
#[derive(Debug, Clone, Serialize)]
pub struct RestoreSummary {
    pub policy: ImportPolicy,
    /// Backup the archive was produced by, if recorded
    pub backup_id: Option<String>,
    pub categories_created: usize,
    /// Manifest categories mapped onto an existing category
    pub categories_reused: usize,
    pub photos_imported: usize,
    pub photos_skipped_duplicate: usize,
    /// Photos skipped after a read, checksum or save failure
    pub photos_failed: usize,
    pub errors: Vec<String>,
    pub state: RestoreState,
}

impl RestoreSummary {
    fn new(policy: ImportPolicy) -> Self {
        Self {
            policy,
            backup_id: None,
            categories_created: 0,
            categories_reused: 0,
            photos_imported: 0,
            photos_skipped_duplicate: 0,
            photos_failed: 0,
            errors: Vec::new(),
            state: RestoreState::Planning,
        }
    }

    /// Photos not imported, for any reason
    pub fn skipped_total(&self) -> usize {
        self.photos_skipped_duplicate + self.photos_failed
    }
}

// ═══════════════════════════════════════════════════════════════
// PLAN
// ═══════════════════════════════════════════════════════════════

/// Where a manifest category lands in the live library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Existing(i64),
    /// Index into `RestorePlan::creates`
    Planned(usize),
}

struct RestorePlan {
    manifest: Manifest,
    creates: Vec<NewCategory>,
    /// Resolved target per manifest photo, same order as `manifest.photos`
    photo_targets: Vec<Target>,
    categories_reused: usize,
}

/// Mutable bookkeeping for one run
struct RestoreRun {
    summary: RestoreSummary,
    /// Binaries saved by this run, deleted again if the run fails
    written: Vec<String>,
    /// Local paths handed out by this run
    used_paths: HashSet<String>,
}

impl RestoreRun {
    fn transition(&mut self, next: RestoreState) {
        log::debug!("Restore state {:?} -> {:?}", self.summary.state, next);
        self.summary.state = next;
    }
}

// ═══════════════════════════════════════════════════════════════
// RECONCILER
// ═══════════════════════════════════════════════════════════════

/// Reconciliation Engine
pub struct Reconciler<'a> {
    store: &'a dyn LibraryStore,
    storage: &'a dyn PhotoStorage,
    codec: ManifestCodec,
    unresolved: UnresolvedCategoryPolicy,
    /// Required headroom for the free-space check; `None` skips the check
    free_space_margin: Option<u64>,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn LibraryStore, storage: &'a dyn PhotoStorage) -> Self {
        Self {
            store,
            storage,
            codec: ManifestCodec::default(),
            unresolved: UnresolvedCategoryPolicy::Fail,
            free_space_margin: None,
        }
    }

    pub fn with_codec(mut self, codec: ManifestCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_unresolved_policy(mut self, policy: UnresolvedCategoryPolicy) -> Self {
        self.unresolved = policy;
        self
    }

    pub fn with_free_space_check(mut self, margin: Option<u64>) -> Self {
        self.free_space_margin = margin;
        self
    }

    /// Restore the archive at `archive_path` into the library.
    ///
    /// On cancellation MERGE policies keep what was already imported and
    /// REPLACE rolls everything back; both report `Cancelled`.
    pub fn restore(
        &self,
        archive_path: &Path,
        policy: ImportPolicy,
        progress: &mut ProgressRecord,
        cancel: &CancellationToken,
    ) -> BackupResult<RestoreSummary> {
        log::info!("Restoring {} with policy {}", archive_path.display(), policy);

        let mut run = RestoreRun {
            summary: RestoreSummary::new(policy),
            written: Vec::new(),
            used_paths: HashSet::new(),
        };

        progress.set_operation("Planning restore");
        let mut archive = open_archive(archive_path)?;
        let plan = self.plan(&mut archive, policy, progress)?;
        run.summary.backup_id = plan.manifest.backup_id.clone();

        let previous_paths: Vec<String> = match policy {
            ImportPolicy::Replace => self.store.list_photos()?.into_iter().map(|p| p.path).collect(),
            _ => Vec::new(),
        };

        progress.set_total(plan.creates.len() + plan.manifest.photos.len());
        self.store.begin_batch()?;

        match self.apply(&plan, &mut archive, &mut run, progress, cancel) {
            Ok(()) => {}
            Err(BackupError::Cancelled { .. }) if policy != ImportPolicy::Replace => {
                let committed = run.summary.photos_imported;
                self.commit_or_abort(&mut run)?;
                log::info!("Restore cancelled, {} photos kept", committed);
                return Err(BackupError::Cancelled { committed });
            }
            Err(BackupError::Cancelled { .. }) => {
                self.abort(&mut run);
                log::info!("Restore cancelled, library rolled back");
                return Err(BackupError::Cancelled { committed: 0 });
            }
            Err(e) => {
                log::error!("Restore failed: {}", e);
                self.abort(&mut run);
                return Err(e);
            }
        }

        run.transition(RestoreState::Finalizing);
        self.commit_or_abort(&mut run)?;

        // Old binaries go only once the new library is durable
        for path in previous_paths.iter().filter(|p| !run.used_paths.contains(*p)) {
            if let Err(e) = self.storage.delete(path) {
                log::warn!("Could not delete replaced photo {}: {}", path, e);
            }
        }

        run.transition(RestoreState::Succeeded);
        progress.finish("Restore complete");
        run.summary.errors = progress.take_errors();

        log::info!(
            "Restore finished: {} categories created, {} reused, {} photos imported, {} skipped",
            run.summary.categories_created,
            run.summary.categories_reused,
            run.summary.photos_imported,
            run.summary.skipped_total()
        );

        Ok(run.summary)
    }

    /// Decode, check and resolve everything. No writes happen here.
    fn plan<R: Read + Seek>(
        &self,
        archive: &mut ZipArchive<R>,
        policy: ImportPolicy,
        progress: &mut ProgressRecord,
    ) -> BackupResult<RestorePlan> {
        let manifest = read_manifest(archive, &self.codec)?;

        {
            let entries: HashSet<&str> = archive.file_names().collect();
            if let Some(photo) = manifest
                .photos
                .iter()
                .find(|p| !entries.contains(p.relative_path.as_str()))
            {
                return Err(BackupError::ManifestInvalid(format!(
                    "photo {} points at missing entry {}",
                    photo.id, photo.relative_path
                )));
            }
        }

        let existing: Vec<Category> = match policy {
            ImportPolicy::Replace => Vec::new(),
            _ => self.store.list_categories()?,
        };

        let now = Utc::now().timestamp_millis();
        let mut by_name: HashMap<String, Target> = existing
            .iter()
            .map(|c| (c.normalized_name.clone(), Target::Existing(c.id)))
            .collect();
        let mut remap: HashMap<i64, Target> = HashMap::new();
        let mut creates: Vec<NewCategory> = Vec::new();
        let mut categories_reused = 0;

        for category in &manifest.categories {
            let normalized = normalize_name(&category.display_name);
            let target = match by_name.get(&normalized) {
                Some(&target) => {
                    if matches!(target, Target::Existing(_)) {
                        categories_reused += 1;
                    }
                    target
                }
                None => {
                    creates.push(NewCategory {
                        display_name: category.display_name.clone(),
                        normalized_name: normalized.clone(),
                        color_hex: category.color_hex.clone(),
                        position: category.position,
                        is_default: category.is_default,
                        created_at: if category.created_at > 0 { category.created_at } else { now },
                    });
                    let target = Target::Planned(creates.len() - 1);
                    by_name.insert(normalized, target);
                    target
                }
            };
            remap.insert(category.id, target);
        }

        let mut next_position = match policy {
            ImportPolicy::Replace => {
                let distinct: HashSet<i64> = creates.iter().map(|c| c.position).collect();
                if distinct.len() != creates.len() {
                    log::info!("Manifest category positions collide, renumbering");
                    for (i, category) in creates.iter_mut().enumerate() {
                        category.position = i as i64;
                    }
                }
                creates.iter().map(|c| c.position).max().map_or(0, |p| p + 1)
            }
            _ => {
                let mut next = existing.iter().map(|c| c.position).max().map_or(0, |p| p + 1);
                for category in creates.iter_mut() {
                    category.position = next;
                    next += 1;
                }
                next
            }
        };

        let mut fallback: Option<Target> = None;
        let mut photo_targets = Vec::with_capacity(manifest.photos.len());
        for photo in &manifest.photos {
            let target = match remap.get(&photo.category_id) {
                Some(&target) => target,
                None => match self.unresolved {
                    UnresolvedCategoryPolicy::Fail => {
                        return Err(BackupError::UnresolvableCategoryReference {
                            photo_id: photo.id,
                            category_id: photo.category_id,
                        });
                    }
                    UnresolvedCategoryPolicy::FallbackToDefault => {
                        let target = match fallback {
                            Some(target) => target,
                            None => {
                                let target = fallback_target(
                                    &existing,
                                    &mut creates,
                                    &by_name,
                                    &mut next_position,
                                    now,
                                );
                                fallback = Some(target);
                                target
                            }
                        };
                        progress.record_error(format!(
                            "Photo {} references unknown category {}, importing into the default category",
                            photo.id, photo.category_id
                        ));
                        target
                    }
                },
            };
            photo_targets.push(target);
        }

        if let Some(margin) = self.free_space_margin {
            let needed = manifest
                .photos
                .iter()
                .map(|p| p.file_size)
                .sum::<u64>()
                .saturating_add(margin);
            let available = self.storage.available_space()?;
            if available < needed {
                return Err(BackupError::InsufficientSpace { needed, available });
            }
        }

        log::debug!(
            "Restore plan: {} categories to create, {} reused, {} photos",
            creates.len(),
            categories_reused,
            photo_targets.len()
        );

        Ok(RestorePlan {
            manifest,
            creates,
            photo_targets,
            categories_reused,
        })
    }

    fn apply<R: Read + Seek>(
        &self,
        plan: &RestorePlan,
        archive: &mut ZipArchive<R>,
        run: &mut RestoreRun,
        progress: &mut ProgressRecord,
        cancel: &CancellationToken,
    ) -> BackupResult<()> {
        let policy = run.summary.policy;
        run.transition(RestoreState::ApplyingCategories);

        if policy == ImportPolicy::Replace {
            progress.set_operation("Clearing library");
            for photo in self.store.list_photos()? {
                self.store.delete_photo(photo.id)?;
            }
            for category in self.store.list_categories()? {
                self.store.delete_category(category.id)?;
            }
        }

        let mut created_ids = Vec::with_capacity(plan.creates.len());
        for category in &plan.creates {
            created_ids.push(self.store.insert_category(category)?);
            progress.advance(format!("Created category {}", category.display_name));
        }
        run.summary.categories_created = created_ids.len();
        run.summary.categories_reused = plan.categories_reused;

        let resolve = |target: Target| match target {
            Target::Existing(id) => id,
            Target::Planned(index) => created_ids[index],
        };

        run.transition(RestoreState::ApplyingPhotos);

        // (category, basename, size) of photos already in the library
        let mut present: HashSet<(i64, String, u64)> = match policy {
            ImportPolicy::MergeSkipDuplicates => self
                .store
                .list_photos()?
                .iter()
                .filter_map(|p| basename(&p.path).map(|b| (p.category_id, b.to_string(), p.file_size)))
                .collect(),
            _ => HashSet::new(),
        };

        for (photo, &target) in plan.manifest.photos.iter().zip(&plan.photo_targets) {
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled {
                    committed: run.summary.photos_imported,
                });
            }

            let category_id = resolve(target);
            let file_name = local_file_name(photo);
            let key = (category_id, file_name.clone(), photo.file_size);

            if policy == ImportPolicy::MergeSkipDuplicates && present.contains(&key) {
                run.summary.photos_skipped_duplicate += 1;
                progress.advance(format!("Skipped duplicate {}", photo.name));
                continue;
            }

            let bytes = match read_entry(archive, &photo.relative_path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    run.summary.photos_failed += 1;
                    progress.record_error(format!("Photo {} ({}) not restored: {}", photo.id, photo.name, e));
                    progress.advance(format!("Skipped {}", photo.name));
                    continue;
                }
            };

            if let Some(expected) = &photo.checksum {
                let actual = sha256_hex(&bytes);
                if !actual.eq_ignore_ascii_case(expected) {
                    run.summary.photos_failed += 1;
                    progress.record_error(format!(
                        "Photo {} ({}) not restored: checksum mismatch",
                        photo.id, photo.name
                    ));
                    progress.advance(format!("Skipped {}", photo.name));
                    continue;
                }
            }

            let path = self.choose_local_path(&file_name, &run.used_paths)?;
            if let Err(e) = self.storage.save(&path, &bytes) {
                run.summary.photos_failed += 1;
                progress.record_error(format!("Photo {} ({}) not restored: {}", photo.id, photo.name, e));
                progress.advance(format!("Skipped {}", photo.name));
                continue;
            }
            run.written.push(path.clone());
            run.used_paths.insert(path.clone());

            self.store.insert_photo(&NewPhoto {
                path,
                category_id,
                name: photo.name.clone(),
                created_at: photo.created_at,
                file_size: photo.file_size,
                width: photo.width,
                height: photo.height,
                is_favorite: photo.is_favorite,
                encrypted: photo.encrypted.clone(),
            })?;

            present.insert(key);
            run.summary.photos_imported += 1;
            progress.advance(format!("Restored {}", photo.name));
        }

        Ok(())
    }

    /// `photos/<name>` when free, else `photos/<8 hex>/<name>`
    fn choose_local_path(&self, file_name: &str, taken: &HashSet<String>) -> BackupResult<String> {
        let direct = format!("{}/{}", LIBRARY_PHOTOS_DIR, file_name);
        if self.path_is_free(&direct, taken)? {
            return Ok(direct);
        }
        loop {
            let token = Uuid::new_v4().simple().to_string();
            let candidate = format!("{}/{}/{}", LIBRARY_PHOTOS_DIR, &token[..8], file_name);
            if self.path_is_free(&candidate, taken)? {
                return Ok(candidate);
            }
        }
    }

    fn path_is_free(&self, path: &str, taken: &HashSet<String>) -> BackupResult<bool> {
        Ok(!taken.contains(path)
            && !self.storage.exists(path)
            && self.store.photo_by_path(path)?.is_none())
    }

    fn commit_or_abort(&self, run: &mut RestoreRun) -> BackupResult<()> {
        if let Err(e) = self.store.commit_batch() {
            log::error!("Commit failed: {}", e);
            self.abort(run);
            return Err(e);
        }
        Ok(())
    }

    /// Roll back the batch and remove binaries written by this run
    fn abort(&self, run: &mut RestoreRun) {
        if let Err(e) = self.store.rollback_batch() {
            log::error!("Rollback failed: {}", e);
        }
        for path in run.written.drain(..) {
            if let Err(e) = self.storage.delete(&path) {
                log::warn!("Could not remove restored file {}: {}", path, e);
            }
        }
        run.transition(RestoreState::Failed);
    }
}

/// Lowest-position default category, else a category named "Uncategorized"
fn fallback_target(
    existing: &[Category],
    creates: &mut Vec<NewCategory>,
    by_name: &HashMap<String, Target>,
    next_position: &mut i64,
    now: i64,
) -> Target {
    let existing_defaults = existing
        .iter()
        .filter(|c| c.is_default)
        .map(|c| (c.position, Target::Existing(c.id)));
    let planned_defaults = creates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_default)
        .map(|(i, c)| (c.position, Target::Planned(i)));
    if let Some((_, target)) = existing_defaults.chain(planned_defaults).min_by_key(|(p, _)| *p) {
        return target;
    }

    let normalized = normalize_name(FALLBACK_CATEGORY_NAME);
    if let Some(&target) = by_name.get(&normalized) {
        return target;
    }

    creates.push(NewCategory {
        display_name: FALLBACK_CATEGORY_NAME.to_string(),
        normalized_name: normalized,
        color_hex: FALLBACK_CATEGORY_COLOR.to_string(),
        position: *next_position,
        is_default: true,
        created_at: now,
    });
    *next_position += 1;
    Target::Planned(creates.len() - 1)
}

/// File name a restored photo is stored under: the source file name, else the
/// display name (archives written before `fileName` existed), else the entry name
fn local_file_name(photo: &ManifestPhoto) -> String {
    [
        photo.file_name.as_deref().unwrap_or_default(),
        photo.name.as_str(),
        photo.relative_path.as_str(),
    ]
    .into_iter()
    .filter_map(basename)
    .find(|n| !n.is_empty() && *n != ".")
    .map(String::from)
    .unwrap_or_else(|| format!("{}.jpg", photo.id))
}
