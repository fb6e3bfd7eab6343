//! Photos Backup - Archive Validator
//!
//! Read-only integrity check of an archive. Every discrepancy is collected
//! so a single pass reports all problems.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Serialize;

use crate::archive::{hash_reader, open_archive, read_manifest_unverified, MANIFEST_ENTRY};
use crate::manifest::{Manifest, ManifestCodec};
use crate::model::normalize_name;
use crate::progress::ProgressRecord;

/// Outcome of validating an archive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub category_count: usize,
    pub photo_count: usize,
    /// Manifest version, when the manifest could be decoded
    pub version: Option<u32>,
    pub exported_at: Option<i64>,
}

impl ValidationReport {
    fn error(&mut self, message: String) {
        log::warn!("Validation error: {}", message);
        self.errors.push(message);
    }

    fn warning(&mut self, message: String) {
        log::debug!("Validation warning: {}", message);
        self.warnings.push(message);
    }
}

/// Archive Validator
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveValidator {
    codec: ManifestCodec,
}

impl ArchiveValidator {
    pub fn new(codec: ManifestCodec) -> Self {
        Self { codec }
    }

    pub fn validate(&self, path: &Path) -> ValidationReport {
        self.validate_with_progress(path, &mut ProgressRecord::silent())
    }

    /// Validate, emitting one progress unit per manifest photo
    pub fn validate_with_progress(&self, path: &Path, progress: &mut ProgressRecord) -> ValidationReport {
        let mut report = ValidationReport::default();
        log::info!("Validating archive {}", path.display());

        let mut archive = match open_archive(path) {
            Ok(archive) => archive,
            Err(e) => {
                report.error(format!("Cannot open archive: {}", e));
                progress.finish("Validation failed");
                return report;
            }
        };

        let manifest = match read_manifest_unverified(&mut archive, &self.codec) {
            Ok(manifest) => manifest,
            Err(e) => {
                report.error(format!("Invalid manifest: {}", e));
                progress.finish("Validation failed");
                return report;
            }
        };

        report.version = Some(manifest.version);
        report.exported_at = Some(manifest.exported_at);
        report.category_count = manifest.categories.len();
        report.photo_count = manifest.photos.len();

        // A stale checksum is one finding among others; the records are still checked
        if let Err(e) = manifest.verify_checksum() {
            report.error(format!("Invalid manifest: {}", e));
        }

        check_categories(&manifest, &mut report);

        let entry_names: HashSet<String> = archive.file_names().map(String::from).collect();
        let mut referenced: HashSet<&str> = HashSet::new();

        progress.set_total(manifest.photos.len());
        for photo in &manifest.photos {
            let path = photo.relative_path.as_str();

            if !referenced.insert(path) {
                report.error(format!("Photo {}: path {} is used by more than one photo", photo.id, path));
            }

            if manifest.category(photo.category_id).is_none() {
                report.error(format!(
                    "Photo {} references unknown category {}",
                    photo.id, photo.category_id
                ));
            }

            if !entry_names.contains(path) {
                report.error(format!("Photo {}: missing binary {}", photo.id, path));
            } else if let Some(expected) = &photo.checksum {
                match archive.by_name(path) {
                    Ok(mut entry) => match hash_reader(&mut entry) {
                        Ok(actual) if actual.eq_ignore_ascii_case(expected) => {}
                        Ok(actual) => report.error(format!(
                            "Photo {}: checksum mismatch for {} (expected {}, got {})",
                            photo.id, path, expected, actual
                        )),
                        Err(e) => report.error(format!("Photo {}: cannot read {}: {}", photo.id, path, e)),
                    },
                    Err(e) => report.error(format!("Photo {}: cannot open {}: {}", photo.id, path, e)),
                }
            } else {
                report.warning(format!("Photo {}: no checksum stored for {}", photo.id, path));
            }

            progress.advance(format!("Checked {}", photo.name));
        }

        let mut orphans: Vec<&String> = entry_names
            .iter()
            .filter(|name| {
                name.as_str() != MANIFEST_ENTRY && !name.ends_with('/') && !referenced.contains(name.as_str())
            })
            .collect();
        orphans.sort();
        for orphan in orphans {
            report.warning(format!("Orphaned binary not referenced by the manifest: {}", orphan));
        }

        report.is_valid = report.errors.is_empty();
        progress.finish(if report.is_valid { "Archive valid" } else { "Archive invalid" });

        log::info!(
            "Validation of {} finished: valid={}, {} errors, {} warnings",
            path.display(),
            report.is_valid,
            report.errors.len(),
            report.warnings.len()
        );

        report
    }
}

fn check_categories(manifest: &Manifest, report: &mut ValidationReport) {
    let mut ids = HashSet::new();
    let mut names: HashMap<String, i64> = HashMap::new();

    for category in &manifest.categories {
        if !ids.insert(category.id) {
            report.error(format!("Category id {} appears more than once", category.id));
        }
        let normalized = normalize_name(&category.display_name);
        if let Some(first) = names.insert(normalized, category.id) {
            report.warning(format!(
                "Categories {} and {} share the name \"{}\" and will be merged",
                first, category.id, category.display_name
            ));
        }
    }
}
