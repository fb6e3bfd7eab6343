//! Photos Backup - Manifest Codec
//!
//! The manifest is the JSON document stored as `manifest.json` inside every
//! archive. Encoding is a pure data transform; decoding validates the version
//! and required fields before attempting a typed parse.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::archive::sha256_hex;
use crate::error::{BackupError, BackupResult};
use crate::model::{basename, Category, EncryptedFields, Photo};

/// Current archive format revision
pub const CURRENT_VERSION: u32 = 1;

const REQUIRED_TOP_LEVEL: &[&str] = &["version", "exportedAt", "categories", "photos"];
const REQUIRED_CATEGORY: &[&str] = &["id", "displayName", "colorHex", "position"];
const REQUIRED_PHOTO: &[&str] = &[
    "id",
    "name",
    "categoryId",
    "createdAt",
    "fileSize",
    "relativePath",
];

/// Kind of export that produced an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    #[default]
    Full,
    Incremental,
}

/// Category record inside a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestCategory {
    /// Symbolic identifier, only meaningful inside this manifest
    pub id: i64,
    pub display_name: String,
    pub color_hex: String,
    pub position: i64,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub created_at: i64,
}

impl From<&Category> for ManifestCategory {
    fn from(c: &Category) -> Self {
        Self {
            id: c.id,
            display_name: c.display_name.clone(),
            color_hex: c.color_hex.clone(),
            position: c.position,
            is_default: c.is_default,
            created_at: c.created_at,
        }
    }
}

/// Photo record inside a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestPhoto {
    pub id: i64,
    pub name: String,
    /// Symbolic reference to a `ManifestCategory::id`
    pub category_id: i64,
    pub created_at: i64,
    pub file_size: u64,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub is_favorite: bool,
    /// File name the photo had in the source library
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Path of the binary entry inside the archive
    pub relative_path: String,
    /// SHA-256 (hex) of the binary entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "EncryptedFields::is_empty")]
    pub encrypted: EncryptedFields,
}

impl ManifestPhoto {
    /// Build a manifest record for a live photo stored at `relative_path` in the archive
    pub fn from_photo(photo: &Photo, relative_path: String, checksum: Option<String>) -> Self {
        Self {
            id: photo.id,
            name: photo.name.clone(),
            category_id: photo.category_id,
            created_at: photo.created_at,
            file_size: photo.file_size,
            width: photo.width,
            height: photo.height,
            is_favorite: photo.is_favorite,
            file_name: basename(&photo.path).map(String::from),
            relative_path,
            checksum,
            encrypted: photo.encrypted.clone(),
        }
    }
}

/// Archive metadata document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,
    /// Export timestamp (epoch millis)
    pub exported_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default)]
    pub mode: BackupMode,
    /// Incremental cutoff (epoch millis), if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<i64>,
    pub categories: Vec<ManifestCategory>,
    pub photos: Vec<ManifestPhoto>,
    /// SHA-256 over the canonical JSON of `(categories, photos)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Manifest {
    /// Create a manifest and seal it with its content checksum
    pub fn new(
        version: u32,
        exported_at: i64,
        categories: Vec<ManifestCategory>,
        photos: Vec<ManifestPhoto>,
    ) -> BackupResult<Self> {
        let mut manifest = Self {
            version,
            exported_at,
            backup_id: None,
            mode: BackupMode::Full,
            baseline: None,
            categories,
            photos,
            checksum: None,
        };
        manifest.checksum = Some(manifest.content_checksum()?);
        Ok(manifest)
    }

    /// Tag the manifest with the export it belongs to
    pub fn with_export_info(mut self, backup_id: String, mode: BackupMode, baseline: Option<i64>) -> Self {
        self.backup_id = Some(backup_id);
        self.mode = mode;
        self.baseline = baseline;
        self
    }

    /// Checksum of the category and photo records
    pub fn content_checksum(&self) -> BackupResult<String> {
        let body = serde_json::to_vec(&(&self.categories, &self.photos))?;
        Ok(sha256_hex(&body))
    }

    /// Compare the stored checksum, if any, against the records
    pub fn verify_checksum(&self) -> BackupResult<()> {
        let Some(expected) = &self.checksum else {
            return Ok(());
        };
        let actual = self.content_checksum()?;
        if !expected.eq_ignore_ascii_case(&actual) {
            return Err(BackupError::ManifestChecksumMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        Ok(())
    }

    pub fn category(&self, id: i64) -> Option<&ManifestCategory> {
        self.categories.iter().find(|c| c.id == id)
    }
}

/// Encoder/decoder bound to the highest format revision it understands
#[derive(Debug, Clone, Copy)]
pub struct ManifestCodec {
    max_version: u32,
}

impl Default for ManifestCodec {
    fn default() -> Self {
        Self { max_version: CURRENT_VERSION }
    }
}

impl ManifestCodec {
    /// Codec accepting revisions up to `max_version`, never beyond `CURRENT_VERSION`
    pub fn new(max_version: u32) -> Self {
        Self {
            max_version: max_version.min(CURRENT_VERSION),
        }
    }

    pub fn max_version(&self) -> u32 {
        self.max_version
    }

    /// Serialize a manifest. Same input always yields the same bytes.
    pub fn encode(&self, manifest: &Manifest) -> BackupResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(manifest)?)
    }

    /// Build and serialize a manifest from live records
    pub fn encode_parts(
        &self,
        categories: &[Category],
        photos: &[ManifestPhoto],
        version: u32,
        exported_at: i64,
    ) -> BackupResult<Vec<u8>> {
        let manifest = Manifest::new(
            version,
            exported_at,
            categories.iter().map(ManifestCategory::from).collect(),
            photos.to_vec(),
        )?;
        self.encode(&manifest)
    }

    /// Parse and check a manifest, including its content checksum
    pub fn decode(&self, bytes: &[u8]) -> BackupResult<Manifest> {
        let manifest = self.decode_unverified(bytes)?;
        manifest.verify_checksum()?;
        Ok(manifest)
    }

    /// Parse with the version and required-field gates but without comparing
    /// the content checksum. Callers report a mismatch via `Manifest::verify_checksum`.
    pub fn decode_unverified(&self, bytes: &[u8]) -> BackupResult<Manifest> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| BackupError::malformed("$", format!("is not valid JSON: {}", e)))?;

        let root = value
            .as_object()
            .ok_or_else(|| BackupError::malformed("$", "is not an object"))?;

        for field in REQUIRED_TOP_LEVEL {
            if root.get(*field).map_or(true, Value::is_null) {
                return Err(BackupError::malformed(*field, "is missing"));
            }
        }

        // Version gate comes before anything else so future formats are never half-parsed
        let version = root["version"]
            .as_i64()
            .ok_or_else(|| BackupError::malformed("version", "is not an integer"))?;
        if version < 1 || version > i64::from(self.max_version) {
            return Err(BackupError::UnsupportedVersion {
                found: version,
                supported: self.max_version,
            });
        }

        check_records(&root["categories"], "categories", REQUIRED_CATEGORY)?;
        check_records(&root["photos"], "photos", REQUIRED_PHOTO)?;

        serde_json::from_value(value).map_err(|e| BackupError::malformed("$", e.to_string()))
    }
}

fn check_records(value: &Value, name: &str, required: &[&str]) -> BackupResult<()> {
    let items = value
        .as_array()
        .ok_or_else(|| BackupError::malformed(name, "is not an array"))?;

    for (i, item) in items.iter().enumerate() {
        let record = item
            .as_object()
            .ok_or_else(|| BackupError::malformed(format!("{}[{}]", name, i), "is not an object"))?;
        for field in required {
            if record.get(*field).map_or(true, Value::is_null) {
                return Err(BackupError::malformed(
                    format!("{}[{}].{}", name, i, field),
                    "is missing",
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EncryptedBlob;

    fn sample() -> Manifest {
        let categories = vec![
            ManifestCategory {
                id: 1,
                display_name: "Family".into(),
                color_hex: "#E91E63".into(),
                position: 0,
                is_default: true,
                created_at: 1_700_000_000_000,
            },
            ManifestCategory {
                id: 2,
                display_name: "Pets".into(),
                color_hex: "#795548".into(),
                position: 1,
                is_default: false,
                created_at: 1_700_000_000_000,
            },
        ];
        let mut encrypted = EncryptedFields::new();
        encrypted.insert("notes".into(), EncryptedBlob(vec![1, 2, 3, 4]));
        let photos = vec![ManifestPhoto {
            id: 7,
            name: "beach.jpg".into(),
            category_id: 2,
            created_at: 1_700_000_100_000,
            file_size: 2048,
            width: 640,
            height: 480,
            is_favorite: true,
            file_name: Some("IMG_0007.jpg".into()),
            relative_path: "photos/7.jpg".into(),
            checksum: Some("ab".repeat(32)),
            encrypted,
        }];
        Manifest::new(CURRENT_VERSION, 1_700_000_200_000, categories, photos).unwrap()
    }

    #[test]
    fn test_encode_is_deterministic() {
        let codec = ManifestCodec::default();
        let a = codec.encode(&sample()).unwrap();
        let b = codec.encode(&sample()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_decode_encoded_manifest() {
        let codec = ManifestCodec::default();
        let manifest = sample();
        let decoded = codec.decode(&codec.encode(&manifest).unwrap()).unwrap();
        assert_eq!(decoded, manifest);
        assert_eq!(decoded.photos[0].encrypted["notes"].0, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_schema_uses_camel_case() {
        let codec = ManifestCodec::default();
        let text = String::from_utf8(codec.encode(&sample()).unwrap()).unwrap();
        assert!(text.contains("\"exportedAt\""));
        assert!(text.contains("\"relativePath\": \"photos/7.jpg\""));
        assert!(text.contains("\"colorHex\": \"#E91E63\""));
    }

    #[test]
    fn test_future_version_rejected() {
        let codec = ManifestCodec::default();
        let mut value: Value = serde_json::from_slice(&codec.encode(&sample()).unwrap()).unwrap();
        value["version"] = Value::from(99);
        let bytes = serde_json::to_vec(&value).unwrap();

        match codec.decode(&bytes) {
            Err(BackupError::UnsupportedVersion { found, supported }) => {
                assert_eq!(found, 99);
                assert_eq!(supported, CURRENT_VERSION);
            }
            other => panic!("expected UnsupportedVersion, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_version_rejected() {
        let codec = ManifestCodec::default();
        let bytes = br#"{"version":0,"exportedAt":1,"categories":[],"photos":[]}"#;
        assert!(matches!(
            codec.decode(bytes),
            Err(BackupError::UnsupportedVersion { found: 0, .. })
        ));
    }

    #[test]
    fn test_missing_top_level_field_named() {
        let codec = ManifestCodec::default();
        let bytes = br#"{"version":1,"exportedAt":1,"categories":[]}"#;
        match codec.decode(bytes) {
            Err(BackupError::MalformedManifest { field, .. }) => assert_eq!(field, "photos"),
            other => panic!("expected MalformedManifest, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_record_field_named() {
        let codec = ManifestCodec::default();
        let bytes = br#"{"version":1,"exportedAt":1,"categories":[],
            "photos":[{"id":1,"name":"a","categoryId":1,"createdAt":0,"fileSize":3}]}"#;
        match codec.decode(bytes) {
            Err(BackupError::MalformedManifest { field, .. }) => {
                assert_eq!(field, "photos[0].relativePath")
            }
            other => panic!("expected MalformedManifest, got {:?}", other),
        }
    }

    #[test]
    fn test_tampered_content_detected() {
        let codec = ManifestCodec::default();
        let mut value: Value = serde_json::from_slice(&codec.encode(&sample()).unwrap()).unwrap();
        value["categories"][0]["colorHex"] = Value::from("#000000");
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            codec.decode(&bytes),
            Err(BackupError::ManifestChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_unverified_decode_keeps_mismatched_manifest() {
        let codec = ManifestCodec::default();
        let mut value: Value = serde_json::from_slice(&codec.encode(&sample()).unwrap()).unwrap();
        value["photos"][0]["relativePath"] = Value::from("photos/elsewhere.jpg");
        let bytes = serde_json::to_vec(&value).unwrap();

        let manifest = codec.decode_unverified(&bytes).unwrap();
        assert_eq!(manifest.photos[0].relative_path, "photos/elsewhere.jpg");
        assert!(matches!(
            manifest.verify_checksum(),
            Err(BackupError::ManifestChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_codec_limit_capped_at_current_version() {
        let codec = ManifestCodec::new(CURRENT_VERSION + 1);
        assert_eq!(codec.max_version(), CURRENT_VERSION);

        let mut value: Value = serde_json::from_slice(&codec.encode(&sample()).unwrap()).unwrap();
        value["version"] = Value::from(CURRENT_VERSION + 1);
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            codec.decode(&bytes),
            Err(BackupError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_file_name_taken_from_storage_path() {
        let photo = Photo {
            id: 3,
            path: "photos/2024/IMG_0003.JPG".into(),
            category_id: 1,
            name: "Beach day".into(),
            created_at: 1,
            file_size: 10,
            width: 0,
            height: 0,
            is_favorite: false,
            encrypted: EncryptedFields::new(),
        };
        let record = ManifestPhoto::from_photo(&photo, "photos/3.jpg".into(), None);
        assert_eq!(record.file_name.as_deref(), Some("IMG_0003.JPG"));
        assert_eq!(record.name, "Beach day");
    }

    #[test]
    fn test_manifest_without_checksum_accepted() {
        let codec = ManifestCodec::default();
        let bytes = br##"{"version":1,"exportedAt":5,"categories":[
            {"id":1,"displayName":"Family","colorHex":"#E91E63","position":0}],"photos":[]}"##;
        let manifest = codec.decode(bytes).unwrap();
        assert_eq!(manifest.categories.len(), 1);
        assert_eq!(manifest.mode, BackupMode::Full);
        assert!(manifest.checksum.is_none());
    }

    #[test]
    fn test_garbage_is_malformed() {
        let codec = ManifestCodec::default();
        assert!(matches!(
            codec.decode(b"not json"),
            Err(BackupError::MalformedManifest { .. })
        ));
    }
}
