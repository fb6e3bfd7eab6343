//! Photos Backup - Library Data Model
//!
//! Live-store records as handed to us by the library store collaborator.

use std::collections::BTreeMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque ciphertext carried through backup/restore unchanged
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncryptedBlob(pub Vec<u8>);

impl Serialize for EncryptedBlob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for EncryptedBlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(EncryptedBlob)
            .map_err(serde::de::Error::custom)
    }
}

/// Named sensitive annotations (child name, notes, ...), keyed for stable ordering
pub type EncryptedFields = BTreeMap<String, EncryptedBlob>;

/// Category as stored in the live library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Local identifier
    pub id: i64,
    /// User-facing name
    pub display_name: String,
    /// Lowercase, space→underscore; unique within a store
    pub normalized_name: String,
    /// Color as `#RRGGBB`
    pub color_hex: String,
    /// Display order, unique within a store
    pub position: i64,
    /// System-seeded category
    pub is_default: bool,
    /// Creation timestamp (epoch millis)
    pub created_at: i64,
}

/// Category about to be inserted (no identifier yet)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCategory {
    pub display_name: String,
    pub normalized_name: String,
    pub color_hex: String,
    pub position: i64,
    pub is_default: bool,
    pub created_at: i64,
}

impl NewCategory {
    pub fn new(display_name: &str, color_hex: &str, position: i64) -> Self {
        Self {
            display_name: display_name.to_string(),
            normalized_name: normalize_name(display_name),
            color_hex: color_hex.to_string(),
            position,
            is_default: false,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Photo as stored in the live library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Photo {
    /// Local identifier
    pub id: i64,
    /// Path relative to the photo storage root
    pub path: String,
    /// Owning category (must exist in the store)
    pub category_id: i64,
    /// Display name
    pub name: String,
    /// Creation timestamp (epoch millis)
    pub created_at: i64,
    /// Size in bytes
    pub file_size: u64,
    pub width: u32,
    pub height: u32,
    pub is_favorite: bool,
    /// Sensitive annotations, never decrypted by this crate
    #[serde(default)]
    pub encrypted: EncryptedFields,
}

/// Photo about to be inserted (no identifier yet)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPhoto {
    pub path: String,
    pub category_id: i64,
    pub name: String,
    pub created_at: i64,
    pub file_size: u64,
    pub width: u32,
    pub height: u32,
    pub is_favorite: bool,
    pub encrypted: EncryptedFields,
}

/// Normalize a category name for uniqueness comparison
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

/// Last component of a slash-separated path
pub fn basename(path: &str) -> Option<&str> {
    Path::new(path).file_name().and_then(|n| n.to_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Family"), "family");
        assert_eq!(normalize_name("  Summer Trip 2024 "), "summer_trip_2024");
        assert_eq!(normalize_name("PETS"), normalize_name("pets"));
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("photos/12.jpg"), Some("12.jpg"));
        assert_eq!(basename("photos/ab12cd34/12.jpg"), Some("12.jpg"));
        assert_eq!(basename("12.jpg"), Some("12.jpg"));
        assert_eq!(basename(""), None);
    }

    #[test]
    fn test_encrypted_blob_is_base64_in_json() {
        let mut fields = EncryptedFields::new();
        fields.insert("child_name".into(), EncryptedBlob(vec![0, 159, 146, 150]));

        let json = serde_json::to_string(&fields).unwrap();
        assert_eq!(json, r#"{"child_name":"AJ+Slg=="}"#);

        let back: EncryptedFields = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fields);
    }
}
