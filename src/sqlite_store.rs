//! Photos Backup - SQLite Library Store
//!
//! Reference `LibraryStore` backed by a single SQLite connection.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::BackupResult;
use crate::model::{Category, EncryptedFields, NewCategory, NewPhoto, Photo};
use crate::store::LibraryStore;

const SCHEMA: &str = r#"
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS categories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        display_name TEXT NOT NULL,
        normalized_name TEXT NOT NULL UNIQUE,
        color_hex TEXT NOT NULL,
        position INTEGER NOT NULL,
        is_default INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS photos (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE,
        category_id INTEGER NOT NULL REFERENCES categories(id),
        name TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        file_size INTEGER NOT NULL,
        width INTEGER NOT NULL,
        height INTEGER NOT NULL,
        is_favorite INTEGER NOT NULL DEFAULT 0,
        encrypted TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_photos_category ON photos(category_id);
    CREATE INDEX IF NOT EXISTS idx_photos_created ON photos(created_at);
"#;

const PHOTO_COLUMNS: &str =
    "id, path, category_id, name, created_at, file_size, width, height, is_favorite, encrypted";

/// Library store on SQLite
pub struct SqliteLibrary {
    conn: Mutex<Connection>,
}

impl SqliteLibrary {
    /// Open (or create) a library database file
    pub fn open(path: &Path) -> BackupResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    /// Throwaway library, used by tests and dry runs
    pub fn open_in_memory() -> BackupResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> BackupResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Count photos
    pub fn count_photos(&self) -> BackupResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM photos", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Count categories
    pub fn count_categories(&self) -> BackupResult<usize> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM categories", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn category_from_row(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        display_name: row.get(1)?,
        normalized_name: row.get(2)?,
        color_hex: row.get(3)?,
        position: row.get(4)?,
        is_default: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn photo_from_row(row: &Row<'_>) -> rusqlite::Result<Photo> {
    let encrypted: Option<String> = row.get(9)?;
    let encrypted = match encrypted {
        Some(json) => serde_json::from_str(&json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?,
        None => EncryptedFields::new(),
    };
    Ok(Photo {
        id: row.get(0)?,
        path: row.get(1)?,
        category_id: row.get(2)?,
        name: row.get(3)?,
        created_at: row.get(4)?,
        file_size: row.get::<_, i64>(5)? as u64,
        width: row.get(6)?,
        height: row.get(7)?,
        is_favorite: row.get(8)?,
        encrypted,
    })
}

fn encrypted_column(fields: &EncryptedFields) -> BackupResult<Option<String>> {
    if fields.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(fields)?))
    }
}

impl LibraryStore for SqliteLibrary {
    fn list_categories(&self) -> BackupResult<Vec<Category>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, display_name, normalized_name, color_hex, position, is_default, created_at
             FROM categories ORDER BY position, id",
        )?;
        let rows = stmt.query_map([], category_from_row)?;
        let categories = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(categories)
    }

    fn insert_category(&self, category: &NewCategory) -> BackupResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO categories (display_name, normalized_name, color_hex, position, is_default, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                category.display_name,
                category.normalized_name,
                category.color_hex,
                category.position,
                category.is_default,
                category.created_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_category(&self, category: &Category) -> BackupResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE categories SET display_name = ?2, normalized_name = ?3, color_hex = ?4,
             position = ?5, is_default = ?6, created_at = ?7 WHERE id = ?1",
            params![
                category.id,
                category.display_name,
                category.normalized_name,
                category.color_hex,
                category.position,
                category.is_default,
                category.created_at
            ],
        )?;
        Ok(())
    }

    fn delete_category(&self, id: i64) -> BackupResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM categories WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn list_photos(&self) -> BackupResult<Vec<Photo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM photos ORDER BY created_at, id",
            PHOTO_COLUMNS
        ))?;
        let rows = stmt.query_map([], photo_from_row)?;
        let photos = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(photos)
    }

    fn insert_photo(&self, photo: &NewPhoto) -> BackupResult<i64> {
        let encrypted = encrypted_column(&photo.encrypted)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO photos (path, category_id, name, created_at, file_size, width, height, is_favorite, encrypted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                photo.path,
                photo.category_id,
                photo.name,
                photo.created_at,
                photo.file_size as i64,
                photo.width,
                photo.height,
                photo.is_favorite,
                encrypted
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_photo(&self, photo: &Photo) -> BackupResult<()> {
        let encrypted = encrypted_column(&photo.encrypted)?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE photos SET path = ?2, category_id = ?3, name = ?4, created_at = ?5, file_size = ?6,
             width = ?7, height = ?8, is_favorite = ?9, encrypted = ?10 WHERE id = ?1",
            params![
                photo.id,
                photo.path,
                photo.category_id,
                photo.name,
                photo.created_at,
                photo.file_size as i64,
                photo.width,
                photo.height,
                photo.is_favorite,
                encrypted
            ],
        )?;
        Ok(())
    }

    fn delete_photo(&self, id: i64) -> BackupResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM photos WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn photo_by_path(&self, path: &str) -> BackupResult<Option<Photo>> {
        let conn = self.conn.lock();
        let photo = conn
            .query_row(
                &format!("SELECT {} FROM photos WHERE path = ?1", PHOTO_COLUMNS),
                params![path],
                photo_from_row,
            )
            .optional()?;
        Ok(photo)
    }

    fn begin_batch(&self) -> BackupResult<()> {
        self.conn.lock().execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit_batch(&self) -> BackupResult<()> {
        self.conn.lock().execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback_batch(&self) -> BackupResult<()> {
        self.conn.lock().execute_batch("ROLLBACK")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo(path: &str, category_id: i64) -> NewPhoto {
        NewPhoto {
            path: path.into(),
            category_id,
            name: path.into(),
            created_at: 1_000,
            file_size: 3,
            width: 10,
            height: 20,
            is_favorite: false,
            encrypted: EncryptedFields::new(),
        }
    }

    #[test]
    fn test_category_and_photo_crud() {
        let lib = SqliteLibrary::open_in_memory().unwrap();
        let cat = lib.insert_category(&NewCategory::new("Family", "#E91E63", 0)).unwrap();
        let id = lib.insert_photo(&photo("photos/a.jpg", cat)).unwrap();

        let found = lib.photo_by_path("photos/a.jpg").unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.category_id, cat);
        assert!(lib.photo_by_path("photos/missing.jpg").unwrap().is_none());

        let mut updated = found.clone();
        updated.is_favorite = true;
        lib.update_photo(&updated).unwrap();
        assert!(lib.list_photos().unwrap()[0].is_favorite);

        lib.delete_photo(id).unwrap();
        lib.delete_category(cat).unwrap();
        assert_eq!(lib.count_photos().unwrap(), 0);
        assert_eq!(lib.count_categories().unwrap(), 0);
    }

    #[test]
    fn test_normalized_name_unique() {
        let lib = SqliteLibrary::open_in_memory().unwrap();
        lib.insert_category(&NewCategory::new("Pets", "#795548", 0)).unwrap();
        assert!(lib.insert_category(&NewCategory::new("pets", "#000000", 1)).is_err());
    }

    #[test]
    fn test_photo_requires_existing_category() {
        let lib = SqliteLibrary::open_in_memory().unwrap();
        assert!(lib.insert_photo(&photo("photos/a.jpg", 99)).is_err());
    }

    #[test]
    fn test_rollback_discards_batch() {
        let lib = SqliteLibrary::open_in_memory().unwrap();
        lib.insert_category(&NewCategory::new("Family", "#E91E63", 0)).unwrap();

        lib.begin_batch().unwrap();
        lib.insert_category(&NewCategory::new("Friends", "#2196F3", 1)).unwrap();
        lib.rollback_batch().unwrap();
        assert_eq!(lib.count_categories().unwrap(), 1);

        lib.begin_batch().unwrap();
        lib.insert_category(&NewCategory::new("Friends", "#2196F3", 1)).unwrap();
        lib.commit_batch().unwrap();
        assert_eq!(lib.count_categories().unwrap(), 2);
    }

    #[test]
    fn test_encrypted_fields_persisted() {
        let lib = SqliteLibrary::open_in_memory().unwrap();
        let cat = lib.insert_category(&NewCategory::new("Family", "#E91E63", 0)).unwrap();
        let mut p = photo("photos/a.jpg", cat);
        p.encrypted.insert("child_age".into(), crate::model::EncryptedBlob(vec![9, 8, 7]));
        lib.insert_photo(&p).unwrap();

        let stored = lib.list_photos().unwrap();
        assert_eq!(stored[0].encrypted, p.encrypted);
    }
}
