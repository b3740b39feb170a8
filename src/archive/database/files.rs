//! File, tag and source records

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use super::{
    ContentStore, StoreError, StoreResult, enum_col, is_unique_violation, time_col, to_db_time,
};
use crate::archive::models::{FileRecord, FileStatus, NewFile, NewSource, Source, Tag};

/// Result of `create_file`
#[derive(Debug, Clone)]
pub struct CreatedFile {
    pub file: FileRecord,
    /// True when another row with the same hash already existed
    pub existed: bool,
}

const FILE_COLUMNS: &str =
    "id, filename, hash, size_bytes, rating, status, created_at, updated_at";

impl ContentStore {
    pub async fn find_file_by_hash(&self, hash: &str) -> StoreResult<Option<FileRecord>> {
        let conn = self.conn.lock().await;
        load_file_where(&conn, "hash = ?1", hash)
    }

    pub async fn find_file(&self, id: i64) -> StoreResult<Option<FileRecord>> {
        let conn = self.conn.lock().await;
        load_file_where(&conn, "id = ?1", id)
    }

    /// Insert a file with its tags and sources.
    ///
    /// Creation is atomic on the content hash: if a row with the same hash
    /// wins the race, that row is returned with `existed` set.
    pub async fn create_file(&self, new: &NewFile) -> StoreResult<CreatedFile> {
        let mut conn = self.conn.lock().await;
        let now = to_db_time(&Utc::now());

        let tx = conn.transaction()?;
        if let Err(err) = tx.execute(
            "INSERT INTO files (filename, hash, size_bytes, rating, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                new.filename,
                new.hash,
                new.size_bytes as i64,
                new.rating.as_str(),
                FileStatus::Inbox.as_str(),
                now,
            ],
        ) {
            drop(tx);
            if is_unique_violation(&err) {
                if let Some(existing) = load_file_where(&conn, "hash = ?1", &new.hash)? {
                    debug!("Hash {} already stored as file {}", new.hash, existing.id);
                    return Ok(CreatedFile { file: existing, existed: true });
                }
            }
            return Err(err.into());
        }

        let file_id = tx.last_insert_rowid();
        for tag in &new.tags {
            let tag_id = create_or_find_tag_in(&tx, tag)?;
            tx.execute(
                "INSERT OR IGNORE INTO file_tags (file_id, tag_id) VALUES (?1, ?2)",
                params![file_id, tag_id],
            )?;
        }
        for source in &new.sources {
            let source_id = create_or_find_source_in(&tx, source)?;
            tx.execute(
                "INSERT OR IGNORE INTO file_sources (file_id, source_id) VALUES (?1, ?2)",
                params![file_id, source_id],
            )?;
        }
        tx.commit()?;

        let file = load_file_where(&conn, "id = ?1", file_id)?
            .ok_or_else(|| StoreError::NotFound(format!("file {}", file_id)))?;
        Ok(CreatedFile { file, existed: false })
    }

    pub async fn find_source_by_url(&self, url: &str) -> StoreResult<Option<Source>> {
        let conn = self.conn.lock().await;
        let source = conn
            .query_row(
                "SELECT id, url, site FROM sources WHERE url = ?1",
                [url],
                |row| Ok(Source { id: row.get(0)?, url: row.get(1)?, site: row.get(2)? }),
            )
            .optional()?;
        Ok(source)
    }

    /// Idempotent on (name, category); returns the tag id
    pub async fn create_or_find_tag(&self, tag: &Tag) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        create_or_find_tag_in(&conn, tag)
    }

    /// Move a file to another lifecycle state
    pub async fn set_file_status(
        &self,
        id: i64,
        status: FileStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<FileRecord>> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE files SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), to_db_time(&now), id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        load_file_where(&conn, "id = ?1", id)
    }

    /// Files that have sat in the trash since before `cutoff`
    pub async fn expired_trash(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<(i64, String)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, filename FROM files WHERE status = ?1 AND updated_at < ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![FileStatus::Trash.as_str(), to_db_time(&cutoff)], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every filename the store knows about
    pub async fn known_filenames(&self) -> StoreResult<HashSet<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT filename FROM files")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(names)
    }
}

fn create_or_find_tag_in(conn: &Connection, tag: &Tag) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO tags (name, category) VALUES (?1, ?2)
         ON CONFLICT(name, category) DO NOTHING",
        params![tag.name, tag.category.as_str()],
    )?;
    let id = conn.query_row(
        "SELECT id FROM tags WHERE name = ?1 AND category = ?2",
        params![tag.name, tag.category.as_str()],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn create_or_find_source_in(conn: &Connection, source: &NewSource) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO sources (url, site) VALUES (?1, ?2) ON CONFLICT(url) DO NOTHING",
        params![source.url, source.site],
    )?;
    let id = conn.query_row("SELECT id FROM sources WHERE url = ?1", [&source.url], |row| {
        row.get(0)
    })?;
    Ok(id)
}

fn load_file_where<P: rusqlite::ToSql>(
    conn: &Connection,
    condition: &str,
    value: P,
) -> StoreResult<Option<FileRecord>> {
    let sql = format!("SELECT {} FROM files WHERE {}", FILE_COLUMNS, condition);
    let file = conn
        .query_row(&sql, [value], |row| {
            Ok(FileRecord {
                id: row.get(0)?,
                filename: row.get(1)?,
                hash: row.get(2)?,
                size_bytes: row.get::<_, i64>(3)? as u64,
                rating: enum_col(row, 4)?,
                status: enum_col(row, 5)?,
                tags: Vec::new(),
                sources: Vec::new(),
                created_at: time_col(row, 6)?,
                updated_at: time_col(row, 7)?,
            })
        })
        .optional()?;

    let Some(mut file) = file else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT t.name, t.category FROM tags t
         JOIN file_tags ft ON ft.tag_id = t.id
         WHERE ft.file_id = ?1 ORDER BY t.category, t.name",
    )?;
    file.tags = stmt
        .query_map([file.id], |row| Ok(Tag { name: row.get(0)?, category: enum_col(row, 1)? }))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT s.id, s.url, s.site FROM sources s
         JOIN file_sources fs ON fs.source_id = s.id
         WHERE fs.file_id = ?1 ORDER BY s.id",
    )?;
    file.sources = stmt
        .query_map([file.id], |row| {
            Ok(Source { id: row.get(0)?, url: row.get(1)?, site: row.get(2)? })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::models::{Rating, TagCategory};
    use chrono::Duration;

    fn sample_file(name: &str, hash: &str) -> NewFile {
        NewFile {
            filename: name.to_string(),
            hash: hash.to_string(),
            size_bytes: 2048,
            rating: Rating::Safe,
            tags: vec![
                Tag::new("artist_a", TagCategory::Creator),
                Tag::new("landscape", TagCategory::General),
            ],
            sources: vec![NewSource {
                url: "https://danbooru.donmai.us/posts/1".to_string(),
                site: "danbooru".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn test_create_file_with_tags_and_sources() {
        let store = ContentStore::open_in_memory().unwrap();
        let created = store.create_file(&sample_file("a.png", "abc")).await.unwrap();

        assert!(!created.existed);
        assert_eq!(created.file.status, FileStatus::Inbox);
        assert_eq!(created.file.size_bytes, 2048);
        assert_eq!(created.file.tags.len(), 2);
        assert_eq!(created.file.sources[0].site, "danbooru");

        let found = store.find_file_by_hash("abc").await.unwrap().unwrap();
        assert_eq!(found.id, created.file.id);
        let source = store
            .find_source_by_url("https://danbooru.donmai.us/posts/1")
            .await
            .unwrap();
        assert!(source.is_some());
    }

    #[tokio::test]
    async fn test_create_file_same_hash_returns_existing() {
        let store = ContentStore::open_in_memory().unwrap();
        let first = store.create_file(&sample_file("a.png", "abc")).await.unwrap();
        let second = store.create_file(&sample_file("b.png", "abc")).await.unwrap();

        assert!(second.existed);
        assert_eq!(second.file.id, first.file.id);
        assert_eq!(second.file.filename, "a.png");
        assert_eq!(store.known_filenames().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tags_are_shared_between_files() {
        let store = ContentStore::open_in_memory().unwrap();
        store.create_file(&sample_file("a.png", "abc")).await.unwrap();
        store.create_file(&sample_file("b.png", "def")).await.unwrap();

        let id_a = store.create_or_find_tag(&Tag::new("landscape", TagCategory::General)).await.unwrap();
        let id_b = store.create_or_find_tag(&Tag::new("landscape", TagCategory::General)).await.unwrap();
        let id_c = store.create_or_find_tag(&Tag::new("landscape", TagCategory::Meta)).await.unwrap();
        assert_eq!(id_a, id_b);
        assert_ne!(id_a, id_c);
    }

    #[tokio::test]
    async fn test_expired_trash() {
        let store = ContentStore::open_in_memory().unwrap();
        let created = store.create_file(&sample_file("a.png", "abc")).await.unwrap();
        let now = Utc::now();

        store
            .set_file_status(created.file.id, FileStatus::Trash, now - Duration::days(8))
            .await
            .unwrap();
        let expired = store.expired_trash(now - Duration::days(7)).await.unwrap();
        assert_eq!(expired, vec![(created.file.id, "a.png".to_string())]);

        let expired = store.expired_trash(now - Duration::days(9)).await.unwrap();
        assert!(expired.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let store = ContentStore::open_in_memory().unwrap();
        assert!(store.find_file(42).await.unwrap().is_none());
        assert!(store.set_file_status(42, FileStatus::Trash, Utc::now()).await.unwrap().is_none());
    }
}
