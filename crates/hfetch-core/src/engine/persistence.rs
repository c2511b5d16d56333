//! SQLite-backed persistent store for fetched bodies
//!
//! Metadata lives in a single `stored_files` table keyed by destination
//! path; the bytes live in blob files under `<data_dir>/blobs/`, appended to
//! as a transfer progresses so that an interrupted download can resume.

use crate::error::FetchError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hfetch_types::StoredEntry;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncSeekExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Persistent store handle; cheap to clone
#[derive(Clone, Debug)]
pub struct FetchStore {
    pool: SqlitePool,
    blob_dir: PathBuf,
}

impl FetchStore {
    /// Open (or create) the store rooted at `data_dir`
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, FetchError> {
        let data_dir = data_dir.as_ref();
        let blob_dir = data_dir.join("blobs");
        tokio::fs::create_dir_all(&blob_dir).await?;

        let options = SqliteConnectOptions::new()
            .filename(data_dir.join("store.db"))
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stored_files (
                path TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                blob TEXT NOT NULL,
                total_bytes INTEGER,
                stored_bytes INTEGER NOT NULL DEFAULT 0,
                complete INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_stored_files_updated ON stored_files(updated_at);
            "#,
        )
        .execute(&pool)
        .await?;

        debug!("Opened persistent store at {}", data_dir.display());
        Ok(Self { pool, blob_dir })
    }

    /// Metadata of the file stored under `path`
    pub async fn lookup(&self, path: &str) -> Result<Option<StoredEntry>, FetchError> {
        Ok(self.lookup_row(path).await?.map(|(entry, _)| entry))
    }

    async fn lookup_row(&self, path: &str) -> Result<Option<(StoredEntry, PathBuf)>, FetchError> {
        let row = sqlx::query("SELECT * FROM stored_files WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let blob = self.blob_dir.join(row.get::<String, _>("blob"));
        Ok(Some((row_to_entry(&row)?, blob)))
    }

    /// Prepare the blob for a transfer from `url` into `path`.
    ///
    /// With `resume` and a partial copy of the same URL, the blob is kept and
    /// the returned file is positioned at its end; otherwise the blob is
    /// truncated. The returned entry reflects what is already on disk.
    pub async fn begin(
        &self,
        path: &str,
        url: &str,
        resume: bool,
    ) -> Result<(StoredEntry, File), FetchError> {
        let existing = self.lookup_row(path).await?;

        let (blob_name, keep) = match &existing {
            Some((entry, blob)) => {
                let name = blob
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                (name, resume && !entry.complete && entry.url == url)
            }
            None => (Uuid::new_v4().to_string(), false),
        };
        let blob_path = self.blob_dir.join(&blob_name);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(!keep)
            .open(&blob_path)
            .await?;

        let stored_bytes = if keep {
            let len = file.metadata().await?.len();
            file.seek(std::io::SeekFrom::Start(len)).await?;
            len
        } else {
            0
        };

        let total_bytes = match &existing {
            Some((entry, _)) if keep => entry.total_bytes,
            _ => None,
        };

        let entry = StoredEntry {
            path: path.to_string(),
            url: url.to_string(),
            total_bytes,
            stored_bytes,
            complete: false,
            updated_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO stored_files (path, url, blob, total_bytes, stored_bytes, complete, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            ON CONFLICT(path) DO UPDATE SET
                url = excluded.url,
                blob = excluded.blob,
                total_bytes = excluded.total_bytes,
                stored_bytes = excluded.stored_bytes,
                complete = 0,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.path)
        .bind(&entry.url)
        .bind(&blob_name)
        .bind(entry.total_bytes.map(|t| t as i64))
        .bind(entry.stored_bytes as i64)
        .bind(entry.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok((entry, file))
    }

    /// Record how far a transfer got
    pub async fn update_progress(
        &self,
        path: &str,
        stored_bytes: u64,
        total_bytes: Option<u64>,
    ) -> Result<(), FetchError> {
        sqlx::query(
            r#"
            UPDATE stored_files
            SET stored_bytes = ?, total_bytes = COALESCE(?, total_bytes), updated_at = ?
            WHERE path = ?
            "#,
        )
        .bind(stored_bytes as i64)
        .bind(total_bytes.map(|t| t as i64))
        .bind(Utc::now().to_rfc3339())
        .bind(path)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark the file under `path` as fully stored
    pub async fn mark_complete(&self, path: &str, size: u64) -> Result<(), FetchError> {
        sqlx::query(
            r#"
            UPDATE stored_files
            SET stored_bytes = ?, total_bytes = ?, complete = 1, updated_at = ?
            WHERE path = ?
            "#,
        )
        .bind(size as i64)
        .bind(size as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(path)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Bytes stored under `path`, complete or not
    pub async fn read_blob(&self, path: &str) -> Result<Bytes, FetchError> {
        let (entry, blob) = self
            .lookup_row(path)
            .await?
            .ok_or_else(|| FetchError::NotPersisted(path.to_string()))?;

        let mut bytes = tokio::fs::read(&blob).await?;
        if entry.complete && bytes.len() as u64 != entry.stored_bytes {
            warn!(
                "Stored file {} is {} bytes, expected {}",
                path,
                bytes.len(),
                entry.stored_bytes
            );
        }
        if !entry.complete {
            bytes.truncate(entry.stored_bytes.min(bytes.len() as u64) as usize);
        }
        Ok(Bytes::from(bytes))
    }

    /// Delete the file under `path`; returns whether there was one
    pub async fn remove(&self, path: &str) -> Result<bool, FetchError> {
        let Some((_, blob)) = self.lookup_row(path).await? else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM stored_files WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;

        remove_blob(&blob).await;
        Ok(true)
    }

    /// All stored files, most recently updated first
    pub async fn list(&self) -> Result<Vec<StoredEntry>, FetchError> {
        let rows = sqlx::query("SELECT * FROM stored_files ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_entry).collect()
    }

    /// Delete everything; returns the number of files removed
    pub async fn clear(&self) -> Result<usize, FetchError> {
        let rows = sqlx::query("SELECT blob FROM stored_files")
            .fetch_all(&self.pool)
            .await?;

        sqlx::query("DELETE FROM stored_files")
            .execute(&self.pool)
            .await?;

        for row in &rows {
            remove_blob(&self.blob_dir.join(row.get::<String, _>("blob"))).await;
        }

        Ok(rows.len())
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn remove_blob(blob: &Path) {
    if let Err(e) = tokio::fs::remove_file(blob).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove blob {}: {}", blob.display(), e);
        }
    }
}

/// Convert a database row to a StoredEntry
fn row_to_entry(row: &SqliteRow) -> Result<StoredEntry, FetchError> {
    let updated_at = DateTime::parse_from_rfc3339(row.get::<String, _>("updated_at").as_str())
        .map_err(|e| FetchError::Serialization(e.to_string()))?
        .with_timezone(&Utc);

    Ok(StoredEntry {
        path: row.get("path"),
        url: row.get("url"),
        total_bytes: row.get::<Option<i64>, _>("total_bytes").map(|t| t as u64),
        stored_bytes: row.get::<i64, _>("stored_bytes") as u64,
        complete: row.get::<i64, _>("complete") != 0,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn begin_write_complete_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = FetchStore::open(dir.path()).await.unwrap();

        let (entry, mut file) = store.begin("a/b.txt", "http://x/b.txt", false).await.unwrap();
        assert_eq!(entry.stored_bytes, 0);
        file.write_all(b"hello").await.unwrap();
        file.flush().await.unwrap();
        store.mark_complete("a/b.txt", 5).await.unwrap();

        let entry = store.lookup("a/b.txt").await.unwrap().unwrap();
        assert!(entry.complete);
        assert_eq!(entry.total_bytes, Some(5));
        assert_eq!(store.read_blob("a/b.txt").await.unwrap().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn resume_keeps_partial_blob_of_same_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = FetchStore::open(dir.path()).await.unwrap();

        let (_, mut file) = store.begin("f", "http://x/f", true).await.unwrap();
        file.write_all(b"abc").await.unwrap();
        file.flush().await.unwrap();
        drop(file);
        store.update_progress("f", 3, Some(6)).await.unwrap();

        let (entry, mut file) = store.begin("f", "http://x/f", true).await.unwrap();
        assert_eq!(entry.stored_bytes, 3);
        assert_eq!(entry.total_bytes, Some(6));
        file.write_all(b"def").await.unwrap();
        file.flush().await.unwrap();
        store.mark_complete("f", 6).await.unwrap();
        assert_eq!(store.read_blob("f").await.unwrap().as_ref(), b"abcdef");

        // A different URL under the same path starts over
        let (entry, _) = store.begin("f", "http://y/f", true).await.unwrap();
        assert_eq!(entry.stored_bytes, 0);
        assert_eq!(store.read_blob("f").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn remove_list_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FetchStore::open(dir.path()).await.unwrap();

        for path in ["one", "two", "three"] {
            store.begin(path, "http://x/", false).await.unwrap();
        }
        assert_eq!(store.list().await.unwrap().len(), 3);

        assert!(store.remove("two").await.unwrap());
        assert!(!store.remove("two").await.unwrap());
        assert!(store.lookup("two").await.unwrap().is_none());

        assert_eq!(store.clear().await.unwrap(), 2);
        assert!(store.list().await.unwrap().is_empty());
        assert!(matches!(
            store.read_blob("one").await,
            Err(FetchError::NotPersisted(_))
        ));
    }
}
