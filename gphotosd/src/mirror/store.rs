use std::path::{Path, PathBuf};
use std::time::Duration;

use gphotos_core::{DeltaPage, MediaRecord, MediaType};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool, migrate::Migrator};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Window used by exact-match lookups around a capture timestamp.
const TIMESTAMP_TOLERANCE_MILLIS: i64 = 1_000;

const MEDIA_COLUMNS: &str = "media_key, file_name, dedup_key, is_canonical, media_type, caption, \
     size_bytes, content_version, utc_timestamp, server_creation_timestamp, timezone_offset, \
     width, height, make, model, aperture, shutter_speed, iso, focal_length, duration, \
     capture_frame_rate, encoded_frame_rate, is_archived, is_favorite, is_locked, \
     is_original_quality, latitude, longitude, location_name, sha1_hash, parsed_name";

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncCursor {
    pub state_token: String,
    pub page_token: String,
    /// State token the in-progress pagination was issued against.
    pub page_anchor: String,
    pub init_complete: bool,
    pub last_sync_at: Option<i64>,
}

impl SyncCursor {
    pub fn is_paging(&self) -> bool {
        !self.page_token.is_empty()
    }
}

/// Cursor columns to write; `None` keeps the stored value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CursorUpdate {
    pub state_token: Option<String>,
    pub page_token: Option<String>,
    pub page_anchor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageEffect {
    pub upserted: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub file_name: Option<String>,
    pub parsed_name: Option<String>,
    pub size_bytes: Option<i64>,
    pub utc_timestamp_millis: Option<i64>,
}

/// Local mirror of one identity's remote library.
#[derive(Clone)]
pub struct MirrorStore {
    pool: SqlitePool,
    identity: String,
}

impl MirrorStore {
    pub fn from_pool(pool: SqlitePool, identity: impl Into<String>) -> Self {
        Self {
            pool,
            identity: identity.into(),
        }
    }

    pub async fn open(path: &Path, identity: impl Into<String>) -> Result<Self, MirrorError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::from_pool(pool, identity);
        store.init().await?;
        Ok(store)
    }

    pub async fn open_default(identity: &str) -> Result<Self, MirrorError> {
        let path = default_db_path(identity)?;
        Self::open(&path, identity).await
    }

    pub async fn init(&self) -> Result<(), MirrorError> {
        MIGRATOR.run(&self.pool).await?;
        sqlx::query("INSERT OR IGNORE INTO sync_cursor (identity) VALUES (?1)")
            .bind(&self.identity)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Insert-or-replace by media key. A locally assigned parsed name survives
    /// unless the incoming record carries its own.
    pub async fn upsert(&self, records: &[MediaRecord]) -> Result<usize, MirrorError> {
        let mut tx = self.pool.begin().await?;
        let count = upsert_rows(&mut tx, records).await?;
        tx.commit().await?;
        Ok(count)
    }

    /// Unknown keys are ignored. Returns the number of rows removed.
    pub async fn delete(&self, media_keys: &[String]) -> Result<usize, MirrorError> {
        let mut tx = self.pool.begin().await?;
        let count = delete_rows(&mut tx, media_keys).await?;
        tx.commit().await?;
        Ok(count)
    }

    /// Applies one delta page and advances the cursor in a single transaction.
    pub async fn apply_page(
        &self,
        page: &DeltaPage,
        cursor: &CursorUpdate,
    ) -> Result<PageEffect, MirrorError> {
        let mut tx = self.pool.begin().await?;
        let upserted = upsert_rows(&mut tx, &page.items).await?;
        let deleted = delete_rows(&mut tx, &page.deleted_keys).await?;
        write_cursor(&mut tx, &self.identity, cursor).await?;
        tx.commit().await?;
        Ok(PageEffect { upserted, deleted })
    }

    pub async fn get_cursor(&self) -> Result<SyncCursor, MirrorError> {
        let row = sqlx::query(
            "SELECT state_token, page_token, page_anchor, init_complete, last_sync_at
             FROM sync_cursor WHERE identity = ?1",
        )
        .bind(&self.identity)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(SyncCursor::default());
        };
        Ok(SyncCursor {
            state_token: row.try_get("state_token")?,
            page_token: row.try_get("page_token")?,
            page_anchor: row.try_get("page_anchor")?,
            init_complete: row.try_get("init_complete")?,
            last_sync_at: row.try_get("last_sync_at")?,
        })
    }

    pub async fn set_cursor(
        &self,
        state_token: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<(), MirrorError> {
        self.update_cursor(&CursorUpdate {
            state_token: state_token.map(str::to_string),
            page_token: page_token.map(str::to_string),
            page_anchor: None,
        })
        .await
    }

    pub async fn update_cursor(&self, cursor: &CursorUpdate) -> Result<(), MirrorError> {
        let mut conn = self.pool.acquire().await?;
        write_cursor(&mut conn, &self.identity, cursor).await?;
        Ok(())
    }

    pub async fn get_init_complete(&self) -> Result<bool, MirrorError> {
        Ok(self.get_cursor().await?.init_complete)
    }

    pub async fn set_init_complete(&self, complete: bool) -> Result<(), MirrorError> {
        sqlx::query("UPDATE sync_cursor SET init_complete = ?2 WHERE identity = ?1")
            .bind(&self.identity)
            .bind(complete)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_synced(&self, at_unix: i64) -> Result<(), MirrorError> {
        sqlx::query("UPDATE sync_cursor SET last_sync_at = ?2 WHERE identity = ?1")
            .bind(&self.identity)
            .bind(at_unix)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Items of exactly `size_bytes` captured within one second of `utc_timestamp_millis`.
    pub async fn find_by_exact_match(
        &self,
        size_bytes: i64,
        utc_timestamp_millis: i64,
    ) -> Result<Vec<MediaRecord>, MirrorError> {
        let rows = sqlx::query(&format!(
            "SELECT {MEDIA_COLUMNS} FROM remote_media
             WHERE size_bytes = ?1 AND utc_timestamp BETWEEN ?2 AND ?3
             ORDER BY media_key ASC"
        ))
        .bind(size_bytes)
        .bind(utc_timestamp_millis.saturating_sub(TIMESTAMP_TOLERANCE_MILLIS))
        .bind(utc_timestamp_millis.saturating_add(TIMESTAMP_TOLERANCE_MILLIS))
        .fetch_all(&self.pool)
        .await?;
        rows_to_records(&rows)
    }

    pub async fn find_by_size(&self, size_bytes: i64) -> Result<Vec<MediaRecord>, MirrorError> {
        self.find_where("size_bytes = ?1", size_bytes).await
    }

    pub async fn find_by_file_name(&self, file_name: &str) -> Result<Vec<MediaRecord>, MirrorError> {
        self.find_where("file_name = ?1", file_name.to_string())
            .await
    }

    pub async fn find_by_parsed_name(
        &self,
        parsed_name: &str,
    ) -> Result<Vec<MediaRecord>, MirrorError> {
        self.find_where("parsed_name = ?1", parsed_name.to_string())
            .await
    }

    pub async fn get_by_media_key(
        &self,
        media_key: &str,
    ) -> Result<Option<MediaRecord>, MirrorError> {
        let row = sqlx::query(&format!(
            "SELECT {MEDIA_COLUMNS} FROM remote_media WHERE media_key = ?1"
        ))
        .bind(media_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(record_from_row)
            .transpose()
            .map_err(MirrorError::from)
    }

    /// Returns whether a record with `media_key` existed.
    pub async fn update_parsed_name(
        &self,
        media_key: &str,
        parsed_name: &str,
    ) -> Result<bool, MirrorError> {
        let result = sqlx::query("UPDATE remote_media SET parsed_name = ?2 WHERE media_key = ?1")
            .bind(media_key)
            .bind(parsed_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Items sharing a file name and size are treated as duplicates; the one
    /// with the lowest media key is kept and the dedup keys of the rest returned.
    pub async fn list_duplicate_dedup_keys(&self) -> Result<Vec<String>, MirrorError> {
        let rows = sqlx::query(
            "SELECT dedup_key FROM (
                 SELECT dedup_key, media_key,
                        ROW_NUMBER() OVER (
                            PARTITION BY file_name, size_bytes ORDER BY media_key ASC
                        ) AS position
                 FROM remote_media
             )
             WHERE position > 1
             ORDER BY media_key ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("dedup_key").map_err(MirrorError::from))
            .collect()
    }

    /// Lookup by the most specific criteria available:
    /// size+timestamp, then size, then file name, then parsed name.
    pub async fn search(&self, query: &SearchQuery) -> Result<Option<String>, MirrorError> {
        let mut hits = Vec::new();
        if let (Some(size), Some(timestamp)) = (query.size_bytes, query.utc_timestamp_millis) {
            hits = self.find_by_exact_match(size, timestamp).await?;
        }
        if hits.is_empty() {
            if let Some(size) = query.size_bytes {
                hits = self.find_by_size(size).await?;
            }
        }
        if hits.is_empty() {
            if let Some(name) = query.file_name.as_deref() {
                hits = self.find_by_file_name(name).await?;
            }
        }
        if hits.is_empty() {
            if let Some(name) = query.parsed_name.as_deref() {
                hits = self.find_by_parsed_name(name).await?;
            }
        }
        Ok(hits.into_iter().next().map(|hit| hit.media_key))
    }

    pub async fn count(&self) -> Result<i64, MirrorError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM remote_media")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn list_media_keys(&self) -> Result<Vec<String>, MirrorError> {
        Ok(
            sqlx::query_scalar("SELECT media_key FROM remote_media ORDER BY media_key ASC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn find_where<T>(&self, clause: &str, value: T) -> Result<Vec<MediaRecord>, MirrorError>
    where
        T: for<'q> sqlx::Encode<'q, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite> + Send + 'static,
    {
        let sql = format!(
            "SELECT {MEDIA_COLUMNS} FROM remote_media WHERE {clause} ORDER BY media_key ASC"
        );
        let rows = sqlx::query(&sql).bind(value).fetch_all(&self.pool).await?;
        rows_to_records(&rows)
    }
}

async fn upsert_rows(
    conn: &mut SqliteConnection,
    records: &[MediaRecord],
) -> Result<usize, sqlx::Error> {
    for record in records {
        sqlx::query(
            "INSERT INTO remote_media (
                media_key, file_name, dedup_key, is_canonical, media_type, caption,
                size_bytes, content_version, utc_timestamp, server_creation_timestamp,
                timezone_offset, width, height, make, model, aperture, shutter_speed, iso,
                focal_length, duration, capture_frame_rate, encoded_frame_rate, is_archived,
                is_favorite, is_locked, is_original_quality, latitude, longitude,
                location_name, sha1_hash, parsed_name
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                    ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31)
            ON CONFLICT(media_key) DO UPDATE SET
                file_name = excluded.file_name,
                dedup_key = excluded.dedup_key,
                is_canonical = excluded.is_canonical,
                media_type = excluded.media_type,
                caption = excluded.caption,
                size_bytes = excluded.size_bytes,
                content_version = excluded.content_version,
                utc_timestamp = excluded.utc_timestamp,
                server_creation_timestamp = excluded.server_creation_timestamp,
                timezone_offset = excluded.timezone_offset,
                width = excluded.width,
                height = excluded.height,
                make = excluded.make,
                model = excluded.model,
                aperture = excluded.aperture,
                shutter_speed = excluded.shutter_speed,
                iso = excluded.iso,
                focal_length = excluded.focal_length,
                duration = excluded.duration,
                capture_frame_rate = excluded.capture_frame_rate,
                encoded_frame_rate = excluded.encoded_frame_rate,
                is_archived = excluded.is_archived,
                is_favorite = excluded.is_favorite,
                is_locked = excluded.is_locked,
                is_original_quality = excluded.is_original_quality,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                location_name = excluded.location_name,
                sha1_hash = excluded.sha1_hash,
                parsed_name = COALESCE(excluded.parsed_name, remote_media.parsed_name)",
        )
        .bind(&record.media_key)
        .bind(&record.file_name)
        .bind(&record.dedup_key)
        .bind(record.is_canonical)
        .bind(record.media_type.code())
        .bind(&record.caption)
        .bind(record.size_bytes)
        .bind(record.content_version)
        .bind(record.utc_timestamp_millis)
        .bind(record.server_creation_timestamp_millis)
        .bind(record.timezone_offset_minutes)
        .bind(record.width)
        .bind(record.height)
        .bind(&record.make)
        .bind(&record.model)
        .bind(record.aperture)
        .bind(record.shutter_speed)
        .bind(record.iso)
        .bind(record.focal_length)
        .bind(record.duration_millis)
        .bind(record.capture_frame_rate)
        .bind(record.encoded_frame_rate)
        .bind(record.is_archived)
        .bind(record.is_favorite)
        .bind(record.is_locked)
        .bind(record.is_original_quality)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(&record.location_name)
        .bind(&record.content_hash)
        .bind(&record.parsed_name)
        .execute(&mut *conn)
        .await?;
    }
    Ok(records.len())
}

async fn delete_rows(
    conn: &mut SqliteConnection,
    media_keys: &[String],
) -> Result<usize, sqlx::Error> {
    let mut removed = 0u64;
    for key in media_keys {
        let result = sqlx::query("DELETE FROM remote_media WHERE media_key = ?1")
            .bind(key)
            .execute(&mut *conn)
            .await?;
        removed += result.rows_affected();
    }
    Ok(removed as usize)
}

async fn write_cursor(
    conn: &mut SqliteConnection,
    identity: &str,
    cursor: &CursorUpdate,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO sync_cursor (identity, state_token, page_token, page_anchor)
         VALUES (?1, COALESCE(?2, ''), COALESCE(?3, ''), COALESCE(?4, ''))
         ON CONFLICT(identity) DO UPDATE SET
             state_token = COALESCE(?2, sync_cursor.state_token),
             page_token = COALESCE(?3, sync_cursor.page_token),
             page_anchor = COALESCE(?4, sync_cursor.page_anchor)",
    )
    .bind(identity)
    .bind(&cursor.state_token)
    .bind(&cursor.page_token)
    .bind(&cursor.page_anchor)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn rows_to_records(rows: &[SqliteRow]) -> Result<Vec<MediaRecord>, MirrorError> {
    rows.iter()
        .map(|row| record_from_row(row).map_err(MirrorError::from))
        .collect()
}

fn record_from_row(row: &SqliteRow) -> Result<MediaRecord, sqlx::Error> {
    let media_type: i64 = row.try_get("media_type")?;
    Ok(MediaRecord {
        media_key: row.try_get("media_key")?,
        file_name: row.try_get("file_name")?,
        dedup_key: row.try_get("dedup_key")?,
        is_canonical: row.try_get("is_canonical")?,
        media_type: MediaType::from_code(media_type),
        caption: row.try_get("caption")?,
        size_bytes: row.try_get("size_bytes")?,
        content_version: row.try_get("content_version")?,
        utc_timestamp_millis: row.try_get("utc_timestamp")?,
        server_creation_timestamp_millis: row.try_get("server_creation_timestamp")?,
        timezone_offset_minutes: row.try_get("timezone_offset")?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        make: row.try_get("make")?,
        model: row.try_get("model")?,
        aperture: row.try_get("aperture")?,
        shutter_speed: row.try_get("shutter_speed")?,
        iso: row.try_get("iso")?,
        focal_length: row.try_get("focal_length")?,
        duration_millis: row.try_get("duration")?,
        capture_frame_rate: row.try_get("capture_frame_rate")?,
        encoded_frame_rate: row.try_get("encoded_frame_rate")?,
        is_archived: row.try_get("is_archived")?,
        is_favorite: row.try_get("is_favorite")?,
        is_locked: row.try_get("is_locked")?,
        is_original_quality: row.try_get("is_original_quality")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        location_name: row.try_get("location_name")?,
        content_hash: row.try_get("sha1_hash")?,
        parsed_name: row.try_get("parsed_name")?,
    })
}

pub fn default_db_path(identity: &str) -> Result<PathBuf, MirrorError> {
    let base = dirs::data_dir().ok_or(MirrorError::MissingDataDir)?;
    Ok(base.join("gphotosd").join(format!("{identity}.db")))
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
