//! Metadata store trait and SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{AuditRepo, BlobRepo, FileRepo, PinRepo, StatsRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    FileRepo + BlobRepo + PinRepo + StatsRepo + AuditRepo + Send + Sync
{
    /// Create tables and indexes if they are missing.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Close all connections. Later calls fail.
    async fn close(&self);
}

/// SQLite-based reference ledger.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) the ledger at `path`.
    ///
    /// `query_timeout_secs` bounds how long an operation waits for the
    /// connection before failing.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(DEFAULT_QUERY_TIMEOUT_SECS);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // One connection: SQLite has a single writer, and every ledger
        // transaction is short, so queueing here is cheaper than lock retries.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(query_timeout_secs))
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::info!(path = %path.display(), query_timeout_secs, "ledger opened");
        Ok(store)
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::{
        AuditMode, CreatedFile, DeletedFile, IngestStart, PinId, RefcountAudit,
        RefcountDiscrepancy,
    };
    use larder_core::{
        ContentHash, FileId, ListQuery, LogicalFile, NewFile, OrderDirection, Savings, SortKey,
    };
    use sqlx::{QueryBuilder, SqliteConnection};
    use time::OffsetDateTime;

    const FILE_COLUMNS: &str = "file_id, original_filename, file_type, size, digest, uploaded_at";

    fn digest_bytes(digest: &ContentHash) -> &[u8] {
        digest.as_bytes().as_slice()
    }

    fn escape_like(term: &str) -> String {
        let mut escaped = String::with_capacity(term.len() + 2);
        for c in term.chars() {
            if matches!(c, '%' | '_' | '\\') {
                escaped.push('\\');
            }
            escaped.push(c);
        }
        escaped
    }

    async fn insert_file(conn: &mut SqliteConnection, new: &NewFile) -> MetadataResult<LogicalFile> {
        let file = LogicalFile {
            id: FileId::new(),
            original_filename: new.original_filename.clone(),
            file_type: new.file_type.clone(),
            size: new.size,
            uploaded_at: OffsetDateTime::now_utc(),
            digest: new.digest,
        };

        sqlx::query(
            "INSERT INTO files (file_id, original_filename, file_type, size, digest, uploaded_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(*file.id.as_uuid())
        .bind(&file.original_filename)
        .bind(&file.file_type)
        .bind(to_i64("files.size", file.size)?)
        .bind(digest_bytes(&file.digest))
        .bind(file.uploaded_at)
        .execute(&mut *conn)
        .await?;

        Ok(file)
    }

    fn check_length(new: &NewFile, byte_length: i64) -> MetadataResult<()> {
        if to_u64("blobs.byte_length", byte_length)? != new.size {
            return Err(MetadataError::Constraint(format!(
                "blob {} has length {byte_length} but upload is {} bytes",
                new.digest, new.size
            )));
        }
        Ok(())
    }

    #[async_trait]
    impl FileRepo for SqliteStore {
        async fn begin_ingest(
            &self,
            new: &NewFile,
            pin_expires_at: OffsetDateTime,
        ) -> MetadataResult<IngestStart> {
            let mut tx = self.pool.begin().await?;

            let blob: Option<(String, i64, i64)> = sqlx::query_as(
                "SELECT state, byte_length, ref_count FROM blobs WHERE digest = ?",
            )
            .bind(digest_bytes(&new.digest))
            .fetch_optional(&mut *tx)
            .await?;

            // Only a referenced blob is known to have bytes. An unreferenced
            // live row may sit over a removal that failed halfway, so it is
            // pinned and rewritten like a new digest.
            match blob {
                Some((state, byte_length, ref_count)) if state == "live" && ref_count > 0 => {
                    check_length(new, byte_length)?;
                    sqlx::query(
                        "UPDATE blobs SET ref_count = ref_count + 1, zeroed_at = NULL WHERE digest = ?",
                    )
                    .bind(digest_bytes(&new.digest))
                    .execute(&mut *tx)
                    .await?;
                    let file = insert_file(&mut tx, new).await?;
                    tx.commit().await?;
                    Ok(IngestStart::Deduplicated(file))
                }
                Some((state, ..)) if state == "reclaiming" => Ok(IngestStart::Reclaiming),
                blob => {
                    if let Some((_, byte_length, _)) = blob {
                        check_length(new, byte_length)?;
                    }
                    let pin = PinId::new();
                    sqlx::query(
                        "INSERT INTO blob_pins (pin_id, digest, created_at, expires_at) VALUES (?, ?, ?, ?)",
                    )
                    .bind(pin.0)
                    .bind(digest_bytes(&new.digest))
                    .bind(OffsetDateTime::now_utc())
                    .bind(pin_expires_at)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    Ok(IngestStart::Pinned(pin))
                }
            }
        }

        async fn create_file(
            &self,
            new: &NewFile,
            pin: Option<PinId>,
        ) -> MetadataResult<CreatedFile> {
            let mut tx = self.pool.begin().await?;

            let existing: Option<(i64,)> =
                sqlx::query_as("SELECT byte_length FROM blobs WHERE digest = ?")
                    .bind(digest_bytes(&new.digest))
                    .fetch_optional(&mut *tx)
                    .await?;
            if let Some((byte_length,)) = existing {
                check_length(new, byte_length)?;
            }

            let upserted = sqlx::query(
                r#"
                INSERT INTO blobs (digest, byte_length, object_key, ref_count, state, created_at)
                VALUES (?, ?, ?, 1, 'live', ?)
                ON CONFLICT(digest) DO UPDATE
                    SET ref_count = ref_count + 1, zeroed_at = NULL
                    WHERE state = 'live'
                "#,
            )
            .bind(digest_bytes(&new.digest))
            .bind(to_i64("blobs.byte_length", new.size)?)
            .bind(new.digest.to_object_key())
            .bind(OffsetDateTime::now_utc())
            .execute(&mut *tx)
            .await?;

            if upserted.rows_affected() == 0 {
                return Err(MetadataError::Conflict(format!(
                    "blob {} is being reclaimed",
                    new.digest
                )));
            }

            let file = insert_file(&mut tx, new).await?;

            if let Some(pin) = pin {
                sqlx::query("DELETE FROM blob_pins WHERE pin_id = ?")
                    .bind(pin.0)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            Ok(CreatedFile {
                file,
                deduplicated: existing.is_some(),
            })
        }

        async fn delete_file(&self, id: &FileId) -> MetadataResult<DeletedFile> {
            let mut tx = self.pool.begin().await?;

            let row = sqlx::query_as::<_, FileRow>(
                "DELETE FROM files WHERE file_id = ? RETURNING file_id, original_filename, file_type, size, digest, uploaded_at",
            )
            .bind(*id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("file {id}")))?;
            let file = LogicalFile::try_from(row)?;

            let remaining: Option<(i64,)> = sqlx::query_as(
                r#"
                UPDATE blobs
                SET ref_count = ref_count - 1,
                    zeroed_at = CASE WHEN ref_count = 1 THEN ? ELSE zeroed_at END
                WHERE digest = ? AND ref_count > 0
                RETURNING ref_count
                "#,
            )
            .bind(OffsetDateTime::now_utc())
            .bind(digest_bytes(&file.digest))
            .fetch_optional(&mut *tx)
            .await?;

            let Some((remaining,)) = remaining else {
                return Err(MetadataError::Constraint(format!(
                    "file {id} references blob {} with no outstanding references",
                    file.digest
                )));
            };

            tx.commit().await?;
            Ok(DeletedFile {
                file,
                remaining_refs: to_u64("blobs.ref_count", remaining)?,
            })
        }

        async fn get_file(&self, id: &FileId) -> MetadataResult<Option<LogicalFile>> {
            let row = sqlx::query_as::<_, FileRow>(
                "SELECT file_id, original_filename, file_type, size, digest, uploaded_at FROM files WHERE file_id = ?",
            )
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
            row.map(LogicalFile::try_from).transpose()
        }

        async fn list_files(&self, query: &ListQuery) -> MetadataResult<Vec<LogicalFile>> {
            let filter = &query.filter;
            if filter.is_unsatisfiable() {
                return Ok(Vec::new());
            }

            let mut qb = QueryBuilder::<Sqlite>::new("SELECT ");
            qb.push(FILE_COLUMNS).push(" FROM files WHERE 1 = 1");

            if let Some(search) = &filter.search {
                qb.push(" AND original_filename LIKE ")
                    .push_bind(format!("%{}%", escape_like(search)))
                    .push(" ESCAPE '\\'");
            }
            if let Some(types) = &filter.file_types {
                qb.push(" AND file_type IN (");
                let mut values = qb.separated(", ");
                for file_type in types {
                    values.push_bind(file_type.clone());
                }
                values.push_unseparated(")");
            }
            if let Some(min) = filter.size_min {
                // Nothing can be larger than i64::MAX bytes.
                let Ok(min) = i64::try_from(min) else {
                    return Ok(Vec::new());
                };
                qb.push(" AND size >= ").push_bind(min);
            }
            if let Some(max) = filter.size_max
                && let Ok(max) = i64::try_from(max)
            {
                qb.push(" AND size <= ").push_bind(max);
            }
            if let Some(from) = filter.uploaded_from {
                qb.push(" AND date(uploaded_at) >= ")
                    .push_bind(format_date(from)?);
            }
            if let Some(to) = filter.uploaded_to {
                qb.push(" AND date(uploaded_at) <= ")
                    .push_bind(format_date(to)?);
            }

            let column = match query.ordering.key {
                SortKey::UploadedAt => "julianday(uploaded_at)",
                SortKey::OriginalFilename => "original_filename",
                SortKey::Size => "size",
            };
            let direction = match query.ordering.direction {
                OrderDirection::Asc => "ASC",
                OrderDirection::Desc => "DESC",
            };
            qb.push(format!(" ORDER BY {column} {direction}, seq {direction}"));

            let rows = qb.build_query_as::<FileRow>().fetch_all(&self.pool).await?;
            rows.into_iter().map(LogicalFile::try_from).collect()
        }
    }

    fn format_date(date: time::Date) -> MetadataResult<String> {
        date.format(time::macros::format_description!("[year]-[month]-[day]"))
            .map_err(|e| MetadataError::Internal(e.to_string()))
    }

    #[async_trait]
    impl BlobRepo for SqliteStore {
        async fn get_blob(&self, digest: &ContentHash) -> MetadataResult<Option<BlobRow>> {
            let row = sqlx::query_as::<_, BlobRow>("SELECT * FROM blobs WHERE digest = ?")
                .bind(digest_bytes(digest))
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn claim_unreferenced(
            &self,
            now: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<BlobRow>> {
            // A single UPDATE is atomic in SQLite: a concurrent ingest either
            // incremented the row first (ref_count > 0, skipped here) or will
            // observe 'reclaiming' and wait.
            let rows = sqlx::query_as::<_, BlobRow>(
                r#"
                UPDATE blobs SET state = 'reclaiming'
                WHERE digest IN (
                    SELECT b.digest FROM blobs b
                    WHERE b.ref_count = 0
                      AND b.state = 'live'
                      AND NOT EXISTS (
                        SELECT 1 FROM blob_pins p
                        WHERE p.digest = b.digest
                          AND julianday(p.expires_at) > julianday(?)
                      )
                    ORDER BY b.zeroed_at
                    LIMIT ?
                )
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn claim_blob(
            &self,
            digest: &ContentHash,
            now: OffsetDateTime,
        ) -> MetadataResult<Option<BlobRow>> {
            let row = sqlx::query_as::<_, BlobRow>(
                r#"
                UPDATE blobs SET state = 'reclaiming'
                WHERE digest = ?
                  AND ref_count = 0
                  AND state = 'live'
                  AND NOT EXISTS (
                    SELECT 1 FROM blob_pins p
                    WHERE p.digest = blobs.digest
                      AND julianday(p.expires_at) > julianday(?)
                  )
                RETURNING *
                "#,
            )
            .bind(digest_bytes(digest))
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn claim_orphan(
            &self,
            digest: &ContentHash,
            byte_length: u64,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                INSERT INTO blobs (digest, byte_length, object_key, ref_count, state, created_at)
                SELECT ?, ?, ?, 0, 'reclaiming', ?
                WHERE NOT EXISTS (
                    SELECT 1 FROM blob_pins
                    WHERE digest = ? AND julianday(expires_at) > julianday(?)
                )
                ON CONFLICT(digest) DO NOTHING
                "#,
            )
            .bind(digest_bytes(digest))
            .bind(to_i64("blobs.byte_length", byte_length)?)
            .bind(digest.to_object_key())
            .bind(now)
            .bind(digest_bytes(digest))
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn finish_reclaim(&self, digest: &ContentHash) -> MetadataResult<bool> {
            let result = sqlx::query(
                "DELETE FROM blobs WHERE digest = ? AND state = 'reclaiming' AND ref_count = 0",
            )
            .bind(digest_bytes(digest))
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn revert_reclaim(&self, digest: &ContentHash) -> MetadataResult<()> {
            sqlx::query("UPDATE blobs SET state = 'live' WHERE digest = ? AND state = 'reclaiming'")
                .bind(digest_bytes(digest))
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn stale_claims(&self) -> MetadataResult<Vec<BlobRow>> {
            let rows = sqlx::query_as::<_, BlobRow>(
                "SELECT * FROM blobs WHERE state = 'reclaiming' ORDER BY digest",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn is_tracked(
            &self,
            digest: &ContentHash,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let tracked: bool = sqlx::query_scalar(
                r#"
                SELECT EXISTS(SELECT 1 FROM blobs WHERE digest = ?)
                    OR EXISTS(
                        SELECT 1 FROM blob_pins
                        WHERE digest = ? AND julianday(expires_at) > julianday(?)
                    )
                "#,
            )
            .bind(digest_bytes(digest))
            .bind(digest_bytes(digest))
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
            Ok(tracked)
        }
    }

    #[async_trait]
    impl PinRepo for SqliteStore {
        async fn release_pin(&self, pin: PinId) -> MetadataResult<()> {
            sqlx::query("DELETE FROM blob_pins WHERE pin_id = ?")
                .bind(pin.0)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn delete_expired_pins(&self, now: OffsetDateTime) -> MetadataResult<u64> {
            let result =
                sqlx::query("DELETE FROM blob_pins WHERE julianday(expires_at) <= julianday(?)")
                    .bind(now)
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected())
        }
    }

    #[async_trait]
    impl StatsRepo for SqliteStore {
        async fn get_savings(&self) -> MetadataResult<Savings> {
            let (logical, unique): (i64, i64) = sqlx::query_as(
                r#"
                SELECT
                    (SELECT COALESCE(SUM(size), 0) FROM files),
                    (SELECT COALESCE(SUM(byte_length), 0) FROM blobs WHERE ref_count > 0)
                "#,
            )
            .fetch_one(&self.pool)
            .await?;
            Ok(Savings::from_totals(
                to_u64("total_logical_bytes", logical)?,
                to_u64("total_unique_bytes", unique)?,
            ))
        }
    }

    #[async_trait]
    impl AuditRepo for SqliteStore {
        async fn audit_refcounts(&self, mode: AuditMode) -> MetadataResult<RefcountAudit> {
            let mut tx = self.pool.begin().await?;

            let rows: Vec<(Vec<u8>, i64, i64)> = sqlx::query_as(
                r#"
                SELECT b.digest, b.ref_count,
                       (SELECT COUNT(*) FROM files f WHERE f.digest = b.digest)
                FROM blobs b
                WHERE b.state = 'live'
                "#,
            )
            .fetch_all(&mut *tx)
            .await?;

            let blobs_checked = rows.len() as u64;
            let mut discrepancies = Vec::new();
            for (digest, recorded, actual) in rows {
                if recorded != actual {
                    discrepancies.push(RefcountDiscrepancy {
                        digest: decode_digest(&digest)?,
                        recorded: to_u64("blobs.ref_count", recorded)?,
                        actual: to_u64("count", actual)?,
                    });
                }
            }

            let mut corrected = 0;
            if mode == AuditMode::Correct {
                let now = OffsetDateTime::now_utc();
                for d in &discrepancies {
                    let actual = to_i64("count", d.actual)?;
                    sqlx::query(
                        r#"
                        UPDATE blobs
                        SET ref_count = ?,
                            zeroed_at = CASE WHEN ? = 0 THEN COALESCE(zeroed_at, ?) ELSE NULL END
                        WHERE digest = ? AND state = 'live'
                        "#,
                    )
                    .bind(actual)
                    .bind(actual)
                    .bind(now)
                    .bind(digest_bytes(&d.digest))
                    .execute(&mut *tx)
                    .await?;
                    corrected += 1;
                    tracing::warn!(
                        digest = %d.digest,
                        recorded = d.recorded,
                        actual = d.actual,
                        "corrected blob reference count"
                    );
                }
            }

            tx.commit().await?;
            Ok(RefcountAudit {
                mode,
                blobs_checked,
                discrepancies,
                corrected,
            })
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
-- One row per distinct digest
CREATE TABLE IF NOT EXISTS blobs (
    digest BLOB PRIMARY KEY,
    byte_length INTEGER NOT NULL CHECK (byte_length >= 0),
    object_key TEXT NOT NULL,
    ref_count INTEGER NOT NULL CHECK (ref_count >= 0),
    state TEXT NOT NULL DEFAULT 'live' CHECK (state IN ('live', 'reclaiming')),
    created_at TEXT NOT NULL,
    zeroed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_blobs_unreferenced ON blobs(state, zeroed_at) WHERE ref_count = 0;

-- One row per upload
CREATE TABLE IF NOT EXISTS files (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id BLOB NOT NULL UNIQUE,
    original_filename TEXT NOT NULL,
    file_type TEXT NOT NULL,
    size INTEGER NOT NULL CHECK (size >= 0),
    digest BLOB NOT NULL REFERENCES blobs(digest),
    uploaded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_files_uploaded_at ON files(uploaded_at);
CREATE INDEX IF NOT EXISTS idx_files_size ON files(size);
CREATE INDEX IF NOT EXISTS idx_files_original_filename ON files(original_filename);
CREATE INDEX IF NOT EXISTS idx_files_digest ON files(digest);

-- Uploads writing bytes for a digest that has no blob row yet
CREATE TABLE IF NOT EXISTS blob_pins (
    pin_id BLOB PRIMARY KEY,
    digest BLOB NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_blob_pins_digest ON blob_pins(digest);
"#;
