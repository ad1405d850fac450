//! Relational health-data stores.
//!
//! Two logical tables hold normalized output: `series_data` (point samples,
//! keyed by user/indicator/source/time) and `summary_data` (interval
//! aggregates, keyed by user/indicator/start/end). Raw vendor payloads are
//! kept per-provider in `raw_payload` for audit and replay, deduplicated on
//! `msg_id`. The user/provider link table lives here too; the credential
//! vault layers encryption on top of it.
//!
//! All writes are upserts so the ingestion path is safe to replay
//! (at-least-once delivery upstream, last-writer-wins on conflict).

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS health_user_provider (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    auth_kind TEXT NOT NULL,
    username TEXT,
    password TEXT,
    access_token TEXT,
    access_token_secret TEXT,
    refresh_token TEXT,
    expires_at INTEGER,
    connect_info TEXT,
    llm_access INTEGER NOT NULL DEFAULT 1,
    reconnect INTEGER NOT NULL DEFAULT 0,
    is_del INTEGER NOT NULL DEFAULT 0,
    create_at TEXT NOT NULL,
    update_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_link_user_provider ON health_user_provider(user_id, provider, is_del);
CREATE INDEX IF NOT EXISTS idx_link_provider ON health_user_provider(provider, is_del, reconnect);

CREATE TABLE IF NOT EXISTS series_data (
    user_id TEXT NOT NULL,
    indicator TEXT NOT NULL,
    source TEXT NOT NULL,
    time TEXT NOT NULL,
    value TEXT NOT NULL,
    timezone TEXT,
    task_id TEXT,
    source_id TEXT,
    create_time TEXT NOT NULL,
    update_time TEXT NOT NULL,
    PRIMARY KEY (user_id, indicator, source, time)
);

CREATE INDEX IF NOT EXISTS idx_series_source_id ON series_data(source_id);
CREATE INDEX IF NOT EXISTS idx_series_user_source ON series_data(user_id, source);

CREATE TABLE IF NOT EXISTS summary_data (
    user_id TEXT NOT NULL,
    indicator TEXT NOT NULL,
    value TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    source TEXT,
    source_table TEXT,
    source_table_id TEXT,
    comment TEXT,
    task_id TEXT,
    deleted INTEGER NOT NULL DEFAULT 0,
    create_time TEXT NOT NULL,
    update_time TEXT NOT NULL,
    PRIMARY KEY (user_id, indicator, start_time, end_time)
);

CREATE TABLE IF NOT EXISTS raw_payload (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    provider TEXT NOT NULL,
    msg_id TEXT NOT NULL,
    user_id TEXT,
    external_user_id TEXT,
    raw_data TEXT NOT NULL,
    is_del INTEGER NOT NULL DEFAULT 0,
    create_at TEXT NOT NULL,
    update_at TEXT NOT NULL,
    UNIQUE (provider, msg_id)
);

CREATE INDEX IF NOT EXISTS idx_raw_provider_time ON raw_payload(provider, create_at DESC);
"#;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

fn format_time(t: NaiveDateTime) -> String {
    t.format(TIME_FORMAT).to_string()
}

fn parse_time(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .ok()
}

fn now_string() -> String {
    format_time(chrono::Utc::now().naive_utc())
}

/// A normalized point sample bound for `series_data`.
#[derive(Debug, Clone)]
pub struct SeriesRecord {
    pub user_id: String,
    pub indicator: String,
    pub source: String,
    /// UTC timestamp of the sample
    pub time: NaiveDateTime,
    pub value: String,
    pub timezone: String,
    pub task_id: Option<String>,
    pub source_id: Option<String>,
}

/// A normalized interval aggregate bound for `summary_data`.
/// `start_time`/`end_time` are the user's local wall-clock time.
#[derive(Debug, Clone)]
pub struct SummaryRecord {
    pub user_id: String,
    pub indicator: String,
    pub value: String,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub source: String,
    pub source_table: String,
    pub source_table_id: String,
    pub comment: String,
    pub task_id: Option<String>,
}

/// A stored raw vendor payload.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RawPayloadRow {
    pub id: i64,
    pub provider: String,
    pub msg_id: String,
    pub user_id: Option<String>,
    pub external_user_id: Option<String>,
    pub raw_data: serde_json::Value,
    pub create_at: String,
    pub update_at: String,
}

/// Per-source aggregate used for the provider stats cache.
#[derive(Debug, Clone)]
pub struct SourceStats {
    pub record_count: i64,
    pub last_sync_time: Option<NaiveDateTime>,
}

/// Handle to the shared SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.execute_batch(SCHEMA).context("Failed to apply schema")?;
        info!(path = %path.display(), "Database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch(SCHEMA).context("Failed to apply schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Shared connection handle for sibling services (the credential vault).
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    // ===== Series store =====

    /// Batch-upsert series rows. A conflicting row is rewritten only when its
    /// value or task id actually changed, so replays leave `update_time`
    /// untouched for identical data.
    pub async fn save_series_records(&self, records: &[SeriesRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        const BATCH_SIZE: usize = 1000;
        let now = now_string();
        let conn = self.conn.lock().await;
        let mut saved = 0usize;

        for batch in records.chunks(BATCH_SIZE) {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    r#"
                    INSERT INTO series_data
                        (user_id, indicator, source, time, value, timezone, task_id, source_id, create_time, update_time)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                    ON CONFLICT (user_id, indicator, source, time)
                    DO UPDATE SET
                        value = excluded.value,
                        timezone = excluded.timezone,
                        task_id = excluded.task_id,
                        source_id = excluded.source_id,
                        update_time = excluded.update_time
                    WHERE series_data.value IS NOT excluded.value
                       OR series_data.task_id IS NOT excluded.task_id
                    "#,
                )?;
                for record in batch {
                    stmt.execute(params![
                        record.user_id,
                        record.indicator,
                        record.source,
                        format_time(record.time),
                        record.value,
                        record.timezone,
                        record.task_id,
                        record.source_id,
                        now,
                    ])?;
                }
            }
            tx.commit()?;
            saved += batch.len();
            debug!(batch = batch.len(), "Saved series batch");
        }

        info!(count = saved, "Saved series records");
        Ok(saved)
    }

    /// Range query over series rows.
    pub async fn query_series(
        &self,
        user_id: &str,
        indicator: &str,
        from: Option<NaiveDateTime>,
        to: Option<NaiveDateTime>,
    ) -> Result<Vec<SeriesRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT user_id, indicator, source, time, value, timezone, task_id, source_id
            FROM series_data
            WHERE user_id = ?1 AND indicator = ?2
              AND (?3 IS NULL OR time >= ?3)
              AND (?4 IS NULL OR time <= ?4)
            ORDER BY time
            "#,
        )?;

        let rows = stmt.query_map(
            params![user_id, indicator, from.map(format_time), to.map(format_time)],
            |row| {
                let time_str: String = row.get(3)?;
                Ok(SeriesRecord {
                    user_id: row.get(0)?,
                    indicator: row.get(1)?,
                    source: row.get(2)?,
                    time: parse_time(&time_str).unwrap_or_default(),
                    value: row.get(4)?,
                    timezone: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                    task_id: row.get(6)?,
                    source_id: row.get(7)?,
                })
            },
        )?;

        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Update time of a series row, for verifying replay semantics.
    pub async fn series_update_time(
        &self,
        user_id: &str,
        indicator: &str,
        source: &str,
        time: NaiveDateTime,
    ) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let result = conn
            .query_row(
                "SELECT update_time FROM series_data WHERE user_id = ?1 AND indicator = ?2 AND source = ?3 AND time = ?4",
                params![user_id, indicator, source, format_time(time)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }

    /// Best-effort delete of series rows that originated from one raw payload.
    /// Matches both the current `source_id = msg_id` form and the legacy
    /// `msg_id_#_hash` suffix form kept for migration tolerance.
    pub async fn delete_series_by_source_id(&self, source_table_id: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM series_data WHERE source_id = ?1 OR source_id LIKE ?1 || '_#_%'",
            params![source_table_id],
        )?;
        if deleted > 0 {
            info!(source_table_id, deleted, "Cascade-deleted series rows");
        }
        Ok(deleted)
    }

    // ===== Summary store =====

    /// Batch-upsert summary rows. A key conflict always rewrites
    /// value/comment/source/source_table_id/task_id.
    pub async fn save_summary_records(&self, records: &[SummaryRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        const BATCH_SIZE: usize = 1000;
        let now = now_string();
        let conn = self.conn.lock().await;
        let mut saved = 0usize;

        for batch in records.chunks(BATCH_SIZE) {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    r#"
                    INSERT INTO summary_data
                        (user_id, indicator, value, start_time, end_time, source, source_table,
                         source_table_id, comment, task_id, deleted, create_time, update_time)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?11)
                    ON CONFLICT (user_id, indicator, start_time, end_time)
                    DO UPDATE SET
                        value = excluded.value,
                        source = excluded.source,
                        source_table = excluded.source_table,
                        source_table_id = excluded.source_table_id,
                        comment = excluded.comment,
                        task_id = excluded.task_id,
                        update_time = excluded.update_time
                    "#,
                )?;
                for record in batch {
                    stmt.execute(params![
                        record.user_id,
                        record.indicator,
                        record.value,
                        format_time(record.start_time),
                        format_time(record.end_time),
                        record.source,
                        record.source_table,
                        record.source_table_id,
                        record.comment,
                        record.task_id,
                        now,
                    ])?;
                }
            }
            tx.commit()?;
            saved += batch.len();
        }

        info!(count = saved, "Saved summary records");
        Ok(saved)
    }

    /// Range query over summary rows, non-deleted only.
    pub async fn query_summary(
        &self,
        user_id: &str,
        indicator: &str,
        start_from: Option<NaiveDateTime>,
    ) -> Result<Vec<SummaryRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT user_id, indicator, value, start_time, end_time, source, source_table,
                   source_table_id, comment, task_id
            FROM summary_data
            WHERE user_id = ?1 AND indicator = ?2 AND deleted = 0
              AND (?3 IS NULL OR start_time >= ?3)
            ORDER BY start_time
            "#,
        )?;

        let rows = stmt.query_map(
            params![user_id, indicator, start_from.map(format_time)],
            |row| {
                let start_str: String = row.get(3)?;
                let end_str: String = row.get(4)?;
                Ok(SummaryRecord {
                    user_id: row.get(0)?,
                    indicator: row.get(1)?,
                    value: row.get(2)?,
                    start_time: parse_time(&start_str).unwrap_or_default(),
                    end_time: parse_time(&end_str).unwrap_or_default(),
                    source: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                    source_table: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                    source_table_id: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                    comment: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
                    task_id: row.get(9)?,
                })
            },
        )?;

        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Soft-delete summary rows that originated from one source table row.
    pub async fn soft_delete_summary_by_source(
        &self,
        user_id: &str,
        source_table: &str,
        source_table_id: &str,
    ) -> Result<usize> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            r#"
            UPDATE summary_data SET deleted = 1, update_time = ?4
            WHERE user_id = ?1 AND source_table = ?2 AND source_table_id = ?3 AND deleted = 0
            "#,
            params![user_id, source_table, source_table_id, now_string()],
        )?;
        Ok(updated)
    }

    // ===== Raw payload store =====

    /// Insert a raw payload. Returns `None` when the `(provider, msg_id)` pair
    /// was already stored, the idempotent-duplicate case.
    pub async fn insert_raw_payload(
        &self,
        provider: &str,
        msg_id: &str,
        user_id: Option<&str>,
        external_user_id: Option<&str>,
        raw_data: &serde_json::Value,
    ) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        let now = now_string();
        let inserted = conn.execute(
            r#"
            INSERT INTO raw_payload (provider, msg_id, user_id, external_user_id, raw_data, is_del, create_at, update_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)
            ON CONFLICT (provider, msg_id) DO NOTHING
            "#,
            params![provider, msg_id, user_id, external_user_id, raw_data.to_string(), now],
        )?;

        if inserted == 0 {
            debug!(provider, msg_id, "Raw payload already stored, skipping");
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    /// Whether a raw payload with this msg_id has already been stored.
    pub async fn raw_payload_exists(&self, provider: &str, msg_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM raw_payload WHERE provider = ?1 AND msg_id = ?2 AND is_del = 0",
            params![provider, msg_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn raw_row_from(row: &rusqlite::Row<'_>) -> std::result::Result<RawPayloadRow, rusqlite::Error> {
        let raw_str: String = row.get(5)?;
        let raw_data = serde_json::from_str(&raw_str).unwrap_or(serde_json::Value::Null);
        Ok(RawPayloadRow {
            id: row.get(0)?,
            provider: row.get(1)?,
            msg_id: row.get(2)?,
            user_id: row.get(3)?,
            external_user_id: row.get(4)?,
            raw_data,
            create_at: row.get(6)?,
            update_at: row.get(7)?,
        })
    }

    /// Paginated raw payload listing for the management console.
    pub async fn list_raw_payloads(
        &self,
        provider: &str,
        page: u32,
        page_size: u32,
        user_id: Option<&str>,
    ) -> Result<(Vec<RawPayloadRow>, i64)> {
        let page = page.max(1);
        let offset = (page - 1) * page_size;
        let conn = self.conn.lock().await;

        let total: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM raw_payload
            WHERE provider = ?1 AND is_del = 0 AND (?2 IS NULL OR user_id = ?2)
            "#,
            params![provider, user_id],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, provider, msg_id, user_id, external_user_id, raw_data, create_at, update_at
            FROM raw_payload
            WHERE provider = ?1 AND is_del = 0 AND (?2 IS NULL OR user_id = ?2)
            ORDER BY create_at DESC, id DESC
            LIMIT ?3 OFFSET ?4
            "#,
        )?;
        let rows = stmt.query_map(params![provider, user_id, page_size, offset], Self::raw_row_from)?;

        Ok((rows.collect::<std::result::Result<Vec<_>, _>>()?, total))
    }

    /// Fetch one raw payload by row id.
    pub async fn get_raw_payload(&self, provider: &str, id: i64) -> Result<Option<RawPayloadRow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                r#"
                SELECT id, provider, msg_id, user_id, external_user_id, raw_data, create_at, update_at
                FROM raw_payload WHERE provider = ?1 AND id = ?2
                "#,
                params![provider, id],
                Self::raw_row_from,
            )
            .optional()?;
        Ok(row)
    }

    /// Soft-delete a raw payload. Returns its msg_id so callers can trigger a
    /// cascade delete of derived series rows.
    pub async fn soft_delete_raw_payload(&self, provider: &str, id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let msg_id: Option<String> = conn
            .query_row(
                "SELECT msg_id FROM raw_payload WHERE provider = ?1 AND id = ?2 AND is_del = 0",
                params![provider, id],
                |row| row.get(0),
            )
            .optional()?;

        if msg_id.is_some() {
            conn.execute(
                "UPDATE raw_payload SET is_del = 1, update_at = ?3 WHERE provider = ?1 AND id = ?2",
                params![provider, id, now_string()],
            )?;
        } else {
            warn!(provider, id, "Raw payload not found or already deleted");
        }
        Ok(msg_id)
    }

    // ===== Aggregates =====

    /// One aggregate query powering the provider stats cache: record count and
    /// newest sample time grouped by source.
    pub async fn user_source_stats(&self, user_id: &str) -> Result<HashMap<String, SourceStats>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT source, COUNT(*) AS record_count, MAX(time) AS last_sync_time
            FROM series_data WHERE user_id = ?1 GROUP BY source
            "#,
        )?;

        let rows = stmt.query_map(params![user_id], |row| {
            let source: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let last: Option<String> = row.get(2)?;
            Ok((source, count, last))
        })?;

        let mut stats = HashMap::new();
        for row in rows {
            let (source, record_count, last) = row?;
            stats.insert(
                source,
                SourceStats {
                    record_count,
                    last_sync_time: last.as_deref().and_then(parse_time),
                },
            );
        }
        Ok(stats)
    }
}
