use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use playbill_core::{WorkId, normalize_text};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkRecord {
    pub id: WorkId,
    pub name: String,
    pub name_norm: String,
    pub default_city_norm: Option<String>,
    pub retired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasRecord {
    pub work_id: WorkId,
    pub alias: String,
    pub alias_norm: String,
    pub source: String,
    pub weight: i64,
    pub no_response_count: i64,
    pub last_used_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceLinkRecord {
    pub work_id: WorkId,
    pub source: String,
    pub source_id: String,
    pub title_at_source: Option<String>,
    pub city_hint: Option<String>,
    pub confidence: f64,
    pub payload_hash: Option<String>,
    pub last_sync_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub work_id: WorkId,
    /// Normalized city scope; empty string when the snapshot is not scoped
    /// to a city.
    pub city_norm: String,
    pub payload: String,
    pub ttl_seconds: i64,
    pub last_success_at: i64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub struct CatalogStore {
    conn: Connection,
    playbill_dir: PathBuf,
}

impl CatalogStore {
    pub fn open(workspace_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let playbill_dir = workspace_root.as_ref().join(".playbill");
        let sqlite_path = playbill_dir.join("catalog.sqlite");

        fs::create_dir_all(&playbill_dir)?;

        let conn = Connection::open(sqlite_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        run_migrations(&conn)?;

        Ok(Self { conn, playbill_dir })
    }

    pub fn playbill_dir(&self) -> &Path {
        &self.playbill_dir
    }

    /// Register a work by display name. A work is created at most once per
    /// normalized name; a second sighting returns the existing row.
    pub fn upsert_work(
        &self,
        name: &str,
        default_city_norm: Option<&str>,
    ) -> Result<WorkRecord, StoreError> {
        let name_norm = normalize_text(name);
        self.conn.execute(
            r#"
            INSERT INTO works (name, name_norm, default_city_norm)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name_norm) DO NOTHING
            "#,
            params![name, name_norm, default_city_norm],
        )?;

        let record = self.find_work_by_name_norm(&name_norm)?;
        record.ok_or_else(|| StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }

    pub fn get_work(&self, work_id: WorkId) -> Result<Option<WorkRecord>, StoreError> {
        let record = self
            .conn
            .prepare(
                "SELECT id, name, name_norm, default_city_norm, retired FROM works WHERE id = ?1",
            )?
            .query_row(params![work_id], work_record_from_row)
            .optional()?;
        Ok(record)
    }

    pub fn find_work_by_name_norm(
        &self,
        name_norm: &str,
    ) -> Result<Option<WorkRecord>, StoreError> {
        let record = self
            .conn
            .prepare(
                "SELECT id, name, name_norm, default_city_norm, retired FROM works WHERE name_norm = ?1",
            )?
            .query_row(params![name_norm], work_record_from_row)
            .optional()?;
        Ok(record)
    }

    /// Works are never deleted, only soft-marked.
    pub fn retire_work(&self, work_id: WorkId) -> Result<(), StoreError> {
        self.conn
            .execute("UPDATE works SET retired = 1 WHERE id = ?1", params![work_id])?;
        Ok(())
    }

    /// A normalized alias resolves to at most one work; re-adding an alias
    /// that already exists points it at the new work (last write wins).
    pub fn upsert_alias(
        &self,
        work_id: WorkId,
        alias: &str,
        source: &str,
        weight: i64,
    ) -> Result<AliasRecord, StoreError> {
        let alias_norm = normalize_text(alias);
        self.conn.execute(
            r#"
            INSERT INTO work_aliases (alias_norm, work_id, alias, source, weight, no_response_count)
            VALUES (?1, ?2, ?3, ?4, ?5, 0)
            ON CONFLICT(alias_norm) DO UPDATE SET
                work_id = excluded.work_id,
                alias = excluded.alias,
                source = excluded.source,
                weight = excluded.weight
            "#,
            params![alias_norm, work_id, alias, source, weight],
        )?;

        let record = self
            .conn
            .prepare(
                r#"
                SELECT work_id, alias, alias_norm, source, weight, no_response_count, last_used_at
                FROM work_aliases WHERE alias_norm = ?1
                "#,
            )?
            .query_row(params![alias_norm], alias_record_from_row)
            .optional()?;
        record.ok_or_else(|| StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }

    pub fn delete_alias(&self, alias_norm: &str) -> Result<bool, StoreError> {
        let deleted = self.conn.execute(
            "DELETE FROM work_aliases WHERE alias_norm = ?1",
            params![alias_norm],
        )?;
        Ok(deleted > 0)
    }

    pub fn list_aliases(&self) -> Result<Vec<AliasRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT work_id, alias, alias_norm, source, weight, no_response_count, last_used_at
            FROM work_aliases
            ORDER BY alias_norm
            "#,
        )?;
        let rows = stmt.query_map([], alias_record_from_row)?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Persisted per-alias miss counter: strictly increases on failed
    /// resolution, resets to zero on success.
    pub fn set_alias_no_response(
        &self,
        alias_norm: &str,
        count: i64,
        used_at: i64,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            UPDATE work_aliases
            SET no_response_count = ?2, last_used_at = ?3
            WHERE alias_norm = ?1
            "#,
            params![alias_norm, count, used_at],
        )?;
        Ok(())
    }

    /// Append a directly-queryable name for a work. Insertion order is the
    /// resolution priority; re-adding an existing name keeps its slot.
    pub fn add_search_name(&self, work_id: WorkId, name: &str) -> Result<(), StoreError> {
        let name = name.trim();
        self.conn.execute(
            r#"
            INSERT INTO search_names (work_id, name, position)
            SELECT ?1, ?2, COALESCE(MAX(position), 0) + 1 FROM search_names WHERE work_id = ?1
            ON CONFLICT(work_id, name) DO NOTHING
            "#,
            params![work_id, name],
        )?;
        Ok(())
    }

    pub fn remove_search_name(&self, work_id: WorkId, name: &str) -> Result<bool, StoreError> {
        let deleted = self.conn.execute(
            "DELETE FROM search_names WHERE work_id = ?1 AND name = ?2",
            params![work_id, name.trim()],
        )?;
        Ok(deleted > 0)
    }

    pub fn search_names_for_work(&self, work_id: WorkId) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM search_names WHERE work_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map(params![work_id], |row| row.get::<_, String>(0))?;
        let names = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn list_search_names(&self) -> Result<Vec<(WorkId, String)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT work_id, name FROM search_names ORDER BY work_id, position")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let names = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn find_work_by_search_name(&self, name: &str) -> Result<Option<WorkId>, StoreError> {
        let work_id = self
            .conn
            .prepare("SELECT work_id FROM search_names WHERE name = ?1")?
            .query_row(params![name.trim()], |row| row.get(0))
            .optional()?;
        Ok(work_id)
    }

    /// Upsert the correlation between a work and an external-source listing,
    /// keyed by (work, source, source id).
    pub fn upsert_source_link(&self, record: &SourceLinkRecord) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO work_source_links (
                work_id, source, source_id, title_at_source, city_hint,
                confidence, payload_hash, last_sync_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(work_id, source, source_id) DO UPDATE SET
                title_at_source = COALESCE(excluded.title_at_source, title_at_source),
                city_hint = COALESCE(excluded.city_hint, city_hint),
                confidence = excluded.confidence,
                payload_hash = COALESCE(excluded.payload_hash, payload_hash),
                last_sync_at = excluded.last_sync_at
            "#,
            params![
                record.work_id,
                record.source,
                record.source_id,
                record.title_at_source,
                record.city_hint,
                record.confidence,
                record.payload_hash,
                record.last_sync_at,
            ],
        )?;
        Ok(())
    }

    pub fn find_source_link(
        &self,
        source: &str,
        source_id: &str,
    ) -> Result<Option<SourceLinkRecord>, StoreError> {
        let record = self
            .conn
            .prepare(
                r#"
                SELECT work_id, source, source_id, title_at_source, city_hint,
                       confidence, payload_hash, last_sync_at
                FROM work_source_links
                WHERE source = ?1 AND source_id = ?2
                "#,
            )?
            .query_row(params![source, source_id], source_link_from_row)
            .optional()?;
        Ok(record)
    }

    pub fn source_links_for_work(
        &self,
        work_id: WorkId,
    ) -> Result<Vec<SourceLinkRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT work_id, source, source_id, title_at_source, city_hint,
                   confidence, payload_hash, last_sync_at
            FROM work_source_links
            WHERE work_id = ?1
            ORDER BY last_sync_at DESC
            "#,
        )?;
        let rows = stmt.query_map(params![work_id], source_link_from_row)?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Replace the single snapshot row for (work, city scope). The UPSERT is
    /// one statement, so a concurrent reader sees either the old or the new
    /// payload, never a mix.
    pub fn upsert_snapshot(
        &self,
        work_id: WorkId,
        city_norm: &str,
        payload: &str,
        ttl_seconds: i64,
        last_success_at: i64,
    ) -> Result<SnapshotRecord, StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO snapshots (work_id, city_norm, payload, ttl_seconds, last_success_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(work_id, city_norm) DO UPDATE SET
                payload = excluded.payload,
                ttl_seconds = excluded.ttl_seconds,
                last_success_at = excluded.last_success_at
            "#,
            params![work_id, city_norm, payload, ttl_seconds, last_success_at],
        )?;

        Ok(SnapshotRecord {
            work_id,
            city_norm: city_norm.to_owned(),
            payload: payload.to_owned(),
            ttl_seconds,
            last_success_at,
        })
    }

    /// Without a city hint the most recently reconciled row for the work is
    /// returned.
    pub fn get_snapshot(
        &self,
        work_id: WorkId,
        city_hint: Option<&str>,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        let record = match city_hint {
            Some(city_norm) => self
                .conn
                .prepare(
                    r#"
                    SELECT work_id, city_norm, payload, ttl_seconds, last_success_at
                    FROM snapshots
                    WHERE work_id = ?1 AND city_norm = ?2
                    "#,
                )?
                .query_row(params![work_id, city_norm], snapshot_from_row)
                .optional()?,
            None => self
                .conn
                .prepare(
                    r#"
                    SELECT work_id, city_norm, payload, ttl_seconds, last_success_at
                    FROM snapshots
                    WHERE work_id = ?1
                    ORDER BY last_success_at DESC
                    LIMIT 1
                    "#,
                )?
                .query_row(params![work_id], snapshot_from_row)
                .optional()?,
        };
        Ok(record)
    }
}

fn work_record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkRecord> {
    Ok(WorkRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        name_norm: row.get(2)?,
        default_city_norm: row.get(3)?,
        retired: row.get::<_, i64>(4)? != 0,
    })
}

fn alias_record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AliasRecord> {
    Ok(AliasRecord {
        work_id: row.get(0)?,
        alias: row.get(1)?,
        alias_norm: row.get(2)?,
        source: row.get(3)?,
        weight: row.get(4)?,
        no_response_count: row.get(5)?,
        last_used_at: row.get(6)?,
    })
}

fn source_link_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SourceLinkRecord> {
    Ok(SourceLinkRecord {
        work_id: row.get(0)?,
        source: row.get(1)?,
        source_id: row.get(2)?,
        title_at_source: row.get(3)?,
        city_hint: row.get(4)?,
        confidence: row.get(5)?,
        payload_hash: row.get(6)?,
        last_sync_at: row.get(7)?,
    })
}

fn snapshot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRecord> {
    Ok(SnapshotRecord {
        work_id: row.get(0)?,
        city_norm: row.get(1)?,
        payload: row.get(2)?,
        ttl_seconds: row.get(3)?,
        last_success_at: row.get(4)?,
    })
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS works (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            name_norm TEXT NOT NULL UNIQUE,
            default_city_norm TEXT,
            retired INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS work_aliases (
            alias_norm TEXT PRIMARY KEY,
            work_id INTEGER NOT NULL,
            alias TEXT NOT NULL,
            source TEXT NOT NULL,
            weight INTEGER NOT NULL DEFAULT 0,
            no_response_count INTEGER NOT NULL DEFAULT 0,
            last_used_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS search_names (
            work_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY (work_id, name)
        );

        CREATE TABLE IF NOT EXISTS work_source_links (
            work_id INTEGER NOT NULL,
            source TEXT NOT NULL,
            source_id TEXT NOT NULL,
            title_at_source TEXT,
            city_hint TEXT,
            confidence REAL NOT NULL DEFAULT 0,
            payload_hash TEXT,
            last_sync_at INTEGER NOT NULL,
            PRIMARY KEY (work_id, source, source_id)
        );

        CREATE TABLE IF NOT EXISTS snapshots (
            work_id INTEGER NOT NULL,
            city_norm TEXT NOT NULL DEFAULT '',
            payload TEXT NOT NULL,
            ttl_seconds INTEGER NOT NULL,
            last_success_at INTEGER NOT NULL,
            PRIMARY KEY (work_id, city_norm)
        );

        CREATE INDEX IF NOT EXISTS idx_work_aliases_work ON work_aliases(work_id);
        CREATE INDEX IF NOT EXISTS idx_source_links_source ON work_source_links(source, source_id);
        "#,
    )?;

    Ok(())
}
