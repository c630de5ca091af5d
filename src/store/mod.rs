pub mod settings;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::BotResult;

/// One stored document: a flat JSON object.
pub type Record = Map<String, Value>;

/// Record CRUD over named collections.
///
/// A record matches `criteria` when every criteria field is present with an
/// equal value; empty criteria match everything.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_one(&self, collection: &str, criteria: &Record) -> BotResult<Option<Record>>;

    async fn find_all(&self, collection: &str, criteria: &Record) -> BotResult<Vec<Record>>;

    async fn create(&self, collection: &str, fields: Record) -> BotResult<Record>;

    /// Merge `fields` into every matching record; returns the number updated.
    async fn update(&self, collection: &str, criteria: &Record, fields: &Record)
        -> BotResult<usize>;

    async fn destroy(&self, collection: &str, criteria: &Record) -> BotResult<usize>;
}

/// Build criteria from `(field, value)` pairs.
pub fn criteria<const N: usize>(pairs: [(&str, Value); N]) -> Record {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn matches(record: &Record, criteria: &Record) -> bool {
    criteria
        .iter()
        .all(|(field, expected)| record.get(field) == Some(expected))
}

/// SQLite-backed record store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;
        info!("Record store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS records (
                record_id TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                fields TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_collection
                ON records(collection, created_at);
            ",
        )
        .context("Failed to run record store migrations")?;
        Ok(())
    }

    // Caller holds the lock. Rows come back in creation order.
    fn matching(
        conn: &Connection,
        collection: &str,
        criteria: &Record,
    ) -> BotResult<Vec<(String, Record)>> {
        let mut stmt = conn.prepare(
            "SELECT record_id, fields FROM records
             WHERE collection = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut found = Vec::new();
        for (record_id, fields) in rows {
            let record: Record = serde_json::from_str(&fields)?;
            if matches(&record, criteria) {
                found.push((record_id, record));
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn find_one(&self, collection: &str, criteria: &Record) -> BotResult<Option<Record>> {
        let conn = self.conn.lock().await;
        Ok(Self::matching(&conn, collection, criteria)?
            .into_iter()
            .next()
            .map(|(_, record)| record))
    }

    async fn find_all(&self, collection: &str, criteria: &Record) -> BotResult<Vec<Record>> {
        let conn = self.conn.lock().await;
        Ok(Self::matching(&conn, collection, criteria)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    async fn create(&self, collection: &str, fields: Record) -> BotResult<Record> {
        let record_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let json = serde_json::to_string(&fields)?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO records (record_id, collection, fields, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            rusqlite::params![record_id, collection, json, now],
        )?;
        debug!(collection, record_id = %record_id, "Record created");
        Ok(fields)
    }

    async fn update(
        &self,
        collection: &str,
        criteria: &Record,
        fields: &Record,
    ) -> BotResult<usize> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let found = Self::matching(&conn, collection, criteria)?;
        for (record_id, mut record) in found.iter().cloned() {
            for (field, value) in fields {
                record.insert(field.clone(), value.clone());
            }
            conn.execute(
                "UPDATE records SET fields = ?1, updated_at = ?2 WHERE record_id = ?3",
                rusqlite::params![serde_json::to_string(&record)?, now, record_id],
            )?;
        }
        Ok(found.len())
    }

    async fn destroy(&self, collection: &str, criteria: &Record) -> BotResult<usize> {
        let conn = self.conn.lock().await;
        let found = Self::matching(&conn, collection, criteria)?;
        for (record_id, _) in &found {
            conn.execute(
                "DELETE FROM records WHERE record_id = ?1",
                rusqlite::params![record_id],
            )?;
        }
        Ok(found.len())
    }
}
