use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

use crate::RecordStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// SQLite-backed key-value store. One row per key, JSON payload.
#[derive(Clone)]
pub struct SqliteRecordStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite db {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare("SELECT key FROM records ORDER BY key")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row?);
            }
            Ok::<Vec<String>, anyhow::Error>(keys)
        })
        .await?
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let db = Arc::clone(&self.db);
        let key = key.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let value = conn
                .query_row(
                    "SELECT value FROM records WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok::<Option<String>, anyhow::Error>(value)
        })
        .await?
    }

    async fn put_raw(&self, key: &str, value: String) -> Result<()> {
        let db = Arc::clone(&self.db);
        let key = key.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(
                r#"
                INSERT INTO records (key, value, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
                params![key, value, Utc::now().to_rfc3339()],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;

        Ok(())
    }
}
