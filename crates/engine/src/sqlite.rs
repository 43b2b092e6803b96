use crate::clock::now_ms;
use crate::store::{KvStore, StoreError};
use anyhow::Context;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Durable [`KvStore`] backed by a SQLite file. Every mutation is recorded in
/// `event_log` so `history` can show what the client did to local state.
/// Clones share one lazily opened connection.
#[derive(Debug, Clone)]
pub struct SqliteKv {
    db_path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteKv {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            conn: Arc::default(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn open(&self) -> anyhow::Result<Connection> {
        let path = self.db_path.clone();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create db dir: {}", dir.display()))?;
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open sqlite db: {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        migrate(&conn)?;
        Ok(conn)
    }

    /// Most recent audit entries, newest first.
    pub fn history(&self, limit: usize) -> anyhow::Result<Vec<StoreEvent>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT seq, ts_ms, kind, key FROM event_log ORDER BY seq DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map([limit], |row| {
            Ok(StoreEvent {
                seq: row.get(0)?,
                ts_ms: row.get(1)?,
                kind: row.get(2)?,
                key: row.get(3)?,
            })
        })?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    /// Runs `f` on the shared connection, opening it on first use. A failed
    /// open is retried on the next call.
    fn with_conn<R>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut slot = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.open()?,
        };
        let result = f(&mut conn);
        *slot = Some(conn);
        result
    }
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            let value = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
                .optional()?;
            Ok(value)
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO kv (key, value, updated_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at_ms = excluded.updated_at_ms",
                (key, value, now_ms()),
            )?;
            append_event_tx(&tx, "kv.set", key)?;
            tx.commit()?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let n = tx.execute("DELETE FROM kv WHERE key = ?1", [key])?;
            if n > 0 {
                append_event_tx(&tx, "kv.deleted", key)?;
            }
            tx.commit()?;
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEvent {
    pub seq: i64,
    pub ts_ms: i64,
    pub kind: String,
    pub key: String,
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    let v: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if v < 1 {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS kv (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS event_log (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  ts_ms INTEGER NOT NULL,
  kind TEXT NOT NULL,
  key TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_event_log_ts ON event_log(ts_ms);
"#,
        )?;

        conn.pragma_update(None, "user_version", 1_i64)?;
    }

    Ok(())
}

fn append_event_tx(tx: &rusqlite::Transaction<'_>, kind: &str, key: &str) -> rusqlite::Result<i64> {
    tx.execute(
        "INSERT INTO event_log (ts_ms, kind, key) VALUES (?1, ?2, ?3)",
        (now_ms(), kind, key),
    )?;
    Ok(tx.last_insert_rowid())
}
