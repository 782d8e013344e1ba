use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use super::KeyValueStore;

/// SQLite-backed [`KeyValueStore`]. Blocking calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: cannot create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("storage: cannot open database {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    pub fn get_blocking(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(Into::into)
    }

    pub fn set_blocking(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
        let keys = stmt.query_map([], |row| row.get(0))?;
        Ok(keys.collect::<Result<Vec<String>, _>>()?)
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>>> {
        let store = self.clone();
        let key = key.to_string();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || store.get_blocking(&key))
                .await
                .map_err(|err| anyhow!("failed to join storage task: {err}"))?
        })
    }

    fn set(&self, key: &str, value: String) -> BoxFuture<'_, Result<()>> {
        let store = self.clone();
        let key = key.to_string();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || store.set_blocking(&key, &value))
                .await
                .map_err(|err| anyhow!("failed to join storage task: {err}"))?
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/rtu.db");

        let store = SqliteStore::open(&path).unwrap();
        store.set("bookmarks", "[1]".into()).await.unwrap();
        store.set("bookmarks", "[1,2]".into()).await.unwrap();
        drop(store);

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.get("bookmarks").await.unwrap().as_deref(), Some("[1,2]"));
        assert_eq!(reopened.get("missing").await.unwrap(), None);
        assert_eq!(reopened.keys().unwrap(), vec!["bookmarks".to_string()]);
    }
}
