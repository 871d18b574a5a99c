//! Durable key/value medium behind the persistent cache tier.
//! Blobs are opaque strings (the cache writes JSON). Implementations:
//! SQLite for real deployments, an in-process map for tests and hosts
//! without a disk.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// The backing medium cannot be reached. For stores implemented
    /// outside this crate.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Fetch the blobs stored under `keys`; absent keys are omitted.
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, String>, StoreError>;

    async fn set(&self, entries: HashMap<String, String>) -> Result<(), StoreError>;

    async fn remove(&self, keys: &[String]) -> Result<(), StoreError>;
}

/// SQLite-backed store. Every call runs on the blocking pool.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;

        // WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self::init(conn)?;

        info!(path = %db_path.display(), "SQLite cache store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                blob TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&mut conn.lock())).await?
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, String>, StoreError> {
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached("SELECT blob FROM kv_store WHERE key = ?1")?;
            let mut out = HashMap::with_capacity(keys.len());
            for key in keys {
                let blob: Option<String> = stmt.query_row(params![key], |row| row.get(0)).optional()?;
                if let Some(blob) = blob {
                    out.insert(key, blob);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn set(&self, entries: HashMap<String, String>) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO kv_store (key, blob, updated_at) VALUES (?1, ?2, ?3)",
                )?;
                let now = crate::now_ms();
                for (key, blob) in &entries {
                    stmt.execute(params![key, blob, now])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, keys: &[String]) -> Result<(), StoreError> {
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached("DELETE FROM kv_store WHERE key = ?1")?;
            for key in &keys {
                stmt.execute(params![key])?;
            }
            Ok(())
        })
        .await
    }
}

/// Process-local store; contents vanish with the process.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, String>, StoreError> {
        let blobs = self.blobs.lock();
        Ok(keys
            .iter()
            .filter_map(|k| blobs.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    async fn set(&self, entries: HashMap<String, String>) -> Result<(), StoreError> {
        self.blobs.lock().extend(entries);
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut blobs = self.blobs.lock();
        for key in keys {
            blobs.remove(key);
        }
        Ok(())
    }
}
