//! Local document server
//!
//! A set of named databases persisted in a single SQLite file. Every database
//! keeps its own sequence of changes and a broadcast feed of change events.

use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::database::{ChangeEvent, Database};
use crate::error::{StoreError, StoreResult};

/// Capacity of each database's change feed
const CHANGE_FEED_CAPACITY: usize = 256;

pub(crate) struct ServerInner {
    pub(crate) conn: Mutex<Connection>,
    feeds: DashMap<String, broadcast::Sender<ChangeEvent>>,
    path: Option<PathBuf>,
}

impl ServerInner {
    pub(crate) fn subscribe(&self, database: &str) -> broadcast::Receiver<ChangeEvent> {
        self.feeds
            .entry(database.to_string())
            .or_insert_with(|| broadcast::channel(CHANGE_FEED_CAPACITY).0)
            .subscribe()
    }

    pub(crate) fn notify(&self, event: ChangeEvent) {
        if let Some(tx) = self.feeds.get(&event.database) {
            let _ = tx.send(event);
        }
    }
}

/// Handle to a local server; cheap to clone
#[derive(Clone)]
pub struct LocalServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for LocalServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalServer")
            .field("path", &self.inner.path)
            .finish()
    }
}

impl LocalServer {
    /// Open or create a server at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, Some(path.to_path_buf()))
    }

    /// Open a server that lives only as long as this handle
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> StoreResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                conn: Mutex::new(conn),
                feeds: DashMap::new(),
                path,
            }),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Create a database if it doesn't exist yet and return a handle to it
    pub fn create_database(&self, name: &str) -> StoreResult<Database> {
        validate_database_name(name)?;
        let now = chrono::Utc::now().timestamp_millis();
        self.inner.conn.lock().execute(
            "INSERT OR IGNORE INTO databases (name, created_at) VALUES (?1, ?2)",
            params![name, now],
        )?;
        Ok(Database::new(name.to_string(), self.inner.clone()))
    }

    /// Handle to an existing database
    pub fn database(&self, name: &str) -> StoreResult<Database> {
        if !self.database_exists(name)? {
            return Err(StoreError::DatabaseNotFound(name.to_string()));
        }
        Ok(Database::new(name.to_string(), self.inner.clone()))
    }

    /// Whether `database` is a handle on this server
    pub fn owns(&self, database: &Database) -> bool {
        database.is_on(&self.inner)
    }

    pub fn database_exists(&self, name: &str) -> StoreResult<bool> {
        let found = self
            .inner
            .conn
            .lock()
            .query_row(
                "SELECT 1 FROM databases WHERE name = ?1",
                params![name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn list_databases(&self) -> StoreResult<Vec<String>> {
        let conn = self.inner.conn.lock();
        let mut stmt = conn.prepare("SELECT name FROM databases ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Delete a database and all of its documents
    pub fn delete_database(&self, name: &str) -> StoreResult<()> {
        let conn = self.inner.conn.lock();
        let removed = conn.execute("DELETE FROM databases WHERE name = ?1", params![name])?;
        if removed == 0 {
            return Err(StoreError::DatabaseNotFound(name.to_string()));
        }
        conn.execute("DELETE FROM documents WHERE database = ?1", params![name])?;
        drop(conn);
        self.inner.feeds.remove(name);
        tracing::debug!("Deleted local database '{}'", name);
        Ok(())
    }
}

impl LocalServer {
    /// Set a device-local value
    pub fn set_metadata(&self, key: &str, value: &str) -> StoreResult<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.inner.conn.lock().execute(
            "INSERT OR REPLACE INTO metadata (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now],
        )?;
        Ok(())
    }

    /// Get a device-local value
    pub fn get_metadata(&self, key: &str) -> StoreResult<Option<String>> {
        let value = self
            .inner
            .conn
            .lock()
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}

/// Names start with a lowercase letter, followed by lowercase letters,
/// digits, `_` or `-`.
pub fn validate_database_name(name: &str) -> StoreResult<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidDatabaseName(name.to_string()))
    }
}

fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS databases (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS documents (
            database TEXT NOT NULL,
            id TEXT NOT NULL,
            rev TEXT NOT NULL,
            data TEXT NOT NULL,
            seq INTEGER NOT NULL,
            is_deleted BOOLEAN NOT NULL DEFAULT 0,
            modified_at INTEGER NOT NULL,
            PRIMARY KEY(database, id)
        )",
        [],
    )?;

    // Device-local settings that never replicate
    conn.execute(
        "CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_docs_seq ON documents(database, seq)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_database_lifecycle() {
        let server = LocalServer::open_in_memory().unwrap();
        assert!(!server.database_exists("inbox").unwrap());
        assert!(matches!(
            server.database("inbox"),
            Err(StoreError::DatabaseNotFound(_))
        ));

        server.create_database("inbox").unwrap();
        server.create_database("inbox").unwrap();
        server.create_database("archive").unwrap();
        assert_eq!(server.list_databases().unwrap(), vec!["archive", "inbox"]);

        server.delete_database("inbox").unwrap();
        assert!(!server.database_exists("inbox").unwrap());
        assert!(server.delete_database("inbox").is_err());
    }

    #[test]
    fn test_owns_only_its_databases() {
        let server = LocalServer::open_in_memory().unwrap();
        let other = LocalServer::open_in_memory().unwrap();

        let mine = server.create_database("notes").unwrap();
        let theirs = other.create_database("notes").unwrap();
        assert!(server.owns(&mine));
        assert!(server.clone().owns(&mine));
        assert!(!server.owns(&theirs));
        assert_ne!(mine, theirs);
    }

    #[test]
    fn test_metadata() {
        let server = LocalServer::open_in_memory().unwrap();
        assert!(server.get_metadata("session_id").unwrap().is_none());
        server.set_metadata("session_id", "abc").unwrap();
        server.set_metadata("session_id", "def").unwrap();
        assert_eq!(server.get_metadata("session_id").unwrap().as_deref(), Some("def"));
    }

    #[test]
    fn test_database_name_validation() {
        assert!(validate_database_name("sp_control").is_ok());
        assert!(validate_database_name("channel-0f3a").is_ok());
        assert!(validate_database_name("").is_err());
        assert!(validate_database_name("Inbox").is_err());
        assert!(validate_database_name("1db").is_err());
        assert!(validate_database_name("a b").is_err());
    }

    #[test]
    fn test_documents_persist_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("syncpoint.db");

        let saved = {
            let server = LocalServer::open(&path).unwrap();
            let db = server.create_database("notes").unwrap();
            db.save(&crate::storage::Document::new(json!({"title": "hello"})))
                .unwrap()
        };

        let server = LocalServer::open(&path).unwrap();
        assert_eq!(server.path(), Some(path.as_path()));
        let db = server.database("notes").unwrap();
        let loaded = db.get(&saved.id).unwrap().unwrap();
        assert_eq!(loaded.rev, saved.rev);
        assert_eq!(loaded.get_str("title"), Some("hello"));
    }
}
