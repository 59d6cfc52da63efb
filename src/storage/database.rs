use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::document::{next_revision, revision_wins, Document};
use super::server::ServerInner;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// Emitted on a database's change feed after every successful write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub type_: ChangeType,
    pub database: String,
    pub seq: u64,
    pub id: String,
    pub rev: String,
    /// The document as written (tombstone for deletes)
    pub document: Document,
}

impl ChangeEvent {
    pub fn is_delete(&self) -> bool {
        self.type_ == ChangeType::Delete
    }
}

/// Handle to a named database on a [`super::LocalServer`]
#[derive(Clone)]
pub struct Database {
    /// Database name
    pub name: String,
    server: Arc<ServerInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("name", &self.name).finish()
    }
}

impl PartialEq for Database {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && Arc::ptr_eq(&self.server, &other.server)
    }
}

impl Database {
    pub(crate) fn new(name: String, server: Arc<ServerInner>) -> Self {
        Self { name, server }
    }

    pub(crate) fn is_on(&self, server: &Arc<ServerInner>) -> bool {
        Arc::ptr_eq(&self.server, server)
    }

    /// Get a live (non-deleted) document by id
    pub fn get(&self, id: &str) -> StoreResult<Option<Document>> {
        let conn = self.server.conn.lock();
        let doc = read_row(&conn, &self.name, id)?
            .map(|(doc, _)| doc)
            .filter(|doc| !doc.deleted);
        Ok(doc)
    }

    /// All live documents, ordered by id
    pub fn all_documents(&self) -> StoreResult<Vec<Document>> {
        let conn = self.server.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT data FROM documents
             WHERE database = ?1 AND is_deleted = 0
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![self.name], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(StoreError::from))
            .collect()
    }

    /// Live documents whose `type` field equals `doc_type`, ordered by id
    pub fn documents_of_type(&self, doc_type: &str) -> StoreResult<Vec<Document>> {
        let conn = self.server.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT data FROM documents
             WHERE database = ?1 AND is_deleted = 0 AND json_extract(data, '$.type') = ?2
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![self.name, doc_type], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(StoreError::from))
            .collect()
    }

    /// Save a document. The document's revision must match the stored one
    /// (or be `None` for a new or previously deleted document); the returned
    /// copy carries the new revision.
    pub fn save(&self, doc: &Document) -> StoreResult<Document> {
        self.write_local(doc, false)
    }

    /// Replace a document with a tombstone
    pub fn delete(&self, doc: &Document) -> StoreResult<Document> {
        self.write_local(doc, true)
    }

    fn write_local(&self, doc: &Document, delete: bool) -> StoreResult<Document> {
        let conn = self.server.conn.lock();
        let current = read_row(&conn, &self.name, &doc.id)?;

        let current_rev = match (&current, doc.rev.as_deref()) {
            (None, None) => None,
            (Some((stored, _)), Some(given)) if stored.rev.as_deref() == Some(given) => {
                stored.rev.clone()
            }
            (Some((stored, _)), None) if stored.deleted && !delete => stored.rev.clone(),
            _ => return Err(StoreError::Conflict(doc.id.clone())),
        };

        let mut written = if delete {
            Document::with_id(doc.id.clone(), serde_json::Value::Null)
        } else {
            doc.clone()
        };
        written.rev = Some(next_revision(current_rev.as_deref()));
        written.deleted = delete;
        written.updated_at = chrono::Utc::now();

        let seq = write_row(&conn, &self.name, &written)?;
        drop(conn);

        let type_ = match (&current, delete) {
            (_, true) => ChangeType::Delete,
            (Some((stored, _)), false) if !stored.deleted => ChangeType::Update,
            _ => ChangeType::Insert,
        };
        self.emit(type_, seq, &written);
        Ok(written)
    }

    /// Store a revision received from a replica. The revision is kept as-is
    /// and only applied if it wins over the stored one; returns whether it
    /// was applied.
    pub fn put_replicated(&self, doc: &Document) -> StoreResult<bool> {
        let rev = doc
            .rev
            .as_deref()
            .ok_or_else(|| StoreError::InvalidDocument(format!("'{}' has no revision", doc.id)))?;

        let conn = self.server.conn.lock();
        let current = read_row(&conn, &self.name, &doc.id)?;
        if let Some((stored, _)) = &current {
            let stored_rev = stored.rev.as_deref().unwrap_or_default();
            if !revision_wins(rev, stored_rev) {
                return Ok(false);
            }
        }

        let seq = write_row(&conn, &self.name, doc)?;
        drop(conn);

        let type_ = match &current {
            _ if doc.deleted => ChangeType::Delete,
            Some((stored, _)) if !stored.deleted => ChangeType::Update,
            _ => ChangeType::Insert,
        };
        self.emit(type_, seq, doc);
        Ok(true)
    }

    /// Changes (latest revision of each document, tombstones included) with
    /// a sequence greater than `since`, in sequence order.
    pub fn changes_since(&self, since: u64, limit: usize) -> StoreResult<Vec<(u64, Document)>> {
        let conn = self.server.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, data FROM documents
             WHERE database = ?1 AND seq > ?2
             ORDER BY seq
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![self.name, since as i64, limit as i64], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(seq, data)| Ok((seq, serde_json::from_str(&data)?)))
            .collect()
    }

    /// Highest sequence number written to this database
    pub fn update_seq(&self) -> StoreResult<u64> {
        let conn = self.server.conn.lock();
        Ok(current_seq(&conn, &self.name)?)
    }

    /// Subscribe to this database's change feed
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.server.subscribe(&self.name)
    }

    fn emit(&self, type_: ChangeType, seq: u64, doc: &Document) {
        self.server.notify(ChangeEvent {
            type_,
            database: self.name.clone(),
            seq,
            id: doc.id.clone(),
            rev: doc.rev.clone().unwrap_or_default(),
            document: doc.clone(),
        });
    }
}

fn read_row(conn: &Connection, database: &str, id: &str) -> StoreResult<Option<(Document, u64)>> {
    let row = conn
        .query_row(
            "SELECT data, seq FROM documents WHERE database = ?1 AND id = ?2",
            params![database, id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)),
        )
        .optional()?;
    match row {
        Some((data, seq)) => Ok(Some((serde_json::from_str(&data)?, seq))),
        None => Ok(None),
    }
}

fn current_seq(conn: &Connection, database: &str) -> rusqlite::Result<u64> {
    let seq: i64 = conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) FROM documents WHERE database = ?1",
        params![database],
        |row| row.get(0),
    )?;
    Ok(seq as u64)
}

fn write_row(conn: &Connection, database: &str, doc: &Document) -> StoreResult<u64> {
    let seq = current_seq(conn, database)? + 1;
    let data = serde_json::to_string(doc)?;
    conn.execute(
        "INSERT INTO documents (database, id, rev, data, seq, is_deleted, modified_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(database, id) DO UPDATE SET
         rev = excluded.rev,
         data = excluded.data,
         seq = excluded.seq,
         is_deleted = excluded.is_deleted,
         modified_at = excluded.modified_at",
        params![
            database,
            doc.id,
            doc.rev.as_deref().unwrap_or_default(),
            data,
            seq as i64,
            doc.deleted,
            doc.updated_at.timestamp_millis()
        ],
    )?;
    Ok(seq)
}
