//! Local document sinks: SQLite and in-memory.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::sync::{Arc, Mutex};

use super::{new_document_id, DocumentSink};

/// A document as held by a local sink.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredDocument {
    pub collection: String,
    pub id: String,
    pub record: Value,
}

/// SQLite-backed sink for deployments without a remote store.
pub struct SqliteDocumentSink {
    conn: Mutex<Connection>,
}

impl SqliteDocumentSink {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let sink = Self {
            conn: Mutex::new(conn),
        };
        sink.ensure_schema()?;
        Ok(sink)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS documents (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              collection TEXT NOT NULL,
              doc_id TEXT NOT NULL UNIQUE,
              created_at INTEGER NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection, id);
            "#,
        )?;
        Ok(())
    }

    /// Documents in `collection`, oldest first.
    #[cfg(test)]
    fn read_collection(&self, collection: &str, limit: usize) -> Result<Vec<StoredDocument>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT doc_id, payload_json FROM documents WHERE collection = ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![collection, limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let payload: String = row.get(1)?;
            out.push(StoredDocument {
                collection: collection.to_string(),
                id,
                record: serde_json::from_str(&payload)?,
            });
        }
        Ok(out)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite sink lock poisoned"))
    }
}

impl DocumentSink for SqliteDocumentSink {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn insert(&self, collection: &str, record: &Value) -> Result<String> {
        let doc_id = new_document_id();
        let payload_json = serde_json::to_string(record)?;
        let created_at = crate::now_utc().timestamp();
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO documents(collection, doc_id, created_at, payload_json)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![collection, doc_id, created_at, payload_json],
        )?;
        Ok(doc_id)
    }
}

/// In-memory sink. Clones share the same storage.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDocumentSink {
    documents: Arc<Mutex<Vec<StoredDocument>>>,
}

impl InMemoryDocumentSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents(&self) -> Vec<StoredDocument> {
        self.documents
            .lock()
            .map(|docs| docs.clone())
            .unwrap_or_default()
    }

    pub fn in_collection(&self, collection: &str) -> Vec<StoredDocument> {
        self.documents()
            .into_iter()
            .filter(|doc| doc.collection == collection)
            .collect()
    }
}

impl DocumentSink for InMemoryDocumentSink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn insert(&self, collection: &str, record: &Value) -> Result<String> {
        let id = new_document_id();
        self.documents
            .lock()
            .map_err(|_| anyhow!("memory sink lock poisoned"))?
            .push(StoredDocument {
                collection: collection.to_string(),
                id: id.clone(),
                record: record.clone(),
            });
        Ok(id)
    }
}
