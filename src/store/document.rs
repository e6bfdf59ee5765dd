//! Document backend
//!
//! The stores only need key-value read/write/upsert semantics per instance id.
//! `SqliteDocumentStore` keeps every document as a JSON body in a single
//! `documents` table; `MemoryDocumentStore` backs tests and offline runs.

use super::{StoreError, StoreResult};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Document collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Instances,
    Credentials,
    Messages,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::Instances,
        Collection::Credentials,
        Collection::Messages,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Instances => "instances",
            Collection::Credentials => "credentials",
            Collection::Messages => "messages",
        }
    }
}

/// Key-value document persistence
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find(&self, collection: Collection, id: &str) -> StoreResult<Option<Value>>;

    /// Insert or replace the whole document
    async fn upsert(&self, collection: Collection, id: &str, document: Value) -> StoreResult<()>;

    /// Returns whether a document existed
    async fn delete(&self, collection: Collection, id: &str) -> StoreResult<bool>;

    /// Ids present in a collection, sorted
    async fn list_ids(&self, collection: Collection) -> StoreResult<Vec<String>>;
}

/// In-memory backend
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<(Collection, String), Value>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find(&self, collection: Collection, id: &str) -> StoreResult<Option<Value>> {
        let documents = self.documents.read().await;
        Ok(documents.get(&(collection, id.to_string())).cloned())
    }

    async fn upsert(&self, collection: Collection, id: &str, document: Value) -> StoreResult<()> {
        let mut documents = self.documents.write().await;
        documents.insert((collection, id.to_string()), document);
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> StoreResult<bool> {
        let mut documents = self.documents.write().await;
        Ok(documents.remove(&(collection, id.to_string())).is_some())
    }

    async fn list_ids(&self, collection: Collection) -> StoreResult<Vec<String>> {
        let documents = self.documents.read().await;
        let mut ids: Vec<String> = documents
            .keys()
            .filter(|(c, _)| *c == collection)
            .map(|(_, id)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    body TEXT NOT NULL,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (collection, id)
)";

#[derive(sqlx::FromRow)]
struct DocumentRow {
    body: String,
}

/// SQLite backend
#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    /// Open or create the database file
    pub async fn open(path: &Path) -> StoreResult<Self> {
        info!(path = %path.display(), "opening document database");

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub async fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory document database");

        // Each connection to :memory: is a separate database
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn find(&self, collection: Collection, id: &str) -> StoreResult<Option<Value>> {
        let row: Option<DocumentRow> =
            sqlx::query_as("SELECT body FROM documents WHERE collection = ? AND id = ?")
                .bind(collection.as_str())
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(row) => {
                let value = serde_json::from_str(&row.body).map_err(|e| StoreError::Corrupt {
                    collection: collection.as_str(),
                    id: id.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn upsert(&self, collection: Collection, id: &str, document: Value) -> StoreResult<()> {
        let body = serde_json::to_string(&document)?;
        sqlx::query(
            "INSERT INTO documents (collection, id, body) VALUES (?, ?, ?)
             ON CONFLICT (collection, id)
             DO UPDATE SET body = excluded.body, updated_at = strftime('%s', 'now')",
        )
        .bind(collection.as_str())
        .bind(id)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(collection.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_ids(&self, collection: Collection) -> StoreResult<Vec<String>> {
        let ids: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM documents WHERE collection = ? ORDER BY id")
                .bind(collection.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}
