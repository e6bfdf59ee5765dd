//! Per-instance persistence
//!
//! Three document collections keyed by instance id:
//! - `instances`: instance configuration record (callback URL, access key)
//! - `credentials`: identity blob plus key material (Credential Store)
//! - `messages`: chats and per-conversation message history (Message Store)
//!
//! Every write is a full-snapshot upsert of the instance's document.

pub mod credentials;
pub mod document;
pub mod instances;
pub mod messages;

pub use credentials::{CredentialStore, Credentials};
pub use document::{Collection, DocumentStore, MemoryDocumentStore, SqliteDocumentStore};
pub use instances::InstanceRecord;
pub use messages::MessageStore;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt document {collection}/{id}: {reason}")]
    Corrupt {
        collection: &'static str,
        id: String,
        reason: String,
    },
}
