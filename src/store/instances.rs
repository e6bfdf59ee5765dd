//! Persisted instance configuration
//!
//! Written on create/update and read back by `list_instances` and
//! `restore_instances`. Runtime status is never persisted.

use super::document::{Collection, DocumentStore};
use super::{StoreError, StoreResult};
use crate::transport::traits::InstanceId;
use serde::{Deserialize, Serialize};

fn default_poll_events() -> bool {
    true
}

/// Instance configuration record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: InstanceId,
    /// Webhook target; events are dropped when unset
    #[serde(default)]
    pub callback_url: Option<String>,
    /// Key the control surface must present for this instance
    #[serde(default)]
    pub access_key: Option<String>,
    /// Phone number used to request a pairing code
    #[serde(default)]
    pub phone: Option<String>,
    /// Replace raw vote events with synthesized `poll.create`/`poll.update`
    #[serde(default = "default_poll_events")]
    pub poll_events: bool,
}

impl InstanceRecord {
    pub fn new(id: InstanceId) -> Self {
        Self {
            id,
            callback_url: None,
            access_key: None,
            phone: None,
            poll_events: true,
        }
    }

    pub async fn load(docs: &dyn DocumentStore, id: &InstanceId) -> StoreResult<Option<Self>> {
        let Some(value) = docs.find(Collection::Instances, id.as_str()).await? else {
            return Ok(None);
        };
        let record = serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
            collection: Collection::Instances.as_str(),
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(record))
    }

    pub async fn save(&self, docs: &dyn DocumentStore) -> StoreResult<()> {
        let value = serde_json::to_value(self)?;
        docs.upsert(Collection::Instances, self.id.as_str(), value)
            .await
    }

    /// Every persisted record, sorted by id. Unreadable records are skipped.
    pub async fn list(docs: &dyn DocumentStore) -> StoreResult<Vec<Self>> {
        let mut records = Vec::new();
        for id in docs.list_ids(Collection::Instances).await? {
            match Self::load(docs, &InstanceId::new(id.clone())).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!(instance = %id, error = %e, "skipping unreadable instance record"),
            }
        }
        Ok(records)
    }
}
