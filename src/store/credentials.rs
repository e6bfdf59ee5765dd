//! Credential Store
//!
//! One record per instance id holding the identity blob and the key material
//! the transport rotates during a session. The record is read once when a
//! session opens and rewritten in full after every change.
//!
//! Persistence failures are logged and never abort the in-memory mutation:
//! the in-memory state stays authoritative until the next successful write.

use super::document::{Collection, DocumentStore};
use super::{StoreError, StoreResult};
use crate::transport::traits::{InstanceId, KeyMap, KeyStore};
use async_trait::async_trait;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Identity credential blob
#[derive(Clone, PartialEq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(with = "crate::webhook::base64_bytes")]
    pub identity_key: Vec<u8>,
    pub registration_id: u32,
    /// Whether pairing with the primary device has completed
    #[serde(default)]
    pub registered: bool,
    /// Own network identity once registered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<String>,
}

impl Credentials {
    /// Fresh, unregistered identity
    pub fn blank() -> Self {
        let mut rng = rand::thread_rng();
        let mut identity_key = vec![0u8; 32];
        rng.fill_bytes(&mut identity_key);
        Self {
            identity_key,
            registration_id: rng.gen_range(1..16380),
            registered: false,
            me: None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identity_key", &"<redacted>")
            .field("registration_id", &self.registration_id)
            .field("registered", &self.registered)
            .field("me", &self.me)
            .finish()
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
struct KeyMaterial(#[serde(with = "crate::webhook::base64_bytes")] Vec<u8>);

#[derive(Clone, Serialize, Deserialize)]
struct CredentialDocument {
    id: InstanceId,
    credentials: Credentials,
    #[serde(default)]
    keys: BTreeMap<String, BTreeMap<String, KeyMaterial>>,
}

/// Per-instance credential store
pub struct CredentialStore {
    instance: InstanceId,
    docs: Arc<dyn DocumentStore>,
    state: RwLock<CredentialDocument>,
    // Serializes snapshot + upsert so an older snapshot never lands last
    write_lock: Mutex<()>,
}

impl CredentialStore {
    /// Load the instance's record, creating a blank identity if none exists.
    pub async fn load(instance: InstanceId, docs: Arc<dyn DocumentStore>) -> StoreResult<Self> {
        let existing = docs.find(Collection::Credentials, instance.as_str()).await?;

        let (document, created) = match existing {
            Some(value) => {
                let document: CredentialDocument =
                    serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
                        collection: Collection::Credentials.as_str(),
                        id: instance.to_string(),
                        reason: e.to_string(),
                    })?;
                (document, false)
            }
            None => (
                CredentialDocument {
                    id: instance.clone(),
                    credentials: Credentials::blank(),
                    keys: BTreeMap::new(),
                },
                true,
            ),
        };

        let store = Self {
            instance,
            docs,
            state: RwLock::new(document),
            write_lock: Mutex::new(()),
        };
        if created {
            debug!(instance = %store.instance, "created blank credentials");
            store.save().await?;
        }
        Ok(store)
    }

    pub async fn credentials(&self) -> Credentials {
        self.state.read().await.credentials.clone()
    }

    /// Write the full record
    pub async fn save(&self) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let document = serde_json::to_value(&*self.state.read().await)?;
        self.docs
            .upsert(Collection::Credentials, self.instance.as_str(), document)
            .await
    }

    async fn save_logged(&self) {
        if let Err(e) = self.save().await {
            warn!(instance = %self.instance, error = %e, "failed to persist credentials");
        }
    }

    /// Replace the identity blob (`creds.update`)
    pub async fn update_credentials(&self, credentials: Credentials) {
        self.state.write().await.credentials = credentials;
        self.save_logged().await;
    }

    /// Discard identity and keys, starting over from a blank identity
    pub async fn reset(&self) {
        {
            let mut state = self.state.write().await;
            state.credentials = Credentials::blank();
            state.keys.clear();
        }
        self.save_logged().await;
    }

    /// Number of stored key ids across all categories
    pub async fn key_count(&self) -> usize {
        self.state.read().await.keys.values().map(BTreeMap::len).sum()
    }
}

#[async_trait]
impl KeyStore for CredentialStore {
    async fn get_keys(&self, category: &str, ids: &[String]) -> HashMap<String, Option<Vec<u8>>> {
        let state = self.state.read().await;
        let keys = state.keys.get(category);
        ids.iter()
            .map(|id| {
                let material = keys.and_then(|k| k.get(id)).map(|m| m.0.clone());
                (id.clone(), material)
            })
            .collect()
    }

    async fn set_keys(&self, data: KeyMap) {
        {
            let mut state = self.state.write().await;
            for (category, entries) in data {
                let keys = state.keys.entry(category.clone()).or_default();
                for (id, material) in entries {
                    match material {
                        Some(bytes) => {
                            keys.insert(id, KeyMaterial(bytes));
                        }
                        None => {
                            keys.remove(&id);
                        }
                    }
                }
                if keys.is_empty() {
                    state.keys.remove(&category);
                }
            }
        }
        self.save_logged().await;
    }
}
