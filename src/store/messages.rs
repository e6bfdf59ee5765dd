//! Message Store
//!
//! Per-instance chat list and per-conversation message history. Messages are
//! unique by (conversation, id) and are never removed individually; the whole
//! document goes away only when the instance is deleted.
//!
//! Mutations are in-memory; callers persist a batch with [`MessageStore::write`],
//! which upserts a full snapshot.

use super::document::{Collection, DocumentStore};
use super::{StoreError, StoreResult};
use crate::transport::traits::{
    merge_vote, Chat, InstanceId, MessageContent, MessageKey, MessageLookup, MessagePatch,
    WireMessage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

#[derive(Clone, Serialize, Deserialize)]
struct MessageDocument {
    id: InstanceId,
    #[serde(default)]
    conversations: Vec<Chat>,
    #[serde(default)]
    messages: BTreeMap<String, Vec<WireMessage>>,
}

/// Per-instance message cache
pub struct MessageStore {
    instance: InstanceId,
    docs: Arc<dyn DocumentStore>,
    state: RwLock<MessageDocument>,
    // Serializes snapshot + upsert so an older snapshot never lands last
    write_lock: Mutex<()>,
}

impl MessageStore {
    pub async fn load(instance: InstanceId, docs: Arc<dyn DocumentStore>) -> StoreResult<Self> {
        let document = match docs.find(Collection::Messages, instance.as_str()).await? {
            Some(value) => serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
                collection: Collection::Messages.as_str(),
                id: instance.to_string(),
                reason: e.to_string(),
            })?,
            None => MessageDocument {
                id: instance.clone(),
                conversations: Vec::new(),
                messages: BTreeMap::new(),
            },
        };

        Ok(Self {
            instance,
            docs,
            state: RwLock::new(document),
            write_lock: Mutex::new(()),
        })
    }

    /// Append messages to a conversation in arrival order.
    ///
    /// A message whose id is already present in the conversation replaces the
    /// stored copy at its original position. Votes recorded on the stored copy
    /// are kept, as are its secret and status when the new copy lacks them.
    pub async fn insert(&self, conversation: &str, messages: Vec<WireMessage>) {
        let mut state = self.state.write().await;
        let entries = state.messages.entry(conversation.to_string()).or_default();
        for message in messages {
            match entries.iter_mut().find(|m| m.key.id == message.key.id) {
                Some(existing) => redeliver(existing, message),
                None => entries.push(message),
            }
        }
    }

    /// Look a message up in `conversation`, falling back to every conversation.
    pub async fn load_message(&self, conversation: &str, id: &str) -> Option<WireMessage> {
        let state = self.state.read().await;
        if let Some(found) = state
            .messages
            .get(conversation)
            .and_then(|entries| entries.iter().find(|m| m.key.id == id))
        {
            return Some(found.clone());
        }

        // O(total messages); only hit when the conversation id is not the right one
        state
            .messages
            .values()
            .flat_map(|entries| entries.iter())
            .find(|m| m.key.id == id)
            .cloned()
    }

    /// Merge `patch` into an existing message. Returns false when absent.
    pub async fn update_patch(&self, conversation: &str, id: &str, patch: MessagePatch) -> bool {
        let mut state = self.state.write().await;
        let Some(message) = state
            .messages
            .get_mut(conversation)
            .and_then(|entries| entries.iter_mut().find(|m| m.key.id == id))
        else {
            return false;
        };

        if let Some(status) = patch.status {
            message.status = Some(status);
        }
        if let Some(content) = patch.content {
            message.content = content;
        }
        if let Some(poll_updates) = patch.poll_updates {
            message.poll_updates = poll_updates;
        }
        true
    }

    /// Insert or replace chat metadata by chat id
    pub async fn upsert_chats(&self, chats: Vec<Chat>) {
        let mut state = self.state.write().await;
        for chat in chats {
            match state.conversations.iter_mut().find(|c| c.id == chat.id) {
                Some(existing) => *existing = chat,
                None => state.conversations.push(chat),
            }
        }
    }

    pub async fn chats(&self) -> Vec<Chat> {
        self.state.read().await.conversations.clone()
    }

    pub async fn conversation(&self, conversation: &str) -> Vec<WireMessage> {
        self.state
            .read()
            .await
            .messages
            .get(conversation)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.values().map(Vec::len).sum()
    }

    /// Persist a full snapshot
    pub async fn write(&self) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let (document, chats, total) = {
            let state = self.state.read().await;
            let total: usize = state.messages.values().map(Vec::len).sum();
            (serde_json::to_value(&*state)?, state.conversations.len(), total)
        };
        self.docs
            .upsert(Collection::Messages, self.instance.as_str(), document)
            .await?;
        debug!(instance = %self.instance, chats, messages = total, "saved message store");
        Ok(())
    }

    /// Persist a snapshot, logging instead of failing
    pub async fn write_logged(&self) {
        if let Err(e) = self.write().await {
            warn!(instance = %self.instance, error = %e, "failed to persist message store");
        }
    }
}

fn redeliver(existing: &mut WireMessage, incoming: WireMessage) {
    let mut votes = std::mem::take(&mut existing.poll_updates);
    let secret = existing.message_secret.take();
    let status = existing.status;

    *existing = incoming;
    for record in std::mem::take(&mut existing.poll_updates) {
        merge_vote(&mut votes, record);
    }
    existing.poll_updates = votes;
    if existing.message_secret.is_none() {
        existing.message_secret = secret;
    }
    if existing.status.is_none() {
        existing.status = status;
    }
}

#[async_trait]
impl MessageLookup for MessageStore {
    async fn get_message(&self, key: &MessageKey) -> Option<MessageContent> {
        self.load_message(&key.conversation, &key.id)
            .await
            .map(|m| m.content)
    }
}
