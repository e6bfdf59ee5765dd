//! Vote handling against the Message Store

use super::tally::{aggregate_votes, selected_labels, Tally};
use super::PollError;
use crate::store::messages::MessageStore;
use crate::transport::traits::{
    merge_vote, InstanceId, MessageContent, MessageKey, MessagePatch, MessageUpdate,
    PollCreation, PollVoteRecord, Transport, VoteContext, WireMessage,
};
use serde::Serialize;
use tracing::{debug, info, warn};

/// `poll.create` payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollCreatePayload {
    pub key: MessageKey,
    pub poll: PollCreation,
    pub results: Tally,
}

/// `poll.update` payload for a decrypted vote
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollUpdatePayload {
    pub poll_creation_message_key: MessageKey,
    pub poll_update_message_key: MessageKey,
    pub voter: String,
    pub selected_options: Vec<String>,
    pub results: Tally,
}

/// `poll.update` payload for vote records delivered by `messages.update`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollUpdatesPayload {
    pub poll_creation_message_key: MessageKey,
    pub poll_updates: Vec<PollVoteRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Tally>,
}

/// Poll handling for one instance's event stream
pub struct PollEngine<'a> {
    instance: &'a InstanceId,
    transport: &'a dyn Transport,
    messages: &'a MessageStore,
}

impl<'a> PollEngine<'a> {
    pub fn new(
        instance: &'a InstanceId,
        transport: &'a dyn Transport,
        messages: &'a MessageStore,
    ) -> Self {
        Self {
            instance,
            transport,
            messages,
        }
    }

    /// `poll.create` payload for a creation message; `None` for anything else.
    pub fn on_creation(&self, message: &WireMessage) -> Option<PollCreatePayload> {
        let MessageContent::PollCreation(poll) = &message.content else {
            return None;
        };
        debug!(instance = %self.instance, poll = %message.key.id, "poll created");
        Some(PollCreatePayload {
            key: message.key.clone(),
            poll: poll.clone(),
            results: aggregate_votes(poll, &message.poll_updates),
        })
    }

    async fn resolve_creation(&self, key: &MessageKey, fallback_conversation: &str) -> Option<WireMessage> {
        let conversation = if key.conversation.is_empty() {
            fallback_conversation
        } else {
            key.conversation.as_str()
        };

        if let Some(found) = self.messages.load_message(conversation, &key.id).await {
            return Some(found);
        }

        match self.transport.fetch_message(key).await {
            Ok(Some(fetched)) => {
                debug!(instance = %self.instance, poll = %key.id, "fetched poll creation on demand");
                let target = fetched.key.conversation.clone();
                self.messages.insert(&target, vec![fetched]).await;
                self.messages.write_logged().await;
                self.messages.load_message(conversation, &key.id).await
            }
            Ok(None) => None,
            Err(e) => {
                warn!(instance = %self.instance, poll = %key.id, error = %e, "poll creation lookup failed");
                None
            }
        }
    }

    /// Decrypt one vote, record it on its creation message and recompute the tally.
    pub async fn on_vote(&self, message: &WireMessage) -> Result<PollUpdatePayload, PollError> {
        let MessageContent::PollUpdate(update) = &message.content else {
            return Err(PollError::NotAVote);
        };
        let creation_key = &update.creation_key;

        let creation = self
            .resolve_creation(creation_key, &message.key.conversation)
            .await
            .ok_or_else(|| PollError::CreationNotFound(creation_key.id.clone()))?;
        let MessageContent::PollCreation(poll) = &creation.content else {
            return Err(PollError::CreationNotFound(creation_key.id.clone()));
        };
        let secret = creation
            .message_secret
            .as_deref()
            .ok_or_else(|| PollError::MissingSecret(creation_key.id.clone()))?;

        let creator = self.transport.key_author(creation_key);
        let voter = self.transport.key_author(&message.key);
        let decrypted = self.transport.decrypt_poll_vote(
            &update.vote,
            &VoteContext {
                poll_message_id: &creation_key.id,
                poll_creator: &creator,
                voter: &voter,
                secret,
            },
        )?;

        let mut votes = creation.poll_updates.clone();
        merge_vote(
            &mut votes,
            PollVoteRecord {
                vote_key: message.key.clone(),
                voter: voter.clone(),
                selected_options: decrypted.selected_options.clone(),
                sender_timestamp_ms: update.sender_timestamp_ms,
            },
        );

        self.messages
            .update_patch(
                &creation.key.conversation,
                &creation.key.id,
                MessagePatch {
                    poll_updates: Some(votes.clone()),
                    ..Default::default()
                },
            )
            .await;
        self.messages.write_logged().await;

        let selected_options = selected_labels(poll, &decrypted.selected_options);
        info!(
            instance = %self.instance,
            poll = %creation_key.id,
            voter = %voter,
            selected = ?selected_options,
            "poll vote decrypted"
        );

        Ok(PollUpdatePayload {
            poll_creation_message_key: creation_key.clone(),
            poll_update_message_key: message.key.clone(),
            voter,
            selected_options,
            results: aggregate_votes(poll, &votes),
        })
    }

    /// Merge vote records carried by a `messages.update` entry.
    ///
    /// Returns `None` when the entry carries no vote records. The tally is
    /// omitted when the creation message is unknown.
    pub async fn on_update(&self, update: &MessageUpdate) -> Option<PollUpdatesPayload> {
        let records = update.update.poll_updates.as_ref().filter(|r| !r.is_empty())?;

        let results = match self.messages.load_message(&update.key.conversation, &update.key.id).await {
            Some(creation) => match &creation.content {
                MessageContent::PollCreation(poll) => {
                    let mut votes = creation.poll_updates.clone();
                    for record in records {
                        merge_vote(&mut votes, record.clone());
                    }
                    self.messages
                        .update_patch(
                            &creation.key.conversation,
                            &creation.key.id,
                            MessagePatch {
                                poll_updates: Some(votes.clone()),
                                ..Default::default()
                            },
                        )
                        .await;
                    self.messages.write_logged().await;
                    Some(aggregate_votes(poll, &votes))
                }
                _ => None,
            },
            None => {
                debug!(instance = %self.instance, poll = %update.key.id, "vote records for unknown poll");
                None
            }
        };

        Some(PollUpdatesPayload {
            poll_creation_message_key: update.key.clone(),
            poll_updates: records.clone(),
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::credentials::CredentialStore;
    use crate::store::document::{DocumentStore, MemoryDocumentStore};
    use crate::transport::mock::MockNetwork;
    use crate::transport::traits::{SessionParams, TransportFactory};
    use crate::transport::vote_crypto::option_hash;
    use std::sync::Arc;

    struct Fixture {
        id: InstanceId,
        network: MockNetwork,
        transport: Arc<dyn Transport>,
        messages: Arc<MessageStore>,
        docs: Arc<dyn DocumentStore>,
    }

    impl Fixture {
        async fn new() -> Self {
            let id = InstanceId::new("acct1");
            let docs: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
            let creds = Arc::new(CredentialStore::load(id.clone(), docs.clone()).await.unwrap());
            let messages = Arc::new(MessageStore::load(id.clone(), docs.clone()).await.unwrap());
            let network = MockNetwork::manual();
            let (transport, _events) = network
                .open(SessionParams {
                    instance: id.clone(),
                    credentials: creds.credentials().await,
                    keys: creds,
                    messages: messages.clone(),
                })
                .await
                .unwrap();
            Self {
                id,
                network,
                transport,
                messages,
                docs,
            }
        }

        fn engine(&self) -> PollEngine<'_> {
            PollEngine::new(&self.id, self.transport.as_ref(), &self.messages)
        }
    }

    fn creation() -> WireMessage {
        MockNetwork::poll_message(MessageKey::new("group@g", "P1"), "Lunch?", &["A", "B"])
    }

    #[tokio::test]
    async fn test_on_creation_reports_empty_tally() {
        let fx = Fixture::new().await;
        let payload = fx.engine().on_creation(&creation()).unwrap();
        assert_eq!(payload.results.count("A"), Some(0));
        assert_eq!(payload.results.count("B"), Some(0));
        assert_eq!(payload.poll.options, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_on_creation_ignores_other_messages() {
        let fx = Fixture::new().await;
        let mut message = creation();
        message.content = MessageContent::Text {
            text: "hi".into(),
            quoted: None,
            mentions: Vec::new(),
        };
        assert!(fx.engine().on_creation(&message).is_none());
    }

    #[tokio::test]
    async fn test_vote_is_decrypted_and_recorded() {
        let fx = Fixture::new().await;
        let poll = creation();
        fx.messages.insert("group@g", vec![poll.clone()]).await;

        let vote = MockNetwork::vote_message(&poll, "group@g", "bob@net", "V1", &["B"], 100).unwrap();
        let payload = fx.engine().on_vote(&vote).await.unwrap();

        assert_eq!(payload.voter, "bob@net");
        assert_eq!(payload.selected_options, vec!["B"]);
        assert_eq!(payload.results.count("B"), Some(1));

        let stored = fx.messages.load_message("group@g", "P1").await.unwrap();
        assert_eq!(stored.poll_updates.len(), 1);
        assert_eq!(stored.poll_updates[0].selected_options, vec![option_hash("B")]);
    }

    #[tokio::test]
    async fn test_replayed_vote_is_idempotent() {
        let fx = Fixture::new().await;
        let poll = creation();
        fx.messages.insert("group@g", vec![poll.clone()]).await;
        let vote = MockNetwork::vote_message(&poll, "group@g", "bob@net", "V1", &["A"], 100).unwrap();

        fx.engine().on_vote(&vote).await.unwrap();
        let payload = fx.engine().on_vote(&vote).await.unwrap();

        assert_eq!(payload.results.count("A"), Some(1));
        let stored = fx.messages.load_message("group@g", "P1").await.unwrap();
        assert_eq!(stored.poll_updates.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_creation_is_fetched_on_demand() {
        let fx = Fixture::new().await;
        let poll = creation();
        fx.network.archive(poll.clone());

        let vote = MockNetwork::vote_message(&poll, "group@g", "bob@net", "V1", &["A"], 1).unwrap();
        let payload = fx.engine().on_vote(&vote).await.unwrap();

        assert_eq!(payload.results.count("A"), Some(1));
        assert!(fx.messages.load_message("group@g", "P1").await.is_some());
        assert!(fx
            .docs
            .find(crate::store::Collection::Messages, "acct1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_unknown_creation_drops_vote() {
        let fx = Fixture::new().await;
        let vote = MockNetwork::vote_message(&creation(), "group@g", "bob@net", "V1", &["A"], 1).unwrap();

        let result = fx.engine().on_vote(&vote).await;
        assert!(matches!(result, Err(PollError::CreationNotFound(id)) if id == "P1"));
    }

    #[tokio::test]
    async fn test_creation_without_secret_is_rejected() {
        let fx = Fixture::new().await;
        let poll = creation();
        let vote = MockNetwork::vote_message(&poll, "group@g", "bob@net", "V1", &["A"], 1).unwrap();
        let mut stripped = poll;
        stripped.message_secret = None;
        fx.messages.insert("group@g", vec![stripped]).await;

        let result = fx.engine().on_vote(&vote).await;
        assert!(matches!(result, Err(PollError::MissingSecret(_))));
    }

    #[tokio::test]
    async fn test_wrong_creator_fails_to_decrypt() {
        let fx = Fixture::new().await;
        let poll = creation();
        fx.messages.insert("group@g", vec![poll.clone()]).await;

        let vote = MockNetwork::vote_message(&poll, "someone-else", "bob@net", "V1", &["A"], 1).unwrap();
        let result = fx.engine().on_vote(&vote).await;
        assert!(matches!(result, Err(PollError::Decrypt(_))));
    }

    #[tokio::test]
    async fn test_text_is_not_a_vote() {
        let fx = Fixture::new().await;
        let mut message = creation();
        message.content = MessageContent::Text {
            text: "hi".into(),
            quoted: None,
            mentions: Vec::new(),
        };
        assert!(matches!(
            fx.engine().on_vote(&message).await,
            Err(PollError::NotAVote)
        ));
    }

    #[tokio::test]
    async fn test_update_records_are_merged() {
        let fx = Fixture::new().await;
        let poll = creation();
        fx.messages.insert("group@g", vec![poll.clone()]).await;
        let vote = MockNetwork::vote_message(&poll, "group@g", "bob@net", "V1", &["A"], 1).unwrap();
        fx.engine().on_vote(&vote).await.unwrap();

        let update = MessageUpdate {
            key: poll.key.clone(),
            update: MessagePatch {
                poll_updates: Some(vec![PollVoteRecord {
                    vote_key: MessageKey::new("group@g", "V2"),
                    voter: "carol@net".to_string(),
                    selected_options: vec![option_hash("A")],
                    sender_timestamp_ms: 2,
                }]),
                ..Default::default()
            },
        };
        let payload = fx.engine().on_update(&update).await.unwrap();

        assert_eq!(payload.results.unwrap().count("A"), Some(2));
    }

    #[tokio::test]
    async fn test_update_for_unknown_poll_has_no_results() {
        let fx = Fixture::new().await;
        let update = MessageUpdate {
            key: MessageKey::new("group@g", "nope"),
            update: MessagePatch {
                poll_updates: Some(vec![PollVoteRecord {
                    vote_key: MessageKey::new("group@g", "V2"),
                    voter: "carol@net".to_string(),
                    selected_options: vec![],
                    sender_timestamp_ms: 2,
                }]),
                ..Default::default()
            },
        };
        let payload = fx.engine().on_update(&update).await.unwrap();
        assert!(payload.results.is_none());

        let plain = MessageUpdate {
            key: MessageKey::new("group@g", "nope"),
            update: MessagePatch::default(),
        };
        assert!(fx.engine().on_update(&plain).await.is_none());
    }
}
