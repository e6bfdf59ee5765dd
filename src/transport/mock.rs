//! In-process mock network
//!
//! Implements `TransportFactory`/`Transport` without a real protocol library.
//! Used by the test suite and by the binary's offline mode. Every handle the
//! factory opens is tracked so tests can observe how many sessions are live
//! for an instance and push events into all of them.

use super::events::{EventSender, EventStream};
use super::traits::*;
use super::vote_crypto;
use crate::store::credentials::Credentials;
use async_trait::async_trait;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Mock network: the `TransportFactory` handed to the session manager
#[derive(Clone)]
pub struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
    auto_connect: bool,
}

#[derive(Default)]
struct NetworkState {
    handles: HashMap<InstanceId, Vec<Arc<HandleInner>>>,
    archive: Vec<WireMessage>,
    sent: Vec<(InstanceId, WireMessage)>,
    opened: HashMap<InstanceId, u32>,
    logged_out: Vec<InstanceId>,
    failing_pairing_requests: u32,
    failing_opens: HashMap<InstanceId, u32>,
    next_handle: u64,
}

struct HandleInner {
    handle: u64,
    instance: InstanceId,
    sender: EventSender,
    closed: AtomicBool,
    credentials: Mutex<Credentials>,
}

impl HandleInner {
    fn is_live(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.sender.is_attached()
    }

    fn credentials(&self) -> MutexGuard<'_, Credentials> {
        self.credentials.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn next_message_id() -> String {
    format!("MOCK{:012X}", NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNetwork {
    /// Network that reports `open` for registered sessions and a pairing
    /// code for unregistered ones as soon as a session is opened.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState::default())),
            auto_connect: true,
        }
    }

    /// Network that emits nothing on its own; tests drive every event.
    pub fn manual() -> Self {
        Self {
            auto_connect: false,
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver an event to every live handle of `instance`.
    ///
    /// Returns the number of handles that received it.
    pub fn emit(&self, instance: &InstanceId, event: TransportEvent) -> usize {
        let handles = self.live(instance);
        handles
            .iter()
            .filter(|h| h.sender.emit(event.clone()))
            .count()
    }

    /// Finish pairing: registers the identity and reports `open`.
    pub fn complete_pairing(&self, instance: &InstanceId) -> usize {
        let me = format!("{}@mock.net", instance);
        let handles = self.live(instance);
        for handle in &handles {
            let creds = {
                let mut creds = handle.credentials();
                creds.registered = true;
                creds.me = Some(me.clone());
                creds.clone()
            };
            handle.sender.emit(TransportEvent::CredsUpdate(creds));
            handle
                .sender
                .emit(TransportEvent::ConnectionUpdate(ConnectionUpdate::open()));
        }
        handles.len()
    }

    /// Handles that are neither closed nor detached from their listener
    pub fn live_handles(&self, instance: &InstanceId) -> usize {
        self.live(instance).len()
    }

    fn live(&self, instance: &InstanceId) -> Vec<Arc<HandleInner>> {
        self.lock()
            .handles
            .get(instance)
            .map(|hs| hs.iter().filter(|h| h.is_live()).cloned().collect())
            .unwrap_or_default()
    }

    /// Number of sessions ever opened for `instance`
    pub fn open_count(&self, instance: &InstanceId) -> u32 {
        self.lock().opened.get(instance).copied().unwrap_or(0)
    }

    pub fn was_logged_out(&self, instance: &InstanceId) -> bool {
        self.lock().logged_out.contains(instance)
    }

    /// Messages sent through any handle of `instance`
    pub fn sent_messages(&self, instance: &InstanceId) -> Vec<WireMessage> {
        self.lock()
            .sent
            .iter()
            .filter(|(id, _)| id == instance)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Make a message fetchable from the network without delivering it.
    pub fn archive(&self, message: WireMessage) {
        self.lock().archive.push(message);
    }

    /// The next `count` pairing-code requests fail with a network error.
    pub fn fail_pairing_requests(&self, count: u32) {
        self.lock().failing_pairing_requests = count;
    }

    /// The next `count` opens for `instance` fail with a network error.
    pub fn fail_opens(&self, instance: &InstanceId, count: u32) {
        self.lock().failing_opens.insert(instance.clone(), count);
    }

    /// Build an incoming poll-creation message carrying a fresh secret.
    pub fn poll_message(key: MessageKey, name: &str, options: &[&str]) -> WireMessage {
        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        WireMessage {
            key,
            timestamp: now_ms(),
            push_name: None,
            content: MessageContent::PollCreation(PollCreation {
                name: name.to_string(),
                options: options.iter().map(|o| o.to_string()).collect(),
                selectable_count: 1,
            }),
            message_secret: Some(secret),
            poll_updates: Vec::new(),
            status: None,
        }
    }

    /// Build an encrypted vote from `voter` on `creation`.
    ///
    /// `creator` must be the author of `creation` under the key-authorship
    /// rule of the receiving instance.
    pub fn vote_message(
        creation: &WireMessage,
        creator: &str,
        voter: &str,
        vote_id: &str,
        selected: &[&str],
        sender_timestamp_ms: u64,
    ) -> TransportResult<WireMessage> {
        let secret = creation
            .message_secret
            .as_deref()
            .ok_or_else(|| TransportError::Protocol("poll has no secret".to_string()))?;
        let ctx = VoteContext {
            poll_message_id: &creation.key.id,
            poll_creator: creator,
            voter,
            secret,
        };
        let vote = vote_crypto::encrypt_vote(selected, &ctx)?;

        Ok(WireMessage {
            key: MessageKey {
                conversation: creation.key.conversation.clone(),
                id: vote_id.to_string(),
                from_me: false,
                participant: Some(voter.to_string()),
            },
            timestamp: sender_timestamp_ms,
            push_name: None,
            content: MessageContent::PollUpdate(PollUpdateMessage {
                creation_key: creation.key.clone(),
                vote,
                sender_timestamp_ms,
            }),
            message_secret: None,
            poll_updates: Vec::new(),
            status: None,
        })
    }
}

#[async_trait]
impl TransportFactory for MockNetwork {
    async fn open(&self, params: SessionParams) -> TransportResult<(Arc<dyn Transport>, EventStream)> {
        let (sender, stream) = EventStream::channel();

        let inner = {
            let mut state = self.lock();
            if let Some(remaining) = state.failing_opens.get_mut(&params.instance) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransportError::Network("connection refused".to_string()));
                }
            }

            *state.opened.entry(params.instance.clone()).or_default() += 1;
            state.next_handle += 1;
            let inner = Arc::new(HandleInner {
                handle: state.next_handle,
                instance: params.instance.clone(),
                sender,
                closed: AtomicBool::new(false),
                credentials: Mutex::new(params.credentials.clone()),
            });
            state
                .handles
                .entry(params.instance.clone())
                .or_default()
                .push(inner.clone());
            inner
        };

        if self.auto_connect {
            let update = if params.credentials.registered {
                ConnectionUpdate::open()
            } else {
                ConnectionUpdate::pairing(format!("mock-qr-{}-{}", params.instance, inner.handle))
            };
            inner.sender.emit(TransportEvent::ConnectionUpdate(update));
        }

        let transport = MockTransport {
            network: self.clone(),
            inner,
        };
        Ok((Arc::new(transport), stream))
    }
}

/// One mock session handle
pub struct MockTransport {
    network: MockNetwork,
    inner: Arc<HandleInner>,
}

impl MockTransport {
    fn ensure_open(&self) -> TransportResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn own_id(&self) -> Option<String> {
        self.inner.credentials().me.clone()
    }

    async fn request_pairing_code(&self, phone: &str) -> TransportResult<String> {
        self.ensure_open()?;
        {
            let mut state = self.network.lock();
            if state.failing_pairing_requests > 0 {
                state.failing_pairing_requests -= 1;
                return Err(TransportError::Network("pairing service unavailable".to_string()));
            }
        }
        if phone.is_empty() || !phone.chars().all(|c| c.is_ascii_digit()) {
            return Err(TransportError::Protocol(format!("invalid phone number: {}", phone)));
        }

        let code = uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase();
        Ok(code)
    }

    async fn send(&self, conversation: &str, content: OutgoingContent) -> TransportResult<WireMessage> {
        self.ensure_open()?;

        let mut message_secret = None;
        let quote = |id: Option<String>| id.map(|id| MessageKey::new(conversation, id));
        let mentions = |mention: bool| {
            if mention {
                vec![conversation.to_string()]
            } else {
                Vec::new()
            }
        };
        let content = match content {
            OutgoingContent::Text {
                text,
                quoted_id,
                mention,
            } => MessageContent::Text {
                text,
                quoted: quote(quoted_id),
                mentions: mentions(mention),
            },
            OutgoingContent::Media {
                mimetype,
                data,
                caption,
                quoted_id,
                mention,
            } => {
                if mimetype.is_empty() || data.is_empty() {
                    return Err(TransportError::Protocol(
                        "media needs data and a mimetype".to_string(),
                    ));
                }
                MessageContent::Media {
                    kind: MediaKind::from_mimetype(&mimetype),
                    mimetype,
                    data,
                    caption: caption.filter(|c| !c.is_empty()),
                    quoted: quote(quoted_id),
                    mentions: mentions(mention),
                }
            }
            OutgoingContent::Poll {
                name,
                options,
                selectable_count,
            } => {
                if options.len() < 2 {
                    return Err(TransportError::Protocol(
                        "a poll needs at least two options".to_string(),
                    ));
                }
                let mut secret = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut secret);
                message_secret = Some(secret);
                MessageContent::PollCreation(PollCreation {
                    name,
                    options,
                    selectable_count,
                })
            }
            OutgoingContent::Reaction { target, emoji } => MessageContent::Reaction { target, emoji },
            OutgoingContent::Delete { target } => MessageContent::Revoke { target },
        };

        let message = WireMessage {
            key: MessageKey {
                conversation: conversation.to_string(),
                id: next_message_id(),
                from_me: true,
                participant: None,
            },
            timestamp: now_ms(),
            push_name: None,
            content,
            message_secret,
            poll_updates: Vec::new(),
            status: Some(MessageStatus::ServerAck),
        };

        let mut state = self.network.lock();
        state.archive.push(message.clone());
        state
            .sent
            .push((self.inner.instance.clone(), message.clone()));
        Ok(message)
    }

    async fn fetch_message(&self, key: &MessageKey) -> TransportResult<Option<WireMessage>> {
        self.ensure_open()?;
        let state = self.network.lock();
        let found = state
            .archive
            .iter()
            .find(|m| m.key.conversation == key.conversation && m.key.id == key.id)
            .or_else(|| state.archive.iter().find(|m| m.key.id == key.id))
            .cloned();
        Ok(found)
    }

    fn decrypt_poll_vote(&self, vote: &EncryptedVote, ctx: &VoteContext<'_>) -> TransportResult<DecryptedVote> {
        vote_crypto::decrypt_vote(vote, ctx)
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    async fn logout(&self) -> TransportResult<()> {
        self.ensure_open()?;
        self.network
            .lock()
            .logged_out
            .push(self.inner.instance.clone());
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::credentials::CredentialStore;
    use crate::store::document::MemoryDocumentStore;
    use crate::store::messages::MessageStore;
    use futures::StreamExt;

    async fn params(id: &str) -> SessionParams {
        let docs = Arc::new(MemoryDocumentStore::new());
        let instance = InstanceId::new(id);
        let creds = Arc::new(CredentialStore::load(instance.clone(), docs.clone()).await.unwrap());
        let messages = Arc::new(MessageStore::load(instance.clone(), docs).await.unwrap());
        SessionParams {
            instance,
            credentials: creds.credentials().await,
            keys: creds,
            messages,
        }
    }

    #[tokio::test]
    async fn test_unregistered_session_reports_pairing_code() {
        let network = MockNetwork::new();
        let (_transport, mut events) = network.open(params("acct1").await).await.unwrap();

        match events.next().await.unwrap() {
            TransportEvent::ConnectionUpdate(update) => {
                assert!(update.qr.unwrap().starts_with("mock-qr-acct1"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_complete_pairing_registers_identity() {
        let network = MockNetwork::new();
        let id = InstanceId::new("acct1");
        let (transport, mut events) = network.open(params("acct1").await).await.unwrap();
        let _qr = events.next().await.unwrap();

        assert_eq!(network.complete_pairing(&id), 1);

        match events.next().await.unwrap() {
            TransportEvent::CredsUpdate(creds) => assert!(creds.registered),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(transport.own_id().as_deref(), Some("acct1@mock.net"));
    }

    #[tokio::test]
    async fn test_closed_handle_no_longer_receives_events() {
        let network = MockNetwork::manual();
        let id = InstanceId::new("acct1");
        let (transport, _events) = network.open(params("acct1").await).await.unwrap();
        assert_eq!(network.live_handles(&id), 1);

        transport.close().await;

        assert_eq!(network.live_handles(&id), 0);
        assert_eq!(
            network.emit(&id, TransportEvent::ConnectionUpdate(ConnectionUpdate::open())),
            0
        );
        assert!(matches!(
            transport.send("chat", OutgoingContent::Text { text: "x".into(), quoted_id: None, mention: false }).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_sent_media_kind_and_mention() {
        let network = MockNetwork::manual();
        let (transport, _events) = network.open(params("acct1").await).await.unwrap();

        let sent = transport
            .send(
                "bob@net",
                OutgoingContent::Media {
                    mimetype: "video/mp4".into(),
                    data: vec![1, 2, 3],
                    caption: Some(String::new()),
                    quoted_id: Some("Q1".into()),
                    mention: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(
            sent.content,
            MessageContent::Media {
                kind: MediaKind::Video,
                mimetype: "video/mp4".into(),
                data: vec![1, 2, 3],
                caption: None,
                quoted: Some(MessageKey::new("bob@net", "Q1")),
                mentions: vec!["bob@net".to_string()],
            }
        );

        let empty = transport
            .send(
                "bob@net",
                OutgoingContent::Media {
                    mimetype: "image/png".into(),
                    data: Vec::new(),
                    caption: None,
                    quoted_id: None,
                    mention: false,
                },
            )
            .await;
        assert!(matches!(empty, Err(TransportError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_sent_poll_is_fetchable_and_carries_secret() {
        let network = MockNetwork::manual();
        let (transport, _events) = network.open(params("acct1").await).await.unwrap();

        let sent = transport
            .send(
                "group@g",
                OutgoingContent::Poll {
                    name: "Lunch?".into(),
                    options: vec!["A".into(), "B".into()],
                    selectable_count: 1,
                },
            )
            .await
            .unwrap();

        assert_eq!(sent.message_secret.as_ref().map(Vec::len), Some(32));
        let fetched = transport.fetch_message(&sent.key).await.unwrap();
        assert_eq!(fetched, Some(sent));
    }

    #[tokio::test]
    async fn test_vote_message_decrypts_through_transport() {
        let network = MockNetwork::manual();
        let (transport, _events) = network.open(params("acct1").await).await.unwrap();
        let creation = MockNetwork::poll_message(MessageKey::new("group@g", "P1"), "Q", &["A", "B"]);

        let vote = MockNetwork::vote_message(&creation, "group@g", "bob@net", "V1", &["B"], 10).unwrap();
        let MessageContent::PollUpdate(update) = &vote.content else {
            panic!("not a vote");
        };

        let ctx = VoteContext {
            poll_message_id: "P1",
            poll_creator: &transport.key_author(&creation.key),
            voter: &transport.key_author(&vote.key),
            secret: creation.message_secret.as_deref().unwrap(),
        };
        let decrypted = transport.decrypt_poll_vote(&update.vote, &ctx).unwrap();
        assert_eq!(decrypted.selected_options, vec![vote_crypto::option_hash("B")]);
    }

    #[tokio::test]
    async fn test_failing_pairing_requests_are_network_errors() {
        let network = MockNetwork::manual();
        let (transport, _events) = network.open(params("acct1").await).await.unwrap();
        network.fail_pairing_requests(1);

        assert!(matches!(
            transport.request_pairing_code("15550001").await,
            Err(TransportError::Network(_))
        ));
        assert_eq!(transport.request_pairing_code("15550001").await.unwrap().len(), 8);
    }
}
