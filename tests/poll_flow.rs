//! Integration tests for poll vote handling.
//!
//! A poll is created in a group conversation, votes arrive encrypted, and
//! every decrypted vote is forwarded as a `poll.update` carrying the full
//! tally. The tally must not depend on restarts between votes.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use switchboard::session::{CreateOptions, SessionConfig, SessionManager};
use switchboard::store::{DocumentStore, MemoryDocumentStore, MessageStore};
use switchboard::transport::{
    InstanceId, MessageKey, MockNetwork, TransportEvent, UpsertKind, WireMessage,
};
use switchboard::webhook::{ChannelEventSink, EventDispatcher, WebhookEvent};
use tokio::sync::mpsc::UnboundedReceiver;

const HOOK: &str = "http://hook.test/polls";
const GROUP: &str = "team@group.net";
const CREATOR: &str = "alice@net";

// === Test Fixtures ===

fn manager_for(
    network: &MockNetwork,
    docs: &Arc<MemoryDocumentStore>,
) -> (SessionManager, UnboundedReceiver<(String, WebhookEvent)>) {
    let (sink, webhooks) = ChannelEventSink::channel();
    let manager = SessionManager::new(
        Arc::new(network.clone()),
        docs.clone(),
        EventDispatcher::new(Arc::new(sink)),
        SessionConfig::default(),
    );
    (manager, webhooks)
}

async fn create(manager: &SessionManager, id: &str, poll_events: bool) {
    manager
        .create(
            id,
            CreateOptions {
                callback_url: Some(HOOK.to_string()),
                poll_events: Some(poll_events),
                ..CreateOptions::default()
            },
        )
        .await
        .unwrap();
}

/// Next webhook of the given type, skipping everything else
async fn next_event(
    webhooks: &mut UnboundedReceiver<(String, WebhookEvent)>,
    event_type: &str,
) -> WebhookEvent {
    let wait = async {
        loop {
            let (_, event) = webhooks.recv().await.expect("webhook channel closed");
            if event.event_type == event_type {
                return event;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .unwrap_or_else(|_| panic!("no {} webhook", event_type))
}

fn poll_creation() -> WireMessage {
    let mut key = MessageKey::new(GROUP, "POLL1");
    key.participant = Some(CREATOR.to_string());
    MockNetwork::poll_message(key, "Lunch?", &["A", "B"])
}

fn vote(creation: &WireMessage, voter: &str, id: &str, selected: &[&str], ts: u64) -> WireMessage {
    MockNetwork::vote_message(creation, CREATOR, voter, id, selected, ts).unwrap()
}

fn upsert(message: WireMessage) -> TransportEvent {
    TransportEvent::MessagesUpsert {
        messages: vec![message],
        kind: UpsertKind::Notify,
    }
}

fn final_tally() -> Value {
    json!([
        {"name": "A", "count": 0, "voters": []},
        {"name": "B", "count": 2, "voters": ["bob@net", "carol@net"]},
    ])
}

// === Vote Flow ===

#[tokio::test]
async fn test_votes_produce_cumulative_tally() {
    let network = MockNetwork::manual();
    let docs = Arc::new(MemoryDocumentStore::new());
    let (manager, mut webhooks) = manager_for(&network, &docs);
    let id = InstanceId::new("acct1");
    create(&manager, "acct1", true).await;

    let creation = poll_creation();
    network.emit(&id, upsert(creation.clone()));
    let created = next_event(&mut webhooks, "poll.create").await;
    assert_eq!(created.data["poll"]["options"], json!(["A", "B"]));
    assert_eq!(created.data["results"][1]["count"], json!(0));

    network.emit(&id, upsert(vote(&creation, "bob@net", "V1", &["B"], 1_000)));
    let first = next_event(&mut webhooks, "poll.update").await;
    assert_eq!(first.data["voter"], json!("bob@net"));
    assert_eq!(first.data["selectedOptions"], json!(["B"]));
    assert_eq!(first.data["results"][1]["count"], json!(1));
    assert_eq!(first.data["pollCreationMessageKey"]["id"], json!("POLL1"));

    network.emit(&id, upsert(vote(&creation, "carol@net", "V2", &["B"], 2_000)));
    let second = next_event(&mut webhooks, "poll.update").await;
    assert_eq!(second.data["voter"], json!("carol@net"));
    assert_eq!(second.data["results"], final_tally());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_tally_survives_restart_between_votes() {
    let network = MockNetwork::manual();
    let docs = Arc::new(MemoryDocumentStore::new());
    let (manager, mut webhooks) = manager_for(&network, &docs);
    let id = InstanceId::new("acct1");
    create(&manager, "acct1", true).await;

    let creation = poll_creation();
    network.emit(&id, upsert(creation.clone()));
    network.emit(&id, upsert(vote(&creation, "bob@net", "V1", &["B"], 1_000)));
    next_event(&mut webhooks, "poll.update").await;

    manager.restart("acct1").await.unwrap();
    assert_eq!(network.live_handles(&id), 1);

    network.emit(&id, upsert(vote(&creation, "carol@net", "V2", &["B"], 2_000)));
    let second = next_event(&mut webhooks, "poll.update").await;
    assert_eq!(second.data["results"], final_tally());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_tally_survives_process_restart() {
    let network = MockNetwork::manual();
    let docs = Arc::new(MemoryDocumentStore::new());
    let id = InstanceId::new("acct1");
    let creation = poll_creation();

    {
        let (manager, mut webhooks) = manager_for(&network, &docs);
        create(&manager, "acct1", true).await;
        network.emit(&id, upsert(creation.clone()));
        network.emit(&id, upsert(vote(&creation, "bob@net", "V1", &["B"], 1_000)));
        next_event(&mut webhooks, "poll.update").await;
        manager.shutdown().await;
    }

    let (manager, mut webhooks) = manager_for(&network, &docs);
    assert_eq!(manager.restore_instances().await.unwrap(), 1);

    network.emit(&id, upsert(vote(&creation, "carol@net", "V2", &["B"], 2_000)));
    let second = next_event(&mut webhooks, "poll.update").await;
    assert_eq!(second.data["results"], final_tally());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_redelivered_creation_keeps_earlier_votes() {
    let network = MockNetwork::manual();
    let docs = Arc::new(MemoryDocumentStore::new());
    let (manager, mut webhooks) = manager_for(&network, &docs);
    let id = InstanceId::new("acct1");
    create(&manager, "acct1", true).await;

    let creation = poll_creation();
    network.emit(&id, upsert(creation.clone()));
    network.emit(&id, upsert(vote(&creation, "bob@net", "V1", &["B"], 1_000)));
    next_event(&mut webhooks, "poll.update").await;

    // History sync delivers the creation again, without its votes
    network.emit(
        &id,
        TransportEvent::MessagesUpsert {
            messages: vec![creation.clone()],
            kind: UpsertKind::Append,
        },
    );
    network.emit(&id, upsert(vote(&creation, "carol@net", "V2", &["B"], 2_000)));
    let second = next_event(&mut webhooks, "poll.update").await;
    assert_eq!(second.data["results"], final_tally());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_changed_vote_replaces_earlier_choice() {
    let network = MockNetwork::manual();
    let docs = Arc::new(MemoryDocumentStore::new());
    let (manager, mut webhooks) = manager_for(&network, &docs);
    let id = InstanceId::new("acct1");
    create(&manager, "acct1", true).await;

    let creation = poll_creation();
    network.emit(&id, upsert(creation.clone()));
    network.emit(&id, upsert(vote(&creation, "bob@net", "V1", &["A"], 1_000)));
    network.emit(&id, upsert(vote(&creation, "bob@net", "V2", &["B"], 2_000)));
    next_event(&mut webhooks, "poll.update").await;
    let latest = next_event(&mut webhooks, "poll.update").await;

    assert_eq!(
        latest.data["results"],
        json!([
            {"name": "A", "count": 0, "voters": []},
            {"name": "B", "count": 1, "voters": ["bob@net"]},
        ])
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_unseen_creation_is_fetched_from_network() {
    let network = MockNetwork::manual();
    let docs = Arc::new(MemoryDocumentStore::new());
    let (manager, mut webhooks) = manager_for(&network, &docs);
    let id = InstanceId::new("acct1");
    create(&manager, "acct1", true).await;

    // Known to the network, never delivered to the instance
    let creation = poll_creation();
    network.archive(creation.clone());

    network.emit(&id, upsert(vote(&creation, "bob@net", "V1", &["B"], 1_000)));
    let update = next_event(&mut webhooks, "poll.update").await;
    assert_eq!(update.data["results"][1]["voters"], json!(["bob@net"]));

    manager.shutdown().await;

    let docs: Arc<dyn DocumentStore> = docs;
    let messages = MessageStore::load(id, docs).await.unwrap();
    let stored = messages.load_message(GROUP, "POLL1").await.unwrap();
    assert_eq!(stored.poll_updates.len(), 1);
}

#[tokio::test]
async fn test_vote_for_unknown_poll_is_dropped() {
    let network = MockNetwork::manual();
    let docs = Arc::new(MemoryDocumentStore::new());
    let (manager, mut webhooks) = manager_for(&network, &docs);
    let id = InstanceId::new("acct1");
    create(&manager, "acct1", true).await;

    let creation = poll_creation();
    network.emit(&id, upsert(vote(&creation, "bob@net", "V1", &["B"], 1_000)));
    // Worker keeps going after the failed vote
    network.emit(&id, upsert(creation.clone()));
    next_event(&mut webhooks, "poll.create").await;

    manager.shutdown().await;
    while let Ok((_, event)) = webhooks.try_recv() {
        assert_ne!(event.event_type, "poll.update");
    }
}

// === Raw Forwarding ===

#[tokio::test]
async fn test_vote_upsert_is_replaced_by_poll_update() {
    let network = MockNetwork::manual();
    let docs = Arc::new(MemoryDocumentStore::new());
    let (manager, mut webhooks) = manager_for(&network, &docs);
    let id = InstanceId::new("acct1");
    create(&manager, "acct1", true).await;

    let creation = poll_creation();
    network.emit(&id, upsert(creation.clone()));
    next_event(&mut webhooks, "messages.upsert").await;

    network.emit(&id, upsert(vote(&creation, "bob@net", "V1", &["B"], 1_000)));
    next_event(&mut webhooks, "poll.update").await;
    manager.shutdown().await;

    while let Ok((_, event)) = webhooks.try_recv() {
        assert_ne!(event.event_type, "messages.upsert");
    }
}

#[tokio::test]
async fn test_poll_events_disabled_forwards_raw_upserts() {
    let network = MockNetwork::manual();
    let docs = Arc::new(MemoryDocumentStore::new());
    let (manager, mut webhooks) = manager_for(&network, &docs);
    let id = InstanceId::new("acct1");
    create(&manager, "acct1", false).await;

    let creation = poll_creation();
    network.emit(&id, upsert(creation.clone()));
    network.emit(&id, upsert(vote(&creation, "bob@net", "V1", &["B"], 1_000)));

    let first = next_event(&mut webhooks, "messages.upsert").await;
    assert_eq!(first.data["messages"][0]["key"]["id"], json!("POLL1"));
    let second = next_event(&mut webhooks, "messages.upsert").await;
    assert_eq!(second.data["messages"][0]["key"]["id"], json!("V1"));

    manager.shutdown().await;
    while let Ok((_, event)) = webhooks.try_recv() {
        assert!(!event.event_type.starts_with("poll."));
    }
}
