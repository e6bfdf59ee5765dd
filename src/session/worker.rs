//! Per-instance event worker
//!
//! Consumes one transport handle's event stream strictly in arrival order.
//! Store mutations for an event complete before the event (or anything after
//! it) is dispatched, so a vote never overtakes the creation it refers to.
//! Lifecycle decisions are not made here: connection updates are forwarded
//! to the supervisor as [`Signal`]s tagged with the handle generation.

use super::registry::{DispatchTarget, Registry};
use super::Signal;
use crate::poll::PollEngine;
use crate::store::credentials::CredentialStore;
use crate::store::messages::MessageStore;
use crate::transport::events::EventStream;
use crate::transport::traits::{
    InstanceId, MessageContent, MessagePatch, MessageUpdate, Transport, TransportEvent,
    WireMessage,
};
use crate::webhook::EventDispatcher;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Everything one worker needs
pub struct Worker {
    pub instance: InstanceId,
    pub generation: u64,
    pub transport: Arc<dyn Transport>,
    pub credentials: Arc<CredentialStore>,
    pub messages: Arc<MessageStore>,
    pub dispatcher: EventDispatcher,
    pub registry: Registry,
    pub signals: mpsc::UnboundedSender<Signal>,
}

impl Worker {
    pub async fn run(self, mut events: EventStream) {
        while let Some(event) = events.next().await {
            // Detached handles only drain; nothing reaches the stores or webhook
            let Some(target) = self.registry.dispatch_target(&self.instance, self.generation) else {
                debug!(instance = %self.instance, generation = self.generation, "dropping event from detached handle");
                break;
            };
            self.handle(event, &target).await;
        }
        debug!(instance = %self.instance, generation = self.generation, "event worker stopped");
    }

    fn dispatch<T: Serialize>(&self, target: &DispatchTarget, event_type: &str, data: &T) {
        match serde_json::to_value(data) {
            Ok(value) => self.dispatcher.dispatch(
                target.callback_url.as_deref(),
                &self.instance,
                event_type,
                value,
            ),
            Err(e) => warn!(instance = %self.instance, event_type, error = %e, "failed to serialize event"),
        }
    }

    async fn handle(&self, event: TransportEvent, target: &DispatchTarget) {
        match &event {
            TransportEvent::ConnectionUpdate(update) => {
                let _ = self.signals.send(Signal::Connection {
                    instance: self.instance.clone(),
                    generation: self.generation,
                    update: update.clone(),
                });
            }
            TransportEvent::CredsUpdate(credentials) => {
                self.credentials
                    .update_credentials(credentials.clone())
                    .await;
            }
            TransportEvent::MessagesUpsert { messages, .. } => {
                self.store_messages(messages).await;
                if target.poll_events {
                    self.handle_polls(messages, target).await;
                    if messages
                        .iter()
                        .any(|m| matches!(m.content, MessageContent::PollUpdate(_)))
                    {
                        // Replaced by the synthesized poll.update
                        return;
                    }
                }
            }
            TransportEvent::MessagesUpdate(updates) => {
                self.apply_updates(updates, target).await;
            }
            TransportEvent::ChatsUpsert(chats) => {
                self.messages.upsert_chats(chats.clone()).await;
                self.messages.write_logged().await;
            }
            TransportEvent::Other { .. } => {}
        }

        self.dispatcher.dispatch(
            target.callback_url.as_deref(),
            &self.instance,
            event.event_type(),
            event.payload(),
        );
    }

    async fn store_messages(&self, messages: &[WireMessage]) {
        // Group by conversation, keeping arrival order within each
        let mut batches: Vec<(&str, Vec<WireMessage>)> = Vec::new();
        for message in messages {
            let conversation = message.key.conversation.as_str();
            match batches.iter_mut().find(|(c, _)| *c == conversation) {
                Some((_, batch)) => batch.push(message.clone()),
                None => batches.push((conversation, vec![message.clone()])),
            }
        }
        for (conversation, batch) in batches {
            self.messages.insert(conversation, batch).await;
        }
        self.messages.write_logged().await;
    }

    async fn handle_polls(&self, messages: &[WireMessage], target: &DispatchTarget) {
        let engine = PollEngine::new(&self.instance, self.transport.as_ref(), &self.messages);
        for message in messages {
            match &message.content {
                MessageContent::PollCreation(_) => {
                    if let Some(payload) = engine.on_creation(message) {
                        self.dispatch(target, "poll.create", &payload);
                    }
                }
                MessageContent::PollUpdate(_) => match engine.on_vote(message).await {
                    Ok(payload) => self.dispatch(target, "poll.update", &payload),
                    Err(e) => warn!(
                        instance = %self.instance,
                        vote = %message.key.id,
                        error = %e,
                        "dropping poll vote"
                    ),
                },
                _ => {}
            }
        }
    }

    async fn apply_updates(&self, updates: &[MessageUpdate], target: &DispatchTarget) {
        for update in updates {
            let mut patch = update.update.clone();
            if target.poll_events {
                // Vote records are merged by the poll engine, not overwritten
                patch.poll_updates = None;
            }
            if patch != MessagePatch::default() {
                self.messages
                    .update_patch(&update.key.conversation, &update.key.id, patch)
                    .await;
            }
        }
        self.messages.write_logged().await;

        if target.poll_events {
            let engine = PollEngine::new(&self.instance, self.transport.as_ref(), &self.messages);
            for update in updates {
                if let Some(payload) = engine.on_update(update).await {
                    self.dispatch(target, "poll.update", &payload);
                }
            }
        }
    }
}
