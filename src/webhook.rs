//! Event Dispatcher
//!
//! Forwards every instance event to the instance's callback target as one
//! POST with body `{ "instance": id, "type": tag, "data": payload }`.
//! Delivery is fire-and-forget: the caller never waits on the outcome, and
//! failures are logged, never retried.

use crate::transport::traits::InstanceId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Body of one webhook call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub instance: InstanceId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

/// Outbound delivery mechanism. `deliver` must not block.
pub trait EventSink: Send + Sync {
    fn deliver(&self, url: &str, event: WebhookEvent);
}

/// HTTP delivery: one detached task per POST
#[derive(Clone)]
pub struct HttpEventSink {
    client: reqwest::Client,
}

impl HttpEventSink {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl EventSink for HttpEventSink {
    fn deliver(&self, url: &str, event: WebhookEvent) {
        let client = self.client.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .json(&event)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            match result {
                Ok(response) => debug!(
                    instance = %event.instance,
                    event_type = %event.event_type,
                    status = %response.status(),
                    "webhook delivered"
                ),
                Err(e) => warn!(
                    instance = %event.instance,
                    event_type = %event.event_type,
                    url = %url,
                    error = %e,
                    "webhook delivery failed"
                ),
            }
        });
    }
}

/// In-order in-process delivery (embedding, tests)
#[derive(Clone)]
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<(String, WebhookEvent)>,
}

impl ChannelEventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<(String, WebhookEvent)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn deliver(&self, url: &str, event: WebhookEvent) {
        if self.sender.send((url.to_string(), event)).is_err() {
            debug!("webhook receiver dropped");
        }
    }
}

/// Routes events to the configured callback target
#[derive(Clone)]
pub struct EventDispatcher {
    sink: Arc<dyn EventSink>,
}

impl EventDispatcher {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Forward one event. No-op when the instance has no callback URL.
    pub fn dispatch(
        &self,
        callback_url: Option<&str>,
        instance: &InstanceId,
        event_type: &str,
        data: Value,
    ) {
        let Some(url) = callback_url.filter(|u| !u.is_empty()) else {
            return;
        };
        self.sink.deliver(
            url,
            WebhookEvent {
                instance: instance.clone(),
                event_type: event_type.to_string(),
                data,
            },
        );
    }
}

/// `Vec<u8>` as a standard base64 string
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(&s)
            .map_err(|e| serde::de::Error::custom(format!("base64 decode error: {e}")))
    }
}

/// `Option<Vec<u8>>` as an optional base64 string
pub mod base64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(s) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        STANDARD
            .decode(&s)
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("base64 decode error: {e}")))
    }
}

/// `Vec<[u8; 32]>` as a list of base64 strings
pub mod base64_hashes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(hashes: &[[u8; 32]], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(hashes.len()))?;
        for hash in hashes {
            seq.serialize_element(&STANDARD.encode(hash))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .iter()
            .map(|s| {
                let bytes = STANDARD
                    .decode(s)
                    .map_err(|e| serde::de::Error::custom(format!("base64 decode error: {e}")))?;
                <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
                    serde::de::Error::custom(format!("expected 32-byte hash, got {}", bytes.len()))
                })
            })
            .collect()
    }
}
