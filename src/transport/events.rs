//! Per-session transport event stream.
//!
//! Each transport session owns exactly one sender; the session manager owns
//! the receiving stream. Dropping the stream detaches the listener: further
//! sends fail and the events are discarded.

use super::traits::TransportEvent;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Ordered stream of events emitted by one transport session.
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<TransportEvent>,
}

impl EventStream {
    /// Create a connected stream/sender pair.
    pub fn channel() -> (EventSender, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (EventSender { sender }, Self { receiver })
    }
}

impl Stream for EventStream {
    type Item = TransportEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Sender side held by the transport session.
#[derive(Clone)]
pub struct EventSender {
    sender: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSender {
    /// Emit an event. Returns false once the listener has been detached.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    /// Whether the receiving stream is still attached.
    pub fn is_attached(&self) -> bool {
        !self.sender.is_closed()
    }
}
