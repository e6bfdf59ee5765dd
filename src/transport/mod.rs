//! Transport Seam
//!
//! The protocol library that performs the wire handshake and end-to-end
//! encryption is an external collaborator. This module defines the traits the
//! session manager consumes, the per-session event stream, the poll vote
//! cipher, and an in-process mock network.

pub mod events;
pub mod mock;
pub mod retry;
pub mod traits;
pub mod vote_crypto;

pub use events::{EventSender, EventStream};
pub use mock::{MockNetwork, MockTransport};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use traits::*;
