//! Poll Engine
//!
//! A poll-creation message establishes named options and an embedded secret.
//! Later vote messages reference the creation key and carry an encrypted
//! selection of option hashes. The engine resolves the creation message,
//! decrypts the vote, records it on the stored creation message, and
//! recomputes the tally from the complete vote set.
//!
//! Tallies are never mutated incrementally: `aggregate_votes` is a pure
//! function of the recorded votes, so replaying after a restart yields the
//! same result in any order.

pub mod engine;
pub mod tally;

#[cfg(test)]
mod proptests;

pub use engine::{PollCreatePayload, PollEngine, PollUpdatePayload, PollUpdatesPayload};
pub use tally::{aggregate_votes, selected_labels, OptionTally, Tally, UNKNOWN_OPTION};

use crate::transport::traits::TransportError;

/// Poll handling errors. Each drops only the triggering event.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Poll creation message {0} not found")]
    CreationNotFound(String),

    #[error("Poll creation message {0} carries no secret")]
    MissingSecret(String),

    #[error("Vote decryption failed: {0}")]
    Decrypt(#[from] TransportError),

    #[error("Message is not a poll vote")]
    NotAVote,
}
