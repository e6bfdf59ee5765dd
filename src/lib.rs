//! Switchboard - Multi-Instance Session Manager
//!
//! Multiplexes many long-lived messaging sessions ("instances") behind one
//! control plane. Each instance gets a persisted identity, a local message
//! cache and a webhook target receiving every protocol event.
//!
//! Key principles:
//! - One live transport handle per instance, ever
//! - Events of one instance are handled strictly in arrival order
//! - Poll tallies are a pure function of the recorded votes
//! - Webhook delivery never blocks instance processing

pub mod poll;
pub mod session;
pub mod store;
pub mod transport;
pub mod webhook;
