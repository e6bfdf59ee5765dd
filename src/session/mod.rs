//! Lifecycle Controller
//!
//! Owns the instance registry and drives each instance through
//! `connecting -> pairing -> open -> closed`:
//! - `lifecycle`: the pure transition table
//! - `registry`: running instances and per-id operation locks
//! - `worker`: one ordered event consumer per transport handle
//! - `manager`: control operations plus the supervisor that applies
//!   lifecycle actions

pub mod lifecycle;
pub mod manager;
pub mod registry;
pub mod worker;

pub use lifecycle::{InstanceStatus, LifecycleAction, LifecycleFlags, LifecycleInput};
pub use manager::SessionManager;

use crate::store::StoreError;
use crate::transport::retry::RetryPolicy;
use crate::transport::traits::{ConnectionUpdate, InstanceId, TransportError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle timing and limits
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a session may stay in `pairing` before it is recreated
    pub pairing_timeout: Duration,
    /// Delay before the post-pairing restart and restart-required recreate
    pub restart_delay: Duration,
    /// Pairing watchdog expiries before the instance is left closed
    pub max_pairing_attempts: u32,
    /// Backoff for pairing-code requests and for reopening a recreated session
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pairing_timeout: Duration::from_secs(60),
            restart_delay: Duration::from_secs(1),
            max_pairing_attempts: 5,
            retry: RetryPolicy::default(),
        }
    }
}

/// Options for `SessionManager::create`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOptions {
    pub callback_url: Option<String>,
    pub access_key: Option<String>,
    /// Phone number to request a pairing code for
    pub phone: Option<String>,
    /// Synthesize poll events (default on)
    pub poll_events: Option<bool>,
}

/// Options for `SessionManager::update`; `None` leaves a field unchanged,
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub callback_url: Option<Option<String>>,
    pub access_key: Option<Option<String>>,
}

/// Row of `list_instances`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub status: InstanceStatus,
}

/// Lifecycle signals consumed by the supervisor
#[derive(Debug)]
pub enum Signal {
    Connection {
        instance: InstanceId,
        generation: u64,
        update: ConnectionUpdate,
    },
    PairingCode {
        instance: InstanceId,
        generation: u64,
        code: String,
    },
    PairingTimeout {
        instance: InstanceId,
        generation: u64,
    },
    RestartTimer {
        instance: InstanceId,
        generation: u64,
    },
}

impl Signal {
    pub fn instance(&self) -> &InstanceId {
        match self {
            Signal::Connection { instance, .. }
            | Signal::PairingCode { instance, .. }
            | Signal::PairingTimeout { instance, .. }
            | Signal::RestartTimer { instance, .. } => instance,
        }
    }
}

/// Result type for control operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Control operation errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Instance {0} already exists")]
    AlreadyExists(InstanceId),

    #[error("Instance {0} not found")]
    NotFound(InstanceId),

    #[error("Instance {instance} is not active (status: {status})")]
    NotActive {
        instance: InstanceId,
        status: InstanceStatus,
    },

    #[error("Invalid access key for instance {0}")]
    Unauthorized(InstanceId),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl SessionError {
    /// Stable machine-readable reason
    pub fn reason_code(&self) -> &'static str {
        match self {
            SessionError::AlreadyExists(_) => "already_exists",
            SessionError::NotFound(_) => "not_found",
            SessionError::NotActive { .. } => "not_active",
            SessionError::Unauthorized(_) => "unauthorized",
            SessionError::Transport(_) => "transport",
            SessionError::Store(_) => "store",
            SessionError::InvalidRequest(_) => "invalid_request",
        }
    }
}
