//! Instance state machine
//!
//! `connecting -> pairing -> open -> closed`. Every lifecycle decision is made
//! by [`transition`], a pure function of the current status, the volatile
//! flags and one input. The supervisor applies the returned actions; nothing
//! here recurses into create/restart.
//!
//! A freshly paired session is restarted exactly once after it first reports
//! `open`. `needs_restart` survives that restart so the second `open` clears
//! it instead of scheduling another one.

use crate::transport::traits::DisconnectReason;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Runtime status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Connecting,
    Pairing,
    Open,
    Closed,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Connecting => "connecting",
            InstanceStatus::Pairing => "pairing",
            InstanceStatus::Open => "open",
            InstanceStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Volatile per-instance flags (never persisted)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleFlags {
    /// A pairing code was issued during this session
    pub was_pairing: bool,
    /// A post-pairing restart is pending or just happened
    pub needs_restart: bool,
    /// Reconnect automatically after an unexpected close
    pub should_reconnect: bool,
    /// Consecutive pairing watchdog expiries
    pub pairing_attempts: u32,
}

impl Default for LifecycleFlags {
    fn default() -> Self {
        Self {
            was_pairing: false,
            needs_restart: false,
            should_reconnect: true,
            pairing_attempts: 0,
        }
    }
}

impl LifecycleFlags {
    /// Flags for the session that replaces this one
    pub fn carried(&self) -> Self {
        Self {
            needs_restart: self.needs_restart,
            pairing_attempts: self.pairing_attempts,
            ..Self::default()
        }
    }
}

/// Lifecycle input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleInput {
    /// A pairing code (or QR payload) was issued
    PairingCode,
    Open,
    NewLogin,
    Close(Option<DisconnectReason>),
    PairingTimeout,
    RestartTimer,
}

/// Side effect requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    CancelWatchdog,
    StartWatchdog,
    /// Arm the restart timer (one-shot restart after pairing)
    ScheduleRestart,
    /// Replace the session now, keeping credentials
    Recreate,
    /// Arm the restart timer after a restart-required close
    RecreateAfterDelay,
    /// Replace the session with blank credentials (pairing expired)
    RecreateFresh,
    /// Drop the instance from the registry
    Teardown,
    /// Stop the session and keep the instance visible as closed
    RemainClosed,
}

/// Outcome of one input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub status: InstanceStatus,
    pub flags: LifecycleFlags,
    pub actions: Vec<LifecycleAction>,
}

/// Apply one input to an instance's status and flags.
pub fn transition(
    status: InstanceStatus,
    flags: LifecycleFlags,
    input: LifecycleInput,
    max_pairing_attempts: u32,
) -> Transition {
    use LifecycleAction::*;

    let mut next = flags;
    let mut actions = Vec::new();

    let status = match input {
        LifecycleInput::PairingCode => {
            next.was_pairing = true;
            if status != InstanceStatus::Pairing {
                actions.push(StartWatchdog);
            }
            InstanceStatus::Pairing
        }
        LifecycleInput::Open => {
            actions.push(CancelWatchdog);
            if next.needs_restart {
                next.needs_restart = false;
            } else if next.was_pairing {
                next.needs_restart = true;
                actions.push(ScheduleRestart);
            }
            next.was_pairing = false;
            next.pairing_attempts = 0;
            InstanceStatus::Open
        }
        LifecycleInput::NewLogin => {
            if !next.needs_restart {
                next.needs_restart = true;
                actions.push(ScheduleRestart);
            }
            status
        }
        LifecycleInput::Close(reason) => {
            actions.push(CancelWatchdog);
            match reason {
                Some(DisconnectReason::LoggedOut) => actions.push(Teardown),
                Some(DisconnectReason::RestartRequired) if next.was_pairing => {
                    next.was_pairing = false;
                    actions.push(RecreateAfterDelay);
                }
                _ if next.should_reconnect => actions.push(Recreate),
                _ => actions.push(RemainClosed),
            }
            InstanceStatus::Closed
        }
        LifecycleInput::PairingTimeout => {
            if status != InstanceStatus::Pairing {
                return Transition {
                    status,
                    flags,
                    actions,
                };
            }
            next.pairing_attempts += 1;
            if next.pairing_attempts >= max_pairing_attempts {
                actions.push(RemainClosed);
                InstanceStatus::Closed
            } else {
                actions.push(RecreateFresh);
                InstanceStatus::Connecting
            }
        }
        LifecycleInput::RestartTimer => {
            actions.push(Recreate);
            status
        }
    };

    Transition {
        status,
        flags: next,
        actions,
    }
}
