//! Per-connection lifecycle state machine.
//!
//! `PendingAuth → Subscribed → Closing → Closed`. Every transition moves
//! exactly one step forward. A connection whose admission fails never leaves
//! `PendingAuth`.

use std::fmt;

use thiserror::Error;

/// Where a connection is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgraded, not yet registered in a room.
    PendingAuth,
    /// Registered; inbound messages are processed.
    Subscribed,
    /// Teardown started; no further messages are processed.
    Closing,
    /// Deregistered and released.
    Closed,
}

impl ConnectionState {
    /// The only state this one may move to.
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::PendingAuth => Some(Self::Subscribed),
            Self::Subscribed => Some(Self::Closing),
            Self::Closing => Some(Self::Closed),
            Self::Closed => None,
        }
    }

    /// Lowercase name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingAuth => "pending_auth",
            Self::Subscribed => "subscribed",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition that would skip or reverse a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid lifecycle transition {from} -> {to}")]
pub struct InvalidTransition {
    /// State at the time of the request.
    pub from: ConnectionState,
    /// Requested state.
    pub to: ConnectionState,
}

/// Lifecycle of one connection, owned by its session task.
#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
}

impl Lifecycle {
    /// Start in [`ConnectionState::PendingAuth`].
    pub fn new() -> Self {
        Self {
            state: ConnectionState::PendingAuth,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether inbound application messages may be processed.
    pub fn accepts_messages(&self) -> bool {
        self.state == ConnectionState::Subscribed
    }

    fn advance(&mut self, to: ConnectionState) -> Result<(), InvalidTransition> {
        if self.state.successor() == Some(to) {
            self.state = to;
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self.state,
                to,
            })
        }
    }

    /// `PendingAuth → Subscribed`, after the room accepted the connection.
    pub fn subscribe(&mut self) -> Result<(), InvalidTransition> {
        self.advance(ConnectionState::Subscribed)
    }

    /// `Subscribed → Closing`.
    ///
    /// Returns `true` only for the call that performed the transition, so
    /// teardown work guarded by it runs once.
    pub fn begin_closing(&mut self) -> bool {
        self.advance(ConnectionState::Closing).is_ok()
    }

    /// `Closing → Closed`.
    pub fn finish(&mut self) -> Result<(), InvalidTransition> {
        self.advance(ConnectionState::Closed)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
