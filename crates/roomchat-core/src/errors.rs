//! Error hierarchy for roomchat.
//!
//! - [`HandshakeError`]: admission failures, resolved before the socket opens
//! - [`RegistryError`]: room registry contract violations
//! - [`MessageError`]: per-message protocol violations that end the connection
//! - [`SigningError`]: the token secret cannot key the MAC
//!
//! Every connection-facing error maps to the [`CloseCode`] the peer observes.

use thiserror::Error;

use crate::protocol::CloseCode;

/// Handshake (admission) failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// Sub-protocol header missing, undecodable, or not four non-empty fields.
    #[error("malformed handshake: {0}")]
    Malformed(String),
    /// The token signature did not verify.
    #[error("unauthorized: token signature mismatch")]
    Unauthorized,
}

impl HandshakeError {
    /// Short machine-readable label (metrics and rejection bodies).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed_handshake",
            Self::Unauthorized => "unauthorized",
        }
    }

    /// Close code reported alongside the HTTP rejection.
    pub fn close_code(&self) -> CloseCode {
        CloseCode::Unauthorized
    }
}

/// Token signing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigningError {
    /// The MAC refused the secret as a key.
    #[error("secret rejected as HMAC key: {0}")]
    InvalidKey(String),
}

/// Room registry failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The connection is not (or no longer) registered in this room.
    #[error("connection {0} is not registered")]
    NotRegistered(String),
    /// Display name was empty after trimming.
    #[error("display name must not be empty")]
    InvalidName,
    /// The room was retired by the idle sweeper; obtain a fresh one.
    #[error("room {0} has been retired")]
    Retired(String),
}

impl RegistryError {
    /// Close code for a connection whose registry call failed.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::InvalidName => CloseCode::InvalidMessage,
            Self::NotRegistered(_) | Self::Retired(_) => CloseCode::InternalError,
        }
    }
}

/// Per-message protocol violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// Payload exceeded the configured ceiling.
    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        /// Payload size in bytes.
        size: usize,
        /// Configured ceiling in bytes.
        limit: usize,
    },
    /// Not JSON, unknown `type`, wrong field types, or empty text/name.
    #[error("invalid message: {0}")]
    InvalidFormat(String),
}

impl MessageError {
    /// Close code for the offending connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::TooLarge { .. } => CloseCode::MessageTooLarge,
            Self::InvalidFormat(_) => CloseCode::InvalidMessage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_error_display() {
        let err = HandshakeError::Malformed("missing header".into());
        assert_eq!(err.to_string(), "malformed handshake: missing header");
        assert_eq!(
            HandshakeError::Unauthorized.to_string(),
            "unauthorized: token signature mismatch"
        );
    }

    #[test]
    fn handshake_error_kind() {
        assert_eq!(HandshakeError::Malformed(String::new()).kind(), "malformed_handshake");
        assert_eq!(HandshakeError::Unauthorized.kind(), "unauthorized");
    }

    #[test]
    fn registry_error_close_codes() {
        assert_eq!(RegistryError::InvalidName.close_code(), CloseCode::InvalidMessage);
        assert_eq!(
            RegistryError::NotRegistered("c1".into()).close_code(),
            CloseCode::InternalError
        );
    }

    #[test]
    fn message_error_close_codes() {
        let too_large = MessageError::TooLarge { size: 10_241, limit: 10_240 };
        assert_eq!(too_large.close_code(), CloseCode::MessageTooLarge);
        assert!(too_large.to_string().contains("10241"));
        assert_eq!(
            MessageError::InvalidFormat("bogus".into()).close_code(),
            CloseCode::InvalidMessage
        );
    }
}
