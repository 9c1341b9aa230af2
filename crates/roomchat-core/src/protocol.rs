//! Wire protocol: inbound frames, outbound room events, and close codes.
//!
//! All application frames are JSON text. Inbound frames are a tagged union on
//! `type` with exactly two shapes (`chat`, `name`); anything else is a
//! protocol violation and ends the connection.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::MessageError;
use crate::ids::RoomScope;

/// Sub-protocol literal echoed back on a successful handshake.
pub const DEFAULT_SUBPROTOCOL: &str = "chat";

/// Ceiling on a single inbound application payload (10 KiB).
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024;

/// WebSocket close codes used by the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// Clean close (peer hung up, or nothing went wrong).
    Normal,
    /// Server is shutting down.
    GoingAway,
    /// Inbound payload above [`MAX_MESSAGE_BYTES`].
    MessageTooLarge,
    /// Registry invariant violated on our side.
    InternalError,
    /// Handshake token failed verification.
    Unauthorized,
    /// Unparseable or unrecognized inbound frame.
    InvalidMessage,
    /// A newer connection for the same identity joined the room.
    Superseded,
    /// The client could not keep up with fan-out.
    SlowConsumer,
    /// No pong within the heartbeat window.
    HeartbeatTimeout,
}

impl CloseCode {
    /// Numeric code sent in the close frame.
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::MessageTooLarge => 1009,
            Self::InternalError => 1011,
            Self::Unauthorized => 4001,
            Self::InvalidMessage => 4002,
            Self::Superseded => 4003,
            Self::SlowConsumer => 4004,
            Self::HeartbeatTimeout => 4005,
        }
    }

    /// Human-readable reason sent in the close frame.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Normal => "normal closure",
            Self::GoingAway => "server shutting down",
            Self::MessageTooLarge => "message too large",
            Self::InternalError => "internal error",
            Self::Unauthorized => "unauthorized",
            Self::InvalidMessage => "invalid message",
            Self::Superseded => "session superseded by reconnect",
            Self::SlowConsumer => "client too slow",
            Self::HeartbeatTimeout => "heartbeat timeout",
        }
    }

    /// Reverse of [`CloseCode::code`].
    pub fn from_code(code: u16) -> Option<Self> {
        [
            Self::Normal,
            Self::GoingAway,
            Self::MessageTooLarge,
            Self::InternalError,
            Self::Unauthorized,
            Self::InvalidMessage,
            Self::Superseded,
            Self::SlowConsumer,
            Self::HeartbeatTimeout,
        ]
        .into_iter()
        .find(|c| c.code() == code)
    }
}

/// A frame sent by a client.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    /// Chat line for the room.
    Chat {
        /// Message text.
        text: String,
    },
    /// Display name change.
    Name {
        /// New display name.
        name: String,
    },
}

impl InboundMessage {
    /// Size-check, parse, and validate a text frame.
    ///
    /// The returned message carries trimmed `text`/`name` values.
    pub fn parse(payload: &str, limit: usize) -> Result<Self, MessageError> {
        if payload.len() > limit {
            return Err(MessageError::TooLarge {
                size: payload.len(),
                limit,
            });
        }
        let message: Self = serde_json::from_str(payload)
            .map_err(|e| MessageError::InvalidFormat(e.to_string()))?;
        match message {
            Self::Chat { text } => Ok(Self::Chat {
                text: non_empty_trimmed(&text, "text")?,
            }),
            Self::Name { name } => Ok(Self::Name {
                name: non_empty_trimmed(&name, "name")?,
            }),
        }
    }
}

fn non_empty_trimmed(value: &str, field: &str) -> Result<String, MessageError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(MessageError::InvalidFormat(format!("{field} is empty")));
    }
    Ok(trimmed.to_owned())
}

/// An event broadcast to every member of a room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum RoomEvent {
    /// A chat line.
    Chat {
        /// Sender identity.
        identity: String,
        /// Sender display name at publish time.
        display_name: String,
        /// Message text.
        text: String,
        /// RFC 3339 publish time.
        time: String,
        /// Room decision component.
        decision_id: String,
        /// Room vertical component.
        vertical_key: String,
    },
    /// A display name change.
    Name {
        /// Identity that changed its name.
        identity: String,
        /// New display name.
        name: String,
        /// RFC 3339 publish time.
        time: String,
        /// Room decision component.
        decision_id: String,
        /// Room vertical component.
        vertical_key: String,
    },
}

impl RoomEvent {
    /// Build a chat event stamped with the current time.
    pub fn chat(scope: &RoomScope, identity: &str, display_name: &str, text: &str) -> Self {
        Self::Chat {
            identity: identity.to_owned(),
            display_name: display_name.to_owned(),
            text: text.to_owned(),
            time: now_rfc3339(),
            decision_id: scope.decision_id.clone(),
            vertical_key: scope.vertical_key.clone(),
        }
    }

    /// Build a name-change event stamped with the current time.
    pub fn name(scope: &RoomScope, identity: &str, name: &str) -> Self {
        Self::Name {
            identity: identity.to_owned(),
            name: name.to_owned(),
            time: now_rfc3339(),
            decision_id: scope.decision_id.clone(),
            vertical_key: scope.vertical_key.clone(),
        }
    }

    /// Event type label (`"chat"` / `"name"`).
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Chat { .. } => "chat",
            Self::Name { .. } => "name",
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// What the (external) token-issuance endpoint hands a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    /// Hex HMAC over `decision:vertical:identity`.
    pub token: String,
    /// Identity the token is bound to.
    pub identity: String,
    /// Initial display name.
    pub display_name: String,
    /// WebSocket URL to connect to.
    pub connection_endpoint_url: String,
    /// Ready-to-send first sub-protocol entry.
    pub subprotocol: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn scope() -> RoomScope {
        RoomScope::new("dec", "vert").unwrap()
    }

    #[test]
    fn close_codes_are_distinct() {
        let codes = [
            CloseCode::Normal,
            CloseCode::GoingAway,
            CloseCode::MessageTooLarge,
            CloseCode::InternalError,
            CloseCode::Unauthorized,
            CloseCode::InvalidMessage,
            CloseCode::Superseded,
            CloseCode::SlowConsumer,
            CloseCode::HeartbeatTimeout,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a.code(), b.code(), "{a:?} and {b:?} share a code");
            }
            assert_eq!(CloseCode::from_code(a.code()), Some(*a));
        }
        assert_eq!(CloseCode::from_code(1234), None);
    }

    #[test]
    fn parse_chat() {
        let msg = InboundMessage::parse(r#"{"type":"chat","text":"hello"}"#, MAX_MESSAGE_BYTES);
        assert_eq!(msg, Ok(InboundMessage::Chat { text: "hello".into() }));
    }

    #[test]
    fn parse_name_trims() {
        let msg = InboundMessage::parse(r#"{"type":"name","name":"  Alice  "}"#, MAX_MESSAGE_BYTES);
        assert_eq!(msg, Ok(InboundMessage::Name { name: "Alice".into() }));
    }

    #[test]
    fn parse_rejects_unknown_type() {
        assert_matches!(
            InboundMessage::parse(r#"{"type":"bogus"}"#, MAX_MESSAGE_BYTES),
            Err(MessageError::InvalidFormat(_))
        );
    }

    #[test]
    fn parse_rejects_non_json() {
        assert_matches!(
            InboundMessage::parse("not json at all", MAX_MESSAGE_BYTES),
            Err(MessageError::InvalidFormat(_))
        );
    }

    #[test]
    fn parse_rejects_wrong_field_type() {
        assert_matches!(
            InboundMessage::parse(r#"{"type":"chat","text":42}"#, MAX_MESSAGE_BYTES),
            Err(MessageError::InvalidFormat(_))
        );
        assert_matches!(
            InboundMessage::parse(r#"{"type":"name"}"#, MAX_MESSAGE_BYTES),
            Err(MessageError::InvalidFormat(_))
        );
    }

    #[test]
    fn parse_rejects_blank_text_and_name() {
        assert_matches!(
            InboundMessage::parse(r#"{"type":"chat","text":"   "}"#, MAX_MESSAGE_BYTES),
            Err(MessageError::InvalidFormat(_))
        );
        assert_matches!(
            InboundMessage::parse(r#"{"type":"name","name":""}"#, MAX_MESSAGE_BYTES),
            Err(MessageError::InvalidFormat(_))
        );
    }

    fn chat_payload_of_len(len: usize) -> String {
        let overhead = r#"{"type":"chat","text":""}"#.len();
        format!(r#"{{"type":"chat","text":"{}"}}"#, "x".repeat(len - overhead))
    }

    #[test]
    fn size_limit_is_inclusive() {
        let exact = chat_payload_of_len(MAX_MESSAGE_BYTES);
        assert_eq!(exact.len(), 10_240);
        assert!(InboundMessage::parse(&exact, MAX_MESSAGE_BYTES).is_ok());

        let over = chat_payload_of_len(MAX_MESSAGE_BYTES + 1);
        assert_eq!(
            InboundMessage::parse(&over, MAX_MESSAGE_BYTES),
            Err(MessageError::TooLarge { size: 10_241, limit: 10_240 })
        );
    }

    #[test]
    fn size_check_runs_before_parsing() {
        let junk = "x".repeat(MAX_MESSAGE_BYTES + 1);
        assert_matches!(
            InboundMessage::parse(&junk, MAX_MESSAGE_BYTES),
            Err(MessageError::TooLarge { .. })
        );
    }

    #[test]
    fn chat_event_wire_shape() {
        let event = RoomEvent::chat(&scope(), "u1", "Alice", "hi");
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "chat");
        assert_eq!(json["identity"], "u1");
        assert_eq!(json["displayName"], "Alice");
        assert_eq!(json["text"], "hi");
        assert_eq!(json["decisionId"], "dec");
        assert_eq!(json["verticalKey"], "vert");
        let time = json["time"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(time).is_ok());
    }

    #[test]
    fn name_event_wire_shape() {
        let event = RoomEvent::name(&scope(), "u1", "Alice");
        assert_eq!(event.event_type(), "name");
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "name");
        assert_eq!(json["name"], "Alice");
        assert!(json.get("displayName").is_none());
    }

    #[test]
    fn token_grant_is_camel_case() {
        let grant = TokenGrant {
            token: "ab".into(),
            identity: "u1".into(),
            display_name: "User".into(),
            connection_endpoint_url: "ws://localhost/ws".into(),
            subprotocol: "ZDp2OnUxOmFi".into(),
        };
        let json = serde_json::to_value(&grant).unwrap();
        assert_eq!(json["displayName"], "User");
        assert_eq!(json["connectionEndpointUrl"], "ws://localhost/ws");
    }
}
