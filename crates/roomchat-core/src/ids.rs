//! ID newtypes.
//!
//! [`ConnectionId`] is generated by the server for every accepted socket and
//! is the registry's map key. [`RoomKey`] is derived, never generated: two
//! clients naming the same decision and vertical always land in the same room.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::HandshakeError;

/// Separator between the decision and vertical components of a [`RoomKey`].
pub const ROOM_KEY_SEPARATOR: &str = "__";

/// Unique identifier for one live connection (UUID v7, time-ordered).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a new random ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Create from an existing string value.
    #[must_use]
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of the fan-out scope: `"{decision_id}__{vertical_key}"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    /// Derive the key for a decision/vertical pair.
    ///
    /// Components must be non-empty, must not contain
    /// [`ROOM_KEY_SEPARATOR`] and must not start or end with `_`; together
    /// these keep the separator run unique so no two pairs share a key.
    pub fn derive(decision_id: &str, vertical_key: &str) -> Result<Self, HandshakeError> {
        for (field, value) in [("decisionId", decision_id), ("verticalKey", vertical_key)] {
            if value.is_empty() {
                return Err(HandshakeError::Malformed(format!("{field} is empty")));
            }
            if value.contains(ROOM_KEY_SEPARATOR)
                || value.starts_with('_')
                || value.ends_with('_')
            {
                return Err(HandshakeError::Malformed(format!(
                    "{field} collides with reserved separator {ROOM_KEY_SEPARATOR:?}"
                )));
            }
        }
        Ok(Self(format!("{decision_id}{ROOM_KEY_SEPARATOR}{vertical_key}")))
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A room key together with the components it was derived from.
///
/// Outbound events carry the components so clients can scope them without
/// parsing the key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoomScope {
    /// Derived key.
    pub key: RoomKey,
    /// Decision identifier component.
    pub decision_id: String,
    /// Vertical key component.
    pub vertical_key: String,
}

impl RoomScope {
    /// Build a scope, deriving its key.
    pub fn new(decision_id: &str, vertical_key: &str) -> Result<Self, HandshakeError> {
        Ok(Self {
            key: RoomKey::derive(decision_id, vertical_key)?,
            decision_id: decision_id.to_owned(),
            vertical_key: vertical_key.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn connection_id_display_matches_inner() {
        let id = ConnectionId::from_string("conn_1".into());
        assert_eq!(id.to_string(), "conn_1");
        assert_eq!(id.as_str(), "conn_1");
    }

    #[test]
    fn room_key_format() {
        let key = RoomKey::derive("D1", "V1").unwrap();
        assert_eq!(key.as_str(), "D1__V1");
    }

    #[test]
    fn room_key_is_not_ambiguous() {
        assert_ne!(
            RoomKey::derive("a", "bc").unwrap(),
            RoomKey::derive("ab", "c").unwrap()
        );
        assert_ne!(
            RoomKey::derive("D1", "V1").unwrap(),
            RoomKey::derive("D1V", "1").unwrap()
        );
    }

    #[test]
    fn room_key_rejects_separator_in_component() {
        assert_matches!(
            RoomKey::derive("a__b", "c"),
            Err(HandshakeError::Malformed(_))
        );
        assert_matches!(
            RoomKey::derive("a", "b__c"),
            Err(HandshakeError::Malformed(_))
        );
    }

    #[test]
    fn room_key_rejects_edge_underscores() {
        // "x_" + "y" and "x" + "_y" would both render as "x___y"
        assert_matches!(RoomKey::derive("x_", "y"), Err(HandshakeError::Malformed(_)));
        assert_matches!(RoomKey::derive("x", "_y"), Err(HandshakeError::Malformed(_)));
        assert!(RoomKey::derive("x_1", "y_2").is_ok());
    }

    #[test]
    fn room_key_rejects_empty_component() {
        assert_matches!(RoomKey::derive("", "v"), Err(HandshakeError::Malformed(_)));
        assert_matches!(RoomKey::derive("d", ""), Err(HandshakeError::Malformed(_)));
    }

    #[test]
    fn scope_keeps_components() {
        let scope = RoomScope::new("dec", "vert").unwrap();
        assert_eq!(scope.key.as_str(), "dec__vert");
        assert_eq!(scope.decision_id, "dec");
        assert_eq!(scope.vertical_key, "vert");
    }

    #[test]
    fn room_key_serializes_as_plain_string() {
        let key = RoomKey::derive("d", "v").unwrap();
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"d__v\"");
    }
}
