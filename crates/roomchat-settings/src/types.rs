//! Settings types.
//!
//! Field names are camelCase on disk (`maxMessageBytes`, `tokenSecret`).

use roomchat_core::logging::LogFormat;
use roomchat_core::protocol::{DEFAULT_SUBPROTOCOL, MAX_MESSAGE_BYTES};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoomchatSettings {
    /// HTTP / WebSocket server.
    pub server: ServerSettings,
    /// Handshake token verification.
    pub auth: AuthSettings,
    /// Logging.
    pub logging: LoggingSettings,
}

impl RoomchatSettings {
    /// Reject settings the server cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.auth.token_secret.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "auth.tokenSecret must be set (or ROOMCHAT_TOKEN_SECRET)".into(),
            ));
        }
        if self.server.max_message_bytes == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxMessageBytes must be positive".into(),
            ));
        }
        if self.server.max_frame_bytes <= self.server.max_message_bytes {
            return Err(SettingsError::InvalidValue(
                "server.maxFrameBytes must exceed server.maxMessageBytes".into(),
            ));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be positive".into(),
            ));
        }
        if self.server.subprotocol.trim().is_empty() || self.server.subprotocol.contains(',') {
            return Err(SettingsError::InvalidValue(
                "server.subprotocol must be a single non-empty token".into(),
            ));
        }
        Ok(())
    }
}

/// Server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` auto-assigns).
    pub port: u16,
    /// Sub-protocol literal echoed on a successful handshake.
    pub subprotocol: String,
    /// Ceiling for one application message.
    pub max_message_bytes: usize,
    /// Transport-level frame ceiling; must exceed `max_message_bytes` so
    /// oversized messages reach the relay and get a proper close code.
    pub max_frame_bytes: usize,
    /// Outbound queue length per connection before it counts as slow.
    pub send_queue_capacity: usize,
    /// Upper bound for a single socket write.
    pub send_timeout_ms: u64,
    /// Interval between server pings.
    pub heartbeat_interval_secs: u64,
    /// Silence after which a connection is dropped.
    pub heartbeat_timeout_secs: u64,
    /// How long an empty room lingers before it is retired.
    pub room_idle_secs: u64,
    /// How often the idle-room sweeper runs.
    pub sweep_interval_secs: u64,
    /// Deliver a sender's own chat/name events back to it. When off (the
    /// default), events fan out to every other member only.
    pub echo_to_sender: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            subprotocol: DEFAULT_SUBPROTOCOL.into(),
            max_message_bytes: MAX_MESSAGE_BYTES,
            max_frame_bytes: 64 * 1024,
            send_queue_capacity: 256,
            send_timeout_ms: 5_000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            room_idle_secs: 300,
            sweep_interval_secs: 60,
            echo_to_sender: false,
        }
    }
}

/// Handshake token settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthSettings {
    /// Shared HMAC secret. Never serialized back out.
    #[serde(skip_serializing)]
    pub token_secret: String,
    /// Public WebSocket URL advertised in issued token grants.
    pub public_url: Option<String>,
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSettings {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Compact,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn valid() -> RoomchatSettings {
        let mut settings = RoomchatSettings::default();
        settings.auth.token_secret = "s3cret".into();
        settings
    }

    #[test]
    fn defaults() {
        let settings = RoomchatSettings::default();
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.subprotocol, "chat");
        assert_eq!(settings.server.max_message_bytes, 10_240);
        assert!(!settings.server.echo_to_sender);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn validate_requires_secret() {
        assert_matches!(
            RoomchatSettings::default().validate(),
            Err(SettingsError::InvalidValue(_))
        );
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_frame_must_exceed_message_limit() {
        let mut settings = valid();
        settings.server.max_frame_bytes = settings.server.max_message_bytes;
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn validate_rejects_list_subprotocol() {
        let mut settings = valid();
        settings.server.subprotocol = "chat, v2".into();
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn secret_is_not_serialized() {
        let json = serde_json::to_value(valid()).unwrap();
        assert!(json["auth"].get("tokenSecret").is_none());
    }

    #[test]
    fn camel_case_on_disk() {
        let json = serde_json::to_value(RoomchatSettings::default()).unwrap();
        assert_eq!(json["server"]["maxMessageBytes"], 10_240);
        assert_eq!(json["server"]["echoToSender"], false);
        assert_eq!(json["logging"]["format"], "compact");
    }
}
