//! Server configuration.

use std::time::Duration;

use roomchat_core::protocol::{DEFAULT_SUBPROTOCOL, MAX_MESSAGE_BYTES};
use roomchat_settings::ServerSettings;
use serde::{Deserialize, Serialize};

/// Runtime configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Sub-protocol literal echoed on a successful handshake.
    pub subprotocol: String,
    /// Ceiling for one application message in bytes.
    pub max_message_bytes: usize,
    /// Transport-level frame ceiling in bytes.
    pub max_frame_bytes: usize,
    /// Per-connection outbound queue length.
    pub send_queue_capacity: usize,
    /// Upper bound for one socket write in milliseconds.
    pub send_timeout_ms: u64,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Silence in seconds after which a connection is closed.
    pub heartbeat_timeout_secs: u64,
    /// Seconds an empty room lingers before retirement.
    pub room_idle_secs: u64,
    /// Seconds between idle-room sweeps.
    pub sweep_interval_secs: u64,
    /// Whether senders receive their own events. Off by default, so a
    /// message reaches every other member of the room.
    pub echo_to_sender: bool,
}

impl ServerConfig {
    /// Socket write timeout.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Ping cadence. Never zero, so the interval timer is valid.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Silence allowed before a heartbeat close.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Idle window before an empty room is retired.
    pub fn room_idle(&self) -> Duration {
        Duration::from_secs(self.room_idle_secs)
    }

    /// Sweeper cadence. Never zero.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// `host:port` bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
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

impl From<&ServerSettings> for ServerConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            subprotocol: s.subprotocol.trim().to_owned(),
            max_message_bytes: s.max_message_bytes,
            max_frame_bytes: s.max_frame_bytes,
            send_queue_capacity: s.send_queue_capacity,
            send_timeout_ms: s.send_timeout_ms,
            heartbeat_interval_secs: s.heartbeat_interval_secs,
            heartbeat_timeout_secs: s.heartbeat_timeout_secs,
            room_idle_secs: s.room_idle_secs,
            sweep_interval_secs: s.sweep_interval_secs,
            echo_to_sender: s.echo_to_sender,
        }
    }
}
