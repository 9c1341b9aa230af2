//! WebSocket admission, per-room registries, connection lifecycle, and fan-out.

pub mod connection;
pub mod handler;
pub mod handshake;
pub mod lifecycle;
pub mod registry;
pub mod rooms;
pub mod session;
