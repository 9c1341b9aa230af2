//! # roomchat-server
//!
//! Axum HTTP + `WebSocket` relay for per-room chat.
//!
//! - `GET /ws`: token-verified upgrade into a room session
//! - Per-room registries with single-session-per-identity and fan-out publish
//! - `GET /health` and `GET /metrics`
//! - Idle-room retirement and graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;
