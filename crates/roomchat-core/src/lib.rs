//! # roomchat-core
//!
//! Foundation types shared by every roomchat crate.
//!
//! - **IDs**: [`ids::ConnectionId`] (server-generated, UUID v7) and
//!   [`ids::RoomKey`] (derived from a decision/vertical pair)
//! - **Auth**: HMAC-SHA256 token verification and sub-protocol handshake decoding
//! - **Protocol**: inbound/outbound JSON frames and close codes
//! - **Errors**: handshake, registry, and message error enums via `thiserror`
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod auth;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;
