//! Per-room connection registry and fan-out.
//!
//! One [`RoomRegistry`] holds every live connection of one room. All
//! mutations and the write-out phase of [`RoomRegistry::publish`] run under
//! the room's mutex, so:
//!
//! - two registrations for the same identity cannot both miss each other
//!   (single session per identity),
//! - two publishes never interleave their per-recipient sends, which gives
//!   every recipient the publisher's order,
//! - a deregistration either happens entirely before a publish enumerates
//!   recipients or entirely after it.
//!
//! Sends are `try_send` on bounded queues, so holding the lock across the
//! fan-out never waits on a slow client.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::Utf8Bytes;
use metrics::counter;
use roomchat_core::errors::RegistryError;
use roomchat_core::ids::{ConnectionId, RoomKey, RoomScope};
use roomchat_core::protocol::{CloseCode, RoomEvent};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::connection::ClientConnection;
use crate::metrics::{
    ROOM_FANOUT_FAILURES_TOTAL, ROOM_MESSAGES_PUBLISHED_TOTAL, ROOM_SUPERSESSIONS_TOTAL,
};

/// Per-connection state owned by the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetadata {
    /// Room the connection belongs to (always the registry's own key).
    pub room: RoomKey,
    /// Verified principal from the handshake token.
    pub identity: String,
    /// Display name; starts out equal to `identity`.
    pub display_name: String,
}

/// Outcome counts of one publish.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Recipients the event was queued for.
    pub delivered: usize,
    /// Recipients that failed and were dropped from the room.
    pub failed: usize,
}

struct Member {
    connection: Arc<ClientConnection>,
    metadata: ConnectionMetadata,
}

struct RoomState {
    members: HashMap<ConnectionId, Member>,
    /// Set by the idle sweeper; a retired registry accepts no new members.
    retired: bool,
    /// When the room last became empty.
    empty_since: Option<Instant>,
}

/// Live connections of a single room.
pub struct RoomRegistry {
    scope: RoomScope,
    state: Mutex<RoomState>,
    /// Mirror of `members.len()` readable without the lock.
    active_count: AtomicUsize,
}

impl RoomRegistry {
    /// Create an empty registry for `scope`.
    pub fn new(scope: RoomScope) -> Self {
        Self {
            scope,
            state: Mutex::new(RoomState {
                members: HashMap::new(),
                retired: false,
                empty_since: Some(Instant::now()),
            }),
            active_count: AtomicUsize::new(0),
        }
    }

    /// The room this registry serves.
    pub fn scope(&self) -> &RoomScope {
        &self.scope
    }

    /// The room key.
    pub fn key(&self) -> &RoomKey {
        &self.scope.key
    }

    /// Add a connection for `identity`.
    ///
    /// A live connection already registered for the same identity is closed
    /// with [`CloseCode::Superseded`] and removed before the new one is
    /// inserted, under the same lock.
    pub async fn register(
        &self,
        connection: Arc<ClientConnection>,
        identity: &str,
    ) -> Result<ConnectionMetadata, RegistryError> {
        let mut state = self.state.lock().await;
        if state.retired {
            return Err(RegistryError::Retired(self.scope.key.to_string()));
        }

        let stale: Vec<ConnectionId> = state
            .members
            .iter()
            .filter(|(id, m)| m.metadata.identity == identity && **id != connection.id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(previous) = state.members.remove(&id) {
                let _ = previous.connection.close(CloseCode::Superseded);
                counter!(ROOM_SUPERSESSIONS_TOTAL).increment(1);
                info!(
                    room = %self.scope.key,
                    identity,
                    superseded = %id,
                    replacement = %connection.id,
                    "superseded previous session"
                );
            }
        }

        let metadata = ConnectionMetadata {
            room: self.scope.key.clone(),
            identity: identity.to_owned(),
            display_name: identity.to_owned(),
        };
        let _ = state.members.insert(
            connection.id.clone(),
            Member {
                connection,
                metadata: metadata.clone(),
            },
        );
        state.empty_since = None;
        self.active_count.store(state.members.len(), Ordering::Relaxed);
        Ok(metadata)
    }

    /// Set the display name of a registered connection.
    ///
    /// The name is trimmed; an empty result is rejected.
    pub async fn set_display_name(
        &self,
        connection_id: &ConnectionId,
        name: &str,
    ) -> Result<ConnectionMetadata, RegistryError> {
        let mut state = self.state.lock().await;
        let member = state
            .members
            .get_mut(connection_id)
            .ok_or_else(|| RegistryError::NotRegistered(connection_id.to_string()))?;
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(RegistryError::InvalidName);
        }
        trimmed.clone_into(&mut member.metadata.display_name);
        Ok(member.metadata.clone())
    }

    /// Current metadata of a registered connection.
    pub async fn metadata(&self, connection_id: &ConnectionId) -> Option<ConnectionMetadata> {
        let state = self.state.lock().await;
        state.members.get(connection_id).map(|m| m.metadata.clone())
    }

    /// Fan an event out to every member.
    ///
    /// With `exclude_self`, `source` is skipped. A recipient whose queue is
    /// full or closed is closed and removed; the failure is counted in the
    /// report and never surfaces to the caller.
    pub async fn publish(
        &self,
        event: &RoomEvent,
        exclude_self: bool,
        source: Option<&ConnectionId>,
    ) -> DeliveryReport {
        let json = match serde_json::to_string(event) {
            Ok(j) => Utf8Bytes::from(j),
            Err(e) => {
                warn!(event_type = event.event_type(), error = %e, "failed to serialize event");
                return DeliveryReport::default();
            }
        };

        let mut report = DeliveryReport::default();
        let mut state = self.state.lock().await;
        let mut failed = Vec::new();
        for (id, member) in &state.members {
            if exclude_self && source == Some(id) {
                continue;
            }
            match member.connection.send(json.clone()) {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    report.failed += 1;
                    failed.push((id.clone(), failure));
                }
            }
        }

        for (id, failure) in failed {
            if let Some(member) = state.members.remove(&id) {
                let _ = member.connection.close(failure.close_code());
                counter!(ROOM_FANOUT_FAILURES_TOTAL).increment(1);
                warn!(
                    room = %self.scope.key,
                    conn_id = %id,
                    ?failure,
                    dropped = member.connection.drop_count(),
                    "dropping recipient after failed send"
                );
            }
        }
        if state.members.is_empty() && state.empty_since.is_none() {
            state.empty_since = Some(Instant::now());
        }
        self.active_count.store(state.members.len(), Ordering::Relaxed);
        drop(state);

        counter!(ROOM_MESSAGES_PUBLISHED_TOTAL).increment(1);
        debug!(
            room = %self.scope.key,
            event_type = event.event_type(),
            delivered = report.delivered,
            failed = report.failed,
            "published event"
        );
        report
    }

    /// Remove a connection. Idempotent: returns `None` if already gone.
    pub async fn deregister(&self, connection_id: &ConnectionId) -> Option<ConnectionMetadata> {
        let mut state = self.state.lock().await;
        let removed = state.members.remove(connection_id)?;
        if state.members.is_empty() {
            state.empty_since = Some(Instant::now());
        }
        self.active_count.store(state.members.len(), Ordering::Relaxed);
        Some(removed.metadata)
    }

    /// Number of registered connections.
    pub fn count(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    /// Retire the room if it has been empty for at least `idle`.
    ///
    /// Once retired, [`RoomRegistry::register`] fails with
    /// [`RegistryError::Retired`] and the caller must use a fresh registry.
    pub async fn try_retire(&self, idle: Duration) -> bool {
        let mut state = self.state.lock().await;
        if state.retired {
            return true;
        }
        let expired = state.members.is_empty()
            && state.empty_since.is_some_and(|since| since.elapsed() >= idle);
        if expired {
            state.retired = true;
        }
        expired
    }

    /// Whether the sweeper has retired this registry.
    pub async fn is_retired(&self) -> bool {
        self.state.lock().await.retired
    }
}
