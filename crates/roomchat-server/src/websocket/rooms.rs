//! Room-keyed store of registries, plus the idle-room sweeper.
//!
//! Registries are created lazily on first admission and retired once they
//! have been empty for the configured idle window. An admission that races
//! a retirement sees [`RegistryError::Retired`], drops the stale entry and
//! retries on a fresh registry.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::gauge;
use roomchat_core::errors::RegistryError;
use roomchat_core::ids::{RoomKey, RoomScope};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::connection::ClientConnection;
use super::registry::{ConnectionMetadata, RoomRegistry};
use crate::metrics::ROOMS_ACTIVE;

/// Admission attempts before a persistent retirement race is reported.
const MAX_ADMIT_ATTEMPTS: usize = 3;

/// All live room registries, sharded by key.
#[derive(Default)]
pub struct RoomStore {
    rooms: DashMap<RoomKey, Arc<RoomRegistry>>,
}

impl RoomStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry for `scope`, created if absent.
    pub fn get_or_create(&self, scope: &RoomScope) -> Arc<RoomRegistry> {
        let room = self
            .rooms
            .entry(scope.key.clone())
            .or_insert_with(|| {
                debug!(room = %scope.key, "room created");
                Arc::new(RoomRegistry::new(scope.clone()))
            })
            .clone();
        self.record_gauge();
        room
    }

    /// The registry for `key`, if one is live.
    pub fn get(&self, key: &RoomKey) -> Option<Arc<RoomRegistry>> {
        self.rooms.get(key).map(|r| Arc::clone(r.value()))
    }

    /// Register `connection` in its room, creating the room if needed.
    ///
    /// Returns the registry the connection now belongs to, together with the
    /// metadata the registry assigned.
    pub async fn admit(
        &self,
        scope: &RoomScope,
        connection: Arc<ClientConnection>,
        identity: &str,
    ) -> Result<(Arc<RoomRegistry>, ConnectionMetadata), RegistryError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let room = self.get_or_create(scope);
            match room.register(Arc::clone(&connection), identity).await {
                Ok(metadata) => return Ok((room, metadata)),
                Err(RegistryError::Retired(key)) if attempts < MAX_ADMIT_ATTEMPTS => {
                    debug!(room = %key, attempts, "room retired during admission, retrying");
                    self.forget(&room);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Retire and drop every room that has been empty for `idle`.
    ///
    /// Returns how many rooms were removed.
    pub async fn sweep(&self, idle: Duration) -> usize {
        // Snapshot first: no shard guard may be held across an await.
        let snapshot: Vec<Arc<RoomRegistry>> =
            self.rooms.iter().map(|r| Arc::clone(r.value())).collect();
        let mut removed = 0;
        for room in snapshot {
            if room.try_retire(idle).await && self.forget(&room) {
                removed += 1;
            }
        }
        self.record_gauge();
        removed
    }

    /// Run [`RoomStore::sweep`] every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        idle: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the immediate first tick
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.sweep(idle).await;
                        if removed > 0 {
                            info!(removed, remaining = self.room_count(), "idle rooms retired");
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
            debug!("room sweeper stopped");
        })
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Registered connections across all rooms.
    pub fn connection_count(&self) -> usize {
        self.rooms.iter().map(|r| r.value().count()).sum()
    }

    /// Remove `room` only if it is still the registry mapped under its key.
    fn forget(&self, room: &Arc<RoomRegistry>) -> bool {
        let removed = self
            .rooms
            .remove_if(room.key(), |_, current| Arc::ptr_eq(current, room))
            .is_some();
        if removed {
            self.record_gauge();
        }
        removed
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_gauge(&self) {
        gauge!(ROOMS_ACTIVE).set(self.rooms.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Utf8Bytes;
    use roomchat_core::ids::ConnectionId;
    use tokio::sync::mpsc;

    fn make_connection() -> (Arc<ClientConnection>, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(ClientConnection::new(ConnectionId::new(), tx)), rx)
    }

    fn scope(d: &str, v: &str) -> RoomScope {
        RoomScope::new(d, v).unwrap()
    }

    #[tokio::test]
    async fn admit_creates_room_lazily() {
        let store = RoomStore::new();
        assert_eq!(store.room_count(), 0);
        let (conn, _rx) = make_connection();
        let (room, meta) = store.admit(&scope("d", "v"), conn, "alice").await.unwrap();
        assert_eq!(store.room_count(), 1);
        assert_eq!(store.connection_count(), 1);
        assert_eq!(&meta.room, room.key());
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let store = RoomStore::new();
        let (a, _ra) = make_connection();
        let (b, _rb) = make_connection();
        let (room_a, _) = store.admit(&scope("d", "one"), a, "alice").await.unwrap();
        let (room_b, _) = store.admit(&scope("d", "two"), b, "alice").await.unwrap();
        assert!(!Arc::ptr_eq(&room_a, &room_b));
        assert_eq!(room_a.count(), 1);
        assert_eq!(room_b.count(), 1);
        assert_eq!(store.room_count(), 2);
    }

    #[tokio::test]
    async fn same_scope_shares_registry() {
        let store = RoomStore::new();
        let s = scope("d", "v");
        let first = store.get_or_create(&s);
        let second = store.get_or_create(&s);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(store.get(&s.key).is_some());
    }

    #[tokio::test]
    async fn sweep_keeps_occupied_rooms() {
        let store = RoomStore::new();
        let (conn, _rx) = make_connection();
        let _ = store.admit(&scope("d", "v"), conn, "alice").await.unwrap();
        assert_eq!(store.sweep(Duration::ZERO).await, 0);
        assert_eq!(store.room_count(), 1);
    }

    #[tokio::test]
    async fn sweep_removes_empty_idle_rooms() {
        let store = RoomStore::new();
        let s = scope("d", "v");
        let (conn, _rx) = make_connection();
        let (room, _) = store.admit(&s, conn.clone(), "alice").await.unwrap();
        let _ = room.deregister(&conn.id).await;

        assert_eq!(store.sweep(Duration::from_secs(3600)).await, 0);
        assert_eq!(store.sweep(Duration::ZERO).await, 1);
        assert_eq!(store.room_count(), 0);
    }

    #[tokio::test]
    async fn admit_retries_after_retirement() {
        let store = RoomStore::new();
        let s = scope("d", "v");
        let stale = store.get_or_create(&s);
        assert!(stale.try_retire(Duration::ZERO).await);

        let (conn, _rx) = make_connection();
        let (room, _) = store.admit(&s, conn, "alice").await.unwrap();
        assert!(!Arc::ptr_eq(&room, &stale));
        assert_eq!(room.count(), 1);
        assert_eq!(store.room_count(), 1);
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let store = Arc::new(RoomStore::new());
        let cancel = CancellationToken::new();
        let handle = store
            .clone()
            .spawn_sweeper(Duration::from_millis(10), Duration::ZERO, cancel.clone());
        let _ = store.get_or_create(&scope("d", "v"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.room_count(), 0);
        cancel.cancel();
        handle.await.unwrap();
    }
}
