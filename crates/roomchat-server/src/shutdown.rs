//! Relay shutdown sequencing.
//!
//! A single `CancellationToken` reaches the listener, every session's reader
//! loop, and the idle-room sweeper. Stopping then takes two waits:
//!
//! 1. [`ShutdownCoordinator::drain_sessions`]: sessions close with 1001 and
//!    leave their rooms
//! 2. [`ShutdownCoordinator::graceful_shutdown`]: server tasks are joined
//!    against one shared deadline and aborted past it

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::websocket::rooms::RoomStore;

/// Deadline for joining server tasks when the caller gives none.
const DEFAULT_TASK_DEADLINE: Duration = Duration::from_secs(10);

/// How often the session count is checked while draining.
const DRAIN_POLL: Duration = Duration::from_millis(25);

/// Result of waiting for sessions to leave their rooms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every session deregistered.
    Drained,
    /// The window closed with sessions still registered.
    TimedOut {
        /// Sessions still registered.
        remaining: usize,
    },
}

/// Owns the relay's shutdown signal.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a coordinator whose signal has not fired.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// A handle on the shutdown signal for a task to watch.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Fire the shutdown signal. Repeat calls are no-ops.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("relay shutdown requested");
            self.token.cancel();
        }
    }

    /// Whether the shutdown signal has fired.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait up to `window` for every session in `rooms` to deregister.
    pub async fn drain_sessions(&self, rooms: &RoomStore, window: Duration) -> DrainOutcome {
        let drained = tokio::time::timeout(window, async {
            while rooms.connection_count() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await;
        match drained {
            Ok(()) => {
                debug!("all sessions deregistered");
                DrainOutcome::Drained
            }
            Err(_) => {
                let remaining = rooms.connection_count();
                warn!(remaining, "sessions still open after drain window");
                DrainOutcome::TimedOut { remaining }
            }
        }
    }

    /// Fire the signal, then join `handles` before a shared deadline.
    ///
    /// Tasks unfinished at the deadline are aborted. Returns how many were.
    pub async fn graceful_shutdown(
        &self,
        handles: Vec<JoinHandle<()>>,
        deadline: Option<Duration>,
    ) -> usize {
        let deadline = deadline.unwrap_or(DEFAULT_TASK_DEADLINE);
        self.shutdown();
        info!(tasks = handles.len(), ?deadline, "joining server tasks");

        let until = Instant::now() + deadline;
        let mut aborted = 0;
        for handle in handles {
            let abort = handle.abort_handle();
            match tokio::time::timeout_at(until, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "server task failed during shutdown"),
                Err(_) => {
                    abort.abort();
                    aborted += 1;
                }
            }
        }
        if aborted > 0 {
            warn!(aborted, "aborted server tasks still running at the deadline");
        }
        aborted
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use roomchat_core::ids::{ConnectionId, RoomScope};
    use tokio::sync::mpsc;

    use super::*;
    use crate::websocket::connection::ClientConnection;

    fn connection() -> Arc<ClientConnection> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(ClientConnection::new(ConnectionId::new(), tx))
    }

    #[test]
    fn signal_starts_unfired() {
        let coord = ShutdownCoordinator::default();
        assert!(!coord.is_shutting_down());
        assert!(!coord.token().is_cancelled());
    }

    #[test]
    fn shutdown_reaches_every_token_once() {
        let coord = ShutdownCoordinator::new();
        let before = coord.token();
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(before.is_cancelled());
        assert!(coord.token().is_cancelled());
    }

    #[tokio::test]
    async fn empty_store_drains_immediately() {
        let coord = ShutdownCoordinator::new();
        let outcome = coord.drain_sessions(&RoomStore::new(), Duration::ZERO).await;
        assert_eq!(outcome, DrainOutcome::Drained);
    }

    #[tokio::test]
    async fn drain_waits_for_sessions_to_leave() {
        let coord = ShutdownCoordinator::new();
        let rooms = Arc::new(RoomStore::new());
        let conn = connection();
        let (room, _) = rooms
            .admit(&RoomScope::new("d", "v").unwrap(), Arc::clone(&conn), "alice")
            .await
            .unwrap();
        let _leaver = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = room.deregister(&conn.id).await;
        });
        let outcome = coord.drain_sessions(&rooms, Duration::from_secs(5)).await;
        assert_eq!(outcome, DrainOutcome::Drained);
        assert_eq!(rooms.connection_count(), 0);
    }

    #[tokio::test]
    async fn drain_reports_stuck_sessions() {
        let coord = ShutdownCoordinator::new();
        let rooms = RoomStore::new();
        let _ = rooms
            .admit(&RoomScope::new("d", "v").unwrap(), connection(), "alice")
            .await
            .unwrap();
        let outcome = coord.drain_sessions(&rooms, Duration::from_millis(60)).await;
        assert_eq!(outcome, DrainOutcome::TimedOut { remaining: 1 });
    }

    #[tokio::test]
    async fn graceful_shutdown_joins_cooperative_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let handle = tokio::spawn(async move { token.cancelled().await });
        assert_eq!(coord.graceful_shutdown(vec![handle], None).await, 0);
        assert!(coord.is_shutting_down());
    }

    #[tokio::test]
    async fn graceful_shutdown_aborts_stragglers() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let polite = tokio::spawn(async move { token.cancelled().await });
        let stuck = tokio::spawn(tokio::time::sleep(Duration::from_secs(300)));
        let started = std::time::Instant::now();
        let aborted = coord
            .graceful_shutdown(vec![polite, stuck], Some(Duration::from_millis(50)))
            .await;
        assert_eq!(aborted, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
