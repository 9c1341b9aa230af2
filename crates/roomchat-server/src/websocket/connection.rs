//! WebSocket client connection handle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::Utf8Bytes;
use parking_lot::Mutex;
use roomchat_core::ids::ConnectionId;
use roomchat_core::protocol::CloseCode;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Why an enqueue to a connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// Outbound queue is full; the client is not keeping up.
    Full,
    /// The writer is gone or the connection is already closing.
    Closed,
}

impl SendFailure {
    /// Close code to retire a connection with after this failure.
    pub fn close_code(self) -> CloseCode {
        match self {
            Self::Full => CloseCode::SlowConsumer,
            Self::Closed => CloseCode::Normal,
        }
    }
}

/// One live client connection, shared between its session task and the
/// room registry.
///
/// Sends never block: text is queued with `try_send` on a bounded channel
/// drained by the session's writer task. Queued frames share the buffer the
/// room serialized them into.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Send channel to the client's WebSocket write task.
    tx: mpsc::Sender<Utf8Bytes>,
    /// Fired once when the connection must stop.
    close_token: CancellationToken,
    /// First close code requested; later requests are ignored.
    close_code: Mutex<Option<CloseCode>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has responded to the last ping.
    is_alive: AtomicBool,
    /// When the last Pong (or any activity) was received.
    last_pong: Mutex<Instant>,
    /// Count of messages dropped due to a full or closed channel.
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Utf8Bytes>) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            close_token: CancellationToken::new(),
            close_code: Mutex::new(None),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue a serialized frame for the client.
    pub fn send(&self, message: Utf8Bytes) -> Result<(), SendFailure> {
        if self.is_closed() {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            return Err(SendFailure::Closed);
        }
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(match err {
                    TrySendError::Full(_) => SendFailure::Full,
                    TrySendError::Closed(_) => SendFailure::Closed,
                })
            }
        }
    }

    /// Request closure with `code`.
    ///
    /// Returns `true` if this call decided the close code.
    pub fn close(&self, code: CloseCode) -> bool {
        let decided = {
            let mut slot = self.close_code.lock();
            if slot.is_some() {
                false
            } else {
                *slot = Some(code);
                true
            }
        };
        self.close_token.cancel();
        decided
    }

    /// Close code requested so far, if any.
    pub fn close_code(&self) -> Option<CloseCode> {
        *self.close_code.lock()
    }

    /// Whether closure has been requested.
    pub fn is_closed(&self) -> bool {
        self.close_token.is_cancelled()
    }

    /// Resolves once closure has been requested.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.close_token.cancelled()
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong or frame received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
