//! WebSocket session: one admitted client from upgrade through teardown.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use roomchat_core::auth::VerifiedToken;
use roomchat_core::ids::ConnectionId;
use roomchat_core::protocol::CloseCode;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::connection::ClientConnection;
use super::handler::{HandlerOptions, Subscription, handle_message};
use super::lifecycle::Lifecycle;
use super::rooms::RoomStore;
use crate::config::ServerConfig;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

/// Extra time the writer gets, beyond one send timeout, to flush its close
/// frame during teardown.
const WRITER_GRACE: Duration = Duration::from_millis(250);

/// Shared services a session needs.
#[derive(Clone)]
pub struct SessionDeps {
    /// Room registries.
    pub rooms: Arc<RoomStore>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Fires when the server shuts down.
    pub shutdown: CancellationToken,
}

/// Timing knobs for the outbound writer.
#[derive(Clone, Copy, Debug)]
struct WriterTiming {
    ping_interval: Duration,
    heartbeat_timeout: Duration,
    send_timeout: Duration,
}

#[derive(Debug)]
enum WriteFailure {
    Timeout,
    Transport,
}

impl WriteFailure {
    fn close_code(&self) -> CloseCode {
        match self {
            Self::Timeout => CloseCode::SlowConsumer,
            Self::Transport => CloseCode::Normal,
        }
    }
}

/// Run a WebSocket session for an admitted client.
///
/// 1. Registers the connection in its room (superseding any older session
///    of the same identity)
/// 2. Spawns the writer, which drains the outbound queue and pings
/// 3. Validates and dispatches inbound text frames
/// 4. On any close, deregisters exactly once and sends the close frame
#[instrument(
    skip_all,
    fields(conn_id = %connection_id, room = %verified.scope.key, identity = %verified.identity)
)]
pub async fn run_ws_session(
    ws: WebSocket,
    connection_id: ConnectionId,
    verified: VerifiedToken,
    deps: SessionDeps,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let config = deps.config;
    let timing = WriterTiming {
        ping_interval: config.heartbeat_interval(),
        heartbeat_timeout: config.heartbeat_timeout(),
        send_timeout: config.send_timeout(),
    };

    let (send_tx, send_rx) = mpsc::channel::<Utf8Bytes>(config.send_queue_capacity);
    let connection = Arc::new(ClientConnection::new(connection_id, send_tx));
    let mut lifecycle = Lifecycle::new();

    let (room, metadata) = match deps
        .rooms
        .admit(&verified.scope, Arc::clone(&connection), &verified.identity)
        .await
    {
        Ok(admitted) => admitted,
        Err(e) => {
            error!(error = %e, "room admission failed");
            let _ = write_frame(&mut ws_tx, close_frame(e.close_code()), timing.send_timeout).await;
            return;
        }
    };
    if let Err(e) = lifecycle.subscribe() {
        error!(error = %e, "lifecycle out of order after admission");
        let _ = room.deregister(&connection.id).await;
        return;
    }

    info!(display_name = %metadata.display_name, members = room.count(), "client subscribed");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let writer = tokio::spawn(run_writer(ws_tx, send_rx, Arc::clone(&connection), timing));

    let options = HandlerOptions {
        max_message_bytes: config.max_message_bytes,
        echo_to_sender: config.echo_to_sender,
    };
    let mut sub = Subscription {
        room,
        connection: Arc::clone(&connection),
        metadata,
    };

    while lifecycle.accepts_messages() {
        let frame = tokio::select! {
            biased;
            () = connection.closed() => break,
            () = deps.shutdown.cancelled() => {
                let _ = connection.close(CloseCode::GoingAway);
                break;
            }
            frame = ws_rx.next() => frame,
        };

        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                let code = read_error_close_code(e);
                debug!(code = code.code(), "inbound read failed");
                let _ = connection.close(code);
                break;
            }
            None => {
                let _ = connection.close(CloseCode::Normal);
                break;
            }
        };
        connection.mark_alive();

        match msg {
            Message::Text(text) => match handle_message(text.as_str(), &mut sub, options).await {
                Ok(report) => {
                    debug!(delivered = report.delivered, failed = report.failed, "message relayed");
                }
                Err(e) => {
                    warn!(error = %e, "closing connection after rejected message");
                    let _ = connection.close(e.close_code());
                }
            },
            Message::Binary(data) => {
                warn!(len = data.len(), "binary frames are not accepted");
                let _ = connection.close(CloseCode::InvalidMessage);
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => {
                info!("client sent close frame");
                let _ = connection.close(CloseCode::Normal);
            }
        }
    }

    // Teardown
    if lifecycle.begin_closing() && sub.room.deregister(&connection.id).await.is_none() {
        debug!("connection already removed from room");
    }
    let code = connection.close_code().unwrap_or(CloseCode::Normal);

    let writer_abort = writer.abort_handle();
    if tokio::time::timeout(timing.send_timeout + WRITER_GRACE, writer)
        .await
        .is_err()
    {
        warn!("writer did not finish in time, aborting");
        writer_abort.abort();
    }
    if let Err(e) = lifecycle.finish() {
        error!(error = %e, "lifecycle out of order at teardown");
    }

    info!(
        code = code.code(),
        reason = code.reason(),
        dropped = connection.drop_count(),
        "client disconnected"
    );
    counter!(WS_DISCONNECTIONS_TOTAL, "code" => code.code().to_string()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
}

/// Drain the outbound queue into the socket, ping on a fixed cadence, and
/// send the close frame once the connection is closed.
async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<Utf8Bytes>,
    connection: Arc<ClientConnection>,
    timing: WriterTiming,
) {
    let mut ping_interval = tokio::time::interval(timing.ping_interval);
    // Skip the immediate first tick
    let _ = ping_interval.tick().await;

    loop {
        tokio::select! {
            biased;
            () = connection.closed() => break,
            msg = queue.recv() => {
                let Some(text) = msg else { break };
                let frame = Message::Text(text);
                if let Err(failure) = write_frame(&mut sink, frame, timing.send_timeout).await {
                    debug!(?failure, "outbound write failed");
                    let _ = connection.close(failure.close_code());
                    break;
                }
            }
            _ = ping_interval.tick() => {
                // Client missed a ping cycle; check how long it has been silent
                if !connection.check_alive()
                    && connection.last_pong_elapsed() > timing.heartbeat_timeout
                {
                    warn!(
                        silent_for = ?connection.last_pong_elapsed(),
                        "client unresponsive, disconnecting"
                    );
                    let _ = connection.close(CloseCode::HeartbeatTimeout);
                    break;
                }
                let ping = Message::Ping(vec![].into());
                if let Err(failure) = write_frame(&mut sink, ping, timing.send_timeout).await {
                    let _ = connection.close(failure.close_code());
                    break;
                }
            }
        }
    }

    let _ = connection.close(CloseCode::Normal);
    let code = connection.close_code().unwrap_or(CloseCode::Normal);
    if let Err(failure) = write_frame(&mut sink, close_frame(code), timing.send_timeout).await {
        debug!(?failure, "close frame not delivered");
    }
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: Message,
    limit: Duration,
) -> Result<(), WriteFailure> {
    match tokio::time::timeout(limit, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(WriteFailure::Transport),
        Err(_) => Err(WriteFailure::Timeout),
    }
}

/// Close code for a failed inbound read. Frames over the socket's size cap
/// never reach the handler and are refused here as too large.
fn read_error_close_code(error: axum::Error) -> CloseCode {
    let inner = error.into_inner();
    match inner.downcast_ref::<tungstenite::Error>() {
        Some(tungstenite::Error::Capacity(_)) => CloseCode::MessageTooLarge,
        _ => {
            debug!(error = %inner, "transport error");
            CloseCode::Normal
        }
    }
}

fn close_frame(code: CloseCode) -> Message {
    Message::Close(Some(CloseFrame {
        code: code.code(),
        reason: Utf8Bytes::from_static(code.reason()),
    }))
}
