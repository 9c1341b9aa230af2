//! Inbound message dispatch for a subscribed connection.

use std::sync::Arc;

use roomchat_core::errors::{MessageError, RegistryError};
use roomchat_core::protocol::{CloseCode, InboundMessage, RoomEvent};
use thiserror::Error;
use tracing::{debug, instrument};

use super::connection::ClientConnection;
use super::registry::{ConnectionMetadata, DeliveryReport, RoomRegistry};

/// Why an inbound frame ended the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    /// The frame itself was rejected.
    #[error(transparent)]
    Message(#[from] MessageError),
    /// The registry refused the requested change.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl HandleError {
    /// Close code to end the connection with.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::Message(e) => e.close_code(),
            Self::Registry(e) => e.close_code(),
        }
    }
}

/// Knobs for message handling.
#[derive(Clone, Copy, Debug)]
pub struct HandlerOptions {
    /// Largest accepted payload in bytes.
    pub max_message_bytes: usize,
    /// Deliver events back to their sender.
    pub echo_to_sender: bool,
}

/// What a subscribed connection carries between frames.
pub struct Subscription {
    /// The connection's room.
    pub room: Arc<RoomRegistry>,
    /// The connection handle registered in `room`.
    pub connection: Arc<ClientConnection>,
    /// Connection-local copy of the registry metadata.
    pub metadata: ConnectionMetadata,
}

/// Handle one inbound text frame.
///
/// Validation happens before any side effect, so a rejected frame neither
/// changes metadata nor publishes.
#[instrument(skip_all, fields(event_type))]
pub async fn handle_message(
    payload: &str,
    sub: &mut Subscription,
    options: HandlerOptions,
) -> Result<DeliveryReport, HandleError> {
    let message = InboundMessage::parse(payload, options.max_message_bytes)?;
    let exclude_self = !options.echo_to_sender;

    let event = match message {
        InboundMessage::Chat { text } => RoomEvent::chat(
            sub.room.scope(),
            &sub.metadata.identity,
            &sub.metadata.display_name,
            &text,
        ),
        InboundMessage::Name { name } => {
            let updated = sub.room.set_display_name(&sub.connection.id, &name).await?;
            debug!(
                identity = %updated.identity,
                display_name = %updated.display_name,
                "display name changed"
            );
            sub.metadata = updated;
            RoomEvent::name(
                sub.room.scope(),
                &sub.metadata.identity,
                &sub.metadata.display_name,
            )
        }
    };
    let _ = tracing::Span::current().record("event_type", event.event_type());

    Ok(sub
        .room
        .publish(&event, exclude_self, Some(&sub.connection.id))
        .await)
}
