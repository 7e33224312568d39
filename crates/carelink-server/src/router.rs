//! Fans an outbound message out to every live connection of each recipient.

use crate::connection::Enqueue;
use crate::protocol::ServerFrame;
use crate::registry::ConnectionRegistry;
use carelink_types::{DeliveryOutcome, OutboundMessage, UserIdentity};
use std::collections::BTreeMap;

/// Routes messages through the connection registry.
///
/// Routing never blocks: every connection gets a single non-blocking
/// enqueue attempt, and a full queue on one device does not stop the
/// attempt on the next.
#[derive(Clone)]
pub struct MessageRouter {
    registry: ConnectionRegistry,
}

impl MessageRouter {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Offers `message` to each distinct recipient and reports what
    /// happened per recipient.
    ///
    /// `message` must already be stored: `QueuedOffline` tells the caller
    /// the recipient will read it back from the store.
    pub fn route(&self, message: &OutboundMessage) -> BTreeMap<UserIdentity, DeliveryOutcome> {
        message
            .recipients()
            .iter()
            .map(|recipient| (recipient.clone(), self.deliver(message, recipient)))
            .collect()
    }

    fn deliver(&self, message: &OutboundMessage, recipient: &UserIdentity) -> DeliveryOutcome {
        let connections = self.registry.connections_for(recipient);
        if connections.is_empty() {
            return DeliveryOutcome::QueuedOffline;
        }

        let frame = match ServerFrame::for_recipient(message, recipient).encode() {
            Ok(json) => json,
            Err(e) => {
                // Stored before routing, so it is still readable from the store.
                tracing::error!(
                    recipient = %recipient,
                    "failed to serialize outbound frame: {}",
                    e
                );
                return DeliveryOutcome::QueuedOffline;
            }
        };

        let mut accepted = 0;
        let mut full = 0;
        for conn in &connections {
            match conn.enqueue(frame.clone()) {
                Enqueue::Accepted => accepted += 1,
                Enqueue::Full => {
                    full += 1;
                    tracing::warn!(
                        recipient = %recipient,
                        connection_id = %conn.id(),
                        kind = message.payload_kind().as_str(),
                        "outbound queue full, dropping message"
                    );
                }
                Enqueue::Closed => {
                    tracing::debug!(
                        recipient = %recipient,
                        connection_id = %conn.id(),
                        "skipping connection closed after snapshot"
                    );
                }
            }
        }

        if accepted > 0 {
            DeliveryOutcome::Delivered {
                connections: accepted,
            }
        } else if full > 0 {
            DeliveryOutcome::DropFullQueue
        } else {
            DeliveryOutcome::QueuedOffline
        }
    }
}
