//! Message types for actor communication.

use crate::protocol::ServerMessage;

/// Messages sent to a `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Deliver a signaling message to the connected client.
    Send { message: ServerMessage },
}
