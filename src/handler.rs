//! Per-message handling: echo valid JSON back to its sender.

use serde_json::Value;
use tracing::{info, warn};

use crate::envelope::{Envelope, INVALID_JSON};
use crate::registry::{ClientHandle, SendError};

/// Interprets inbound client messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageHandler;

impl MessageHandler {
    pub fn new() -> Self {
        MessageHandler
    }

    /// Build the reply for one raw inbound message.
    pub fn respond(&self, raw: &[u8]) -> Envelope {
        match serde_json::from_slice::<Value>(raw) {
            Ok(data) => Envelope::echo(data),
            Err(_) => Envelope::error(INVALID_JSON),
        }
    }

    /// Handle one message from `conn`, replying to `conn` only.
    ///
    /// Malformed input is answered with an error envelope and never closes
    /// the connection. An error is returned only when the reply cannot be
    /// queued because the connection is already gone.
    pub async fn handle(&self, conn: &ClientHandle, raw: &[u8]) -> Result<(), SendError> {
        let reply = self.respond(raw);
        match &reply {
            Envelope::Echo { data } => info!(client = %conn.id(), %data, "Received"),
            _ => info!(client = %conn.id(), len = raw.len(), "Received malformed message"),
        }

        match reply.to_message() {
            Ok(msg) => conn.send(msg).await,
            Err(e) => {
                warn!(client = %conn.id(), error = %e, "Failed to serialize reply");
                Ok(())
            }
        }
    }
}
