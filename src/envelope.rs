//! Wire envelope exchanged with clients.
//!
//! Every outbound message is a JSON object tagged by its `message` field:
//!
//! ```text
//! {"message": "image", "data": "<base64 JPEG>"}
//! {"message": "echo",  "data": <value>}
//! {"message": "error", "error": "<description>"}
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

/// Error text sent back when an inbound message is not valid JSON.
pub const INVALID_JSON: &str = "Invalid JSON";

/// Tagged outbound payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "message", rename_all = "lowercase")]
pub enum Envelope {
    /// One camera frame, base64-encoded JPEG.
    Image { data: String },
    /// The value parsed from the client's own message.
    Echo { data: Value },
    /// Human-readable error for the client.
    Error { error: String },
}

impl Envelope {
    /// Wrap encoded JPEG bytes in an image envelope.
    pub fn image(jpeg: &[u8]) -> Self {
        Envelope::Image {
            data: STANDARD.encode(jpeg),
        }
    }

    pub fn echo(data: Value) -> Self {
        Envelope::Echo { data }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Envelope::Error {
            error: error.into(),
        }
    }

    /// Kind tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Image { .. } => "image",
            Envelope::Echo { .. } => "echo",
            Envelope::Error { .. } => "error",
        }
    }

    /// Serialize into a WebSocket text message.
    pub fn to_message(&self) -> Result<Message, serde_json::Error> {
        Ok(Message::text(serde_json::to_string(self)?))
    }
}
