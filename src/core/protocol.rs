/// Wire Protocol
///
/// Clients and the server exchange JSON text frames. A client frame names an
/// event, carries arbitrary data, and may carry an `id` asking for an
/// acknowledgement. The server answers with event frames and ack frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::RelayError;

/// Event names only the server may emit.
pub const RESERVED_EVENTS: &[&str] = &["connect", "disconnect", "error", "joined", "left"];

pub fn is_reserved(event: &str) -> bool {
    RESERVED_EVENTS.contains(&event)
}

/// Check the name of an event about to be relayed to other clients and
/// return its trimmed form.
pub fn validate_relay_event(event: &str) -> Result<String, RelayError> {
    let event = event.trim();
    if event.is_empty() {
        return Err(RelayError::InvalidFrame("event name must not be empty".to_string()));
    }
    if is_reserved(event) {
        return Err(RelayError::ReservedEvent(event.to_string()));
    }
    Ok(event.to_string())
}

/// Frame sent by a client.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    /// Acknowledgement id. `None` means fire-and-forget.
    #[serde(default)]
    pub id: Option<Value>,
}

/// Event pushed from the server to a client.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct EventFrame {
    pub event: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            from: None,
            room: None,
        }
    }

    pub fn from_conn(mut self, conn_id: impl Into<String>) -> Self {
        self.from = Some(conn_id.into());
        self
    }

    pub fn in_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AckError {
    pub code: String,
    pub message: String,
}

/// Reply to a client frame that carried an `id`.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AckFrame {
    pub ack: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AckError>,
}

impl AckFrame {
    pub fn ok(id: Value, data: Value) -> Self {
        Self {
            ack: id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(id: Value, error: &RelayError) -> Self {
        Self {
            ack: id,
            ok: false,
            data: None,
            error: Some(AckError {
                code: error.code().to_string(),
                message: error.to_string(),
            }),
        }
    }
}

/// Reason a client frame could not be parsed, along with the ack id if one
/// could still be recovered from the raw JSON.
#[derive(Debug)]
pub struct FrameError {
    pub id: Option<Value>,
    pub error: RelayError,
}

/// Parse a client text frame.
pub fn parse_client_frame(text: &str) -> Result<ClientFrame, FrameError> {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(mut frame) => {
            let event = frame.event.trim();
            if event.is_empty() {
                return Err(FrameError {
                    id: frame.id,
                    error: RelayError::InvalidFrame("event name must not be empty".to_string()),
                });
            }
            if event.len() != frame.event.len() {
                frame.event = event.to_string();
            }
            Ok(frame)
        }
        Err(e) => {
            // Well-formed JSON with a bad shape can still be acknowledged.
            let id = serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|v| v.get("id").cloned())
                .filter(|id| !id.is_null());
            Err(FrameError {
                id,
                error: RelayError::InvalidFrame(e.to_string()),
            })
        }
    }
}

/// Serialize any server frame to its text form.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, RelayError> {
    Ok(serde_json::to_string(frame)?)
}
