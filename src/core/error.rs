/// Error Types
///
/// Every failure the relay can report, over HTTP or inside an acknowledgement
/// frame, is a `RelayError`. Each variant carries a stable snake_case code so
/// clients can branch on it without parsing messages.

use actix_web::{HttpResponse, ResponseError, http::StatusCode};

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid room name: {0}")]
    InvalidRoom(String),

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("event name '{0}' is reserved by the server")]
    ReservedEvent(String),

    #[error("connection '{0}' not found")]
    UnknownConnection(String),

    #[error("not a member of room '{0}'")]
    NotInRoom(String),

    #[error("room '{0}' not found")]
    RoomNotFound(String),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RelayError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "config_error",
            RelayError::InvalidFrame(_) => "invalid_frame",
            RelayError::InvalidRoom(_) => "invalid_room",
            RelayError::UnknownEvent(_) => "unknown_event",
            RelayError::ReservedEvent(_) => "reserved_event",
            RelayError::UnknownConnection(_) => "unknown_connection",
            RelayError::NotInRoom(_) => "not_in_room",
            RelayError::RoomNotFound(_) => "room_not_found",
            RelayError::Encode(_) => "encode_error",
        }
    }
}

impl ResponseError for RelayError {
    fn status_code(&self) -> StatusCode {
        match self {
            RelayError::InvalidFrame(_)
            | RelayError::InvalidRoom(_)
            | RelayError::UnknownEvent(_)
            | RelayError::ReservedEvent(_) => StatusCode::BAD_REQUEST,
            RelayError::NotInRoom(_) => StatusCode::FORBIDDEN,
            RelayError::UnknownConnection(_) | RelayError::RoomNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            RelayError::Config(_) | RelayError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        }))
    }
}
