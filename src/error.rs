//! Handler error types

use std::fmt;

use crate::plane::PlaneError;

/// Errors raised while handling a control or data message
///
/// These never leave the dispatch boundary: the control channel logs them
/// and reports a generic failure outcome, the relays log and move on.
#[derive(Debug)]
pub enum HandlerError {
    /// Payload is not valid JSON or does not have the expected shape
    Malformed(String),
    /// A required field is missing
    MissingField(&'static str),
    /// An identifier cannot be used as a topic level
    InvalidId { id: String, reason: &'static str },
    /// A plane rejected a publish, subscribe or unsubscribe
    Plane(PlaneError),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed payload: {}", msg),
            Self::MissingField(field) => write!(f, "missing field: {}", field),
            Self::InvalidId { id, reason } => write!(f, "invalid id '{}': {}", id, reason),
            Self::Plane(e) => write!(f, "plane error: {}", e),
        }
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Plane(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PlaneError> for HandlerError {
    fn from(e: PlaneError) -> Self {
        Self::Plane(e)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

pub type HandlerResult<T> = Result<T, HandlerError>;
