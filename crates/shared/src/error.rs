use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCode {
    Unauthorized,
    Validation,
    Conflict,
    Transport,
    Query,
    Decode,
    Internal,
}

impl FaultCode {
    /// Maps an HTTP status returned by the gateway to a fault category.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => FaultCode::Unauthorized,
            400 | 422 => FaultCode::Validation,
            409 => FaultCode::Conflict,
            404 | 406 | 416 => FaultCode::Query,
            _ => FaultCode::Internal,
        }
    }
}

/// An error outcome reported by the remote gateway. `message` is the
/// gateway's own description and is meant to be shown verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct GatewayFault {
    pub code: FaultCode,
    pub message: String,
}

impl GatewayFault {
    pub fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FaultCode::Transport, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(FaultCode::Decode, message)
    }
}

/// Error payload shapes used by the auth and query endpoints. Auth
/// endpoints answer with `msg` or `error_description`, the query endpoint
/// with `message`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ErrorBody {
    pub fn into_message(self) -> Option<String> {
        self.msg
            .or(self.message)
            .or(self.error_description)
            .or(self.error)
            .filter(|message| !message.trim().is_empty())
    }
}
