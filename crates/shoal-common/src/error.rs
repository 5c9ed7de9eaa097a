use serde::{Deserialize, Serialize};

/// Machine-readable error codes for the wire protocol.
/// Shared by every shoal service and preserved across component
/// boundaries so callers can branch on the kind, not the message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadParameter,
    NotFound,
    AlreadyExists,
    AccessDenied,
    CompareFailed,
    UnknownAuthority,
    Internal,
}

impl ErrorCode {
    /// Suggested HTTP status code for this error.
    /// Transport-agnostic (returns u16, not an axum type).
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadParameter => 400,
            Self::NotFound => 404,
            Self::AlreadyExists => 409,
            Self::AccessDenied => 403,
            Self::CompareFailed => 409,
            Self::UnknownAuthority => 403,
            Self::Internal => 500,
        }
    }

    /// Collapse probing-sensitive kinds at the API edge: a caller asking
    /// about a secret it does not hold learns "denied", never "absent".
    pub fn conceal_absence(self) -> Self {
        match self {
            Self::NotFound | Self::CompareFailed => Self::AccessDenied,
            other => other,
        }
    }
}

/// Wire shape of an error response: a kind plus one human message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}
