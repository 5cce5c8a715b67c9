use thiserror::Error;

/// Errors produced by the relay tunnel layer.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A connection request carried a missing or malformed field.
    #[error("invalid parameter `{field}`: {reason}")]
    InvalidParameter { field: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("authorization failed: {0}")]
    Authorization(String),

    /// Generic operational failure, e.g. a relay that cannot be reached at all.
    #[error("operation failed: {0}")]
    Operational(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Coarse error category reported to control API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Transport,
    Authorization,
    Operational,
    NotFound,
}

impl GatewayError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        GatewayError::InvalidParameter {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::InvalidParameter { .. } => ErrorKind::Validation,
            GatewayError::Transport(_) | GatewayError::Io(_) | GatewayError::Timeout => {
                ErrorKind::Transport
            }
            GatewayError::Authorization(_) => ErrorKind::Authorization,
            GatewayError::SessionNotFound(_) => ErrorKind::NotFound,
            GatewayError::Operational(_) | GatewayError::Codec(_) | GatewayError::Other(_) => {
                ErrorKind::Operational
            }
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for GatewayError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        GatewayError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for GatewayError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        GatewayError::Codec(e.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
