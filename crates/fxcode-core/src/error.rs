use thiserror::Error;

/// Errors produced by the fxcode protocol and channel layers.
#[derive(Debug, Error)]
pub enum FxError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("upgrade failed: {0}")]
    Upgrade(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("Unable to reconnect; session no longer exists ({0})")]
    SessionNotFound(String),

    #[error("Unable to connect; token is already in use")]
    TokenInUse,

    #[error("session disposed: {0}")]
    SessionDisposed(String),

    #[error("Invalid call '{0}'")]
    InvalidCall(String),

    #[error("Invalid listen '{0}'")]
    InvalidListen(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl FxError {
    /// Stable error code sent to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            FxError::Codec(_) => "Codec",
            FxError::InvalidMessage(_) => "InvalidMessage",
            FxError::Upgrade(_) => "Upgrade",
            FxError::Handshake(_) => "Handshake",
            FxError::SessionNotFound(_) => "SessionNotFound",
            FxError::TokenInUse => "TokenInUse",
            FxError::SessionDisposed(_) => "SessionDisposed",
            FxError::InvalidCall(_) => "InvalidCall",
            FxError::InvalidListen(_) => "InvalidListen",
            FxError::UnknownChannel(_) => "UnknownChannel",
            FxError::Channel(_) => "Channel",
            FxError::Transport(_) => "Transport",
            FxError::Timeout => "Timeout",
            FxError::NotImplemented(_) => "NotImplemented",
            FxError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => "FileNotFound",
                std::io::ErrorKind::AlreadyExists => "FileExists",
                std::io::ErrorKind::PermissionDenied => "NoPermissions",
                std::io::ErrorKind::InvalidInput => "FileIsADirectory",
                _ => "Unknown",
            },
            FxError::Other(_) => "Unknown",
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for FxError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        FxError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for FxError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        FxError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for FxError {
    fn from(e: serde_json::Error) -> Self {
        FxError::InvalidMessage(e.to_string())
    }
}

pub type FxResult<T> = Result<T, FxError>;
