use thiserror::Error;

/// Returned by `connect` on either client. Never raised after `connect`
/// has returned; later transport failures only move the client to
/// `Disconnected` and produce a log line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("connection cancelled by disconnect")]
    Cancelled,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("not connected")]
    NotConnected,
    #[error("request rejected (code {code}): {comment}")]
    Command { code: u16, comment: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no acknowledgement before timeout")]
    Timeout,
    #[error("unexpected response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no channel found for the supplied page id and stream key")]
    NotFound,
    #[error("channel lookup failed: {0}")]
    Transport(String),
}

impl From<ResolveError> for ConnectError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::NotFound => ConnectError::Auth(
                "Authentication failed. Please check your Page ID and Stream API Key.".to_string(),
            ),
            ResolveError::Transport(msg) => ConnectError::Transport(msg),
        }
    }
}
