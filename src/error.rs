use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("not connected")]
    NotConnected,
    #[error("internal channel closed")]
    ChannelClosed,
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl From<tokio::time::error::Elapsed> for AppError {
    fn from(value: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(value.to_string())
    }
}

impl AppError {
    /// Network-level failures that are retried with backoff and never surfaced as fatal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::NotConnected
                | Self::Io(_)
                | Self::Reqwest(_)
                | Self::WebSocket(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_error_taxonomy() {
        assert!(AppError::Timeout("poll".to_string()).is_transient());
        assert!(AppError::NotConnected.is_transient());
        assert!(!AppError::Protocol("bad frame".to_string()).is_transient());
        assert!(!AppError::Rejected("400".to_string()).is_transient());
    }
}
