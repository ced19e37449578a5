//! Transport error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("unexpected http status {0}")]
    HttpStatus(u16),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("not connected")]
    NotConnected,

    /// Negotiation primitive failure (description, candidate, channel)
    #[error("webrtc error: {0}")]
    Webrtc(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Core(#[from] peerlink_core::Error),

    #[error("transport error: {0}")]
    Other(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::ConnectionFailed(e.to_string())
    }
}

impl From<url::ParseError> for TransportError {
    fn from(e: url::ParseError) -> Self {
        TransportError::InvalidUrl(e.to_string())
    }
}

/// Data channel send failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel cannot take more data right now; retry later
    #[error("channel send buffer full")]
    Backpressure,

    #[error("channel closed")]
    Closed,

    #[error("channel error: {0}")]
    Other(String),
}
