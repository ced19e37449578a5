//! Error types for peerlink-core

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    /// MessagePack encoding error
    #[error("encode error: {0}")]
    EncodeError(String),

    /// MessagePack decoding error
    #[error("decode error: {0}")]
    DecodeError(String),

    /// JSON encoding or decoding error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Chunk header that cannot belong to any chunk group
    #[error("malformed chunk: {0}")]
    MalformedChunk(String),

    /// Signaling message missing a required field
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Payload cannot be expressed in the requested serialization
    #[error("unsupported payload: {0}")]
    Unsupported(String),
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::EncodeError(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::DecodeError(e.to_string())
    }
}
