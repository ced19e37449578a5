//! Session error types

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PeerError>;

/// Category of a [`PeerError`], named as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    Webrtc,
    Network,
    ServerError,
    BrowserIncompatible,
    InvalidId,
    InvalidKey,
    UnavailableId,
    SslUnavailable,
    Disconnected,
    PeerUnavailable,
    NotOpen,
    Destroyed,
    ListingDisabled,
    Fatal,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Webrtc => "webrtc",
            ErrorType::Network => "network",
            ErrorType::ServerError => "server-error",
            ErrorType::BrowserIncompatible => "browser-incompatible",
            ErrorType::InvalidId => "invalid-id",
            ErrorType::InvalidKey => "invalid-key",
            ErrorType::UnavailableId => "unavailable-id",
            ErrorType::SslUnavailable => "ssl-unavailable",
            ErrorType::Disconnected => "disconnected",
            ErrorType::PeerUnavailable => "peer-unavailable",
            ErrorType::NotOpen => "not-open",
            ErrorType::Destroyed => "destroyed",
            ErrorType::ListingDisabled => "listing-disabled",
            ErrorType::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("negotiation failed: {0}")]
    Webrtc(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("the current platform does not support data or media connections")]
    BrowserIncompatible,

    #[error("ID \"{0}\" is invalid")]
    InvalidId(String),

    #[error("API KEY \"{0}\" is invalid")]
    InvalidKey(String),

    #[error("ID \"{0}\" is taken")]
    UnavailableId(String),

    #[error("the cloud server does not support TLS")]
    SslUnavailable,

    #[error("{0}")]
    Disconnected(String),

    #[error("could not connect to peer {0}")]
    PeerUnavailable(String),

    #[error("connection is not open")]
    NotOpen,

    #[error("peer has been destroyed")]
    Destroyed,

    #[error("peer listing is disabled for this key")]
    ListingDisabled,

    #[error("{0}")]
    Fatal(String),
}

impl PeerError {
    pub fn kind(&self) -> ErrorType {
        match self {
            PeerError::Webrtc(_) => ErrorType::Webrtc,
            PeerError::Network(_) => ErrorType::Network,
            PeerError::ServerError(_) => ErrorType::ServerError,
            PeerError::BrowserIncompatible => ErrorType::BrowserIncompatible,
            PeerError::InvalidId(_) => ErrorType::InvalidId,
            PeerError::InvalidKey(_) => ErrorType::InvalidKey,
            PeerError::UnavailableId(_) => ErrorType::UnavailableId,
            PeerError::SslUnavailable => ErrorType::SslUnavailable,
            PeerError::Disconnected(_) => ErrorType::Disconnected,
            PeerError::PeerUnavailable(_) => ErrorType::PeerUnavailable,
            PeerError::NotOpen => ErrorType::NotOpen,
            PeerError::Destroyed => ErrorType::Destroyed,
            PeerError::ListingDisabled => ErrorType::ListingDisabled,
            PeerError::Fatal(_) => ErrorType::Fatal,
        }
    }

    pub(crate) fn refused_while_disconnected() -> Self {
        PeerError::Disconnected(
            "cannot connect to new peers after disconnecting from the server".to_string(),
        )
    }
}

impl From<peerlink_transport::TransportError> for PeerError {
    fn from(e: peerlink_transport::TransportError) -> Self {
        PeerError::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_match_wire_names() {
        assert_eq!(PeerError::Webrtc("x".into()).kind().to_string(), "webrtc");
        assert_eq!(PeerError::ServerError("x".into()).kind().to_string(), "server-error");
        assert_eq!(PeerError::BrowserIncompatible.kind().to_string(), "browser-incompatible");
        assert_eq!(PeerError::UnavailableId("a".into()).kind().to_string(), "unavailable-id");
        assert_eq!(PeerError::SslUnavailable.kind().to_string(), "ssl-unavailable");
        assert_eq!(PeerError::PeerUnavailable("b".into()).kind().to_string(), "peer-unavailable");
    }

    #[test]
    fn test_messages() {
        assert_eq!(PeerError::InvalidId("a b!".into()).to_string(), "ID \"a b!\" is invalid");
        assert_eq!(PeerError::PeerUnavailable("bob".into()).to_string(), "could not connect to peer bob");
    }
}
