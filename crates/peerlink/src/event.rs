//! Session and connection events

use peerlink_core::Data;
use peerlink_transport::MediaStream;

use crate::connection::{DataConnection, MediaConnection};
use crate::error::PeerError;

/// Events raised by a [`Peer`](crate::Peer)
#[derive(Clone)]
pub enum PeerEvent {
    /// The relay accepted our id
    Open(String),
    /// A remote peer opened a data connection to us
    Connection(DataConnection),
    /// A remote peer is calling us
    Call(MediaConnection),
    /// The peer was destroyed
    Close,
    /// The link to the relay is gone; carries the id we had
    Disconnected(Option<String>),
    Error(PeerError),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::Open(id) => f.debug_tuple("Open").field(id).finish(),
            PeerEvent::Connection(c) => f.debug_tuple("Connection").field(&c.id()).finish(),
            PeerEvent::Call(c) => f.debug_tuple("Call").field(&c.id()).finish(),
            PeerEvent::Close => f.write_str("Close"),
            PeerEvent::Disconnected(id) => f.debug_tuple("Disconnected").field(id).finish(),
            PeerEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

/// Events raised by a data or media connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Open,
    /// A decoded application payload (data connections)
    Data(Data),
    /// The remote media stream (media connections)
    Stream(MediaStream),
    Close,
    Error(String),
}
