//! Negotiation primitive interfaces
//!
//! The host platform supplies the real-time transport: something that can
//! produce and accept session descriptions, exchange connectivity
//! candidates, open data channels and carry media streams. These traits are
//! the only surface the session layer uses.

use async_trait::async_trait;
use bytes::Bytes;
use peerlink_core::{ConnectionKind, IceCandidate, SessionDescription, DEFAULT_STUN_SERVER};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{ChannelError, Result};

/// Optional transport features exposed by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Data channels are available
    pub data: bool,
    /// Media streams are available
    pub media: bool,
    /// Data channels are natively reliable (SCTP)
    pub sctp: bool,
    /// The primitive raises `NegotiationNeeded` by itself
    pub negotiation_needed: bool,
    /// Binary payloads above this size must be chunked
    pub chunked_mtu: Option<usize>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            data: true,
            media: true,
            sctp: true,
            negotiation_needed: false,
            chunked_mtu: None,
        }
    }
}

/// Settings handed to every new primitive
#[derive(Debug, Clone)]
pub struct PrimitiveConfig {
    pub ice_servers: Vec<String>,
}

impl Default for PrimitiveConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

/// Events raised by a primitive
#[derive(Clone)]
pub enum PrimitiveEvent {
    /// A local candidate to forward to the remote side
    IceCandidate(IceCandidate),
    IceConnectionState(IceConnectionState),
    /// The primitive wants a new offer
    NegotiationNeeded,
    /// The remote side opened a data channel
    DataChannel(Arc<dyn DataChannel>),
    /// The remote side added a media stream
    RemoteStream(MediaStream),
}

impl fmt::Debug for PrimitiveEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            PrimitiveEvent::IceConnectionState(s) => {
                f.debug_tuple("IceConnectionState").field(s).finish()
            }
            PrimitiveEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            PrimitiveEvent::DataChannel(dc) => {
                f.debug_tuple("DataChannel").field(&dc.label()).finish()
            }
            PrimitiveEvent::RemoteStream(s) => f.debug_tuple("RemoteStream").field(s).finish(),
        }
    }
}

/// Events raised by a data channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Close,
}

/// Creates negotiation primitives
#[async_trait]
pub trait PrimitiveProvider: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Build one primitive for a connection of `kind`. Its events go to
    /// `events` until it is closed.
    async fn create(
        &self,
        config: &PrimitiveConfig,
        kind: ConnectionKind,
        events: mpsc::UnboundedSender<PrimitiveEvent>,
    ) -> Result<Arc<dyn NegotiationPrimitive>>;
}

/// One host session object performing description/candidate exchange
#[async_trait]
pub trait NegotiationPrimitive: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    fn is_closed(&self) -> bool {
        self.signaling_state() == SignalingState::Closed
    }

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Open an outbound data channel
    async fn create_data_channel(&self, label: &str, reliable: bool)
        -> Result<Arc<dyn DataChannel>>;

    /// Attach a local media stream
    async fn add_stream(&self, stream: &MediaStream) -> Result<()>;

    /// Close the primitive. Idempotent.
    fn close(&self);
}

/// A bidirectional data channel
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    /// Route channel events to `sink`. Events raised before the first
    /// attach are replayed to it.
    fn attach(&self, sink: mpsc::UnboundedSender<ChannelEvent>);

    async fn send(&self, data: Bytes) -> std::result::Result<(), ChannelError>;

    fn close(&self);
}

/// Opaque host media stream handle
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl MediaStream {
    pub fn new<T: Any + Send + Sync>(id: impl Into<String>, stream: T) -> Self {
        Self {
            id: id.into(),
            inner: Arc::new(stream),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Access the host stream object
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream").field("id", &self.id).finish()
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_stream_downcast() {
        #[derive(Debug, PartialEq)]
        struct Camera(u32);

        let stream = MediaStream::new("cam-1", Camera(7));
        let copy = stream.clone();
        assert_eq!(copy.id(), "cam-1");
        assert_eq!(copy.downcast_ref::<Camera>(), Some(&Camera(7)));
        assert!(copy.downcast_ref::<String>().is_none());
        assert_eq!(stream, copy);
    }
}
