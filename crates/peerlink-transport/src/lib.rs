//! peerlink Transport Layer
//!
//! This crate provides the network-facing pieces of peerlink:
//! - The signaling link to the relay: WebSocket first, with a segmented
//!   long-poll HTTP stream as fallback ([`SignalingSocket`])
//! - The relay's HTTP surface: id acquisition and peer listing ([`HttpApi`])
//! - The [`Relay`]/[`SignalLink`] seam used by the session layer
//! - Negotiation primitive interfaces implemented by the host platform
//!   ([`PrimitiveProvider`], [`NegotiationPrimitive`], [`DataChannel`])
//! - A webrtc-rs backed provider (feature `webrtc`)

pub mod config;
pub mod error;
pub mod http;
pub mod primitive;
pub mod relay;
pub mod signaling;

#[cfg(feature = "webrtc")]
pub mod webrtc;

pub use config::{normalize_path, SignalingConfig};
pub use error::{ChannelError, Result, TransportError};
pub use http::HttpApi;
pub use primitive::{
    Capabilities, ChannelEvent, DataChannel, IceConnectionState, MediaStream,
    NegotiationPrimitive, PrimitiveConfig, PrimitiveEvent, PrimitiveProvider, SignalingState,
};
pub use relay::{HttpRelay, Relay, SignalEvent, SignalLink};
pub use signaling::SignalingSocket;

#[cfg(feature = "webrtc")]
pub use webrtc::{LocalTracks, WebRtcProvider};
