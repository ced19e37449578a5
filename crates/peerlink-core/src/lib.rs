//! peerlink Core
//!
//! Wire-level building blocks shared by the peerlink transport and session
//! crates.
//!
//! This crate provides:
//! - Relay signaling messages ([`SignalMessage`], [`MessageType`]) and their
//!   OFFER/ANSWER/CANDIDATE payloads
//! - The data-channel packet codec ([`codec`]) for every [`Serialization`] mode
//! - Chunk splitting and reassembly for size-limited channels ([`chunk`])
//! - An incremental newline framing decoder for the relay stream ([`framing`])
//! - The reliable-delivery overlay state machine ([`reliable`])
//! - Session description patching ([`sdp`]) and id helpers ([`id`])

pub mod chunk;
pub mod codec;
pub mod error;
pub mod framing;
pub mod id;
pub mod reliable;
pub mod sdp;
pub mod types;

pub use chunk::{Chunk, Reassembler};
pub use codec::Decoded;
pub use error::{Error, Result};
pub use framing::LineDecoder;
pub use reliable::ReliableOverlay;
pub use types::*;

/// Public cloud relay host
pub const CLOUD_HOST: &str = "0.peerjs.com";

/// Public cloud relay port
pub const CLOUD_PORT: u16 = 9000;

/// Default relay API key
pub const DEFAULT_KEY: &str = "peerjs";

/// Agent tag sent in OFFER/ANSWER payloads
pub const AGENT: &str = "peerlink";

/// Largest binary payload sent unchunked on channels that require chunking
pub const CHUNKED_MTU: usize = 16300;

/// Default STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
