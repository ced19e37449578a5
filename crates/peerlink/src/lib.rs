//! peerlink
//!
//! Peer-to-peer sessions brokered by a signaling relay.
//!
//! A [`Peer`] registers with the relay, then opens [`DataConnection`]s and
//! [`MediaConnection`]s to other peers. Offer/answer and candidate exchange
//! run over the relay; payloads flow directly over the negotiated
//! transport supplied by a [`PrimitiveProvider`].
//!
//! # Example
//!
//! ```ignore
//! use peerlink::{ConnectOptions, ConnectionEvent, Peer, PeerEvent};
//!
//! #[tokio::main]
//! async fn main() -> peerlink::Result<()> {
//!     let peer = Peer::builder().id("alice").build();
//!     let mut events = peer.subscribe();
//!
//!     while let Some(PeerEvent::Open(id)) = events.recv().await {
//!         println!("registered as {}", id);
//!         break;
//!     }
//!
//!     let conn = peer.connect("bob", ConnectOptions::default()).await?;
//!     let mut conn_events = conn.subscribe();
//!     while let Some(event) = conn_events.recv().await {
//!         if let ConnectionEvent::Open = event {
//!             conn.send(serde_json::json!({"hello": "bob"}))?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod connection;
pub mod emitter;
pub mod error;
pub mod event;
pub mod logging;
pub mod options;
pub mod peer;

mod negotiator;
mod registry;
mod session;

pub use builder::PeerBuilder;
pub use connection::{ConnectionHandle, DataConnection, MediaConnection};
pub use error::{ErrorType, PeerError, Result};
pub use event::{ConnectionEvent, PeerEvent};
pub use logging::LogLevel;
pub use options::{CallOptions, ConnectOptions, PeerOptions};
pub use peer::Peer;

pub use peerlink_core::{ConnectionKind, Data, Serialization};
pub use peerlink_transport::{Capabilities, MediaStream, PrimitiveProvider, Relay};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::builder::PeerBuilder;
    pub use crate::connection::{ConnectionHandle, DataConnection, MediaConnection};
    pub use crate::error::{PeerError, Result};
    pub use crate::event::{ConnectionEvent, PeerEvent};
    pub use crate::options::{CallOptions, ConnectOptions};
    pub use crate::peer::Peer;
    pub use peerlink_core::{Data, Serialization};
}
