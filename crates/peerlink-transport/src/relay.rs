//! Relay seam
//!
//! The session layer talks to the signaling relay through these traits so
//! the network-backed implementation can be swapped for an in-process hub.

use async_trait::async_trait;
use peerlink_core::SignalMessage;
use tokio::sync::mpsc;

use crate::config::SignalingConfig;
use crate::error::Result;
use crate::http::HttpApi;
use crate::signaling::SignalingSocket;

/// Events raised by a signaling link
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// A message from the relay
    Message(SignalMessage),
    /// The link to the relay was lost
    Disconnected,
    /// The link could not be used at all
    Error(String),
    /// The link was closed by the relay side
    Close,
}

/// One logical, reconnectable channel to the relay
pub trait SignalLink: Send + Sync {
    /// Begin talking to the relay as `id`
    fn start(&self, id: &str, token: &str);

    /// Send a message; queued until `start` has been called
    fn send(&self, message: SignalMessage);

    /// Tear the link down. Idempotent; raises no further events.
    fn close(&self);
}

/// Factory and request/response surface of a relay
#[async_trait]
pub trait Relay: Send + Sync {
    /// Create a link that reports to `events`
    fn open_link(&self, events: mpsc::UnboundedSender<SignalEvent>) -> Box<dyn SignalLink>;

    /// Obtain a fresh peer id
    async fn retrieve_id(&self) -> Result<String>;

    /// Ids of the peers currently connected under our key
    async fn list_peers(&self) -> Result<Vec<String>>;
}

/// Relay reached over the network (WebSocket plus HTTP fallback)
#[derive(Clone)]
pub struct HttpRelay {
    api: HttpApi,
}

impl HttpRelay {
    pub fn new(config: SignalingConfig) -> Self {
        Self {
            api: HttpApi::new(config),
        }
    }
}

#[async_trait]
impl Relay for HttpRelay {
    fn open_link(&self, events: mpsc::UnboundedSender<SignalEvent>) -> Box<dyn SignalLink> {
        Box::new(SignalingSocket::new(self.api.clone(), events))
    }

    async fn retrieve_id(&self) -> Result<String> {
        self.api.retrieve_id().await
    }

    async fn list_peers(&self) -> Result<Vec<String>> {
        self.api.list_peers().await
    }
}
