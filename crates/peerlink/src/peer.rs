//! Application handle to a session

use peerlink_transport::{MediaStream, Relay, TransportError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::builder::PeerBuilder;
use crate::connection::{ConnectionHandle, DataConnection, MediaConnection, Owner};
use crate::error::{PeerError, Result};
use crate::event::PeerEvent;
use crate::options::{CallOptions, ConnectOptions};
use crate::session::{Command, Event, PeerShared};

/// A peer registered with the signaling relay.
///
/// Cloning is cheap; all clones drive the same session.
#[derive(Clone)]
pub struct Peer {
    shared: Arc<PeerShared>,
    tx: mpsc::UnboundedSender<Event>,
    relay: Arc<dyn Relay>,
}

impl Peer {
    pub(crate) fn new(
        shared: Arc<PeerShared>,
        tx: mpsc::UnboundedSender<Event>,
        relay: Arc<dyn Relay>,
    ) -> Self {
        Self { shared, tx, relay }
    }

    pub fn builder() -> PeerBuilder {
        PeerBuilder::new()
    }

    /// Our id, once known. Cleared while disconnected.
    pub fn id(&self) -> Option<String> {
        self.shared.id.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// Receive session events. The first subscriber also gets everything
    /// emitted before it subscribed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        self.shared.events.subscribe()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Event::Command(command(reply))).ok()?;
        rx.await.ok()
    }

    fn refused(&self) -> PeerError {
        let error = PeerError::refused_while_disconnected();
        self.shared.events.emit(PeerEvent::Error(error.clone()));
        error
    }

    /// Open a data connection to `peer`
    pub async fn connect(&self, peer: &str, options: ConnectOptions) -> Result<DataConnection> {
        let peer = peer.to_string();
        match self
            .request(|reply| Command::Connect {
                peer,
                options,
                reply,
            })
            .await
        {
            Some(result) => result,
            None => Err(self.refused()),
        }
    }

    /// Call `peer` with our local `stream`
    pub async fn call(
        &self,
        peer: &str,
        stream: MediaStream,
        options: CallOptions,
    ) -> Result<MediaConnection> {
        let peer = peer.to_string();
        match self
            .request(|reply| Command::Call {
                peer,
                stream,
                options,
                reply,
            })
            .await
        {
            Some(result) => result,
            None => Err(self.refused()),
        }
    }

    /// Leave the relay but keep connections. Takes effect asynchronously;
    /// watch for [`PeerEvent::Disconnected`].
    pub fn disconnect(&self) {
        let _ = self.tx.send(Event::Command(Command::Disconnect));
    }

    /// Rejoin the relay with the id we had before disconnecting
    pub async fn reconnect(&self) -> Result<()> {
        self.request(|reply| Command::Reconnect { reply })
            .await
            .unwrap_or_else(|| {
                Err(PeerError::Fatal(
                    "this peer cannot reconnect to the server; it has already been destroyed"
                        .to_string(),
                ))
            })
    }

    /// Close every connection and leave the relay for good
    pub fn destroy(&self) {
        let _ = self.tx.send(Event::Command(Command::Destroy));
    }

    /// Ids of all peers connected to the relay under our key
    pub async fn list_all_peers(&self) -> Result<Vec<String>> {
        match self.relay.list_peers().await {
            Ok(peers) => Ok(peers),
            Err(TransportError::HttpStatus(401)) => Err(PeerError::ListingDisabled),
            Err(e) => {
                warn!(error = %e, "peer listing failed");
                let error = PeerError::Network(format!("could not get peers from the server: {}", e));
                self.shared.events.emit(PeerEvent::Error(error.clone()));
                Err(error)
            }
        }
    }

    /// Look up one of our connections to `peer`
    pub async fn connection(&self, peer: &str, connection_id: &str) -> Option<ConnectionHandle> {
        let owner = Owner::new(peer, connection_id);
        self.request(|reply| Command::Lookup { owner, reply })
            .await
            .flatten()
    }

    /// Every live connection, grouped by remote peer
    pub async fn connections(&self) -> Vec<(String, Vec<ConnectionHandle>)> {
        self.request(|reply| Command::Snapshot { reply })
            .await
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id())
            .field("open", &self.is_open())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
