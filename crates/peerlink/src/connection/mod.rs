//! Data and media connections
//!
//! Each connection has two halves: a cloneable application handle
//! ([`DataConnection`], [`MediaConnection`]) and the state owned by the
//! session actor ([`Connection`]). The handle reads shared flags and posts
//! commands; only the actor mutates connection state.

mod data;
mod media;

pub use data::DataConnection;
pub use media::MediaConnection;

pub(crate) use data::{DataState, SendContext, NOT_OPEN};
pub(crate) use media::MediaState;

use parking_lot::Mutex;
use peerlink_core::{ConnectionKind, Serialization};
use peerlink_transport::MediaStream;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::emitter::Emitter;
use crate::event::ConnectionEvent;
use crate::session::Event;

/// Addresses one connection: remote peer plus connection id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Owner {
    pub peer: String,
    pub connection_id: String,
}

impl Owner {
    pub fn new(peer: &str, connection_id: &str) -> Self {
        Self {
            peer: peer.to_string(),
            connection_id: connection_id.to_string(),
        }
    }
}

/// Immutable identity plus the flags the handles read
pub(crate) struct ConnectionInfo {
    pub id: String,
    pub peer: String,
    pub kind: ConnectionKind,
    pub label: String,
    pub metadata: Option<Value>,
    pub serialization: Serialization,
    pub reliable: bool,
    pub open: AtomicBool,
    pub buffer_size: AtomicUsize,
    pub peer_agent: Mutex<Option<String>>,
    pub primitive: Mutex<Option<String>>,
    pub local_stream: Mutex<Option<MediaStream>>,
    pub remote_stream: Mutex<Option<MediaStream>>,
    pub events: Emitter<ConnectionEvent>,
}

impl ConnectionInfo {
    pub fn new(
        id: String,
        peer: String,
        kind: ConnectionKind,
        label: Option<String>,
        metadata: Option<Value>,
        serialization: Serialization,
        reliable: bool,
    ) -> Self {
        Self {
            label: label.unwrap_or_else(|| id.clone()),
            id,
            peer,
            kind,
            metadata,
            serialization,
            reliable,
            open: AtomicBool::new(false),
            buffer_size: AtomicUsize::new(0),
            peer_agent: Mutex::new(None),
            primitive: Mutex::new(None),
            local_stream: Mutex::new(None),
            remote_stream: Mutex::new(None),
            events: Emitter::new(),
        }
    }

    pub fn owner(&self) -> Owner {
        Owner::new(&self.peer, &self.id)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// State every connection kind carries on the actor side
pub(crate) struct Core {
    pub info: Arc<ConnectionInfo>,
    /// Pooled primitive currently serving this connection
    pub primitive: Option<String>,
    /// Set once the connection is torn down; checked by negotiation workers
    pub closed: Arc<AtomicBool>,
    pub open: bool,
    /// We created this connection and make its offers
    pub originator: bool,
    /// An offer went out and its answer has not been applied yet
    pub awaiting_answer: bool,
}

impl Core {
    pub fn new(info: Arc<ConnectionInfo>) -> Self {
        Self {
            info,
            primitive: None,
            closed: Arc::new(AtomicBool::new(false)),
            open: false,
            originator: false,
            awaiting_answer: false,
        }
    }

    pub fn set_primitive(&mut self, primitive: Option<String>) {
        *self.info.primitive.lock() = primitive.clone();
        self.primitive = primitive;
    }

    /// Flip to open and notify. The shared flag is raised before the event
    /// so a handle reacting to `Open` can send immediately.
    pub fn mark_open(&mut self) {
        if self.open {
            return;
        }
        self.open = true;
        self.info.open.store(true, Ordering::SeqCst);
        self.info.events.emit(ConnectionEvent::Open);
    }

    pub fn mark_closed(&mut self) {
        self.open = false;
        self.closed.store(true, Ordering::SeqCst);
        self.info.open.store(false, Ordering::SeqCst);
    }

    pub fn emit(&self, event: ConnectionEvent) {
        self.info.events.emit(event);
    }
}

/// Actor-side connection
pub(crate) enum Connection {
    Data(DataState),
    Media(MediaState),
}

impl Connection {
    pub fn core(&self) -> &Core {
        match self {
            Connection::Data(d) => &d.core,
            Connection::Media(m) => &m.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut Core {
        match self {
            Connection::Data(d) => &mut d.core,
            Connection::Media(m) => &mut m.core,
        }
    }

    pub fn id(&self) -> &str {
        &self.core().info.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.core().info.kind
    }

    pub fn is_open(&self) -> bool {
        self.core().open
    }

    pub fn primitive(&self) -> Option<&str> {
        self.core().primitive.as_deref()
    }

    pub fn handle(&self, tx: &mpsc::UnboundedSender<Event>) -> ConnectionHandle {
        match self {
            Connection::Data(d) => {
                ConnectionHandle::Data(DataConnection::new(d.core.info.clone(), tx.clone()))
            }
            Connection::Media(m) => {
                ConnectionHandle::Media(MediaConnection::new(m.core.info.clone(), tx.clone()))
            }
        }
    }

    /// Tear down local resources. Does not touch the primitive pool.
    pub fn shutdown(&mut self) {
        match self {
            Connection::Data(d) => d.shutdown(),
            Connection::Media(m) => m.core.mark_closed(),
        }
    }
}

/// Application handle to any kind of connection
#[derive(Clone)]
pub enum ConnectionHandle {
    Data(DataConnection),
    Media(MediaConnection),
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        match self {
            ConnectionHandle::Data(c) => c.id(),
            ConnectionHandle::Media(c) => c.id(),
        }
    }

    pub fn peer(&self) -> &str {
        match self {
            ConnectionHandle::Data(c) => c.peer(),
            ConnectionHandle::Media(c) => c.peer(),
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        match self {
            ConnectionHandle::Data(_) => ConnectionKind::Data,
            ConnectionHandle::Media(_) => ConnectionKind::Media,
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            ConnectionHandle::Data(c) => c.is_open(),
            ConnectionHandle::Media(c) => c.is_open(),
        }
    }

    pub fn as_data(&self) -> Option<&DataConnection> {
        match self {
            ConnectionHandle::Data(c) => Some(c),
            ConnectionHandle::Media(_) => None,
        }
    }

    pub fn as_media(&self) -> Option<&MediaConnection> {
        match self {
            ConnectionHandle::Media(c) => Some(c),
            ConnectionHandle::Data(_) => None,
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .field("peer", &self.peer())
            .finish()
    }
}
