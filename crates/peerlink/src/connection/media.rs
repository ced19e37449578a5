use peerlink_core::SessionDescription;
use peerlink_transport::MediaStream;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{ConnectionInfo, Core};
use crate::event::ConnectionEvent;
use crate::session::{Command, Event};

/// Application handle to a media call
#[derive(Clone)]
pub struct MediaConnection {
    info: Arc<ConnectionInfo>,
    tx: mpsc::UnboundedSender<Event>,
}

impl MediaConnection {
    pub(crate) fn new(info: Arc<ConnectionInfo>, tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { info, tx }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn peer(&self) -> &str {
        &self.info.peer
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.info.metadata.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.info.is_open()
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.info.local_stream.lock().clone()
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.info.remote_stream.lock().clone()
    }

    pub fn primitive_id(&self) -> Option<String> {
        self.info.primitive.lock().clone()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.info.events.subscribe()
    }

    /// Accept an incoming call with our `stream`. Only the first answer
    /// counts; later calls are ignored with a warning.
    pub fn answer(&self, stream: MediaStream) {
        let _ = self.tx.send(Event::Command(Command::Answer {
            owner: self.info.owner(),
            stream,
        }));
    }

    pub fn close(&self) {
        let _ = self.tx.send(Event::Command(Command::Close(self.info.owner())));
    }
}

impl std::fmt::Debug for MediaConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaConnection")
            .field("id", &self.info.id)
            .field("peer", &self.info.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

pub(crate) struct MediaState {
    pub core: Core,
    /// Remote offer of an inbound call, consumed by `answer`
    pub offer: Option<SessionDescription>,
}

impl MediaState {
    pub fn new(info: Arc<ConnectionInfo>, offer: Option<SessionDescription>) -> Self {
        Self {
            core: Core::new(info),
            offer,
        }
    }

    pub fn has_local_stream(&self) -> bool {
        self.core.info.local_stream.lock().is_some()
    }

    pub fn set_local_stream(&self, stream: MediaStream) {
        *self.core.info.local_stream.lock() = Some(stream);
    }

    pub fn add_remote_stream(&self, stream: MediaStream) {
        *self.core.info.remote_stream.lock() = Some(stream.clone());
        self.core.emit(ConnectionEvent::Stream(stream));
    }
}
