use bytes::Bytes;
use peerlink_core::{
    chunk, codec, Data, Decoded, Reassembler, ReliableOverlay, Serialization,
};
use peerlink_transport::DataChannel;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ConnectionInfo, Core, Owner};
use crate::error::{PeerError, Result};
use crate::event::ConnectionEvent;
use crate::session::{schedule, Command, Event};

pub(crate) const NOT_OPEN: &str =
    "Connection is not open. You should listen for the `open` event before sending messages.";

/// Application handle to a data connection
#[derive(Clone)]
pub struct DataConnection {
    info: Arc<ConnectionInfo>,
    tx: mpsc::UnboundedSender<Event>,
}

impl DataConnection {
    pub(crate) fn new(info: Arc<ConnectionInfo>, tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { info, tx }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Remote peer id
    pub fn peer(&self) -> &str {
        &self.info.peer
    }

    pub fn label(&self) -> &str {
        &self.info.label
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.info.metadata.as_ref()
    }

    pub fn serialization(&self) -> Serialization {
        self.info.serialization
    }

    pub fn reliable(&self) -> bool {
        self.info.reliable
    }

    pub fn is_open(&self) -> bool {
        self.info.is_open()
    }

    /// Number of payloads waiting in the send buffer
    pub fn buffer_size(&self) -> usize {
        self.info.buffer_size.load(Ordering::SeqCst)
    }

    /// Agent tag the remote side sent with its offer or answer
    pub fn peer_agent(&self) -> Option<String> {
        self.info.peer_agent.lock().clone()
    }

    /// Pooled negotiation primitive serving this connection
    pub fn primitive_id(&self) -> Option<String> {
        self.info.primitive.lock().clone()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.info.events.subscribe()
    }

    /// Queue `data` for delivery. Fails with [`PeerError::NotOpen`] (and an
    /// `Error` event) before the connection has opened.
    pub fn send(&self, data: impl Into<Data>) -> Result<()> {
        if !self.is_open() {
            self.info.events.emit(ConnectionEvent::Error(NOT_OPEN.to_string()));
            return Err(PeerError::NotOpen);
        }
        self.tx
            .send(Event::Command(Command::Send {
                owner: self.info.owner(),
                data: data.into(),
            }))
            .map_err(|_| PeerError::Destroyed)
    }

    /// Close the connection. Does nothing unless it is open.
    pub fn close(&self) {
        let _ = self.tx.send(Event::Command(Command::Close(self.info.owner())));
    }
}

impl std::fmt::Debug for DataConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataConnection")
            .field("id", &self.info.id)
            .field("peer", &self.info.peer)
            .field("label", &self.info.label)
            .field("open", &self.is_open())
            .finish()
    }
}

/// What the send path needs from the session
pub(crate) struct SendContext<'a> {
    pub events: &'a mpsc::UnboundedSender<Event>,
    pub retry_backoff: Duration,
    pub retransmit_interval: Duration,
    /// Chunk binary payloads above this size
    pub chunk_mtu: Option<usize>,
}

pub(crate) struct DataState {
    pub core: Core,
    channel: Option<Arc<dyn DataChannel>>,
    buffer: VecDeque<Bytes>,
    buffering: bool,
    reassembler: Reassembler,
    next_group: u32,
    overlay: Option<ReliableOverlay>,
    retransmit_pending: bool,
}

impl DataState {
    pub fn new(info: Arc<ConnectionInfo>, overlay: bool) -> Self {
        Self {
            core: Core::new(info),
            channel: None,
            buffer: VecDeque::new(),
            buffering: false,
            reassembler: Reassembler::new(),
            next_group: 0,
            overlay: overlay.then(ReliableOverlay::new),
            retransmit_pending: false,
        }
    }

    fn owner(&self) -> Owner {
        self.core.info.owner()
    }

    pub fn record_agent(&self, agent: Option<String>) {
        if agent.is_some() {
            *self.core.info.peer_agent.lock() = agent;
        }
    }

    /// Take ownership of `channel` and route its events to the session
    pub fn attach_channel(
        &mut self,
        channel: Arc<dyn DataChannel>,
        events: &mpsc::UnboundedSender<Event>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.attach(tx);
        self.channel = Some(channel);

        let events = events.clone();
        let owner = self.owner();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let tagged = Event::Channel {
                    owner: owner.clone(),
                    event,
                };
                if events.send(tagged).is_err() {
                    break;
                }
            }
        });
    }

    pub async fn send(&mut self, data: Data, ctx: &SendContext<'_>) {
        let packet = match codec::encode(&data, self.core.info.serialization) {
            Ok(packet) => packet,
            Err(e) => {
                self.core.emit(ConnectionEvent::Error(e.to_string()));
                return;
            }
        };

        let frames = match ctx.chunk_mtu {
            Some(mtu) if self.core.info.serialization.is_binary() && packet.len() > mtu => {
                let group = self.next_group;
                self.next_group = self.next_group.wrapping_add(1);
                let chunks = chunk::split(group, &packet, mtu);
                debug!(
                    connection_id = %self.core.info.id,
                    group,
                    chunks = chunks.len(),
                    "chunking payload"
                );
                let mut frames = Vec::with_capacity(chunks.len());
                for piece in &chunks {
                    match codec::encode_chunk(piece) {
                        Ok(frame) => frames.push(frame),
                        Err(e) => {
                            self.core.emit(ConnectionEvent::Error(e.to_string()));
                            return;
                        }
                    }
                }
                frames
            }
            _ => vec![packet],
        };

        // Chunks go through the overlay one by one so every wrapped frame
        // stays within the channel's unit
        for frame in frames {
            let frame = match self.overlay.as_mut() {
                Some(overlay) => match overlay.wrap(frame) {
                    Ok(wrapped) => wrapped,
                    Err(e) => {
                        self.core.emit(ConnectionEvent::Error(e.to_string()));
                        return;
                    }
                },
                None => frame,
            };
            self.buffered_send(frame, ctx).await;
        }

        if self.overlay.is_some() && !self.retransmit_pending {
            self.retransmit_pending = true;
            schedule(ctx.events, ctx.retransmit_interval, Event::Retransmit(self.owner()));
        }
    }

    async fn buffered_send(&mut self, frame: Bytes, ctx: &SendContext<'_>) {
        if self.buffering || !self.try_send(frame.clone(), ctx).await {
            self.buffer.push_back(frame);
            self.sync_buffer_size();
        }
    }

    async fn try_send(&mut self, frame: Bytes, ctx: &SendContext<'_>) -> bool {
        let result = match &self.channel {
            Some(channel) => channel.send(frame).await,
            None => Err(peerlink_transport::ChannelError::Closed),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                debug!(connection_id = %self.core.info.id, error = %e, "send failed, buffering");
                self.buffering = true;
                schedule(ctx.events, ctx.retry_backoff, Event::RetrySend(self.owner()));
                false
            }
        }
    }

    /// Drain the send buffer in order until a send fails again
    pub async fn retry_buffer(&mut self, ctx: &SendContext<'_>) {
        if !self.core.open {
            return;
        }
        self.buffering = false;
        while let Some(front) = self.buffer.front().cloned() {
            if !self.try_send(front, ctx).await {
                break;
            }
            self.buffer.pop_front();
            self.sync_buffer_size();
        }
    }

    pub async fn retransmit(&mut self, ctx: &SendContext<'_>) {
        self.retransmit_pending = false;
        if !self.core.open {
            return;
        }
        let frames = match &self.overlay {
            Some(overlay) => overlay.retransmissions(),
            None => return,
        };
        for frame in frames {
            self.buffered_send(frame, ctx).await;
        }
        if self.overlay.as_ref().is_some_and(ReliableOverlay::has_unacked) {
            self.retransmit_pending = true;
            schedule(ctx.events, ctx.retransmit_interval, Event::Retransmit(self.owner()));
        }
    }

    pub async fn receive(&mut self, bytes: Bytes, ctx: &SendContext<'_>) {
        let bodies = match self.overlay.as_mut() {
            Some(overlay) => match overlay.receive(&bytes) {
                Ok(received) => {
                    if let Some(ack) = received.ack {
                        self.buffered_send(ack, ctx).await;
                    }
                    received.delivered
                }
                Err(e) => {
                    warn!(connection_id = %self.core.info.id, error = %e, "bad overlay frame");
                    return;
                }
            },
            None => vec![bytes],
        };
        for body in bodies {
            self.deliver(&body);
        }
    }

    fn deliver(&mut self, body: &[u8]) {
        let serialization = self.core.info.serialization;
        match codec::decode(body, serialization) {
            Ok(Decoded::Data(data)) => self.core.emit(ConnectionEvent::Data(data)),
            Ok(Decoded::Chunk(piece)) => match self.reassembler.push(piece) {
                Ok(Some(whole)) => match codec::decode(&whole, serialization) {
                    Ok(Decoded::Data(data)) => self.core.emit(ConnectionEvent::Data(data)),
                    Ok(Decoded::Chunk(_)) => {
                        warn!(connection_id = %self.core.info.id, "nested chunk dropped")
                    }
                    Err(e) => {
                        warn!(connection_id = %self.core.info.id, error = %e, "undecodable payload")
                    }
                },
                Ok(None) => {}
                Err(e) => warn!(connection_id = %self.core.info.id, error = %e, "bad chunk"),
            },
            Err(e) => warn!(connection_id = %self.core.info.id, error = %e, "undecodable payload"),
        }
    }

    fn sync_buffer_size(&self) {
        self.core
            .info
            .buffer_size
            .store(self.buffer.len(), Ordering::SeqCst);
    }

    pub fn shutdown(&mut self) {
        self.core.mark_closed();
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.buffer.clear();
        self.buffering = false;
        self.reassembler.clear();
        self.sync_buffer_size();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use peerlink_core::ConnectionKind;
    use peerlink_transport::{ChannelError, ChannelEvent};

    #[derive(Default)]
    struct RecordingChannel {
        frames: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl DataChannel for RecordingChannel {
        fn label(&self) -> String {
            "recording".to_string()
        }

        fn attach(&self, _sink: mpsc::UnboundedSender<ChannelEvent>) {}

        async fn send(&self, data: Bytes) -> std::result::Result<(), ChannelError> {
            self.frames.lock().push(data);
            Ok(())
        }

        fn close(&self) {}
    }

    fn state(overlay: bool) -> DataState {
        let info = Arc::new(ConnectionInfo::new(
            "dc_test".to_string(),
            "bob".to_string(),
            ConnectionKind::Data,
            None,
            None,
            Serialization::Binary,
            overlay,
        ));
        DataState::new(info, overlay)
    }

    #[tokio::test]
    async fn test_overlay_payload_is_chunked_to_unit() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = SendContext {
            events: &tx,
            retry_backoff: Duration::from_millis(10),
            retransmit_interval: Duration::from_secs(5),
            chunk_mtu: Some(1024),
        };
        let channel = Arc::new(RecordingChannel::default());
        let mut sender = state(true);
        sender.attach_channel(channel.clone(), &tx);

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
        sender.send(Data::Bytes(Bytes::from(payload.clone())), &ctx).await;

        let frames = channel.frames.lock().clone();
        assert!(frames.len() >= 5, "got {} frames", frames.len());
        assert!(frames.iter().all(|f| f.len() < 1024 + 64));

        let mut receiver = state(true);
        let mut events = receiver.core.info.events.subscribe();
        for frame in frames {
            receiver.receive(frame, &ctx).await;
        }
        match events.try_recv() {
            Ok(ConnectionEvent::Data(Data::Bytes(bytes))) => assert_eq!(bytes.to_vec(), payload),
            other => panic!("unexpected {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }
}
