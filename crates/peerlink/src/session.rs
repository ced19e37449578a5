//! Session actor
//!
//! One task per [`Peer`](crate::Peer) owns the relay link, the connection
//! registry, the pending-message store and the negotiation engine. Handles,
//! transports, primitives and timers all talk to it through one channel, so
//! every state change happens in the order events were posted.

use parking_lot::Mutex;
use peerlink_core::{
    id::connection_id, AnswerPayload, CandidatePayload, ConnectionKind, Data, MessageType,
    OfferPayload, SessionDescription, SignalMessage, AGENT,
};
use peerlink_transport::{
    Capabilities, ChannelEvent, IceConnectionState, MediaStream, PrimitiveEvent, Relay,
    SignalEvent, SignalLink, SignalingState,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::connection::{
    Connection, ConnectionHandle, ConnectionInfo, DataConnection, DataState, MediaConnection,
    MediaState, Owner, SendContext, NOT_OPEN,
};
use crate::emitter::Emitter;
use crate::error::{PeerError, Result};
use crate::event::{ConnectionEvent, PeerEvent};
use crate::negotiator::{Job, Negotiator, Op, Outcome, PoolKey};
use crate::options::{CallOptions, ConnectOptions, PeerOptions};
use crate::registry::Registry;

/// Requests posted by application handles
pub(crate) enum Command {
    Connect {
        peer: String,
        options: ConnectOptions,
        reply: oneshot::Sender<Result<DataConnection>>,
    },
    Call {
        peer: String,
        stream: MediaStream,
        options: CallOptions,
        reply: oneshot::Sender<Result<MediaConnection>>,
    },
    Answer {
        owner: Owner,
        stream: MediaStream,
    },
    Send {
        owner: Owner,
        data: Data,
    },
    Close(Owner),
    Disconnect,
    Reconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    Destroy,
    Lookup {
        owner: Owner,
        reply: oneshot::Sender<Option<ConnectionHandle>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<(String, Vec<ConnectionHandle>)>>,
    },
}

/// Everything the actor reacts to
pub(crate) enum Event {
    Start,
    /// Startup validation failed
    Abort(PeerError),
    Command(Command),
    IdRetrieved(std::result::Result<String, String>),
    Signal {
        generation: u64,
        event: SignalEvent,
    },
    Primitive {
        key: PoolKey,
        primitive_id: String,
        event: PrimitiveEvent,
    },
    Channel {
        owner: Owner,
        event: ChannelEvent,
    },
    Negotiated(Outcome),
    RetrySend(Owner),
    Retransmit(Owner),
    /// Deferred half of `disconnect()`
    Disconnect,
}

/// How many closed connection ids are remembered for dropping late messages
const RETIRED_LIMIT: usize = 256;

/// Post `event` after `after`
pub(crate) fn schedule(events: &mpsc::UnboundedSender<Event>, after: Duration, event: Event) {
    let events = events.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = events.send(event);
    });
}

/// Session flags readable from handles
pub(crate) struct PeerShared {
    pub id: Mutex<Option<String>>,
    pub open: AtomicBool,
    pub disconnected: AtomicBool,
    pub destroyed: AtomicBool,
    pub events: Emitter<PeerEvent>,
}

impl PeerShared {
    pub fn new() -> Self {
        Self {
            id: Mutex::new(None),
            open: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            events: Emitter::new(),
        }
    }
}

pub(crate) struct Session {
    options: PeerOptions,
    requested_id: Option<String>,
    relay: Arc<dyn Relay>,
    shared: Arc<PeerShared>,
    tx: mpsc::UnboundedSender<Event>,
    negotiator: Negotiator,
    caps: Capabilities,
    link: Option<Box<dyn SignalLink>>,
    generation: u64,
    id: Option<String>,
    last_server_id: Option<String>,
    open: bool,
    disconnected: bool,
    disconnect_scheduled: bool,
    destroyed: bool,
    registry: Registry,
    pending: HashMap<String, Vec<SignalMessage>>,
    retired: VecDeque<String>,
}

impl Session {
    pub fn new(
        options: PeerOptions,
        requested_id: Option<String>,
        relay: Arc<dyn Relay>,
        negotiator: Negotiator,
        shared: Arc<PeerShared>,
        tx: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let caps = negotiator.capabilities();
        Self {
            options,
            requested_id,
            relay,
            shared,
            tx,
            negotiator,
            caps,
            link: None,
            generation: 0,
            id: None,
            last_server_id: None,
            open: false,
            disconnected: false,
            disconnect_scheduled: false,
            destroyed: false,
            registry: Registry::default(),
            pending: HashMap::new(),
            retired: VecDeque::new(),
        }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(event).await;
            if self.destroyed && self.disconnected {
                break;
            }
        }
        debug!(id = ?self.last_server_id, "session stopped");
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Start => self.start(),
            Event::Abort(e) => self.abort(e),
            Event::Command(command) => self.handle_command(command).await,
            Event::IdRetrieved(result) => {
                if self.destroyed || self.disconnected {
                    return;
                }
                match result {
                    Ok(id) => self.initialize(id),
                    Err(e) => self.abort(PeerError::ServerError(format!(
                        "could not get an ID from the server: {}",
                        e
                    ))),
                }
            }
            Event::Signal { generation, event } => {
                if generation == self.generation {
                    self.handle_signal(event).await;
                } else {
                    debug!(generation, current = self.generation, "event from retired link");
                }
            }
            Event::Primitive {
                key,
                primitive_id,
                event,
            } => self.handle_primitive_event(key, primitive_id, event),
            Event::Channel { owner, event } => self.handle_channel_event(owner, event).await,
            Event::Negotiated(outcome) => self.handle_outcome(outcome),
            Event::RetrySend(owner) => {
                let chunk_mtu = self.caps.chunked_mtu;
                if let Some(data) = self.registry.data_mut(&owner) {
                    let ctx = send_context(&self.tx, &self.options, chunk_mtu, data);
                    data.retry_buffer(&ctx).await;
                }
            }
            Event::Retransmit(owner) => {
                let chunk_mtu = self.caps.chunked_mtu;
                if let Some(data) = self.registry.data_mut(&owner) {
                    let ctx = send_context(&self.tx, &self.options, chunk_mtu, data);
                    data.retransmit(&ctx).await;
                }
            }
            Event::Disconnect => self.finish_disconnect(),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                peer,
                options,
                reply,
            } => {
                let result = self.connect(peer, options).await;
                let _ = reply.send(result);
            }
            Command::Call {
                peer,
                stream,
                options,
                reply,
            } => {
                let result = self.call(peer, stream, options).await;
                let _ = reply.send(result);
            }
            Command::Answer { owner, stream } => self.answer(&owner, stream).await,
            Command::Send { owner, data } => self.send_data(&owner, data).await,
            Command::Close(owner) => self.close_connection(&owner),
            Command::Disconnect => self.disconnect(),
            Command::Reconnect { reply } => {
                let result = self.reconnect();
                let _ = reply.send(result);
            }
            Command::Destroy => self.destroy(),
            Command::Lookup { owner, reply } => {
                let _ = reply.send(self.registry.get(&owner).map(|c| c.handle(&self.tx)));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshot(&self.tx));
            }
        }
    }

    // ========================================================================
    // Relay link lifecycle
    // ========================================================================

    fn start(&mut self) {
        self.open_link();
        match self.requested_id.clone() {
            Some(id) => self.initialize(id),
            None => self.request_id(),
        }
    }

    fn request_id(&self) {
        let relay = self.relay.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = relay.retrieve_id().await.map_err(|e| e.to_string());
            let _ = tx.send(Event::IdRetrieved(result));
        });
    }

    fn open_link(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.link = Some(self.relay.open_link(tx));

        let events = self.tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if events.send(Event::Signal { generation, event }).is_err() {
                    break;
                }
            }
        });
    }

    fn initialize(&mut self, id: String) {
        info!(id = %id, "starting session");
        self.id = Some(id.clone());
        *self.shared.id.lock() = Some(id.clone());
        if let Some(link) = &self.link {
            link.start(&id, &self.options.token);
        }
    }

    fn send_signal(&self, message: SignalMessage) {
        match &self.link {
            Some(link) => link.send(message),
            None => debug!(kind = %message.kind, "no relay link, message dropped"),
        }
    }

    fn emit(&self, event: PeerEvent) {
        self.shared.events.emit(event);
    }

    fn emit_error(&self, error: PeerError) {
        debug!(kind = %error.kind(), error = %error, "session error");
        self.emit(PeerEvent::Error(error));
    }

    /// Destroy a session that never reached the relay, otherwise only
    /// disconnect it; then report `error`.
    fn abort(&mut self, error: PeerError) {
        error!(kind = %error.kind(), error = %error, "aborting");
        if self.last_server_id.is_none() {
            self.destroy();
        } else {
            self.disconnect();
        }
        self.emit_error(error);
    }

    fn disconnect(&mut self) {
        if self.disconnected || self.disconnect_scheduled {
            return;
        }
        self.disconnect_scheduled = true;
        let _ = self.tx.send(Event::Disconnect);
    }

    fn finish_disconnect(&mut self) {
        self.disconnect_scheduled = false;
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        self.open = false;
        self.shared.disconnected.store(true, Ordering::SeqCst);
        self.shared.open.store(false, Ordering::SeqCst);
        if let Some(link) = self.link.take() {
            link.close();
        }

        let id = self.id.take();
        *self.shared.id.lock() = None;
        info!(id = ?id, "disconnected from relay");
        self.emit(PeerEvent::Disconnected(id.clone()));
        self.last_server_id = id;
    }

    fn reconnect(&mut self) -> Result<()> {
        if self.disconnected && !self.destroyed {
            info!(id = ?self.last_server_id, "reconnecting");
            self.disconnected = false;
            self.shared.disconnected.store(false, Ordering::SeqCst);
            self.open_link();
            match self.last_server_id.clone() {
                Some(id) => self.initialize(id),
                None => self.request_id(),
            }
            Ok(())
        } else if self.destroyed {
            Err(PeerError::Fatal(
                "this peer cannot reconnect to the server; it has already been destroyed"
                    .to_string(),
            ))
        } else if !self.open {
            Err(PeerError::Fatal(
                "cannot reconnect while the initial connection is still in progress".to_string(),
            ))
        } else {
            Err(PeerError::Fatal(format!(
                "peer {} cannot reconnect because it is not disconnected from the server",
                self.id.as_deref().unwrap_or_default()
            )))
        }
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        info!(connections = self.registry.len(), "destroying peer");
        for peer in self.registry.peers() {
            self.cleanup_peer(&peer);
        }
        self.negotiator.clear();
        self.pending.clear();
        self.emit(PeerEvent::Close);
        self.disconnect();
        self.destroyed = true;
        self.shared.destroyed.store(true, Ordering::SeqCst);
    }

    // ========================================================================
    // Relay messages
    // ========================================================================

    async fn handle_signal(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::Message(message) => self.handle_message(message).await,
            SignalEvent::Disconnected => {
                if !self.disconnected {
                    self.emit_error(PeerError::Network("lost connection to server".to_string()));
                    self.disconnect();
                }
            }
            SignalEvent::Error(e) => self.abort(PeerError::Network(e)),
            SignalEvent::Close => {
                if !self.disconnected {
                    self.abort(PeerError::Network(
                        "underlying socket is already closed".to_string(),
                    ));
                }
            }
        }
    }

    async fn handle_message(&mut self, message: SignalMessage) {
        let src = message.src.clone().unwrap_or_default();
        match message.kind {
            MessageType::Open => {
                self.open = true;
                self.shared.open.store(true, Ordering::SeqCst);
                if let Some(id) = self.id.clone() {
                    info!(id = %id, "session open");
                    self.emit(PeerEvent::Open(id));
                }
            }
            MessageType::Error => {
                let text = message.error_text().unwrap_or("unknown server error").to_string();
                self.abort(PeerError::ServerError(text));
            }
            MessageType::IdTaken => {
                let id = self.id.clone().unwrap_or_default();
                self.abort(PeerError::UnavailableId(id));
            }
            MessageType::InvalidKey => {
                let key = self.options.key.clone();
                self.abort(PeerError::InvalidKey(key));
            }
            MessageType::Leave => {
                debug!(peer = %src, "peer left");
                self.cleanup_peer(&src);
            }
            MessageType::Expire => self.emit_error(PeerError::PeerUnavailable(src)),
            MessageType::Offer => self.handle_offer(src, message).await,
            MessageType::Answer | MessageType::Candidate => {
                let Some(connection_id) = message.connection_id().map(str::to_string) else {
                    warn!(peer = %src, kind = %message.kind, "message without connection id");
                    return;
                };
                if self.retired.contains(&connection_id) {
                    debug!(peer = %src, connection_id = %connection_id, kind = %message.kind, "message for a closed connection dropped");
                    return;
                }
                let owner = Owner::new(&src, &connection_id);
                let routable = self
                    .registry
                    .get(&owner)
                    .is_some_and(|c| c.primitive().is_some());
                if routable {
                    self.handle_connection_message(&owner, message);
                } else {
                    debug!(peer = %src, connection_id = %connection_id, kind = %message.kind, "buffering message");
                    self.pending.entry(connection_id).or_default().push(message);
                }
            }
            MessageType::Unknown => warn!(peer = %src, "unrecognized message type"),
        }
    }

    async fn handle_offer(&mut self, src: String, message: SignalMessage) {
        let payload: OfferPayload = match message.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer = %src, error = %e, "malformed offer");
                return;
            }
        };
        let owner = Owner::new(&src, &payload.connection_id);
        if self.registry.get(&owner).is_some() {
            warn!(peer = %src, connection_id = %owner.connection_id, "offer for an existing connection ignored");
            return;
        }

        match payload.kind {
            ConnectionKind::Media => {
                let info = Arc::new(ConnectionInfo::new(
                    payload.connection_id,
                    src,
                    ConnectionKind::Media,
                    None,
                    payload.metadata,
                    Default::default(),
                    false,
                ));
                self.registry
                    .insert(Connection::Media(MediaState::new(info.clone(), Some(payload.sdp))));
                self.emit(PeerEvent::Call(MediaConnection::new(info, self.tx.clone())));
            }
            ConnectionKind::Data => {
                let reliable = payload.reliable.unwrap_or(false);
                let info = Arc::new(ConnectionInfo::new(
                    payload.connection_id,
                    src,
                    ConnectionKind::Data,
                    payload.label,
                    payload.metadata,
                    payload.serialization.unwrap_or_default(),
                    reliable,
                ));
                let state = DataState::new(info.clone(), !self.caps.sctp && reliable);
                state.record_agent(payload.browser);
                self.registry.insert(Connection::Data(state));
                self.emit(PeerEvent::Connection(DataConnection::new(info, self.tx.clone())));

                self.start_connection(&owner, None, None, Some(payload.sdp)).await;
                self.replay_pending(&owner);
            }
        }
    }

    fn replay_pending(&mut self, owner: &Owner) {
        let messages = self.pending.remove(&owner.connection_id).unwrap_or_default();
        if !messages.is_empty() {
            debug!(connection_id = %owner.connection_id, count = messages.len(), "replaying buffered messages");
        }
        for message in messages {
            self.handle_connection_message(owner, message);
        }
    }

    /// ANSWER and CANDIDATE for a connection that has a primitive
    fn handle_connection_message(&mut self, owner: &Owner, message: SignalMessage) {
        match message.kind {
            MessageType::Answer => {
                let payload: AnswerPayload = match message.payload_as() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(connection_id = %owner.connection_id, error = %e, "malformed answer");
                        return;
                    }
                };
                let awaiting = self
                    .registry
                    .get_mut(owner)
                    .is_some_and(|c| std::mem::replace(&mut c.core_mut().awaiting_answer, false));
                if !awaiting {
                    debug!(connection_id = %owner.connection_id, "duplicate answer dropped");
                    return;
                }
                if let Some(Connection::Data(data)) = self.registry.get(owner) {
                    data.record_agent(payload.browser);
                }
                self.enqueue(owner, Op::RemoteDescription(payload.sdp));
                if let Some(media) = self.registry.media_mut(owner) {
                    media.core.mark_open();
                }
            }
            MessageType::Candidate => match message.payload_as::<CandidatePayload>() {
                Ok(payload) => self.enqueue(owner, Op::Candidate(payload.candidate)),
                Err(e) => warn!(connection_id = %owner.connection_id, error = %e, "malformed candidate"),
            },
            other => {
                warn!(connection_id = %owner.connection_id, kind = %other, "unexpected message for connection")
            }
        }
    }

    // ========================================================================
    // Negotiation
    // ========================================================================

    fn enqueue(&self, owner: &Owner, op: Op) {
        let Some(connection) = self.registry.get(owner) else {
            return;
        };
        let Some(primitive_id) = connection.primitive() else {
            debug!(connection_id = %owner.connection_id, ?op, "no primitive yet");
            return;
        };
        let core = connection.core();
        let job = Job {
            owner: owner.clone(),
            closed: core.closed.clone(),
            patch_sdp: self.negotiator.patches_sdp(core.info.kind, core.info.reliable),
            op,
        };
        let key = PoolKey::new(core.info.kind, &owner.peer);
        self.negotiator.enqueue(&key, primitive_id, job);
    }

    /// Attach a primitive to a registered connection and kick off
    /// negotiation: as offerer when `offer` is `None`, else as answerer.
    async fn start_connection(
        &mut self,
        owner: &Owner,
        requested: Option<&str>,
        stream: Option<MediaStream>,
        offer: Option<SessionDescription>,
    ) {
        let Some(info) = self.registry.get(owner).map(|c| c.core().info.clone()) else {
            return;
        };
        let (primitive_id, primitive) =
            match self.negotiator.acquire(info.kind, owner, requested).await {
                Ok(acquired) => acquired,
                Err(e) => {
                    self.emit_error(PeerError::Webrtc(e.to_string()));
                    return;
                }
            };
        if let Some(connection) = self.registry.get_mut(owner) {
            connection.core_mut().set_primitive(Some(primitive_id));
        }

        if let Some(stream) = &stream {
            if let Err(e) = primitive.add_stream(stream).await {
                self.emit_error(PeerError::Webrtc(e.to_string()));
            }
        }

        match offer {
            Some(description) => self.enqueue(owner, Op::RemoteDescription(description)),
            None => {
                if info.kind == ConnectionKind::Data {
                    let reliable = self.caps.sctp || info.reliable;
                    match primitive.create_data_channel(&info.label, reliable).await {
                        Ok(channel) => {
                            if let Some(data) = self.registry.data_mut(owner) {
                                data.attach_channel(channel, &self.tx);
                            }
                        }
                        Err(e) => self.emit_error(PeerError::Webrtc(e.to_string())),
                    }
                }
                if !self.caps.negotiation_needed {
                    self.enqueue(owner, Op::MakeOffer);
                }
            }
        }
    }

    fn handle_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::LocalDescription {
                owner,
                primitive_id,
                description,
            } => {
                let Some(connection) = self.registry.get(&owner) else {
                    debug!(connection_id = %owner.connection_id, "description for a removed connection");
                    return;
                };
                let core = connection.core();
                if connection.primitive() != Some(primitive_id.as_str())
                    || core.closed.load(Ordering::SeqCst)
                {
                    debug!(connection_id = %owner.connection_id, "stale description dropped");
                    return;
                }

                let info = &core.info;
                let is_offer = description.is_offer();
                let message = if is_offer {
                    let is_data = info.kind == ConnectionKind::Data;
                    let payload = OfferPayload {
                        sdp: description,
                        kind: info.kind,
                        label: is_data.then(|| info.label.clone()),
                        connection_id: info.id.clone(),
                        reliable: is_data.then_some(info.reliable),
                        serialization: is_data.then_some(info.serialization),
                        metadata: info.metadata.clone(),
                        browser: Some(AGENT.to_string()),
                    };
                    SignalMessage::to_peer(MessageType::Offer, &owner.peer, &payload)
                } else {
                    let payload = AnswerPayload {
                        sdp: description,
                        kind: info.kind,
                        connection_id: info.id.clone(),
                        browser: Some(AGENT.to_string()),
                    };
                    SignalMessage::to_peer(MessageType::Answer, &owner.peer, &payload)
                };

                match message {
                    Ok(message) => {
                        debug!(peer = %owner.peer, connection_id = %owner.connection_id, kind = %message.kind, "sending description");
                        if is_offer {
                            if let Some(connection) = self.registry.get_mut(&owner) {
                                connection.core_mut().awaiting_answer = true;
                            }
                        }
                        self.send_signal(message);
                    }
                    Err(e) => self.emit_error(PeerError::Webrtc(e.to_string())),
                }
            }
            Outcome::Failed { owner, message } => {
                debug!(connection_id = %owner.connection_id, "negotiation abandoned");
                self.emit_error(PeerError::Webrtc(message));
            }
        }
    }

    fn handle_primitive_event(&mut self, key: PoolKey, primitive_id: String, event: PrimitiveEvent) {
        let Some(owner) = self.negotiator.owner_of(&key, &primitive_id).cloned() else {
            debug!(primitive = %primitive_id, "event from a released primitive");
            return;
        };

        match event {
            PrimitiveEvent::IceCandidate(candidate) => {
                if self.negotiator.is_muted(&key, &primitive_id) {
                    return;
                }
                let payload = CandidatePayload {
                    candidate,
                    kind: key.kind,
                    connection_id: owner.connection_id.clone(),
                };
                match SignalMessage::to_peer(MessageType::Candidate, &owner.peer, &payload) {
                    Ok(message) => self.send_signal(message),
                    Err(e) => warn!(error = %e, "could not encode candidate"),
                }
            }
            PrimitiveEvent::IceConnectionState(state) => match state {
                IceConnectionState::Failed | IceConnectionState::Disconnected => {
                    info!(peer = %owner.peer, connection_id = %owner.connection_id, ?state, "connectivity lost");
                    self.close_connection(&owner);
                }
                IceConnectionState::Completed => self.negotiator.mute(&key, &primitive_id),
                other => debug!(connection_id = %owner.connection_id, state = ?other, "ice state"),
            },
            PrimitiveEvent::NegotiationNeeded => {
                let stable = self
                    .negotiator
                    .primitive(&key, &primitive_id)
                    .is_some_and(|p| p.signaling_state() == SignalingState::Stable);
                let originator = self
                    .registry
                    .get(&owner)
                    .is_some_and(|c| c.core().originator);
                if stable && originator {
                    self.enqueue(&owner, Op::MakeOffer);
                } else {
                    debug!(connection_id = %owner.connection_id, stable, originator, "negotiation needed ignored");
                }
            }
            PrimitiveEvent::DataChannel(channel) => match self.registry.data_mut(&owner) {
                Some(data) => data.attach_channel(channel, &self.tx),
                None => warn!(peer = %owner.peer, connection_id = %owner.connection_id, "data channel for unknown connection"),
            },
            PrimitiveEvent::RemoteStream(stream) => match self.registry.media_mut(&owner) {
                Some(media) => media.add_remote_stream(stream),
                None => warn!(peer = %owner.peer, connection_id = %owner.connection_id, "stream for unknown connection"),
            },
        }
    }

    // ========================================================================
    // Connections
    // ========================================================================

    fn refuse_while_disconnected(&self) -> PeerError {
        warn!("cannot connect to new peers after disconnecting from the server");
        let error = PeerError::refused_while_disconnected();
        self.emit_error(error.clone());
        error
    }

    async fn connect(&mut self, peer: String, options: ConnectOptions) -> Result<DataConnection> {
        if self.disconnected || self.destroyed {
            return Err(self.refuse_while_disconnected());
        }
        let id = options
            .connection_id
            .unwrap_or_else(|| connection_id(ConnectionKind::Data.id_prefix()));
        let owner = Owner::new(&peer, &id);
        if self.registry.get(&owner).is_some() {
            return Err(PeerError::Fatal(format!("connection {} already exists", id)));
        }

        let info = Arc::new(ConnectionInfo::new(
            id,
            peer,
            ConnectionKind::Data,
            options.label,
            options.metadata,
            options.serialization,
            options.reliable,
        ));
        let mut state = DataState::new(info.clone(), !self.caps.sctp && options.reliable);
        state.core.originator = true;
        self.registry.insert(Connection::Data(state));
        debug!(peer = %owner.peer, connection_id = %owner.connection_id, "connecting");

        self.start_connection(&owner, options.primitive.as_deref(), None, None)
            .await;
        Ok(DataConnection::new(info, self.tx.clone()))
    }

    async fn call(
        &mut self,
        peer: String,
        stream: MediaStream,
        options: CallOptions,
    ) -> Result<MediaConnection> {
        if self.disconnected || self.destroyed {
            return Err(self.refuse_while_disconnected());
        }
        let id = options
            .connection_id
            .unwrap_or_else(|| connection_id(ConnectionKind::Media.id_prefix()));
        let owner = Owner::new(&peer, &id);
        if self.registry.get(&owner).is_some() {
            return Err(PeerError::Fatal(format!("connection {} already exists", id)));
        }

        let info = Arc::new(ConnectionInfo::new(
            id,
            peer,
            ConnectionKind::Media,
            None,
            options.metadata,
            Default::default(),
            false,
        ));
        let mut state = MediaState::new(info.clone(), None);
        state.core.originator = true;
        state.set_local_stream(stream.clone());
        self.registry.insert(Connection::Media(state));
        debug!(peer = %owner.peer, connection_id = %owner.connection_id, "calling");

        self.start_connection(&owner, options.primitive.as_deref(), Some(stream), None)
            .await;
        Ok(MediaConnection::new(info, self.tx.clone()))
    }

    async fn answer(&mut self, owner: &Owner, stream: MediaStream) {
        let Some(media) = self.registry.media_mut(owner) else {
            warn!(connection_id = %owner.connection_id, "answer for unknown call");
            return;
        };
        if media.has_local_stream() {
            warn!(connection_id = %owner.connection_id, "local stream already exists on this call, answer ignored");
            return;
        }
        media.set_local_stream(stream.clone());
        let Some(offer) = media.offer.take() else {
            warn!(connection_id = %owner.connection_id, "no offer to answer");
            return;
        };

        self.start_connection(owner, None, Some(stream), Some(offer)).await;
        self.replay_pending(owner);
        if let Some(media) = self.registry.media_mut(owner) {
            media.core.mark_open();
        }
    }

    async fn send_data(&mut self, owner: &Owner, data: Data) {
        let chunk_mtu = self.caps.chunked_mtu;
        let Some(state) = self.registry.data_mut(owner) else {
            debug!(connection_id = %owner.connection_id, "send on a removed connection");
            return;
        };
        if !state.core.open {
            state.core.emit(ConnectionEvent::Error(NOT_OPEN.to_string()));
            return;
        }
        let ctx = send_context(&self.tx, &self.options, chunk_mtu, state);
        state.send(data, &ctx).await;
    }

    async fn handle_channel_event(&mut self, owner: Owner, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => {
                if let Some(data) = self.registry.data_mut(&owner) {
                    if !data.core.closed.load(Ordering::SeqCst) {
                        debug!(peer = %owner.peer, connection_id = %owner.connection_id, "data connection open");
                        data.core.mark_open();
                    }
                }
            }
            ChannelEvent::Message(bytes) => {
                let chunk_mtu = self.caps.chunked_mtu;
                if let Some(data) = self.registry.data_mut(&owner) {
                    let ctx = send_context(&self.tx, &self.options, chunk_mtu, data);
                    data.receive(bytes, &ctx).await;
                }
            }
            ChannelEvent::Close => self.close_connection(&owner),
        }
    }

    /// Close an open connection: release its primitive, notify once and
    /// drop it from the registry. No-op unless open.
    fn close_connection(&mut self, owner: &Owner) {
        let Some(connection) = self.registry.get_mut(owner) else {
            return;
        };
        if !connection.is_open() {
            return;
        }
        debug!(peer = %owner.peer, connection_id = %owner.connection_id, "closing connection");
        connection.shutdown();
        self.release_primitive(owner);
        self.retire(owner);
        if let Some(connection) = self.registry.remove(owner) {
            connection.core().emit(ConnectionEvent::Close);
        }
    }

    /// Tear down a connection that never opened, without a close event
    fn abandon_connection(&mut self, owner: &Owner) {
        if let Some(connection) = self.registry.get_mut(owner) {
            debug!(peer = %owner.peer, connection_id = %owner.connection_id, "abandoning connection");
            connection.shutdown();
        }
        self.release_primitive(owner);
        self.retire(owner);
        self.registry.remove(owner);
    }

    /// Forget buffered messages for a torn-down connection and drop any
    /// that still arrive for it
    fn retire(&mut self, owner: &Owner) {
        self.pending.remove(&owner.connection_id);
        if self.retired.len() == RETIRED_LIMIT {
            self.retired.pop_front();
        }
        self.retired.push_back(owner.connection_id.clone());
    }

    fn release_primitive(&mut self, owner: &Owner) {
        let Some(connection) = self.registry.get_mut(owner) else {
            return;
        };
        let kind = connection.kind();
        let primitive = connection.primitive().map(str::to_string);
        connection.core_mut().set_primitive(None);
        if let Some(id) = primitive {
            self.negotiator.cleanup(&PoolKey::new(kind, &owner.peer), &id);
        }
    }

    fn cleanup_peer(&mut self, peer: &str) {
        for owner in self.registry.owners_for(peer) {
            let open = self.registry.get(&owner).is_some_and(Connection::is_open);
            if open {
                self.close_connection(&owner);
            } else {
                self.abandon_connection(&owner);
            }
        }
    }
}

/// Chunk size for `data`: the platform's limit, or our own limit when the
/// remote agent is known to need chunking.
fn send_context<'a>(
    events: &'a mpsc::UnboundedSender<Event>,
    options: &PeerOptions,
    platform_mtu: Option<usize>,
    data: &DataState,
) -> SendContext<'a> {
    let remote_needs_chunks = data.core.info.peer_agent.lock().as_deref() == Some("Chrome");
    SendContext {
        events,
        retry_backoff: options.retry_backoff,
        retransmit_interval: options.retransmit_interval,
        chunk_mtu: platform_mtu.or_else(|| remote_needs_chunks.then_some(options.chunk_mtu)),
    }
}
