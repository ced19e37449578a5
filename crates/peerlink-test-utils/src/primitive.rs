//! In-process negotiation primitives
//!
//! Offers and answers carry the token of the primitive that produced them.
//! When an offerer applies an answer it looks the answerer up on the shared
//! [`FakeNetwork`], wires every data channel it opened to a twin on the
//! other side, exchanges media streams and reports the link as connected.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use peerlink_core::{id::random_token, ConnectionKind, IceCandidate, SessionDescription};
use peerlink_transport::{
    Capabilities, ChannelError, ChannelEvent, DataChannel, IceConnectionState, MediaStream,
    NegotiationPrimitive, PrimitiveConfig, PrimitiveEvent, PrimitiveProvider, SignalingState,
    TransportError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

const OFFER_PREFIX: &str = "fake-offer:";
const ANSWER_PREFIX: &str = "fake-answer:";
const CANDIDATE_DELAY: Duration = Duration::from_millis(10);

/// State shared by every primitive of one [`FakeProvider`]
#[derive(Default)]
pub struct FakeNetwork {
    primitives: Mutex<HashMap<String, Weak<FakePrimitive>>>,
    fail_sends: AtomicBool,
    frames_sent: AtomicUsize,
    created: AtomicUsize,
    closed: AtomicUsize,
    candidates_applied: AtomicUsize,
    applied: Mutex<Vec<String>>,
    channel_closes: AtomicUsize,
}

impl FakeNetwork {
    /// Make every channel send fail with backpressure
    pub fn set_send_failure(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }

    /// Frames successfully handed to a channel
    pub fn frames_sent(&self) -> usize {
        self.frames_sent.load(Ordering::SeqCst)
    }

    pub fn primitives_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn primitives_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn candidates_applied(&self) -> usize {
        self.candidates_applied.load(Ordering::SeqCst)
    }

    /// Every remote candidate applied, in the order it was applied
    pub fn applied_candidates(&self) -> Vec<String> {
        self.applied.lock().clone()
    }

    /// Report `state` from every live primitive. Returns how many reported.
    pub fn raise_ice_state(&self, state: IceConnectionState) -> usize {
        let live = self.live();
        for primitive in &live {
            primitive.emit(PrimitiveEvent::IceConnectionState(state));
        }
        live.len()
    }

    /// Have every live primitive gather one more local candidate
    pub fn gather_candidates(&self) -> usize {
        let live = self.live();
        for primitive in &live {
            primitive.emit(PrimitiveEvent::IceCandidate(primitive.next_candidate()));
        }
        live.len()
    }

    /// `close()` calls on channels, including repeated ones
    pub fn channel_closes(&self) -> usize {
        self.channel_closes.load(Ordering::SeqCst)
    }

    fn lookup(&self, token: &str) -> Option<Arc<FakePrimitive>> {
        self.primitives.lock().get(token).and_then(Weak::upgrade)
    }

    fn live(&self) -> Vec<Arc<FakePrimitive>> {
        self.primitives
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

/// Provider of [`FakePrimitive`]s. Clones share one network, so two peers
/// built from clones of the same provider can reach each other.
#[derive(Clone)]
pub struct FakeProvider {
    caps: Capabilities,
    network: Arc<FakeNetwork>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::default())
    }

    pub fn with_capabilities(caps: Capabilities) -> Self {
        Self {
            caps,
            network: Arc::new(FakeNetwork::default()),
        }
    }

    pub fn network(&self) -> Arc<FakeNetwork> {
        self.network.clone()
    }
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrimitiveProvider for FakeProvider {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    async fn create(
        &self,
        _config: &PrimitiveConfig,
        kind: ConnectionKind,
        events: mpsc::UnboundedSender<PrimitiveEvent>,
    ) -> Result<Arc<dyn NegotiationPrimitive>, TransportError> {
        let primitive = Arc::new(FakePrimitive {
            token: random_token(),
            kind,
            network: self.network.clone(),
            events,
            raises_negotiation_needed: self.caps.negotiation_needed,
            gathered: AtomicUsize::new(0),
            state: Mutex::new(PrimitiveState {
                signaling: SignalingState::Stable,
                has_remote: false,
                channels: Vec::new(),
                streams: Vec::new(),
                candidates: Vec::new(),
            }),
        });
        self.network
            .primitives
            .lock()
            .insert(primitive.token.clone(), Arc::downgrade(&primitive));
        self.network.created.fetch_add(1, Ordering::SeqCst);
        Ok(primitive)
    }
}

struct PrimitiveState {
    signaling: SignalingState,
    has_remote: bool,
    channels: Vec<Arc<FakeChannel>>,
    streams: Vec<MediaStream>,
    candidates: Vec<IceCandidate>,
}

pub struct FakePrimitive {
    token: String,
    kind: ConnectionKind,
    network: Arc<FakeNetwork>,
    events: mpsc::UnboundedSender<PrimitiveEvent>,
    raises_negotiation_needed: bool,
    gathered: AtomicUsize,
    state: Mutex<PrimitiveState>,
}

impl FakePrimitive {
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Remote candidates applied so far
    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    fn emit(&self, event: PrimitiveEvent) {
        let _ = self.events.send(event);
    }

    /// Local candidates are numbered per primitive: `candidate:{token}-{n} ...`
    fn next_candidate(&self) -> IceCandidate {
        let n = self.gathered.fetch_add(1, Ordering::SeqCst);
        IceCandidate {
            candidate: format!(
                "candidate:{}-{} 1 udp 2122260223 127.0.0.1 9 typ host",
                self.token, n
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    fn negotiation_needed(&self) {
        if self.raises_negotiation_needed && self.signaling_state() == SignalingState::Stable {
            self.emit(PrimitiveEvent::NegotiationNeeded);
        }
    }

    fn streams(&self) -> Vec<MediaStream> {
        self.state.lock().streams.clone()
    }

    /// Wire our channels and streams to `answerer`
    fn pair_with(&self, answerer: &FakePrimitive) {
        let channels = self.state.lock().channels.clone();
        for channel in channels {
            let twin = FakeChannel::new(&channel.label, self.network.clone());
            FakeChannel::link(&channel, &twin);
            answerer.emit(PrimitiveEvent::DataChannel(twin.clone()));
            twin.raise(ChannelEvent::Open);
            channel.raise(ChannelEvent::Open);
        }
        for stream in self.streams() {
            answerer.emit(PrimitiveEvent::RemoteStream(stream));
        }
        for stream in answerer.streams() {
            self.emit(PrimitiveEvent::RemoteStream(stream));
        }
        for side in [self, answerer] {
            side.emit(PrimitiveEvent::IceConnectionState(IceConnectionState::Connected));
        }
    }
}

#[async_trait]
impl NegotiationPrimitive for FakePrimitive {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Webrtc("primitive closed".to_string()));
        }
        Ok(SessionDescription::offer(format!("{}{}", OFFER_PREFIX, self.token)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if self.signaling_state() != SignalingState::HaveRemoteOffer {
            return Err(TransportError::Webrtc("no remote offer to answer".to_string()));
        }
        Ok(SessionDescription::answer(format!("{}{}", ANSWER_PREFIX, self.token)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if state.signaling == SignalingState::Closed {
                return Err(TransportError::Webrtc("primitive closed".to_string()));
            }
            state.signaling = if description.is_offer() {
                SignalingState::HaveLocalOffer
            } else {
                SignalingState::Stable
            };
        }
        // Gathering finishes shortly after the description is applied
        let candidate = self.next_candidate();
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CANDIDATE_DELAY).await;
            let _ = events.send(PrimitiveEvent::IceCandidate(candidate));
        });
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let answerer = if description.is_offer() {
            if !description.sdp.starts_with(OFFER_PREFIX) {
                return Err(TransportError::Webrtc("unrecognized offer".to_string()));
            }
            let mut state = self.state.lock();
            state.signaling = SignalingState::HaveRemoteOffer;
            state.has_remote = true;
            None
        } else {
            let token = description
                .sdp
                .strip_prefix(ANSWER_PREFIX)
                .ok_or_else(|| TransportError::Webrtc("unrecognized answer".to_string()))?;
            let answerer = self
                .network
                .lookup(token)
                .ok_or_else(|| TransportError::Webrtc("answerer is gone".to_string()))?;
            let mut state = self.state.lock();
            if state.signaling != SignalingState::HaveLocalOffer {
                return Err(TransportError::Webrtc("answer without a local offer".to_string()));
            }
            state.signaling = SignalingState::Stable;
            state.has_remote = true;
            Some(answerer)
        };

        if let Some(answerer) = answerer {
            self.pair_with(&answerer);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.has_remote {
            return Err(TransportError::Webrtc("remote description not set".to_string()));
        }
        self.network.applied.lock().push(candidate.candidate.clone());
        state.candidates.push(candidate);
        self.network.candidates_applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _reliable: bool,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let channel = FakeChannel::new(label, self.network.clone());
        self.state.lock().channels.push(channel.clone());
        self.negotiation_needed();
        Ok(channel)
    }

    async fn add_stream(&self, stream: &MediaStream) -> Result<(), TransportError> {
        self.state.lock().streams.push(stream.clone());
        self.negotiation_needed();
        Ok(())
    }

    fn close(&self) {
        let channels = {
            let mut state = self.state.lock();
            if state.signaling == SignalingState::Closed {
                return;
            }
            state.signaling = SignalingState::Closed;
            std::mem::take(&mut state.channels)
        };
        self.network.closed.fetch_add(1, Ordering::SeqCst);
        self.network.primitives.lock().remove(&self.token);
        for channel in channels {
            channel.close();
        }
    }
}

struct ChannelState {
    sink: Option<mpsc::UnboundedSender<ChannelEvent>>,
    early: Vec<ChannelEvent>,
    remote: Option<Weak<FakeChannel>>,
    closed: bool,
}

/// One end of an in-process data channel
pub struct FakeChannel {
    label: String,
    network: Arc<FakeNetwork>,
    state: Mutex<ChannelState>,
}

impl FakeChannel {
    fn new(label: &str, network: Arc<FakeNetwork>) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            network,
            state: Mutex::new(ChannelState {
                sink: None,
                early: Vec::new(),
                remote: None,
                closed: false,
            }),
        })
    }

    fn link(a: &Arc<FakeChannel>, b: &Arc<FakeChannel>) {
        a.state.lock().remote = Some(Arc::downgrade(b));
        b.state.lock().remote = Some(Arc::downgrade(a));
    }

    fn raise(&self, event: ChannelEvent) {
        let mut state = self.state.lock();
        match &state.sink {
            Some(sink) => {
                let _ = sink.send(event);
            }
            None => state.early.push(event),
        }
    }

    fn remote(&self) -> Option<Arc<FakeChannel>> {
        self.state.lock().remote.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl DataChannel for FakeChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn attach(&self, sink: mpsc::UnboundedSender<ChannelEvent>) {
        let mut state = self.state.lock();
        for event in state.early.drain(..) {
            let _ = sink.send(event);
        }
        state.sink = Some(sink);
    }

    async fn send(&self, data: Bytes) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        if self.network.fail_sends.load(Ordering::SeqCst) {
            return Err(ChannelError::Backpressure);
        }
        let remote = self.remote().ok_or(ChannelError::Closed)?;
        remote.raise(ChannelEvent::Message(data));
        self.network.frames_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.network.channel_closes.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.raise(ChannelEvent::Close);
        if let Some(remote) = self.remote() {
            remote.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_pair() -> (FakeProvider, PrimitiveConfig) {
        (FakeProvider::new(), PrimitiveConfig::default())
    }

    #[tokio::test]
    async fn test_offer_answer_opens_twin_channel() {
        let (provider, config) = provider_pair();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = provider.create(&config, ConnectionKind::Data, tx_a).await.unwrap();
        let b = provider.create(&config, ConnectionKind::Data, tx_b).await.unwrap();

        let channel = a.create_data_channel("chat", true).await.unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::Stable);

        let (sink_a, mut events_a) = mpsc::unbounded_channel();
        channel.attach(sink_a);
        assert_eq!(events_a.recv().await, Some(ChannelEvent::Open));

        let twin = loop {
            match rx_b.recv().await {
                Some(PrimitiveEvent::DataChannel(dc)) => break dc,
                Some(_) => continue,
                None => panic!("no data channel"),
            }
        };
        assert_eq!(twin.label(), "chat");
        let (sink_b, mut events_b) = mpsc::unbounded_channel();
        twin.attach(sink_b);
        assert_eq!(events_b.recv().await, Some(ChannelEvent::Open));

        channel.send(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(
            events_b.recv().await,
            Some(ChannelEvent::Message(Bytes::from_static(b"hi")))
        );

        assert!(matches!(rx_a.recv().await, Some(PrimitiveEvent::IceCandidate(_))));
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_fails() {
        let (provider, config) = provider_pair();
        let (tx, _rx) = mpsc::unbounded_channel();
        let p = provider.create(&config, ConnectionKind::Data, tx).await.unwrap();
        let candidate = IceCandidate {
            candidate: "candidate:x".into(),
            sdp_mid: None,
            sdp_mline_index: None,
        };
        assert!(p.add_ice_candidate(candidate).await.is_err());
        assert_eq!(provider.network().candidates_applied(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_toggle_and_close() {
        let network = Arc::new(FakeNetwork::default());
        let a = FakeChannel::new("x", network.clone());
        let b = FakeChannel::new("x", network.clone());
        FakeChannel::link(&a, &b);

        network.set_send_failure(true);
        assert_eq!(a.send(Bytes::from_static(b"1")).await, Err(ChannelError::Backpressure));
        network.set_send_failure(false);
        assert!(a.send(Bytes::from_static(b"1")).await.is_ok());
        assert_eq!(network.frames_sent(), 1);

        a.close();
        a.close();
        assert!(b.is_closed());
        assert_eq!(a.send(Bytes::from_static(b"1")).await, Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn test_raised_events_reach_live_primitives() {
        let provider = FakeProvider::with_capabilities(Capabilities {
            negotiation_needed: true,
            ..Default::default()
        });
        let config = PrimitiveConfig::default();
        let network = provider.network();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let p = provider.create(&config, ConnectionKind::Data, tx).await.unwrap();

        p.create_data_channel("chat", false).await.unwrap();
        assert!(matches!(rx.recv().await, Some(PrimitiveEvent::NegotiationNeeded)));

        assert_eq!(network.gather_candidates(), 1);
        assert_eq!(network.gather_candidates(), 1);
        for seq in 0..2 {
            match rx.recv().await {
                Some(PrimitiveEvent::IceCandidate(c)) => {
                    let foundation = c.candidate.split_whitespace().next().unwrap();
                    assert!(foundation.ends_with(&format!("-{}", seq)), "{}", foundation);
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        assert_eq!(network.raise_ice_state(IceConnectionState::Failed), 1);
        assert!(matches!(
            rx.recv().await,
            Some(PrimitiveEvent::IceConnectionState(IceConnectionState::Failed))
        ));

        p.close();
        assert_eq!(network.raise_ice_state(IceConnectionState::Failed), 0);
    }
}
