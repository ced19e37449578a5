//! WebRTC negotiation primitives backed by webrtc-rs
//!
//! `WebRtcProvider` builds one `RTCPeerConnection` per primitive. Local media
//! is passed in as a [`MediaStream`] wrapping [`LocalTracks`]; remote tracks
//! arrive as a [`MediaStream`] wrapping the `TrackRemote`.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use peerlink_core::{ConnectionKind, IceCandidate, SdpType, SessionDescription};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use webrtc_rs::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine, APIBuilder,
    },
    data_channel::{
        data_channel_init::RTCDataChannelInit, data_channel_message::DataChannelMessage,
        RTCDataChannel,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_connection_state::RTCIceConnectionState,
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, sdp::session_description::RTCSessionDescription,
        signaling_state::RTCSignalingState, RTCPeerConnection,
    },
    rtp_transceiver::{rtp_receiver::RTCRtpReceiver, RTCRtpTransceiver},
    track::{track_local::TrackLocal, track_remote::TrackRemote},
};

use crate::error::{ChannelError, Result, TransportError};
use crate::primitive::{
    Capabilities, ChannelEvent, DataChannel, IceConnectionState, MediaStream,
    NegotiationPrimitive, PrimitiveConfig, PrimitiveEvent, PrimitiveProvider, SignalingState,
};

/// Buffered bytes above which sends report backpressure
const MAX_BUFFERED_AMOUNT: usize = 16 * 1024 * 1024;

/// Local tracks to attach with `add_stream`
#[derive(Clone)]
pub struct LocalTracks(pub Vec<Arc<dyn TrackLocal + Send + Sync>>);

fn webrtc_err(context: &str, e: impl std::fmt::Display) -> TransportError {
    TransportError::Webrtc(format!("{}: {}", context, e))
}

/// Primitive provider using webrtc-rs
#[derive(Default)]
pub struct WebRtcProvider;

impl WebRtcProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PrimitiveProvider for WebRtcProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            data: true,
            media: true,
            sctp: true,
            negotiation_needed: false,
            chunked_mtu: None,
        }
    }

    async fn create(
        &self,
        config: &PrimitiveConfig,
        kind: ConnectionKind,
        events: mpsc::UnboundedSender<PrimitiveEvent>,
    ) -> Result<Arc<dyn NegotiationPrimitive>> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()
            .map_err(|e| webrtc_err("codec registration failed", e))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)
            .map_err(|e| webrtc_err("interceptor registration failed", e))?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| webrtc_err("peer connection creation failed", e))?,
        );
        debug!(%kind, "created RTCPeerConnection");

        install_handlers(&pc, events);
        Ok(Arc::new(WebRtcPrimitive {
            pc,
            closed: Mutex::new(false),
        }))
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<PrimitiveEvent>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(PrimitiveEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(e) => warn!("failed to convert ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let mapped = match state {
            RTCIceConnectionState::Checking => IceConnectionState::Checking,
            RTCIceConnectionState::Connected => IceConnectionState::Connected,
            RTCIceConnectionState::Completed => IceConnectionState::Completed,
            RTCIceConnectionState::Failed => IceConnectionState::Failed,
            RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
            RTCIceConnectionState::Closed => IceConnectionState::Closed,
            _ => IceConnectionState::New,
        };
        let _ = tx.send(PrimitiveEvent::IceConnectionState(mapped));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let _ = tx.send(PrimitiveEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        info!("received data channel '{}'", channel.label());
        let _ = tx.send(PrimitiveEvent::DataChannel(WebRtcDataChannel::wrap(channel)));
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let id = track.stream_id();
            info!("received remote track for stream {}", id);
            let _ = tx.send(PrimitiveEvent::RemoteStream(MediaStream::new(id, track)));
            Box::pin(async {})
        },
    ));
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    let SessionDescription { sdp_type, sdp } = description;
    match sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            return Err(TransportError::Unsupported("rollback descriptions".into()))
        }
    }
    .map_err(|e| webrtc_err("invalid session description", e))
}

fn from_rtc(description: RTCSessionDescription, sdp_type: SdpType) -> SessionDescription {
    SessionDescription {
        sdp_type,
        sdp: description.sdp,
    }
}

/// One `RTCPeerConnection`
pub struct WebRtcPrimitive {
    pc: Arc<RTCPeerConnection>,
    closed: Mutex<bool>,
}

#[async_trait]
impl NegotiationPrimitive for WebRtcPrimitive {
    fn signaling_state(&self) -> SignalingState {
        if *self.closed.lock() {
            return SignalingState::Closed;
        }
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| webrtc_err("create offer failed", e))?;
        Ok(from_rtc(offer, SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| webrtc_err("create answer failed", e))?;
        Ok(from_rtc(answer, SdpType::Answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(|e| webrtc_err("set local description failed", e))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(|e| webrtc_err("set remote description failed", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| webrtc_err("add ICE candidate failed", e))
    }

    async fn create_data_channel(
        &self,
        label: &str,
        reliable: bool,
    ) -> Result<Arc<dyn DataChannel>> {
        let options = if reliable {
            RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            }
        } else {
            RTCDataChannelInit {
                ordered: Some(true),
                max_retransmits: Some(0),
                ..Default::default()
            }
        };
        let channel = self
            .pc
            .create_data_channel(label, Some(options))
            .await
            .map_err(|e| webrtc_err("data channel creation failed", e))?;
        info!("created data channel '{}'", label);
        Ok(WebRtcDataChannel::wrap(channel))
    }

    async fn add_stream(&self, stream: &MediaStream) -> Result<()> {
        let tracks = stream
            .downcast_ref::<LocalTracks>()
            .ok_or_else(|| TransportError::Unsupported("stream is not LocalTracks".into()))?;
        for track in &tracks.0 {
            self.pc
                .add_track(track.clone())
                .await
                .map_err(|e| webrtc_err("add track failed", e))?;
        }
        Ok(())
    }

    fn close(&self) {
        {
            let mut closed = self.closed.lock();
            if *closed {
                return;
            }
            *closed = true;
        }
        let pc = self.pc.clone();
        tokio::spawn(async move {
            if let Err(e) = pc.close().await {
                warn!("peer connection close failed: {}", e);
            }
        });
    }
}

#[derive(Default)]
struct ChannelSink {
    sink: Option<mpsc::UnboundedSender<ChannelEvent>>,
    early: Vec<ChannelEvent>,
}

impl ChannelSink {
    fn push(&mut self, event: ChannelEvent) {
        match &self.sink {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => self.early.push(event),
        }
    }
}

/// One `RTCDataChannel`
pub struct WebRtcDataChannel {
    channel: Arc<RTCDataChannel>,
    sink: Arc<Mutex<ChannelSink>>,
}

impl WebRtcDataChannel {
    fn wrap(channel: Arc<RTCDataChannel>) -> Arc<dyn DataChannel> {
        let sink = Arc::new(Mutex::new(ChannelSink::default()));

        let s = sink.clone();
        channel.on_open(Box::new(move || {
            s.lock().push(ChannelEvent::Open);
            Box::pin(async {})
        }));

        let s = sink.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            s.lock().push(ChannelEvent::Message(msg.data));
            Box::pin(async {})
        }));

        let s = sink.clone();
        channel.on_close(Box::new(move || {
            s.lock().push(ChannelEvent::Close);
            Box::pin(async {})
        }));

        Arc::new(Self { channel, sink })
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.channel.label().to_string()
    }

    fn attach(&self, sink: mpsc::UnboundedSender<ChannelEvent>) {
        let mut state = self.sink.lock();
        for event in state.early.drain(..) {
            let _ = sink.send(event);
        }
        state.sink = Some(sink);
    }

    async fn send(&self, data: Bytes) -> std::result::Result<(), ChannelError> {
        if self.channel.buffered_amount().await > MAX_BUFFERED_AMOUNT {
            return Err(ChannelError::Backpressure);
        }
        self.channel
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| ChannelError::Other(e.to_string()))
    }

    fn close(&self) {
        let channel = self.channel.clone();
        tokio::spawn(async move {
            let _ = channel.close().await;
        });
    }
}
