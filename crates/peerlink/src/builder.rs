//! Peer builder pattern

use async_trait::async_trait;
use peerlink_core::id::{validate_id, validate_key};
use peerlink_core::ConnectionKind;
use peerlink_transport::{
    Capabilities, HttpRelay, NegotiationPrimitive, PrimitiveConfig, PrimitiveEvent,
    PrimitiveProvider, Relay, TransportError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::PeerError;
use crate::logging::{self, LogLevel};
use crate::negotiator::Negotiator;
use crate::options::PeerOptions;
use crate::peer::Peer;
use crate::session::{Event, PeerShared, Session};

/// Builder for [`Peer`]
pub struct PeerBuilder {
    id: Option<String>,
    options: PeerOptions,
    provider: Option<Arc<dyn PrimitiveProvider>>,
    relay: Option<Arc<dyn Relay>>,
}

impl PeerBuilder {
    pub fn new() -> Self {
        Self {
            id: None,
            options: PeerOptions::default(),
            provider: None,
            relay: None,
        }
    }

    /// Ask the relay for this id instead of a generated one
    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// Replace all options at once
    pub fn options(mut self, options: PeerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn host(mut self, host: &str) -> Self {
        self.options.host = host.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.options.port = port;
        self
    }

    pub fn path(mut self, path: &str) -> Self {
        self.options.path = path.to_string();
        self
    }

    pub fn key(mut self, key: &str) -> Self {
        self.options.key = key.to_string();
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.options.secure = secure;
        self
    }

    pub fn token(mut self, token: &str) -> Self {
        self.options.token = token.to_string();
        self
    }

    pub fn ice_servers(mut self, servers: Vec<String>) -> Self {
        self.options.ice_servers = servers;
        self
    }

    /// 0 = off, 1 = errors, 2 = warnings, 3 = everything
    pub fn debug(mut self, level: u8) -> Self {
        self.options.debug = LogLevel::from_level(level);
        self
    }

    pub fn chunk_mtu(mut self, mtu: usize) -> Self {
        self.options.chunk_mtu = mtu;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.options.retry_backoff = backoff;
        self
    }

    pub fn fallback(mut self, enabled: bool) -> Self {
        self.options.fallback = enabled;
        self
    }

    /// Host platform supplying negotiation primitives
    pub fn provider(mut self, provider: impl PrimitiveProvider + 'static) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    /// Use this relay instead of the network relay described by the options
    pub fn relay(mut self, relay: impl Relay + 'static) -> Self {
        self.relay = Some(Arc::new(relay));
        self
    }

    /// Start the session. Must be called inside a Tokio runtime.
    ///
    /// Startup problems (bad id or key, no usable transport, TLS on the
    /// cloud relay) do not fail here: they are reported as an error event
    /// to the first subscriber and the peer destroys itself.
    pub fn build(self) -> Peer {
        if self.options.debug > LogLevel::Off {
            logging::init(self.options.debug);
        }

        let provider = self.provider.unwrap_or_else(default_provider);
        let relay = self
            .relay
            .unwrap_or_else(|| Arc::new(HttpRelay::new(self.options.signaling_config())));

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PeerShared::new());
        let caps = provider.capabilities();
        let negotiator = Negotiator::new(provider, self.options.primitive_config(), tx.clone());

        let first = match validate(&self.options, self.id.as_deref(), caps) {
            Some(error) => Event::Abort(error),
            None => Event::Start,
        };
        let _ = tx.send(first);

        let session = Session::new(
            self.options,
            self.id.filter(|id| !id.is_empty()),
            relay.clone(),
            negotiator,
            shared.clone(),
            tx.clone(),
        );
        tokio::spawn(session.run(rx));

        Peer::new(shared, tx, relay)
    }
}

impl Default for PeerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(options: &PeerOptions, id: Option<&str>, caps: Capabilities) -> Option<PeerError> {
    if !caps.data && !caps.media {
        return Some(PeerError::BrowserIncompatible);
    }
    if let Some(id) = id {
        if !validate_id(id) {
            return Some(PeerError::InvalidId(id.to_string()));
        }
    }
    if !validate_key(&options.key) {
        return Some(PeerError::InvalidKey(options.key.clone()));
    }
    if options.secure && options.is_cloud_host() {
        return Some(PeerError::SslUnavailable);
    }
    None
}

#[cfg(feature = "webrtc")]
fn default_provider() -> Arc<dyn PrimitiveProvider> {
    Arc::new(peerlink_transport::WebRtcProvider::new())
}

#[cfg(not(feature = "webrtc"))]
fn default_provider() -> Arc<dyn PrimitiveProvider> {
    Arc::new(NoProvider)
}

/// Stand-in when no provider was given and none is compiled in
#[cfg_attr(feature = "webrtc", allow(dead_code))]
struct NoProvider;

#[async_trait]
impl PrimitiveProvider for NoProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            data: false,
            media: false,
            ..Default::default()
        }
    }

    async fn create(
        &self,
        _config: &PrimitiveConfig,
        _kind: ConnectionKind,
        _events: mpsc::UnboundedSender<PrimitiveEvent>,
    ) -> Result<Arc<dyn NegotiationPrimitive>, TransportError> {
        Err(TransportError::Unsupported(
            "no negotiation primitive provider".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_order() {
        let caps = Capabilities::default();
        let options = PeerOptions::default();
        assert_eq!(validate(&options, None, caps), None);
        assert_eq!(validate(&options, Some(""), caps), None);
        assert_eq!(
            validate(&options, Some("bad id!"), caps),
            Some(PeerError::InvalidId("bad id!".into()))
        );

        let none = Capabilities {
            data: false,
            media: false,
            ..Default::default()
        };
        assert_eq!(
            validate(&options, Some("bad id!"), none),
            Some(PeerError::BrowserIncompatible)
        );
    }

    #[test]
    fn test_validate_key_and_tls() {
        let caps = Capabilities::default();
        let bad_key = PeerOptions {
            key: "no/slashes".into(),
            ..Default::default()
        };
        assert_eq!(
            validate(&bad_key, None, caps),
            Some(PeerError::InvalidKey("no/slashes".into()))
        );

        let cloud_tls = PeerOptions {
            secure: true,
            ..Default::default()
        };
        assert_eq!(validate(&cloud_tls, None, caps), Some(PeerError::SslUnavailable));

        let own_tls = PeerOptions {
            host: "relay.example.com".into(),
            secure: true,
            ..Default::default()
        };
        assert_eq!(validate(&own_tls, None, caps), None);
    }
}
