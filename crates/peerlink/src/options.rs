//! Peer and connection options

use peerlink_core::{
    id::random_token, Serialization, CHUNKED_MTU, CLOUD_HOST, CLOUD_PORT, DEFAULT_KEY,
    DEFAULT_STUN_SERVER,
};
use peerlink_transport::{normalize_path, PrimitiveConfig, SignalingConfig};
use serde_json::Value;
use std::time::Duration;

use crate::logging::LogLevel;

/// Settings of one [`Peer`](crate::Peer)
#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub key: String,
    pub secure: bool,
    /// Session token sent to the relay alongside our id
    pub token: String,
    pub ice_servers: Vec<String>,
    pub debug: LogLevel,
    /// Largest binary payload sent unchunked when the channel requires chunking
    pub chunk_mtu: usize,
    /// Delay before a failed send is retried
    pub retry_backoff: Duration,
    /// Interval at which unacknowledged overlay frames are resent
    pub retransmit_interval: Duration,
    pub stream_timeout: Duration,
    pub fallback_grace: Duration,
    /// Open the long-poll stream alongside the socket
    pub fallback: bool,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            host: CLOUD_HOST.to_string(),
            port: CLOUD_PORT,
            path: "/".to_string(),
            key: DEFAULT_KEY.to_string(),
            secure: false,
            token: random_token(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            debug: LogLevel::Off,
            chunk_mtu: CHUNKED_MTU,
            retry_backoff: Duration::from_millis(100),
            retransmit_interval: Duration::from_millis(250),
            stream_timeout: Duration::from_secs(25),
            fallback_grace: Duration::from_secs(5),
            fallback: true,
        }
    }
}

impl PeerOptions {
    pub fn is_cloud_host(&self) -> bool {
        self.host == CLOUD_HOST
    }

    pub fn signaling_config(&self) -> SignalingConfig {
        SignalingConfig {
            host: self.host.clone(),
            port: self.port,
            path: normalize_path(&self.path),
            key: self.key.clone(),
            secure: self.secure,
            stream_timeout: self.stream_timeout,
            fallback_grace: self.fallback_grace,
            fallback: self.fallback,
        }
    }

    pub fn primitive_config(&self) -> PrimitiveConfig {
        PrimitiveConfig {
            ice_servers: self.ice_servers.clone(),
        }
    }
}

/// Options for [`Peer::connect`](crate::Peer::connect)
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Channel label; defaults to the connection id
    pub label: Option<String>,
    /// Application metadata handed to the remote peer
    pub metadata: Option<Value>,
    pub serialization: Serialization,
    /// Ask for reliable delivery on channels that lack it natively
    pub reliable: bool,
    /// Use this connection id instead of a random one
    pub connection_id: Option<String>,
    /// Reuse this pooled negotiation primitive if it is stable
    pub primitive: Option<String>,
}

impl ConnectOptions {
    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn serialization(mut self, serialization: Serialization) -> Self {
        self.serialization = serialization;
        self
    }

    pub fn reliable(mut self, reliable: bool) -> Self {
        self.reliable = reliable;
        self
    }

    pub fn connection_id(mut self, id: &str) -> Self {
        self.connection_id = Some(id.to_string());
        self
    }

    pub fn primitive(mut self, id: &str) -> Self {
        self.primitive = Some(id.to_string());
        self
    }
}

/// Options for [`Peer::call`](crate::Peer::call)
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub metadata: Option<Value>,
    pub connection_id: Option<String>,
    pub primitive: Option<String>,
}

impl CallOptions {
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn connection_id(mut self, id: &str) -> Self {
        self.connection_id = Some(id.to_string());
        self
    }

    pub fn primitive(mut self, id: &str) -> Self {
        self.primitive = Some(id.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = PeerOptions::default();
        assert!(options.is_cloud_host());
        assert_eq!(options.port, 9000);
        assert_eq!(options.key, "peerjs");
        assert_eq!(options.chunk_mtu, 16300);
        assert_eq!(options.retry_backoff, Duration::from_millis(100));
        assert_eq!(options.token.len(), 32);
    }

    #[test]
    fn test_signaling_config_normalizes_path() {
        let options = PeerOptions {
            host: "relay.local".into(),
            path: "api".into(),
            ..Default::default()
        };
        let config = options.signaling_config();
        assert_eq!(config.path, "/api/");
        assert_eq!(config.host, "relay.local");
    }
}
