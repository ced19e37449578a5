//! Relay endpoint configuration

use peerlink_core::{CLOUD_HOST, CLOUD_PORT, DEFAULT_KEY};
use std::time::Duration;
use url::Url;

use crate::error::Result;

/// Where and how to reach the signaling relay
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub host: String,
    pub port: u16,
    /// URL path prefix; always starts and ends with `/`
    pub path: String,
    /// Relay API key
    pub key: String,
    /// Use https/wss
    pub secure: bool,
    /// Lifetime of one fallback stream segment before it is re-opened
    pub stream_timeout: Duration,
    /// Delay between the socket opening and the fallback stream being dropped
    pub fallback_grace: Duration,
    /// Run the long-poll stream alongside the socket
    pub fallback: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            host: CLOUD_HOST.to_string(),
            port: CLOUD_PORT,
            path: "/".to_string(),
            key: DEFAULT_KEY.to_string(),
            secure: false,
            stream_timeout: Duration::from_secs(25),
            fallback_grace: Duration::from_secs(5),
            fallback: true,
        }
    }
}

/// Make sure `path` starts and ends with `/`
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 2);
    if !path.starts_with('/') {
        out.push('/');
    }
    out.push_str(path);
    if !out.ends_with('/') {
        out.push('/');
    }
    out
}

impl SignalingConfig {
    /// `{http|https}://host:port{path}{key}`
    pub fn http_base(&self) -> Result<Url> {
        let scheme = if self.secure { "https" } else { "http" };
        Ok(Url::parse(&format!(
            "{}://{}:{}{}{}",
            scheme,
            self.host,
            self.port,
            normalize_path(&self.path),
            self.key
        ))?)
    }

    /// Per-session HTTP prefix: `{http base}/{id}/{token}`
    pub fn session_base(&self, id: &str, token: &str) -> Result<String> {
        Ok(format!("{}/{}/{}", self.http_base()?, id, token))
    }

    /// `{ws|wss}://host:port{path}peerjs?key=..&id=..&token=..`
    pub fn websocket_url(&self, id: &str, token: &str) -> Result<Url> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = Url::parse(&format!(
            "{}://{}:{}{}peerjs",
            scheme,
            self.host,
            self.port,
            normalize_path(&self.path)
        ))?;
        url.query_pairs_mut()
            .append_pair("key", &self.key)
            .append_pair("id", id)
            .append_pair("token", token);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("relay"), "/relay/");
        assert_eq!(normalize_path("/relay/"), "/relay/");
    }

    #[test]
    fn test_default_urls() {
        let config = SignalingConfig::default();
        assert_eq!(
            config.http_base().unwrap().as_str(),
            "http://0.peerjs.com:9000/peerjs"
        );
        assert_eq!(
            config.websocket_url("alice", "tok").unwrap().as_str(),
            "ws://0.peerjs.com:9000/peerjs?key=peerjs&id=alice&token=tok"
        );
        assert_eq!(
            config.session_base("alice", "tok").unwrap(),
            "http://0.peerjs.com:9000/peerjs/alice/tok"
        );
    }

    #[test]
    fn test_secure_custom_path() {
        let config = SignalingConfig {
            host: "relay.example.com".into(),
            port: 443,
            path: "/signal".into(),
            key: "k1".into(),
            secure: true,
            ..Default::default()
        };
        assert_eq!(
            config.http_base().unwrap().as_str(),
            "https://relay.example.com/signal/k1"
        );
        assert_eq!(
            config.websocket_url("b", "t").unwrap().as_str(),
            "wss://relay.example.com/signal/peerjs?key=k1&id=b&token=t"
        );
    }
}
