//! Signaling message types and payload definitions

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Relay message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// The relay accepted our id; the session is usable
    #[serde(rename = "OPEN")]
    Open,
    /// Relay-side failure
    #[serde(rename = "ERROR")]
    Error,
    /// Requested id is already in use
    #[serde(rename = "ID-TAKEN")]
    IdTaken,
    /// API key rejected
    #[serde(rename = "INVALID-KEY")]
    InvalidKey,
    /// A remote peer left the relay
    #[serde(rename = "LEAVE")]
    Leave,
    /// A message could not be delivered to its destination
    #[serde(rename = "EXPIRE")]
    Expire,
    #[serde(rename = "OFFER")]
    Offer,
    #[serde(rename = "ANSWER")]
    Answer,
    #[serde(rename = "CANDIDATE")]
    Candidate,
    /// Any type this client does not understand
    #[serde(other, rename = "UNKNOWN")]
    Unknown,
}

impl MessageType {
    /// Wire name of the type
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Open => "OPEN",
            MessageType::Error => "ERROR",
            MessageType::IdTaken => "ID-TAKEN",
            MessageType::InvalidKey => "INVALID-KEY",
            MessageType::Leave => "LEAVE",
            MessageType::Expire => "EXPIRE",
            MessageType::Offer => "OFFER",
            MessageType::Answer => "ANSWER",
            MessageType::Candidate => "CANDIDATE",
            MessageType::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message exchanged with the signaling relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Sending peer (filled in by the relay)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    /// Destination peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
}

impl SignalMessage {
    /// Create a message without payload or addressing
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            payload: None,
            src: None,
            dst: None,
        }
    }

    /// Create a message carrying a typed payload addressed to `dst`
    pub fn to_peer<P: Serialize>(kind: MessageType, dst: &str, payload: &P) -> Result<Self> {
        Ok(Self {
            kind,
            payload: Some(serde_json::to_value(payload)?),
            src: None,
            dst: Some(dst.to_string()),
        })
    }

    /// Connection id carried in the payload, if any
    pub fn connection_id(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("connectionId"))
            .and_then(Value::as_str)
    }

    /// Decode the payload into a typed structure
    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P> {
        let payload = self
            .payload
            .clone()
            .ok_or_else(|| Error::MalformedMessage(format!("{} without payload", self.kind)))?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Free-text message of an ERROR payload (`{"msg": ...}`)
    pub fn error_text(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("msg"))
            .and_then(Value::as_str)
    }
}

/// Kind of logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Data,
    Media,
}

impl ConnectionKind {
    /// Prefix of generated connection ids
    pub fn id_prefix(&self) -> &'static str {
        match self {
            ConnectionKind::Data => "dc_",
            ConnectionKind::Media => "mc_",
        }
    }
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionKind::Data => f.write_str("data"),
            ConnectionKind::Media => f.write_str("media"),
        }
    }
}

/// Payload encoding of a data connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Serialization {
    /// MessagePack packets (chunking-capable)
    #[default]
    Binary,
    /// Same packets as `Binary`
    BinaryUtf8,
    /// UTF-8 JSON text
    Json,
    /// Raw bytes, no framing
    None,
}

impl Serialization {
    pub fn is_binary(&self) -> bool {
        matches!(self, Serialization::Binary | Serialization::BinaryUtf8)
    }
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// A session description (offer or answer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }
}

/// A connectivity candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// OFFER payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub sdp: SessionDescription,
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialization: Option<Serialization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
}

/// ANSWER payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub sdp: SessionDescription,
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
}

/// CANDIDATE payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    pub connection_id: String,
}

/// An application payload carried by a data connection
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    /// Structured value
    Value(Value),
    /// Opaque bytes
    Bytes(Bytes),
}

impl Data {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Data::Value(v) => Some(v),
            Data::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Data::Bytes(b) => Some(b),
            Data::Value(_) => None,
        }
    }
}

impl From<Value> for Data {
    fn from(v: Value) -> Self {
        Data::Value(v)
    }
}

impl From<Bytes> for Data {
    fn from(b: Bytes) -> Self {
        Data::Bytes(b)
    }
}

impl From<Vec<u8>> for Data {
    fn from(b: Vec<u8>) -> Self {
        Data::Bytes(Bytes::from(b))
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        Data::Value(Value::String(s.to_string()))
    }
}

impl From<String> for Data {
    fn from(s: String) -> Self {
        Data::Value(Value::String(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type_wire_names() {
        let msg: SignalMessage = serde_json::from_str(r#"{"type":"ID-TAKEN"}"#).unwrap();
        assert_eq!(msg.kind, MessageType::IdTaken);

        let msg: SignalMessage = serde_json::from_str(r#"{"type":"HEARTBEAT"}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Unknown);

        let text = serde_json::to_string(&SignalMessage::new(MessageType::InvalidKey)).unwrap();
        assert_eq!(text, r#"{"type":"INVALID-KEY"}"#);
    }

    #[test]
    fn test_offer_payload_wire_shape() {
        let offer = OfferPayload {
            sdp: SessionDescription::offer("v=0"),
            kind: ConnectionKind::Data,
            label: Some("chat".into()),
            connection_id: "dc_abc".into(),
            reliable: Some(true),
            serialization: Some(Serialization::BinaryUtf8),
            metadata: Some(json!({"room": 7})),
            browser: Some("peerlink".into()),
        };
        let msg = SignalMessage::to_peer(MessageType::Offer, "bob", &offer).unwrap();
        let wire = serde_json::to_value(&msg).unwrap();

        assert_eq!(wire["type"], "OFFER");
        assert_eq!(wire["dst"], "bob");
        assert_eq!(wire["payload"]["connectionId"], "dc_abc");
        assert_eq!(wire["payload"]["type"], "data");
        assert_eq!(wire["payload"]["serialization"], "binary-utf8");
        assert_eq!(wire["payload"]["sdp"]["type"], "offer");
        assert_eq!(msg.connection_id(), Some("dc_abc"));

        let back: OfferPayload = msg.payload_as().unwrap();
        assert_eq!(back, offer);
    }

    #[test]
    fn test_candidate_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let wire = serde_json::to_value(&candidate).unwrap();
        assert_eq!(wire["sdpMid"], "0");
        assert_eq!(wire["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_payload_missing() {
        let msg = SignalMessage::new(MessageType::Answer);
        assert!(msg.payload_as::<AnswerPayload>().is_err());
        assert_eq!(msg.connection_id(), None);
    }
}
