//! Data-channel packet codec
//!
//! Binary modes wrap every payload in a MessagePack [`Packet`] so chunk
//! fragments and application values share one channel. JSON mode sends
//! UTF-8 JSON text. `none` passes bytes through untouched.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::types::{Data, Serialization};

#[derive(Serialize, Deserialize)]
enum Packet {
    Value(Value),
    Bytes(Bytes),
    Chunk(Chunk),
}

/// Result of decoding one channel message
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A complete application payload
    Data(Data),
    /// One fragment of a chunked payload
    Chunk(Chunk),
}

/// Encode an application payload for the given serialization
pub fn encode(data: &Data, mode: Serialization) -> Result<Bytes> {
    match mode {
        Serialization::Binary | Serialization::BinaryUtf8 => {
            let packet = match data {
                Data::Value(v) => Packet::Value(v.clone()),
                Data::Bytes(b) => Packet::Bytes(b.clone()),
            };
            Ok(Bytes::from(rmp_serde::to_vec(&packet)?))
        }
        Serialization::Json => match data {
            Data::Value(v) => Ok(Bytes::from(serde_json::to_vec(v)?)),
            Data::Bytes(_) => Err(Error::Unsupported(
                "raw bytes cannot be sent on a json connection".into(),
            )),
        },
        Serialization::None => match data {
            Data::Bytes(b) => Ok(b.clone()),
            Data::Value(Value::String(s)) => Ok(Bytes::from(s.clone().into_bytes())),
            Data::Value(v) => Ok(Bytes::from(serde_json::to_vec(v)?)),
        },
    }
}

/// Encode a chunk fragment. Only binary modes carry chunks.
pub fn encode_chunk(chunk: &Chunk) -> Result<Bytes> {
    Ok(Bytes::from(rmp_serde::to_vec(&Packet::Chunk(chunk.clone()))?))
}

/// Decode one channel message
pub fn decode(bytes: &[u8], mode: Serialization) -> Result<Decoded> {
    match mode {
        Serialization::Binary | Serialization::BinaryUtf8 => {
            Ok(match rmp_serde::from_slice::<Packet>(bytes)? {
                Packet::Value(v) => Decoded::Data(Data::Value(v)),
                Packet::Bytes(b) => Decoded::Data(Data::Bytes(b)),
                Packet::Chunk(c) => Decoded::Chunk(c),
            })
        }
        Serialization::Json => Ok(Decoded::Data(Data::Value(serde_json::from_slice(bytes)?))),
        Serialization::None => Ok(Decoded::Data(Data::Bytes(Bytes::copy_from_slice(bytes)))),
    }
}
