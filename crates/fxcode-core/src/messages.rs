//! Wire messages exchanged over a session socket.
//!
//! Every frame is a CBOR map tagged by `type`. Channel traffic travels inside
//! [`Frame::Regular`] so it can be sequenced, acknowledged and replayed after
//! a reconnect.

use crate::error::FxError;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Connection type requested by the client in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum ConnectionType {
    Management = 1,
    ExtensionHost = 2,
    Tunnel = 3,
}

impl From<ConnectionType> for u8 {
    fn from(t: ConnectionType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for ConnectionType {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            1 => Ok(Self::Management),
            2 => Ok(Self::ExtensionHost),
            3 => Ok(Self::Tunnel),
            other => Err(format!("Unrecognized connection type {other}")),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Management => f.write_str("management"),
            ConnectionType::ExtensionHost => f.write_str("extension host"),
            ConnectionType::Tunnel => f.write_str("tunnel"),
        }
    }
}

/// First frame sent by the client after the socket upgrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub desired_connection_type: ConnectionType,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub args: Value,
}

/// Server reply to an accepted handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeOk {
    /// True when the socket was re-attached to an existing session.
    pub reconnection: bool,
}

/// Error carried on the wire: either a rejected handshake or a failed call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl From<&FxError> for ErrorPayload {
    fn from(e: &FxError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// A frame on the session socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    Handshake(HandshakeRequest),
    Ok(HandshakeOk),
    Error(ErrorPayload),
    /// Sequenced application payload. `ack` piggybacks the highest `seq`
    /// the sender has received from its peer.
    Regular { seq: u64, ack: u64, payload: Payload },
    Ack { ack: u64 },
    KeepAlive,
    Disconnect { reason: Option<String> },
}

/// Application payload of a [`Frame::Regular`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Payload {
    Request(ChannelRequest),
    Response(ChannelResponse),
    /// Opaque bytes for extension-host and tunnel pipes.
    Data(Vec<u8>),
}

/// Client-to-server channel traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelRequest {
    Call {
        id: u32,
        channel: String,
        command: String,
        #[serde(default)]
        args: Value,
    },
    Listen {
        id: u32,
        channel: String,
        event: String,
        #[serde(default)]
        args: Value,
    },
    /// Detach a listener (or abandon a call) by request id.
    Dispose { id: u32 },
}

/// Server-to-client channel traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelResponse {
    Ok { id: u32, result: Value },
    Err { id: u32, error: ErrorPayload },
    Event { id: u32, payload: Value },
}

/// Binary buffer embedded in JSON channel arguments and results.
///
/// Serialized as a base64 string; a plain byte array is accepted on input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer(pub Vec<u8>);

impl Buffer {
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(v: Vec<u8>) -> Self {
        Buffer(v)
    }
}

impl Serialize for Buffer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Buffer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BufferVisitor;

        impl<'de> serde::de::Visitor<'de> for BufferVisitor {
            type Value = Buffer;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a base64 string or a byte array")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Buffer, E> {
                base64::engine::general_purpose::STANDARD
                    .decode(v)
                    .map(Buffer)
                    .map_err(E::custom)
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Buffer, E> {
                Ok(Buffer(v.to_vec()))
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Buffer, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(Buffer(out))
            }
        }

        deserializer.deserialize_any(BufferVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{cbor_decode, cbor_encode};
    use serde_json::json;

    #[test]
    fn regular_frame_survives_cbor() {
        let frame = Frame::Regular {
            seq: 7,
            ack: 3,
            payload: Payload::Request(ChannelRequest::Call {
                id: 1,
                channel: "remotefilesystem".into(),
                command: "stat".into(),
                args: json!([{ "scheme": "file", "path": "/tmp" }]),
            }),
        };
        let bytes = cbor_encode(&frame).unwrap();
        let decoded: Frame = cbor_decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn connection_type_is_numeric_on_the_wire() {
        let value = serde_json::to_value(HandshakeRequest {
            desired_connection_type: ConnectionType::ExtensionHost,
            commit: None,
            args: Value::Null,
        })
        .unwrap();
        assert_eq!(value["desiredConnectionType"], json!(2));

        let bad: Result<HandshakeRequest, _> =
            serde_json::from_value(json!({ "desiredConnectionType": 9 }));
        assert!(bad.is_err());
    }

    #[test]
    fn buffer_accepts_base64_and_arrays() {
        let b: Buffer = serde_json::from_value(json!("aGk=")).unwrap();
        assert_eq!(b.0, b"hi");
        let b: Buffer = serde_json::from_value(json!([104, 105])).unwrap();
        assert_eq!(b.0, b"hi");
        assert_eq!(serde_json::to_value(Buffer(b"hi".to_vec())).unwrap(), json!("aGk="));
    }

    #[test]
    fn error_payload_carries_code() {
        let payload = ErrorPayload::from(&FxError::InvalidCall("bogus".into()));
        assert_eq!(payload.code, "InvalidCall");
        assert_eq!(payload.message, "Invalid call 'bogus'");
    }
}
