use base64::{engine::general_purpose, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::errors::Error;
use crate::sid::Sid;
use crate::transport::TransportType;

/// The raw opcode byte of a binary message frame.
const BINARY_MESSAGE_OPCODE: u8 = 4;

/// An engine-layer packet.
///
/// On the wire each packet is one frame: the ASCII opcode digit followed by
/// the body for text frames, the raw opcode byte followed by the body for
/// binary frames. On the polling transport binary bodies are carried as
/// base64 text with a `b` marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Sent by the server to complete the handshake, carries the session
    /// parameters as JSON.
    Open(OpenPacket),
    /// Either side may close the session.
    Close,
    /// Heartbeat probe; the receiver answers with [`Packet::Pong`].
    Ping,
    /// Heartbeat answer.
    Pong,
    /// Ping with a `probe` body, sent on a fresh transport to validate it
    /// before an upgrade.
    PingProbe,
    /// Pong with a `probe` body, the answer to [`Packet::PingProbe`].
    PongProbe,
    /// An application-layer text message. The body is opaque to the engine.
    Message(String),
    /// Commits a validated transport upgrade.
    Upgrade,
    /// Flushed to a parked polling request so it completes and the client
    /// can finish upgrading.
    Noop,
    /// An application-layer binary message.
    Binary(Bytes),
}

impl Packet {
    pub fn is_binary(&self) -> bool {
        matches!(self, Packet::Binary(_))
    }

    fn opcode(&self) -> u8 {
        match self {
            Packet::Open(_) => 0,
            Packet::Close => 1,
            Packet::Ping | Packet::PingProbe => 2,
            Packet::Pong | Packet::PongProbe => 3,
            Packet::Message(_) | Packet::Binary(_) => 4,
            Packet::Upgrade => 5,
            Packet::Noop => 6,
        }
    }

    /// Encode the packet as a text frame.
    ///
    /// Binary packets become `b` + base64; this form is only valid on the
    /// polling transport.
    pub fn into_text(self) -> Result<String, Error> {
        let res = match self {
            Packet::Open(open) => format!("0{}", serde_json::to_string(&open)?),
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::PingProbe => "2probe".to_string(),
            Packet::PongProbe => "3probe".to_string(),
            Packet::Message(msg) => format!("4{msg}"),
            Packet::Upgrade => "5".to_string(),
            Packet::Noop => "6".to_string(),
            Packet::Binary(data) => format!("b{}", general_purpose::STANDARD.encode(data)),
        };
        Ok(res)
    }

    /// Encode the packet as a websocket binary frame: the raw opcode byte
    /// followed by the body.
    pub fn into_binary(self) -> Bytes {
        match self {
            Packet::Binary(data) => {
                let mut buf = BytesMut::with_capacity(1 + data.len());
                buf.put_u8(BINARY_MESSAGE_OPCODE);
                buf.extend_from_slice(&data);
                buf.freeze()
            }
            p => {
                let mut buf = BytesMut::with_capacity(2);
                buf.put_u8(p.opcode());
                buf.freeze()
            }
        }
    }

    /// Decode a packet from a text frame.
    pub fn from_text(value: &str) -> Result<Self, Error> {
        let mut chars = value.chars();
        let opcode = chars.next().ok_or(Error::InvalidFrame)?;
        let body = chars.as_str();
        let is_probe = body == "probe";
        let packet = match opcode {
            '0' => Packet::Open(serde_json::from_str(body)?),
            '1' => Packet::Close,
            '2' if is_probe => Packet::PingProbe,
            '2' => Packet::Ping,
            '3' if is_probe => Packet::PongProbe,
            '3' => Packet::Pong,
            '4' => Packet::Message(body.to_string()),
            '5' => Packet::Upgrade,
            '6' => Packet::Noop,
            'b' => Packet::Binary(general_purpose::STANDARD.decode(body)?.into()),
            c => return Err(Error::InvalidOpcode(c as u8)),
        };
        Ok(packet)
    }

    /// Decode a packet from a websocket binary frame.
    pub fn from_binary(frame: Bytes) -> Result<Self, Error> {
        match frame.first() {
            Some(&op) if op == BINARY_MESSAGE_OPCODE => Ok(Packet::Binary(frame.slice(1..))),
            Some(&op) if op <= 6 => {
                // Control opcodes never carry binary bodies.
                Err(Error::InvalidFrame)
            }
            Some(&op) => Err(Error::InvalidOpcode(op)),
            None => Err(Error::InvalidFrame),
        }
    }
}

impl TryFrom<Packet> for String {
    type Error = Error;
    fn try_from(packet: Packet) -> Result<Self, Self::Error> {
        packet.into_text()
    }
}

impl TryFrom<&str> for Packet {
    type Error = Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Packet::from_text(value)
    }
}

/// The handshake parameters sent in the body of an [`Packet::Open`] packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenPacket {
    pub sid: Sid,
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    pub max_payload: u64,
}

impl OpenPacket {
    pub(crate) fn new(transport: TransportType, sid: Sid, config: &EngineConfig) -> Self {
        OpenPacket {
            sid,
            upgrades: config.upgrades(transport),
            ping_interval: config.ping_interval.as_millis() as u64,
            ping_timeout: config.ping_timeout.as_millis() as u64,
            max_payload: config.max_payload,
        }
    }
}
