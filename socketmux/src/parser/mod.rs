//! Packet parsers.
//!
//! Two framings are supported:
//! * [`DefaultParser`]: a textual header packet followed by one binary
//!   attachment frame per binary leaf, referenced by placeholders.
//! * [`MsgPackParser`]: the whole packet as a single self-describing
//!   binary frame.
//!
//! Both sides of a connection must use the same parser.

use bytes::Bytes;

mod default;
mod msgpack;

pub use default::DefaultParser;
pub use msgpack::MsgPackParser;

use crate::packet::Packet;
use crate::value::ValueError;

/// The head frame of an encoded packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Sent as an engine text message.
    Text(String),
    /// Sent as an engine binary message.
    Binary(Bytes),
}

/// The outcome of decoding a head frame.
#[derive(Debug)]
pub enum Decoded {
    /// The packet is complete.
    Packet(Packet),
    /// The packet declares binary attachments that have not arrived yet;
    /// feed them to [`PartialPacket::add_attachment`] as they do.
    Partial(PartialPacket),
}

pub use default::PartialPacket;

/// A packet parser implementation.
pub trait Parse {
    /// Encode a packet into its head frame plus attachment frames, in the
    /// exact order they must travel.
    fn encode(&self, packet: Packet) -> Result<(Payload, Vec<Bytes>), ParseError>;

    /// Decode a text head frame.
    fn decode_text(&self, data: &str) -> Result<Decoded, ParseError>;

    /// Decode a binary head frame.
    fn decode_binary(&self, data: Bytes) -> Result<Decoded, ParseError>;
}

/// Parser selection, dispatched by enum like the engine dispatches
/// transports.
#[derive(Debug, Clone, Default)]
pub enum Parser {
    #[default]
    Default,
    MsgPack,
}

impl Parse for Parser {
    fn encode(&self, packet: Packet) -> Result<(Payload, Vec<Bytes>), ParseError> {
        match self {
            Parser::Default => DefaultParser.encode(packet),
            Parser::MsgPack => MsgPackParser.encode(packet),
        }
    }

    fn decode_text(&self, data: &str) -> Result<Decoded, ParseError> {
        match self {
            Parser::Default => DefaultParser.decode_text(data),
            Parser::MsgPack => MsgPackParser.decode_text(data),
        }
    }

    fn decode_binary(&self, data: Bytes) -> Result<Decoded, ParseError> {
        match self {
            Parser::Default => DefaultParser.decode_binary(data),
            Parser::MsgPack => MsgPackParser.decode_binary(data),
        }
    }
}

/// Errors when encoding or decoding packets.
#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("invalid packet type")]
    InvalidPacketType,

    #[error("invalid event name")]
    InvalidEventName,

    #[error("invalid ack id")]
    InvalidAckId,

    #[error("packet payload is not an array")]
    InvalidPayload,

    #[error("received unexpected binary data; both ends must use the same parser")]
    UnexpectedBinaryPacket,

    #[error("received unexpected string data; both ends must use the same parser")]
    UnexpectedStringPacket,

    #[error("attachment count does not match the declared count")]
    AttachmentMismatch,

    #[error("unknown attachment placeholder index {0}")]
    UnknownPlaceholder(usize),

    #[error("error serializing json packet: {0:?}")]
    Json(#[from] serde_json::Error),

    #[error("error encoding msgpack packet: {0:?}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("error decoding msgpack packet: {0:?}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error(transparent)]
    Value(#[from] ValueError),
}
